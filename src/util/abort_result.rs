/// Outcome of work that an operator may cut short.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AbortResult<T, U> {
    Completed(T),
    Aborted(U),
}

impl<T, U> AbortResult<T, U> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    pub fn map<V, F: FnOnce(T) -> V, G: FnOnce(U) -> V>(self, completed: F, aborted: G) -> V {
        match self {
            Self::Completed(v) => completed(v),
            Self::Aborted(v) => aborted(v),
        }
    }
}

impl<T> AbortResult<T, T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Completed(v) => v,
            Self::Aborted(v) => v,
        }
    }
}
