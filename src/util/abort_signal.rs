use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

struct SharedState {
    aborted: bool,
    wakers: Vec<Waker>,
}

/// Resolves once the paired [`AbortHandle`] has been triggered.
/// Cheap to clone; every clone observes the same abort.
pub struct AbortSignal(Arc<Mutex<SharedState>>);

/// Operator side of an [`AbortSignal`]
pub struct AbortHandle(AbortSignal);

impl Clone for AbortSignal {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl Clone for AbortHandle {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl AbortSignal {
    pub fn new() -> (Self, AbortHandle) {
        let signal = Self(Arc::new(Mutex::new(SharedState {
            aborted: false,
            wakers: Vec::with_capacity(4),
        })));

        (signal.clone(), AbortHandle(signal))
    }

    /// A signal whose handle has been dropped, so it never fires
    pub fn never() -> Self {
        Self::new().0
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AbortHandle {
    /// Trigger the abort. Calling this more than once has no further effect.
    pub fn abort(&self) {
        let mut lock = self.0.lock();
        if lock.aborted {
            return;
        }

        lock.aborted = true;
        let wakers = mem::take(&mut lock.wakers);
        drop(lock);
        wakers.into_iter().for_each(Waker::wake);
    }

    pub fn signal(&self) -> AbortSignal {
        self.0.clone()
    }
}

impl Future for AbortSignal {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut lock = self.lock();
        if lock.aborted {
            Poll::Ready(())
        } else {
            if !lock.wakers.iter().any(|w| cx.waker().will_wake(w)) {
                lock.wakers.push(cx.waker().clone());
            }
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_abort_wakes_waiters() {
        let (signal, handle) = AbortSignal::new();
        let waiter = tokio::spawn(signal.clone());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!signal.is_aborted());

        handle.abort();
        handle.abort();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_aborted());
        assert!(handle.signal().is_aborted());
    }

    #[tokio::test]
    async fn test_never_does_not_fire() {
        let signal = AbortSignal::never();
        let res = tokio::time::timeout(Duration::from_millis(10), signal.clone()).await;
        assert!(res.is_err());
        assert!(!signal.is_aborted());
    }
}
