pub use abort_result::*;
pub use abort_signal::*;

mod abort_result;
mod abort_signal;
