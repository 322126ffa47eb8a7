//! Cooperative cancellation.
//!
//! The token is shared between the signal listener, the readiness gate and
//! the build-graph runner.

mod signals;
mod token;

pub use signals::cancel_on_termination;
pub use token::CancellationToken;
