//! Admission throttling for the verification engine.
//!
//! Three independent mechanisms, all in-memory and process-wide:
//!
//! * [`MinuteWindow`] - fixed 60 second request windows per key, with
//!   an exponential penalty for keys that keep hitting the limit.
//! * [`DailyBudget`] - per-key daily quantity budgets that reset at
//!   UTC midnight, with atomic reserve-what-remains semantics.
//! * [`ConcurrencyGate`] - per-key lease counting with immediate
//!   refusal and RAII release.
//!
//! The same key must always be used with the same limits for the
//! results to be meaningful; callers encode the identity class into
//! the key to keep agent and IP budgets apart.

use std::time::Duration;
use thiserror::Error;

mod budget;
mod limit;
mod window;

pub use budget::{DailyBudget, Reservation};
pub use limit::{ConcurrencyGate, Lease};
pub use window::MinuteWindow;

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("rate limit exceeded, retry in {0:?}")]
    TooManyRequests(Duration),
    #[error("daily quota exhausted, retry in {0:?}")]
    DailyExhausted(Duration),
    #[error("too many concurrent requests")]
    TooManyLeases,
}
