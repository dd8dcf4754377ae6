//! Socket plumbing for the spiwire reactor.
//!
//! This is the lowest layer of spiwire. It provides:
//! - [`Socket`]: a closable, non-blocking handle (listener, stream or wake pipe)
//!   carrying the interest bits and deadline the reactor polls it with
//! - [`Selector`]: the `select()` wait primitive and its deadline arithmetic
//!
//! Everything above (sessions, management fan-out, the task loop) is built on
//! these two types.

pub mod error;
pub mod interest;
#[cfg(unix)]
pub mod select;
#[cfg(unix)]
pub mod socket;

pub use error::{Result, TransportError};
pub use interest::{Deadline, Interest, Ready};
#[cfg(unix)]
pub use select::{earliest_deadline, observed_readiness, Selector, WaitBound, WaitError};
#[cfg(unix)]
pub use socket::{Socket, WakeSender};
