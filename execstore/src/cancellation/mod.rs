//! Cooperative cancellation shared by background tasks.
//!
//! Full scans hand one token to every chunk worker, and the lock heartbeat
//! uses one to tell exclusive work that the lock was lost.

mod token;

pub use token::CancellationToken;
