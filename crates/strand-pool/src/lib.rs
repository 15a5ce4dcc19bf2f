//! Capability connection pooling.
//!
//! A [`ConnectionManager`] owns one bounded pool per named capability. Callers
//! lease connections through scoped [`Lease`] guards; establishing a new
//! connection goes through a [`RetryPolicy`] and a per-capability
//! [`CircuitBreaker`].

pub mod breaker;
pub mod lease;
pub mod manager;
pub(crate) mod pool;
pub mod retry;

pub use breaker::{Admission, CircuitBreaker};
pub use lease::Lease;
pub use manager::ConnectionManager;
pub use pool::PoolStats;
pub use retry::{sleep_or_cancel, RetryPolicy, RetryState};
