//! Failure isolation for external dependencies.
//!
//! Every connection to the bus or a sink goes through a [`ResilientConnection`], which
//! combines a [`CircuitBreaker`], bounded exponential backoff and periodic health probes.

mod breaker;
mod connection;
mod retry;

pub use breaker::{CallPermit, CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
pub use connection::{ConnectionHealth, Connector, PoolStatus, ResilientConnection};
pub use retry::{RetryPolicy, retry_with_backoff};
