//! Retry and timeout policies
//!
//! Pure decision state with no I/O; the session worker and the transport
//! supervisor consult them and own the timers.

pub mod auth_retry;
pub mod retry;
pub mod timeout;

pub use auth_retry::{AuthRetryConfig, AuthRetryPolicy};
pub use retry::{ConnectRetryPolicy, RetryConfig};
pub use timeout::{AuthTimeoutPolicy, ConnectTimeoutPolicy, IdleActivityTimeoutPolicy};
