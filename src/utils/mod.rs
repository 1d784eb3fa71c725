//! # Utility Modules
//!
//! Supporting utilities shared by the server and the client channel.
//!
//! ## Components
//! - **Logging**: `tracing-subscriber` initialization from [`LoggingConfig`](crate::config::LoggingConfig)
//! - **Metrics**: Thread-safe observability counters
//! - **Timeout**: Async timeout wrappers and default durations

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};
