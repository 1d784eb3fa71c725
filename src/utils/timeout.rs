//! Timeout defaults and helpers.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default bound for connection setup and TLS handshakes
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default grace period for in-flight calls during shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `future` with a time limit, mapping expiry to [`ProtocolError::Timeout`]
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| ProtocolError::Timeout)?
}
