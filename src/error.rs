//! # Error Types
//!
//! Error handling for the RPC core.
//!
//! `ProtocolError` covers everything that can go wrong outside of a single call's
//! outcome: transport and TLS failures, framing problems, registry misuse and
//! configuration errors. The outcome of an individual call is a
//! [`Status`](crate::protocol::status::Status); every `ProtocolError` converts into one.
//!
//! ## Error Categories
//! - **Connection Errors**: handshake, socket and TLS failures
//! - **Auth Errors**: credential production or validation failures
//! - **Protocol Errors**: calling-convention violations, malformed frames
//! - **Registry Errors**: unknown or duplicate methods
//! - **Configuration Errors**: invalid settings, unreadable certificate files
//!
//! ## Example Usage
//! ```rust
//! use secure_rpc::error::{ProtocolError, Result};
//! use std::fs::File;
//! use std::io::Read;
//! use tracing::{info, error};
//!
//! fn read_file(path: &str) -> Result<String> {
//!     let mut file = File::open(path).map_err(ProtocolError::Io)?;
//!     let mut contents = String::new();
//!     file.read_to_string(&mut contents).map_err(ProtocolError::Io)?;
//!     Ok(contents)
//! }
//!
//! fn main() {
//!     match read_file("example.txt") {
//!         Ok(contents) => info!(contents, "Successfully read file"),
//!         Err(e) => error!(error=%e, "Error reading file"),
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_CHANNEL_CLOSED: &str = "Channel is closed";
    pub const ERR_SERVER_SHUTTING_DOWN: &str = "Server is shutting down";
    pub const ERR_NO_PREFACE: &str = "Server closed the connection before sending its preface";

    /// Calling-convention violations
    pub const ERR_MISSING_REQUEST: &str = "Call half-closed without a request message";
    pub const ERR_EXTRA_REQUEST: &str = "More than one request message for a single-request call";
    pub const ERR_MISSING_RESPONSE: &str = "Call completed without a response message";
    pub const ERR_EXTRA_RESPONSE: &str = "More than one response message for a single-response call";
    pub const ERR_SEND_AFTER_HALF_CLOSE: &str = "Message sent after half-close";
    pub const ERR_SEND_AFTER_TERMINATION: &str = "Message sent after the call terminated";
    pub const ERR_DUPLICATE_CALL_ID: &str = "Call identifier already in use";

    /// Flow control
    pub const ERR_REQUEST_CREDIT_EXCEEDED: &str = "Client sent more requests than it was granted";
    pub const ERR_RESPONSE_CREDIT_EXCEEDED: &str = "Server sent more responses than it was granted";

    /// Auth errors
    pub const ERR_MISSING_CREDENTIAL: &str = "Missing credential";
    pub const ERR_INVALID_CREDENTIAL: &str = "Invalid credential";
}

/// ProtocolError is the primary error type for all non-call-scoped operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Invalid protocol header")]
    InvalidHeader,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Duplicate method: {0}")]
    DuplicateMethod(String),

    #[error("Method {method} is declared {declared} but its handler is {handler}")]
    ConventionMismatch {
        method: String,
        declared: &'static str,
        handler: &'static str,
    },

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// True for failures of the underlying connection rather than of a single call.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::Connection(_)
                | ProtocolError::ConnectionClosed
                | ProtocolError::TlsError(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
