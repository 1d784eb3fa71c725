//! # Transport Layer
//!
//! TCP + TLS connections carrying length-prefixed packets.

pub mod tls;

pub use tls::{PemSource, TlsClientConfig, TlsServerConfig};
