//! # Core Wire Components
//!
//! Packet framing, call-multiplexing frames and message codecs.
//!
//! ## Components
//! - **Packet**: binary packet format with magic bytes and length prefix
//! - **Codec**: Tokio codec for framing packets over the TLS byte stream
//! - **Frame**: per-call frames (headers, messages, half-close, cancel, trailers)
//! - **Flow**: per-call message credit
//! - **Serialization**: message formats referenced by method descriptors
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Version(1)] [Length(4)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum packet size: 16MB (prevents memory exhaustion)
//! - Length validation before allocation

pub mod codec;
pub mod flow;
pub mod frame;
pub mod packet;
pub mod serialization;
