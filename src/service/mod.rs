//! # Service Layer
//!
//! The two ends of a secure RPC connection.
//!
//! ## Components
//! - **Server**: TLS listener dispatching calls to a [`Service`](crate::protocol::dispatcher::Service)
//! - **Channel**: client connection issuing calls in all four conventions
//! - **Call handles**: response streams and request senders for streaming calls

pub mod call;
pub mod channel;
pub mod server;
mod table;

pub use call::{ClientStreamingCall, RequestSender, Streaming};
pub use channel::{CallOptions, Channel, ChannelBuilder};
pub use server::{Server, ServerBuilder};
