//! # secure-rpc
//!
//! A mutually authenticated RPC core over TLS.
//!
//! ## Features
//! - Mutual TLS with explicit trust anchors and strict server-name checks
//! - Unary, server-streaming, client-streaming and bidirectional calls
//!   multiplexed over one connection
//! - Immutable method registry built once before serving
//! - Per-call bearer credentials on the client, an ordered interceptor chain
//!   with token authentication on the server
//! - Deadlines and cancellation propagated to the peer
//!
//! ## Layout
//! - [`core`]: packet framing and call frames
//! - [`transport`]: TLS configuration and connection setup
//! - [`protocol`]: descriptors, metadata, status, context, interceptors, dispatch
//! - [`service`]: the server and the client channel
//! - [`greet`]: the example Greet service
//!
//! ## Example
//! ```rust,no_run
//! use secure_rpc::greet::GreetService;
//! use secure_rpc::protocol::auth::AuthInterceptor;
//! use secure_rpc::service::Server;
//! use secure_rpc::transport::TlsServerConfig;
//!
//! # async fn run() -> secure_rpc::error::Result<()> {
//! let tls = TlsServerConfig::new("certs/server.pem", "certs/server.key")
//!     .with_client_auth("certs/ca.pem");
//! Server::builder(GreetService::default().into_service()?)
//!     .tls(tls)
//!     .interceptor(AuthInterceptor::with_static_token("valid-token"))
//!     .build()?
//!     .serve("0.0.0.0:50051")
//!     .await
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod greet;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use error::{ProtocolError, Result};
pub use protocol::status::{Code, Status};
pub use service::{CallOptions, Channel, Server};
