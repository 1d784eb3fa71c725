//! # Protocol Layer
//!
//! Call semantics on top of the framed transport: method descriptors and
//! registry, metadata, status codes, call context, interceptors with bearer
//! token authentication, and the server-side dispatcher.

pub mod auth;
pub mod context;
pub mod dispatcher;
pub mod interceptor;
pub mod metadata;
pub mod registry;
pub mod status;
