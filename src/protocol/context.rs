//! Request-scoped context handed to interceptors and handlers.
//!
//! A `Context` is created per incoming call and moved through the interceptor
//! chain into exactly one handler invocation. Values attached by interceptors
//! (for example the authenticated identity) live in a typed extension map and
//! disappear with the call.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::protocol::metadata::Metadata;

#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok().map(|b| *b))
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok().map(|b| *b))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

#[derive(Debug)]
pub struct Context {
    method: String,
    metadata: Metadata,
    peer: Option<SocketAddr>,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
    extensions: Extensions,
}

impl Context {
    pub fn new(method: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            method: method.into(),
            metadata,
            peer: None,
            deadline: None,
            cancellation: CancellationToken::new(),
            extensions: Extensions::default(),
        }
    }

    pub(crate) fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub(crate) fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub(crate) fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Full method name of the call
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Inbound request metadata
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once the caller cancelled, the deadline passed or the connection dropped
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the call is cancelled
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Shorthand for `extensions().get::<T>()`
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }
}
