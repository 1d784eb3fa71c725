//! Server-side call guards.
//!
//! Interceptors run in registration order after the method is resolved and
//! before its handler. Each one receives the call [`Context`] and the rest of
//! the chain; returning `Err(status)` closes the call with that status and the
//! handler never runs.

use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::context::Context;
use crate::protocol::status::Status;

#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(&self, ctx: Context, next: Next<'_>) -> Result<Context, Status>;
}

/// Remainder of an interceptor chain
pub struct Next<'a> {
    chain: &'a [Arc<dyn Interceptor>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Interceptor>]) -> Self {
        Self { chain }
    }

    /// Hand the context to the next interceptor, or back to the dispatcher at the end
    pub async fn run(self, ctx: Context) -> Result<Context, Status> {
        match self.chain.split_first() {
            Some((head, rest)) => head.intercept(ctx, Next { chain: rest }).await,
            None => Ok(ctx),
        }
    }
}

/// Ordered list of interceptors shared by every call of a server
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub async fn run(&self, ctx: Context) -> Result<Context, Status> {
        Next::new(&self.interceptors).run(ctx).await
    }
}
