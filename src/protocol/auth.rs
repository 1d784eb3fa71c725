//! Bearer-token authentication.
//!
//! Client side: [`CallCredentials`] produce the metadata attached to every
//! outgoing call. Server side: [`AuthInterceptor`] reads the credential header,
//! validates it through a [`TokenValidator`] and records the resulting
//! [`AuthenticatedIdentity`] in the call context.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{constants, Result};
use crate::protocol::context::Context;
use crate::protocol::interceptor::{Interceptor, Next};
use crate::protocol::metadata::Metadata;
use crate::protocol::status::Status;

/// Header carrying the bearer credential unless configured otherwise
pub const DEFAULT_TOKEN_HEADER: &str = "token";

/// What a credential producer knows about the call it is attaching to
#[derive(Debug, Clone, Copy)]
pub struct CallInfo<'a> {
    pub method: &'a str,
    pub authority: &'a str,
}

/// Asynchronous per-call metadata producer.
///
/// Invoked once per call before anything is written to the connection. An
/// error terminates the call with `UNAUTHENTICATED`.
#[async_trait]
pub trait CallCredentials: Send + Sync {
    async fn metadata(&self, info: &CallInfo<'_>) -> Result<Metadata>;
}

/// Fixed token sent in a single header
#[derive(Debug, Clone)]
pub struct StaticToken {
    header: String,
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_header(DEFAULT_TOKEN_HEADER, token)
    }

    pub fn with_header(header: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl CallCredentials for StaticToken {
    async fn metadata(&self, _info: &CallInfo<'_>) -> Result<Metadata> {
        let mut md = Metadata::new();
        md.insert(&self.header, self.token.clone());
        Ok(md)
    }
}

/// Token fetched per call by an async closure (refresh, vault lookup...)
pub struct TokenFn<F> {
    header: String,
    fetch: F,
}

impl<F, Fut> TokenFn<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    pub fn new(fetch: F) -> Self {
        Self {
            header: DEFAULT_TOKEN_HEADER.to_string(),
            fetch,
        }
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = header.into();
        self
    }
}

#[async_trait]
impl<F, Fut> CallCredentials for TokenFn<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    async fn metadata(&self, _info: &CallInfo<'_>) -> Result<Metadata> {
        let token = (self.fetch)().await?;
        let mut md = Metadata::new();
        md.insert(&self.header, token);
        Ok(md)
    }
}

/// Identity derived from a validated credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedIdentity {
    pub subject: String,
    pub token: String,
}

/// Pluggable credential check.
///
/// `Ok(None)` means the token is not valid; `Err` reports a failure of the
/// validator itself (an unreachable token store, say) and ends the call with
/// that status.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> std::result::Result<Option<AuthenticatedIdentity>, Status>;
}

/// Accepts exactly one token
#[derive(Debug, Clone)]
pub struct StaticTokenValidator {
    expected: String,
    subject: String,
}

impl StaticTokenValidator {
    pub fn new(expected: impl Into<String>) -> Self {
        let expected = expected.into();
        Self {
            subject: expected.clone(),
            expected,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> std::result::Result<Option<AuthenticatedIdentity>, Status> {
        Ok((token == self.expected).then(|| AuthenticatedIdentity {
            subject: self.subject.clone(),
            token: token.to_string(),
        }))
    }
}

/// In-memory token → subject table
#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    tokens: HashMap<String, String>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, subject: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), subject.into());
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenValidator for TokenStore {
    async fn validate(&self, token: &str) -> std::result::Result<Option<AuthenticatedIdentity>, Status> {
        Ok(self.tokens.get(token).map(|subject| AuthenticatedIdentity {
            subject: subject.clone(),
            token: token.to_string(),
        }))
    }
}

/// Rejects calls whose credential header is missing or invalid
#[derive(Clone)]
pub struct AuthInterceptor {
    header: String,
    validator: Arc<dyn TokenValidator>,
}

impl AuthInterceptor {
    pub fn new(validator: Arc<dyn TokenValidator>) -> Self {
        Self::with_header(DEFAULT_TOKEN_HEADER, validator)
    }

    pub fn with_header(header: impl Into<String>, validator: Arc<dyn TokenValidator>) -> Self {
        Self {
            header: header.into(),
            validator,
        }
    }

    /// Interceptor accepting a single fixed token
    pub fn with_static_token(token: impl Into<String>) -> Self {
        Self::new(Arc::new(StaticTokenValidator::new(token)))
    }
}

#[async_trait]
impl Interceptor for AuthInterceptor {
    async fn intercept(&self, mut ctx: Context, next: Next<'_>) -> std::result::Result<Context, Status> {
        let Some(token) = ctx.metadata().get(&self.header).map(str::to_owned) else {
            warn!(method = ctx.method(), peer = ?ctx.peer(), "Call rejected: credential header missing");
            return Err(Status::unauthenticated(constants::ERR_MISSING_CREDENTIAL));
        };

        match self.validator.validate(&token).await? {
            Some(identity) => {
                debug!(method = ctx.method(), subject = %identity.subject, "Call authenticated");
                ctx.extensions_mut().insert(identity);
                next.run(ctx).await
            }
            None => {
                warn!(method = ctx.method(), peer = ?ctx.peer(), "Call rejected: invalid credential");
                Err(Status::unauthenticated(constants::ERR_INVALID_CREDENTIAL))
            }
        }
    }
}
