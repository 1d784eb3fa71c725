//! Greet service: the demo service served by `greet-server`.
//!
//! One method per calling convention, all under `greet.GreetService`.

use std::time::Duration;

use futures::stream::{self, Stream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::protocol::context::Context;
use crate::protocol::dispatcher::{RequestStream, Service};
use crate::protocol::registry::{CallKind, MethodDescriptor};
use crate::protocol::status::Status;

pub const SERVICE_NAME: &str = "greet.GreetService";

pub const GREET: MethodDescriptor =
    MethodDescriptor::new("greet.GreetService/Greet", CallKind::Unary);
pub const GREET_MANY_TIMES: MethodDescriptor =
    MethodDescriptor::new("greet.GreetService/GreetManyTimes", CallKind::ServerStreaming);
pub const LONG_GREET: MethodDescriptor =
    MethodDescriptor::new("greet.GreetService/LongGreet", CallKind::ClientStreaming);
pub const GREET_EVERYONE: MethodDescriptor =
    MethodDescriptor::new("greet.GreetService/GreetEveryone", CallKind::BidiStreaming);

/// Number of responses produced by `GreetManyTimes`
pub const GREET_MANY_TIMES_COUNT: u32 = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeter {
    pub first_name: String,
    pub last_name: String,
}

impl Greeter {
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetRequest {
    pub greeter: Greeter,
}

impl GreetRequest {
    pub fn new(greeter: Greeter) -> Self {
        Self { greeter }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetResponse {
    pub result: String,
}

impl GreetResponse {
    fn new(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
        }
    }
}

/// Builds the Greet [`Service`]
#[derive(Debug, Clone)]
pub struct GreetService {
    stream_interval: Duration,
}

impl Default for GreetService {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl GreetService {
    /// `stream_interval` spaces the `GreetManyTimes` responses
    pub fn new(stream_interval: Duration) -> Self {
        Self { stream_interval }
    }

    pub fn into_service(self) -> Result<Service> {
        let interval = self.stream_interval;
        let service = Service::builder(SERVICE_NAME)
            .unary(GREET, |ctx, req: GreetRequest| async move { Ok(greet(&ctx, req)) })?
            .server_streaming(GREET_MANY_TIMES, move |ctx, req: GreetRequest| async move {
                Ok(greet_many_times(&ctx, req, interval))
            })?
            .client_streaming(LONG_GREET, long_greet)?
            .bidi_streaming(GREET_EVERYONE, |ctx, reqs| async move {
                Ok(greet_everyone(ctx, reqs))
            })?
            .build();
        Ok(service)
    }
}

fn greet(ctx: &Context, req: GreetRequest) -> GreetResponse {
    info!(method = ctx.method(), greeter = ?req.greeter, "Greet invoked");
    GreetResponse::new(format!("Hello {}!", req.greeter.first_name))
}

fn greet_many_times(
    ctx: &Context,
    req: GreetRequest,
    interval: Duration,
) -> impl Stream<Item = std::result::Result<GreetResponse, Status>> {
    info!(method = ctx.method(), greeter = ?req.greeter, "GreetManyTimes invoked");
    let first_name = req.greeter.first_name;
    stream::unfold(0u32, move |i| {
        let first_name = first_name.clone();
        async move {
            if i >= GREET_MANY_TIMES_COUNT {
                return None;
            }
            if i > 0 {
                tokio::time::sleep(interval).await;
            }
            let response = GreetResponse::new(format!("Hello {first_name} number {i}"));
            Some((Ok(response), i + 1))
        }
    })
}

async fn long_greet(
    ctx: Context,
    mut reqs: RequestStream<GreetRequest>,
) -> std::result::Result<GreetResponse, Status> {
    info!(method = ctx.method(), "LongGreet invoked with a streaming request");
    let mut result = String::new();
    while let Some(req) = reqs.next().await {
        let req = req?;
        result.push_str(&format!("Hello {}! ", req.greeter.first_name));
    }
    Ok(GreetResponse::new(result))
}

fn greet_everyone(
    ctx: Context,
    reqs: RequestStream<GreetRequest>,
) -> impl Stream<Item = std::result::Result<GreetResponse, Status>> {
    info!(method = ctx.method(), "GreetEveryone invoked with a streaming request");
    reqs.map(|req| req.map(|req| GreetResponse::new(format!("Hello {}! ", req.greeter.first_name))))
}
