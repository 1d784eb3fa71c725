//! Server-side method dispatch.
//!
//! [`ServiceBuilder`] pairs every [`MethodDescriptor`] with a typed handler of
//! the matching calling convention, erases the message types behind the
//! descriptor's codecs and freezes the result into a [`Service`]. The server
//! connection loop hands each incoming call to [`execute`], which resolves the
//! method, runs the interceptor chain and drives the handler to a terminal
//! [`Status`].

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::core::flow::{CreditGrant, SendCredit, INITIAL_REQUEST_CREDIT};
use crate::core::frame::{CallId, Frame};
use crate::core::serialization::SerializationFormat;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::context::Context;
use crate::protocol::interceptor::InterceptorChain;
use crate::protocol::metadata::Metadata;
use crate::protocol::registry::{CallKind, MethodDescriptor, MethodRegistry, ServiceDescriptor};
use crate::protocol::status::Status;
use crate::utils::metrics::Metrics;

/// Decoded request messages of a client-streaming or bidi call
pub type RequestStream<T> = BoxStream<'static, std::result::Result<T, Status>>;

type ByteStream = BoxStream<'static, std::result::Result<Vec<u8>, Status>>;
type UnaryFn = dyn Fn(Context, Vec<u8>) -> BoxFuture<'static, std::result::Result<Vec<u8>, Status>>
    + Send
    + Sync;
type ServerStreamingFn = dyn Fn(Context, Vec<u8>) -> BoxFuture<'static, std::result::Result<ByteStream, Status>>
    + Send
    + Sync;
type ClientStreamingFn = dyn Fn(Context, ByteStream) -> BoxFuture<'static, std::result::Result<Vec<u8>, Status>>
    + Send
    + Sync;
type BidiFn = dyn Fn(Context, ByteStream) -> BoxFuture<'static, std::result::Result<ByteStream, Status>>
    + Send
    + Sync;

/// Type-erased handler, one variant per calling convention
#[derive(Clone)]
pub(crate) enum MethodHandler {
    Unary(Arc<UnaryFn>),
    ServerStreaming(Arc<ServerStreamingFn>),
    ClientStreaming(Arc<ClientStreamingFn>),
    Bidi(Arc<BidiFn>),
}

fn decode_request<T: DeserializeOwned>(
    codec: SerializationFormat,
    bytes: &[u8],
) -> std::result::Result<T, Status> {
    codec
        .decode(bytes)
        .map_err(|e| Status::internal(format!("Failed to decode request: {e}")).with_cause(e))
}

fn encode_response<T: Serialize>(
    codec: SerializationFormat,
    message: &T,
) -> std::result::Result<Vec<u8>, Status> {
    codec
        .encode(message)
        .map_err(|e| Status::internal(format!("Failed to encode response: {e}")).with_cause(e))
}

fn decode_stream<T>(codec: SerializationFormat, raw: ByteStream) -> RequestStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    raw.map(move |item| item.and_then(|bytes| decode_request(codec, &bytes)))
        .boxed()
}

fn encode_stream<T, S>(codec: SerializationFormat, responses: S) -> ByteStream
where
    T: Serialize + Send + 'static,
    S: Stream<Item = std::result::Result<T, Status>> + Send + 'static,
{
    responses
        .map(move |item| item.and_then(|message| encode_response(codec, &message)))
        .boxed()
}

/// Collects method handlers for one service
pub struct ServiceBuilder {
    registry: MethodRegistry,
    handlers: Vec<MethodHandler>,
}

impl ServiceBuilder {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            registry: MethodRegistry::new(service),
            handlers: Vec::new(),
        }
    }

    fn add(mut self, descriptor: MethodDescriptor, shape: CallKind, handler: MethodHandler) -> Result<Self> {
        if descriptor.kind() != shape {
            return Err(ProtocolError::ConventionMismatch {
                method: descriptor.name().to_string(),
                declared: descriptor.kind().as_str(),
                handler: shape.as_str(),
            });
        }
        self.registry.register(descriptor)?;
        self.handlers.push(handler);
        Ok(self)
    }

    /// Register a handler taking one request and returning one response
    pub fn unary<Req, Res, F, Fut>(self, descriptor: MethodDescriptor, handler: F) -> Result<Self>
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Res, Status>> + Send + 'static,
    {
        let (req_codec, res_codec) = (descriptor.request_codec(), descriptor.response_codec());
        let handler = Arc::new(handler);
        let erased = move |ctx: Context, bytes: Vec<u8>| {
            let handler = Arc::clone(&handler);
            async move {
                let request = decode_request(req_codec, &bytes)?;
                let response = handler(ctx, request).await?;
                encode_response(res_codec, &response)
            }
            .boxed()
        };
        self.add(descriptor, CallKind::Unary, MethodHandler::Unary(Arc::new(erased)))
    }

    /// Register a handler taking one request and producing a response stream
    pub fn server_streaming<Req, Res, S, F, Fut>(
        self,
        descriptor: MethodDescriptor,
        handler: F,
    ) -> Result<Self>
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        S: Stream<Item = std::result::Result<Res, Status>> + Send + 'static,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<S, Status>> + Send + 'static,
    {
        let (req_codec, res_codec) = (descriptor.request_codec(), descriptor.response_codec());
        let handler = Arc::new(handler);
        let erased = move |ctx: Context, bytes: Vec<u8>| {
            let handler = Arc::clone(&handler);
            async move {
                let request = decode_request(req_codec, &bytes)?;
                let responses = handler(ctx, request).await?;
                Ok(encode_stream(res_codec, responses))
            }
            .boxed()
        };
        self.add(
            descriptor,
            CallKind::ServerStreaming,
            MethodHandler::ServerStreaming(Arc::new(erased)),
        )
    }

    /// Register a handler consuming a request stream and returning one response
    pub fn client_streaming<Req, Res, F, Fut>(
        self,
        descriptor: MethodDescriptor,
        handler: F,
    ) -> Result<Self>
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(Context, RequestStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Res, Status>> + Send + 'static,
    {
        let (req_codec, res_codec) = (descriptor.request_codec(), descriptor.response_codec());
        let handler = Arc::new(handler);
        let erased = move |ctx: Context, raw: ByteStream| {
            let handler = Arc::clone(&handler);
            async move {
                let response = handler(ctx, decode_stream(req_codec, raw)).await?;
                encode_response(res_codec, &response)
            }
            .boxed()
        };
        self.add(
            descriptor,
            CallKind::ClientStreaming,
            MethodHandler::ClientStreaming(Arc::new(erased)),
        )
    }

    /// Register a handler with independent request and response streams
    pub fn bidi_streaming<Req, Res, S, F, Fut>(
        self,
        descriptor: MethodDescriptor,
        handler: F,
    ) -> Result<Self>
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        S: Stream<Item = std::result::Result<Res, Status>> + Send + 'static,
        F: Fn(Context, RequestStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<S, Status>> + Send + 'static,
    {
        let (req_codec, res_codec) = (descriptor.request_codec(), descriptor.response_codec());
        let handler = Arc::new(handler);
        let erased = move |ctx: Context, raw: ByteStream| {
            let handler = Arc::clone(&handler);
            async move {
                let responses = handler(ctx, decode_stream(req_codec, raw)).await?;
                Ok(encode_stream(res_codec, responses))
            }
            .boxed()
        };
        self.add(
            descriptor,
            CallKind::BidiStreaming,
            MethodHandler::Bidi(Arc::new(erased)),
        )
    }

    /// Freeze the registered methods
    pub fn build(self) -> Service {
        Service {
            descriptor: self.registry.build(),
            handlers: self.handlers,
        }
    }
}

/// Immutable set of methods served by one server
#[derive(Clone)]
pub struct Service {
    descriptor: ServiceDescriptor,
    handlers: Vec<MethodHandler>,
}

impl Service {
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder::new(name)
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub(crate) fn resolve(&self, method: &str) -> Option<(&MethodDescriptor, &MethodHandler)> {
        let index = self.descriptor.position(method)?;
        Some((&self.descriptor.methods()[index], &self.handlers[index]))
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// Outbound half of a server call
pub(crate) struct ResponseSink {
    call_id: CallId,
    outbound: mpsc::Sender<Frame>,
    /// Response credit granted by the client
    credit: Arc<SendCredit>,
    metrics: Arc<Metrics>,
}

impl ResponseSink {
    pub(crate) fn new(
        call_id: CallId,
        outbound: mpsc::Sender<Frame>,
        credit: Arc<SendCredit>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            call_id,
            outbound,
            credit,
            metrics,
        }
    }

    /// Send one response; waits while the client has no room for it
    async fn send(&self, payload: Vec<u8>) -> std::result::Result<(), Status> {
        if !self.credit.acquire().await {
            return Err(Status::unavailable(constants::ERR_CONNECTION_CLOSED));
        }
        let len = payload.len() as u64;
        self.outbound
            .send(Frame::Message {
                call_id: self.call_id,
                payload,
            })
            .await
            .map_err(|_| Status::unavailable(constants::ERR_CONNECTION_CLOSED))?;
        self.metrics.message_sent(len);
        Ok(())
    }

    /// Let the client send `credit` more requests
    async fn grant(&self, credit: u32) {
        if credit == 0 {
            return;
        }
        let update = Frame::WindowUpdate {
            call_id: self.call_id,
            credit,
        };
        if self.outbound.send(update).await.is_err() {
            debug!(call_id = self.call_id, "Connection gone before credit was returned");
        }
    }

    /// Request stream over `inbound` that returns credit as the handler consumes it
    async fn requests(&self, inbound: mpsc::Receiver<Vec<u8>>, window: u32) -> ByteStream {
        self.grant(window.saturating_sub(INITIAL_REQUEST_CREDIT)).await;

        let call_id = self.call_id;
        let outbound = self.outbound.clone();
        let mut grant = CreditGrant::new(window);
        ReceiverStream::new(inbound)
            .then(move |payload| {
                let update = grant
                    .consumed()
                    .map(|credit| (outbound.clone(), Frame::WindowUpdate { call_id, credit }));
                async move {
                    if let Some((outbound, frame)) = update {
                        let _ = outbound.send(frame).await;
                    }
                    Ok(payload)
                }
            })
            .boxed()
    }

    /// Write the terminal status; fails silently once the connection is gone
    pub(crate) async fn finish(&self, status: &Status) {
        let trailers = Frame::Trailers {
            call_id: self.call_id,
            code: status.code().as_u16(),
            message: status.message().to_string(),
        };
        if self.outbound.send(trailers).await.is_err() {
            debug!(call_id = self.call_id, "Connection gone before trailers were written");
        }
    }
}

/// Everything the connection loop knows about a freshly opened call
pub(crate) struct IncomingCall {
    pub call_id: CallId,
    pub method: String,
    pub metadata: Metadata,
    pub peer: SocketAddr,
    pub deadline: Option<Instant>,
    pub inbound: mpsc::Receiver<Vec<u8>>,
    pub half_closed: watch::Receiver<bool>,
    /// Capacity of `inbound`
    pub window: u32,
    pub cancel: CancellationToken,
    /// Fired by the connection reader when the request queue overflows
    pub overflow: CancellationToken,
}

fn violation(message: &str) -> Status {
    Status::from(ProtocolError::ProtocolViolation(message.to_string()))
}

/// Read the only request of a single-request call, requiring half-close right after it
async fn single_request(inbound: &mut mpsc::Receiver<Vec<u8>>) -> std::result::Result<Vec<u8>, Status> {
    let request = inbound
        .recv()
        .await
        .ok_or_else(|| violation(constants::ERR_MISSING_REQUEST))?;
    match inbound.recv().await {
        None => Ok(request),
        Some(_) => Err(violation(constants::ERR_EXTRA_REQUEST)),
    }
}

async fn await_half_close(half_closed: &mut watch::Receiver<bool>) -> std::result::Result<(), Status> {
    half_closed
        .wait_for(|closed| *closed)
        .await
        .map(|_| ())
        .map_err(|_| Status::unavailable(constants::ERR_CONNECTION_CLOSED))
}

async fn drain(responses: &mut ByteStream, sink: &ResponseSink) -> std::result::Result<(), Status> {
    while let Some(item) = responses.next().await {
        sink.send(item?).await?;
    }
    Ok(())
}

async fn run_handler(
    handler: MethodHandler,
    ctx: Context,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    mut half_closed: watch::Receiver<bool>,
    window: u32,
    sink: &ResponseSink,
) -> std::result::Result<(), Status> {
    match handler {
        MethodHandler::Unary(h) => {
            let request = single_request(&mut inbound).await?;
            let response = h(ctx, request).await?;
            sink.send(response).await
        }
        MethodHandler::ServerStreaming(h) => {
            let request = single_request(&mut inbound).await?;
            let mut responses = h(ctx, request).await?;
            drain(&mut responses, sink).await
        }
        MethodHandler::ClientStreaming(h) => {
            let requests = sink.requests(inbound, window).await;
            let response = h(ctx, requests).await?;
            await_half_close(&mut half_closed).await?;
            sink.send(response).await
        }
        MethodHandler::Bidi(h) => {
            let requests = sink.requests(inbound, window).await;
            let mut responses = h(ctx, requests).await?;
            drain(&mut responses, sink).await?;
            await_half_close(&mut half_closed).await
        }
    }
}

/// Run one call to completion and return its terminal status.
///
/// The handler future is dropped as soon as the call is cancelled or its
/// deadline passes, which stops any response stream it was producing.
pub(crate) async fn execute(
    service: &Service,
    interceptors: &InterceptorChain,
    call: IncomingCall,
    sink: &ResponseSink,
) -> Status {
    let IncomingCall {
        call_id,
        method,
        metadata,
        peer,
        deadline,
        inbound,
        half_closed,
        window,
        cancel,
        overflow,
    } = call;

    let Some((descriptor, handler)) = service.resolve(&method) else {
        debug!(call_id, %method, "Unknown method");
        return Status::from(ProtocolError::MethodNotFound(method));
    };
    let kind = descriptor.kind();
    let handler = handler.clone();

    let ctx = Context::new(method, metadata)
        .with_peer(peer)
        .with_deadline(deadline)
        .with_cancellation(cancel.clone());

    let work = async move {
        let ctx = interceptors.run(ctx).await?;
        run_handler(handler, ctx, inbound, half_closed, window, sink).await
    };
    let guarded = AssertUnwindSafe(work).catch_unwind();

    let expiry = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        outcome = guarded => match outcome {
            Ok(Ok(())) => Status::ok(),
            Ok(Err(status)) => status,
            Err(_) => {
                error!(call_id, kind = %kind, "Handler panicked");
                Status::internal("Handler panicked")
            }
        },
        _ = cancel.cancelled() => Status::cancelled("Call cancelled"),
        _ = overflow.cancelled() => {
            cancel.cancel();
            Status::resource_exhausted(constants::ERR_REQUEST_CREDIT_EXCEEDED)
        }
        _ = expiry => {
            cancel.cancel();
            Status::deadline_exceeded("Deadline exceeded")
        }
    }
}
