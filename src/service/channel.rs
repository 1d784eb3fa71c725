//! # Secure Channel
//!
//! Client end of a mutually authenticated TLS connection. One channel
//! multiplexes any number of concurrent calls; a writer task owns the sink and
//! a reader task routes server frames to the calls they belong to. The reader
//! never waits on a call: each call announces a response window and a server
//! that sends past it loses that call with RESOURCE_EXHAUSTED.
//!
//! ## Example
//! ```rust,no_run
//! use secure_rpc::greet::{self, GreetRequest, GreetResponse, Greeter};
//! use secure_rpc::protocol::auth::StaticToken;
//! use secure_rpc::service::{CallOptions, Channel};
//! use secure_rpc::transport::TlsClientConfig;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let tls = TlsClientConfig::new("certs/ca.pem")
//!     .with_client_certificate("certs/client.pem", "certs/client.key");
//! let channel = Channel::builder(tls)
//!     .credentials(StaticToken::new("valid-token"))
//!     .open("localhost:50051")
//!     .await?;
//!
//! let request = GreetRequest::new(Greeter::new("John", "Doe"));
//! let response: GreetResponse = channel
//!     .unary(&greet::GREET, &request, CallOptions::new())
//!     .await?;
//! println!("{}", response.result);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{ClientConfig, TransportConfig};
use crate::core::codec::PacketCodec;
use crate::core::flow;
use crate::core::frame::Frame;
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::auth::{CallCredentials, CallInfo};
use crate::protocol::metadata::Metadata;
use crate::protocol::registry::{CallKind, MethodDescriptor};
use crate::protocol::status::{Code, Status};
use crate::service::call::{
    enqueue_nowait, single_response, CallCore, CallState, ClientSlot, ClientStreamingCall,
    RequestSender, Streaming,
};
use crate::service::table::CallTable;
use crate::transport::tls::{self, ClientFramed, TlsClientConfig};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout_error;

/// Per-call settings
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    metadata: Metadata,
    timeout: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a metadata entry; credential metadata wins on key collisions
    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.append(key, value);
        self
    }

    /// Deadline relative to the start of the call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Connection state shared by the channel handle and its calls
pub(crate) struct Shared {
    address: String,
    authority: String,
    credentials: Option<Arc<dyn CallCredentials>>,
    pub(crate) outbound: mpsc::Sender<Frame>,
    pub(crate) calls: Arc<CallTable<ClientSlot>>,
    pub(crate) metrics: Arc<Metrics>,
    next_call_id: AtomicU64,
    closing: AtomicBool,
    shutdown: CancellationToken,
    default_timeout: Option<Duration>,
    call_buffer: usize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    pub(crate) async fn send(&self, frame: Frame) -> std::result::Result<(), Status> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| Status::unavailable(constants::ERR_CONNECTION_CLOSED))
    }

    fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.shutdown.is_cancelled()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub struct ChannelBuilder {
    tls: TlsClientConfig,
    credentials: Option<Arc<dyn CallCredentials>>,
    config: ClientConfig,
    transport: TransportConfig,
    metrics: Arc<Metrics>,
}

impl ChannelBuilder {
    /// Attach `credentials` to every call made on the channel
    pub fn credentials(mut self, credentials: impl CallCredentials + 'static) -> Self {
        self.credentials = Some(Arc::new(credentials));
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Deadline for calls that do not set their own
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Connect to `address` (`host:port`), complete TLS and wait for the server preface
    #[instrument(skip(self), fields(authority = ?self.tls.authority()))]
    pub async fn open(self, address: &str) -> Result<Channel> {
        let (host, port) = split_address(address)?;
        let authority = self.tls.authority().unwrap_or(host).to_string();
        let client_tls = Arc::new(self.tls.load_client_config()?);
        let codec = PacketCodec::new(self.transport.max_payload_size);

        let connecting = async {
            let (mut framed, peer) = tls::connect(host, port, &self.tls, client_tls, codec).await?;
            await_preface(&mut framed).await?;
            Ok::<_, ProtocolError>((framed, peer))
        };
        let (framed, peer) = with_timeout_error(connecting, self.config.connection_timeout)
            .await
            .map_err(|e| match e {
                ProtocolError::Timeout => ProtocolError::Connection(format!(
                    "Timed out connecting to {address} after {:?}",
                    self.config.connection_timeout
                )),
                other => other,
            })?;

        self.metrics.connection_established();
        info!(%peer, "Channel open");

        let (sink, stream) = framed.split();
        let (outbound, queue) = mpsc::channel(self.config.backpressure_limit);
        let calls = Arc::new(CallTable::new());
        let shutdown = CancellationToken::new();

        let writer = tokio::spawn(write_loop(sink, queue, shutdown.clone()));
        let reader = tokio::spawn(read_loop(
            stream,
            calls.clone(),
            outbound.clone(),
            shutdown.clone(),
            self.metrics.clone(),
        ));

        Ok(Channel {
            inner: Arc::new(Shared {
                address: address.to_string(),
                authority,
                credentials: self.credentials,
                outbound,
                calls,
                metrics: self.metrics,
                next_call_id: AtomicU64::new(1),
                closing: AtomicBool::new(false),
                shutdown,
                default_timeout: self.config.call_timeout,
                call_buffer: self.transport.call_buffer,
                tasks: Mutex::new(vec![writer, reader]),
            }),
        })
    }
}

fn split_address(address: &str) -> Result<(&str, u16)> {
    let invalid = || ProtocolError::Connection(format!("Invalid address '{address}' (expected host:port)"));
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host, port))
}

async fn await_preface(framed: &mut ClientFramed) -> Result<()> {
    match framed.next().await {
        Some(Ok(packet)) => match Frame::from_packet(&packet)? {
            Frame::Ready => Ok(()),
            other => Err(ProtocolError::ProtocolViolation(format!(
                "Expected READY preface, got {}",
                other.kind()
            ))),
        },
        Some(Err(e)) => Err(ProtocolError::Connection(format!(
            "{}: {e}",
            constants::ERR_NO_PREFACE
        ))),
        None => Err(ProtocolError::Connection(constants::ERR_NO_PREFACE.to_string())),
    }
}

async fn write_frame(sink: &mut SplitSink<ClientFramed, Packet>, frame: Frame) -> Result<()> {
    sink.send(frame.to_packet()?).await
}

/// Drain the outbound queue into the socket; flush what is queued on shutdown
async fn write_loop(
    mut sink: SplitSink<ClientFramed, Packet>,
    mut queue: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.cancelled() => {
                while let Ok(frame) = queue.try_recv() {
                    if write_frame(&mut sink, frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        };
        if let Err(e) = write_frame(&mut sink, frame).await {
            debug!(error = %e, "Write failed, closing writer");
            break;
        }
    }
    let _ = sink.close().await;
}

/// Route server frames to their calls until the connection ends
async fn read_loop(
    mut stream: SplitStream<ClientFramed>,
    calls: Arc<CallTable<ClientSlot>>,
    outbound: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
    metrics: Arc<Metrics>,
) {
    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => break,
            item = stream.next() => item,
        };
        let packet = match item {
            Some(Ok(packet)) => packet,
            Some(Err(e)) => {
                debug!(error = %e, "Connection read failed");
                break;
            }
            None => break,
        };

        match Frame::from_packet(&packet) {
            Ok(Frame::Message { call_id, payload }) => {
                metrics.message_received(payload.len() as u64);
                match calls.with(call_id, |slot| slot.messages.try_send(payload)) {
                    Some(Ok(())) => {}
                    Some(Err(TrySendError::Full(_))) => {
                        metrics.protocol_error();
                        warn!(call_id, "{}", constants::ERR_RESPONSE_CREDIT_EXCEEDED);
                        if let Some(slot) = calls.remove(call_id) {
                            slot.state.finish(Status::resource_exhausted(
                                constants::ERR_RESPONSE_CREDIT_EXCEEDED,
                            ));
                            enqueue_nowait(&outbound, Frame::Cancel { call_id });
                        }
                    }
                    Some(Err(TrySendError::Closed(_))) => {
                        debug!(call_id, "Call no longer reads responses");
                    }
                    None => debug!(call_id, "Message for finished call dropped"),
                }
            }
            Ok(Frame::Trailers {
                call_id,
                code,
                message,
            }) => {
                if let Some(slot) = calls.remove(call_id) {
                    slot.state.finish(Status::new(Code::from_u16(code), message));
                }
            }
            Ok(Frame::WindowUpdate { call_id, credit }) => {
                calls.with(call_id, |slot| slot.state.grant(credit));
            }
            Ok(other) => {
                metrics.protocol_error();
                warn!(kind = other.kind(), "Unexpected frame from server");
            }
            Err(e) => {
                metrics.protocol_error();
                warn!(error = %e, "Malformed frame, closing connection");
                break;
            }
        }
    }

    // dropping the slots ends every pending call with UNAVAILABLE
    shutdown.cancel();
    let orphaned = calls.drain();
    if !orphaned.is_empty() {
        debug!(calls = orphaned.len(), "Connection ended with calls in flight");
    }
    metrics.connection_closed();
}

/// Handle to an open secure channel; clones share the connection
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Shared>,
}

impl Channel {
    pub fn builder(tls: TlsClientConfig) -> ChannelBuilder {
        ChannelBuilder {
            tls,
            credentials: None,
            config: ClientConfig::default(),
            transport: TransportConfig::default(),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Open a channel without call credentials
    pub async fn open(address: &str, tls: TlsClientConfig) -> Result<Channel> {
        Self::builder(tls).open(address).await
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn authority(&self) -> &str {
        &self.inner.authority
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    /// Stop accepting calls, give in-flight calls `grace` to finish, cancel the rest.
    ///
    /// Only the first call does anything.
    #[instrument(skip(self), fields(address = %self.inner.address))]
    pub async fn close(&self, grace: Duration) {
        let shared = &self.inner;
        if shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(in_flight = shared.calls.len(), "Closing channel");

        if tokio::time::timeout(grace, shared.calls.wait_idle()).await.is_err() {
            warn!(in_flight = shared.calls.len(), "Close grace period elapsed, cancelling calls");
            for (call_id, slot) in shared.calls.drain() {
                slot.state.finish(Status::cancelled(constants::ERR_CHANNEL_CLOSED));
                enqueue_nowait(&shared.outbound, Frame::Cancel { call_id });
            }
        }

        shared.shutdown.cancel();
        let tasks = std::mem::take(&mut *shared.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "Channel task ended abnormally");
            }
        }
        info!("Channel closed");
    }

    /// Attach credentials, register the call and send its headers
    async fn start(
        &self,
        method: &MethodDescriptor,
        options: CallOptions,
    ) -> std::result::Result<CallCore, Status> {
        let shared = &self.inner;
        if shared.is_closed() {
            return Err(Status::unavailable(constants::ERR_CHANNEL_CLOSED));
        }

        let CallOptions {
            mut metadata,
            timeout,
        } = options;
        if let Some(credentials) = &shared.credentials {
            let info = CallInfo {
                method: method.name(),
                authority: &shared.authority,
            };
            let attached = credentials.metadata(&info).await.map_err(|e| {
                warn!(method = method.name(), error = %e, "Failed to attach call credentials");
                Status::unauthenticated(format!("Failed to attach credentials: {e}")).with_cause(e)
            })?;
            metadata.merge(attached);
        }
        metadata.validate().map_err(Status::from)?;

        let call_id = shared.next_call_id.fetch_add(1, Ordering::Relaxed);
        let timeout = timeout.or(shared.default_timeout);
        let window = flow::window(shared.call_buffer);
        let (messages, messages_rx) = mpsc::channel(window as usize);
        let state = Arc::new(CallState::new());
        shared.calls.insert(
            call_id,
            ClientSlot {
                messages,
                state: state.clone(),
            },
        );
        // the reader may have drained the table between the check above and the insert
        if shared.shutdown.is_cancelled() {
            shared.calls.remove(call_id);
            return Err(Status::unavailable(constants::ERR_CONNECTION_CLOSED));
        }

        let headers = Frame::Headers {
            call_id,
            method: method.name().to_string(),
            metadata: metadata.into_wire(),
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
            window,
        };
        if let Err(status) = shared.send(headers).await {
            shared.calls.remove(call_id);
            return Err(status);
        }

        shared.metrics.call_started();
        debug!(call_id, method = method.name(), "Call started");
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        Ok(CallCore::new(
            call_id,
            shared.clone(),
            messages_rx,
            state,
            window,
            deadline,
        ))
    }

    async fn send_single<Req: Serialize>(
        &self,
        call: &CallCore,
        method: &MethodDescriptor,
        request: &Req,
    ) -> std::result::Result<(), Status> {
        let mut sender = RequestSender::new(call, method.request_codec());
        sender.send(request).await?;
        sender.close_send().await;
        Ok(())
    }

    /// One request, one response
    pub async fn unary<Req, Res>(
        &self,
        method: &MethodDescriptor,
        request: &Req,
        options: CallOptions,
    ) -> std::result::Result<Res, Status>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        expect_kind(method, CallKind::Unary)?;
        let call = self.start(method, options).await?;
        self.send_single(&call, method, request).await?;
        let mut responses = Streaming::new(call, method.response_codec());
        single_response(&mut responses).await
    }

    /// One request, a stream of responses
    pub async fn server_streaming<Req, Res>(
        &self,
        method: &MethodDescriptor,
        request: &Req,
        options: CallOptions,
    ) -> std::result::Result<Streaming<Res>, Status>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        expect_kind(method, CallKind::ServerStreaming)?;
        let call = self.start(method, options).await?;
        self.send_single(&call, method, request).await?;
        Ok(Streaming::new(call, method.response_codec()))
    }

    /// A stream of requests, one response
    pub async fn client_streaming<Req, Res>(
        &self,
        method: &MethodDescriptor,
        options: CallOptions,
    ) -> std::result::Result<ClientStreamingCall<Req, Res>, Status>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        expect_kind(method, CallKind::ClientStreaming)?;
        let call = self.start(method, options).await?;
        let sender = RequestSender::new(&call, method.request_codec());
        Ok(ClientStreamingCall::new(
            sender,
            Streaming::new(call, method.response_codec()),
        ))
    }

    /// Independent request and response streams
    pub async fn bidi_streaming<Req, Res>(
        &self,
        method: &MethodDescriptor,
        options: CallOptions,
    ) -> std::result::Result<(RequestSender<Req>, Streaming<Res>), Status>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        expect_kind(method, CallKind::BidiStreaming)?;
        let call = self.start(method, options).await?;
        let sender = RequestSender::new(&call, method.request_codec());
        Ok((sender, Streaming::new(call, method.response_codec())))
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("address", &self.inner.address)
            .field("authority", &self.inner.authority)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn expect_kind(method: &MethodDescriptor, shape: CallKind) -> std::result::Result<(), Status> {
    if method.kind() == shape {
        return Ok(());
    }
    Err(Status::from(ProtocolError::ConventionMismatch {
        method: method.name().to_string(),
        declared: method.kind().as_str(),
        handler: shape.as_str(),
    }))
}
