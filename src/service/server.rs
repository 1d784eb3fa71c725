//! # RPC Server
//!
//! Accepts TLS connections, sends the `Ready` preface and multiplexes calls
//! over each connection. Every call runs in its own task; frames leave the
//! connection through a single bounded writer queue. The reader never waits on
//! a call: requests are queued within the credit the call granted, and a
//! client that overruns it fails only that call.
//!
//! ## Shutdown
//! When the shutdown signal fires the listener stops accepting, new calls are
//! refused with `UNAVAILABLE` and in-flight calls get `shutdown_timeout` to
//! finish before they are cancelled.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ServerConfig, TransportConfig};
use crate::core::codec::PacketCodec;
use crate::core::flow::{self, SendCredit};
use crate::core::frame::{CallId, Frame};
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::{self, IncomingCall, ResponseSink, Service};
use crate::protocol::interceptor::{Interceptor, InterceptorChain};
use crate::protocol::metadata::Metadata;
use crate::protocol::status::{Code, Status};
use crate::service::table::CallTable;
use crate::transport::tls::TlsServerConfig;
use crate::utils::metrics::Metrics;

type ServerFramed = Framed<TlsStream<TcpStream>, PacketCodec>;

/// Server half of a live call as seen by the connection reader
struct ServerCall {
    /// Dropped on half-close so the handler sees the end of its request stream
    inbound: Option<mpsc::Sender<Vec<u8>>>,
    half_closed: watch::Sender<bool>,
    cancel: CancellationToken,
    /// Fired when the client sends more requests than it was granted
    overflow: CancellationToken,
    /// Response credit granted by the client
    credit: Arc<SendCredit>,
}

/// What became of a request message handed to a call
enum Delivery {
    Queued,
    Overflowed,
    Dropped,
    AfterHalfClose,
}

/// Queue a request without waiting; a call that overruns its credit is ended alone
fn deliver(call: &mut ServerCall, payload: Vec<u8>) -> Delivery {
    if call.overflow.is_cancelled() {
        return Delivery::Dropped;
    }
    let Some(inbound) = &call.inbound else {
        return Delivery::AfterHalfClose;
    };
    match inbound.try_send(payload) {
        Ok(()) => Delivery::Queued,
        Err(TrySendError::Full(_)) => {
            call.overflow.cancel();
            Delivery::Overflowed
        }
        Err(TrySendError::Closed(_)) => Delivery::Dropped,
    }
}

/// State shared by every connection of a server
struct Shared {
    service: Service,
    interceptors: InterceptorChain,
    config: ServerConfig,
    transport: TransportConfig,
    metrics: Arc<Metrics>,
    /// Fired when shutdown starts; new calls are refused afterwards
    draining: CancellationToken,
    /// Parent of every connection and call token; fired when the grace period ends
    force: CancellationToken,
}

pub struct ServerBuilder {
    service: Service,
    tls: Option<TlsServerConfig>,
    interceptors: InterceptorChain,
    config: ServerConfig,
    transport: TransportConfig,
    metrics: Arc<Metrics>,
}

impl ServerBuilder {
    pub fn tls(mut self, tls: TlsServerConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Append an interceptor; interceptors run in the order they are added
    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Load certificates and validate settings; failures here are fatal at startup
    pub fn build(self) -> Result<Server> {
        let tls = self
            .tls
            .ok_or_else(|| ProtocolError::ConfigError("TLS configuration is required".into()))?;
        let acceptor = tls.acceptor()?;

        let mut errors = self.config.validate();
        errors.extend(self.transport.validate());
        if !errors.is_empty() {
            return Err(ProtocolError::ConfigError(errors.join("; ")));
        }

        Ok(Server {
            acceptor,
            shared: Arc::new(Shared {
                service: self.service,
                interceptors: self.interceptors,
                config: self.config,
                transport: self.transport,
                metrics: self.metrics,
                draining: CancellationToken::new(),
                force: CancellationToken::new(),
            }),
        })
    }
}

pub struct Server {
    acceptor: TlsAcceptor,
    shared: Arc<Shared>,
}

impl Server {
    pub fn builder(service: Service) -> ServerBuilder {
        ServerBuilder {
            service,
            tls: None,
            interceptors: InterceptorChain::new(),
            config: ServerConfig::default(),
            transport: TransportConfig::default(),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.shared.metrics.clone()
    }

    /// Bind `addr` and serve until Ctrl-C
    pub async fn serve(self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_with_shutdown(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve connections from `listener` until `signal` resolves, then drain
    #[instrument(skip_all, fields(service = %self.shared.service.name()))]
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let local = listener.local_addr()?;
        info!(address = %local, methods = self.shared.service.descriptor().len(), "Server listening");

        let mut connections = JoinSet::new();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if connections.len() >= self.shared.config.max_connections {
                            warn!(%peer, "Connection limit reached, dropping connection");
                            continue;
                        }
                        let acceptor = self.acceptor.clone();
                        let shared = self.shared.clone();
                        connections.spawn(handle_connection(stream, peer, acceptor, shared));
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        info!(in_flight = connections.len(), "Shutting down, draining connections");
        self.shared.draining.cancel();

        let drained = tokio::time::timeout(self.shared.config.shutdown_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("Shutdown grace period elapsed, cancelling remaining calls");
            self.shared.force.cancel();
            let flushed = tokio::time::timeout(Duration::from_secs(1), async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if flushed.is_err() {
                connections.abort_all();
            }
        }

        self.shared.metrics.log_metrics();
        info!("Server stopped");
        Ok(())
    }
}

#[instrument(skip_all, fields(%peer))]
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    shared: Arc<Shared>,
) {
    let tls = match tokio::time::timeout(shared.config.handshake_timeout, acceptor.accept(stream)).await
    {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            shared.metrics.handshake_failed();
            warn!(error = %e, "TLS handshake failed");
            return;
        }
        Err(_) => {
            shared.metrics.handshake_failed();
            warn!("TLS handshake timed out");
            return;
        }
    };

    let mut framed = Framed::new(tls, PacketCodec::new(shared.transport.max_payload_size));
    if let Err(e) = send_frame(&mut framed, Frame::Ready).await {
        warn!(error = %e, "Failed to send connection preface");
        return;
    }

    shared.metrics.connection_established();
    info!("Connection established");

    let (sink, stream) = framed.split();
    let (outbound, queue) = mpsc::channel(shared.config.backpressure_limit);
    let writer = tokio::spawn(write_loop(sink, queue));

    let conn_token = shared.force.child_token();
    let table = Arc::new(CallTable::new());
    read_loop(stream, peer, &outbound, &table, &conn_token, &shared).await;

    conn_token.cancel();
    for (_, call) in table.drain() {
        call.cancel.cancel();
        call.credit.close();
    }
    drop(outbound);
    if let Err(e) = writer.await {
        debug!(error = %e, "Writer task ended abnormally");
    }

    shared.metrics.connection_closed();
    info!("Connection closed");
}

async fn send_frame(framed: &mut ServerFramed, frame: Frame) -> Result<()> {
    framed.send(frame.to_packet()?).await
}

/// Drain the outbound queue into the socket until every sender is gone
async fn write_loop(mut sink: SplitSink<ServerFramed, Packet>, mut queue: mpsc::Receiver<Frame>) {
    while let Some(frame) = queue.recv().await {
        let kind = frame.kind();
        let packet = match frame.to_packet() {
            Ok(packet) => packet,
            Err(e) => {
                error!(error = %e, kind, "Failed to encode frame");
                continue;
            }
        };
        if let Err(e) = sink.send(packet).await {
            debug!(error = %e, "Write failed, closing writer");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<ServerFramed>,
    peer: SocketAddr,
    outbound: &mpsc::Sender<Frame>,
    table: &Arc<CallTable<ServerCall>>,
    conn_token: &CancellationToken,
    shared: &Arc<Shared>,
) {
    let mut draining = false;

    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(packet)) => match Frame::from_packet(&packet) {
                    Ok(frame) => on_frame(frame, peer, outbound, table, conn_token, shared, draining).await,
                    Err(e) => {
                        shared.metrics.protocol_error();
                        warn!(error = %e, "Malformed frame, closing connection");
                        break;
                    }
                },
                Some(Err(e)) => {
                    if e.is_connection_error() {
                        debug!(error = %e, "Connection read failed");
                    } else {
                        shared.metrics.protocol_error();
                        warn!(error = %e, "Framing error, closing connection");
                    }
                    break;
                }
                None => break,
            },
            _ = shared.draining.cancelled(), if !draining => {
                draining = true;
                debug!(in_flight = table.len(), "Draining connection");
            }
            _ = table.wait_idle(), if draining => break,
            _ = conn_token.cancelled() => break,
        }
    }
}

async fn on_frame(
    frame: Frame,
    peer: SocketAddr,
    outbound: &mpsc::Sender<Frame>,
    table: &Arc<CallTable<ServerCall>>,
    conn_token: &CancellationToken,
    shared: &Arc<Shared>,
    draining: bool,
) {
    match frame {
        Frame::Headers {
            call_id,
            method,
            metadata,
            timeout_ms,
            window,
        } => {
            if draining {
                reject(outbound, call_id, Status::unavailable(constants::ERR_SERVER_SHUTTING_DOWN)).await;
                return;
            }
            if table.len() >= shared.config.max_concurrent_calls {
                reject(
                    outbound,
                    call_id,
                    Status::new(Code::ResourceExhausted, "Too many concurrent calls"),
                )
                .await;
                return;
            }

            let request_window = flow::window(shared.transport.call_buffer);
            let (inbound, inbound_rx) = mpsc::channel(request_window as usize);
            let (half_closed, half_closed_rx) = watch::channel(false);
            let cancel = conn_token.child_token();
            let overflow = CancellationToken::new();
            let credit = Arc::new(SendCredit::new(window.max(1)));
            let slot = ServerCall {
                inbound: Some(inbound),
                half_closed,
                cancel: cancel.clone(),
                overflow: overflow.clone(),
                credit: credit.clone(),
            };
            if !table.insert(call_id, slot) {
                shared.metrics.protocol_error();
                warn!(call_id, "{}", constants::ERR_DUPLICATE_CALL_ID);
                return;
            }

            shared.metrics.call_started();
            let call = IncomingCall {
                call_id,
                method,
                metadata: Metadata::from_wire(metadata),
                peer,
                deadline: timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms)),
                inbound: inbound_rx,
                half_closed: half_closed_rx,
                window: request_window,
                cancel,
                overflow,
            };
            tokio::spawn(run_call(call, credit, outbound.clone(), table.clone(), shared.clone()));
        }
        Frame::Message { call_id, payload } => {
            shared.metrics.message_received(payload.len() as u64);
            match table.with(call_id, |call| deliver(call, payload)) {
                Some(Delivery::Queued) => {}
                Some(Delivery::Overflowed) => {
                    shared.metrics.protocol_error();
                    warn!(call_id, "{}", constants::ERR_REQUEST_CREDIT_EXCEEDED);
                }
                Some(Delivery::Dropped) => {
                    debug!(call_id, "Handler no longer reads requests, message dropped");
                }
                Some(Delivery::AfterHalfClose) => {
                    shared.metrics.protocol_error();
                    warn!(call_id, "{}", constants::ERR_SEND_AFTER_HALF_CLOSE);
                }
                None => debug!(call_id, "Message for finished call dropped"),
            }
        }
        Frame::HalfClose { call_id } => {
            table.with(call_id, |call| {
                call.inbound = None;
                call.half_closed.send_replace(true);
            });
        }
        Frame::Cancel { call_id } => {
            if table.with(call_id, |call| call.cancel.cancel()).is_some() {
                debug!(call_id, "Call cancelled by client");
            }
        }
        Frame::WindowUpdate { call_id, credit } => {
            table.with(call_id, |call| call.credit.grant(credit));
        }
        other => {
            shared.metrics.protocol_error();
            warn!(kind = other.kind(), "Unexpected frame from client");
        }
    }
}

async fn reject(outbound: &mpsc::Sender<Frame>, call_id: CallId, status: Status) {
    debug!(call_id, %status, "Call refused");
    let _ = outbound
        .send(Frame::Trailers {
            call_id,
            code: status.code().as_u16(),
            message: status.message().to_string(),
        })
        .await;
}

#[instrument(skip_all, fields(call_id = call.call_id, method = %call.method))]
async fn run_call(
    call: IncomingCall,
    credit: Arc<SendCredit>,
    outbound: mpsc::Sender<Frame>,
    table: Arc<CallTable<ServerCall>>,
    shared: Arc<Shared>,
) {
    let call_id = call.call_id;
    let started = Instant::now();
    let sink = ResponseSink::new(call_id, outbound, credit, shared.metrics.clone());

    let status = dispatcher::execute(&shared.service, &shared.interceptors, call, &sink).await;

    table.remove(call_id);
    shared.metrics.call_finished(status.code());
    if status.is_ok() {
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Call completed");
    } else {
        info!(code = %status.code(), message = status.message(), "Call failed");
    }
    sink.finish(&status).await;
}
