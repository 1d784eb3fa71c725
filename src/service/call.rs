//! Client-side call handles.
//!
//! A call is live while its slot sits in the channel's call table. The
//! connection reader removes the slot when trailers arrive; cancellation,
//! deadline expiry and dropping the handle remove it locally and tell the
//! server with a `Cancel` frame. The reader never waits on a call: responses
//! are queued within the window the call announced, and consuming them hands
//! credit back to the server.

use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::debug;

use crate::core::flow::{CreditGrant, SendCredit, INITIAL_REQUEST_CREDIT};
use crate::core::frame::{CallId, Frame};
use crate::core::serialization::SerializationFormat;
use crate::error::{constants, ProtocolError};
use crate::protocol::status::{Code, Status};
use crate::service::channel::Shared;

/// Terminal status and request credit of a live call.
///
/// Shared by the call handles and the connection reader; whichever ends the
/// call first records the status.
pub(crate) struct CallState {
    status: OnceLock<Status>,
    credit: SendCredit,
}

impl CallState {
    pub(crate) fn new() -> Self {
        Self {
            status: OnceLock::new(),
            credit: SendCredit::new(INITIAL_REQUEST_CREDIT),
        }
    }

    /// Record the terminal status; false if the call had already ended
    pub(crate) fn finish(&self, status: Status) -> bool {
        let first = self.status.set(status).is_ok();
        self.credit.close();
        first
    }

    pub(crate) fn status(&self) -> Option<Status> {
        self.status.get().cloned()
    }

    pub(crate) fn grant(&self, credit: u32) {
        self.credit.grant(credit);
    }
}

/// Reader-side entry of a live call
pub(crate) struct ClientSlot {
    pub(crate) messages: mpsc::Sender<Vec<u8>>,
    pub(crate) state: Arc<CallState>,
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        // a call still open when its slot goes away lost the connection
        self.state
            .finish(Status::unavailable(constants::ERR_CONNECTION_CLOSED));
    }
}

fn violation(message: &str) -> Status {
    Status::from(ProtocolError::ProtocolViolation(message.to_string()))
}

/// Queue `frame` without waiting; used where awaiting is impossible
pub(crate) fn enqueue_nowait(outbound: &mpsc::Sender<Frame>, frame: Frame) {
    match outbound.try_send(frame) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(frame)) => {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let outbound = outbound.clone();
                handle.spawn(async move {
                    let _ = outbound.send(frame).await;
                });
            }
        }
    }
}

/// Receiving half of a call shared by every call shape
pub(crate) struct CallCore {
    id: CallId,
    shared: Arc<Shared>,
    messages: mpsc::Receiver<Vec<u8>>,
    state: Arc<CallState>,
    grant: CreditGrant,
    deadline: Option<Instant>,
    status: Option<Status>,
}

impl CallCore {
    pub(crate) fn new(
        id: CallId,
        shared: Arc<Shared>,
        messages: mpsc::Receiver<Vec<u8>>,
        state: Arc<CallState>,
        window: u32,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            id,
            shared,
            messages,
            state,
            grant: CreditGrant::new(window),
            deadline,
            status: None,
        }
    }

    fn terminate(&mut self, status: Status) -> Status {
        self.shared.metrics.call_finished(status.code());
        self.status = Some(status.clone());
        status
    }

    /// Next response payload; `Ok(None)` once the call ended with OK
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, Status> {
        if let Some(status) = &self.status {
            return if status.is_ok() {
                Ok(None)
            } else {
                Err(status.clone())
            };
        }

        let received = loop {
            match self.deadline {
                Some(at) if self.state.status().is_none() => tokio::select! {
                    payload = self.messages.recv() => break payload,
                    _ = tokio::time::sleep_until(at) => {
                        // over on the server already; drain what it sent
                        if self.state.status().is_some() {
                            continue;
                        }
                        debug!(call_id = self.id, "Deadline exceeded");
                        return Err(self.abort(Status::deadline_exceeded("Deadline exceeded")));
                    }
                },
                _ => break self.messages.recv().await,
            }
        };

        match received {
            Some(payload) => {
                self.return_credit();
                Ok(Some(payload))
            }
            // the slot is gone, so the status is recorded
            None => {
                let status = self
                    .state
                    .status()
                    .unwrap_or_else(|| Status::unavailable(constants::ERR_CONNECTION_CLOSED));
                if status.is_ok() {
                    self.terminate(status);
                    Ok(None)
                } else {
                    Err(self.terminate(status))
                }
            }
        }
    }

    fn return_credit(&mut self) {
        if let Some(credit) = self.grant.consumed() {
            if self.state.status().is_none() {
                enqueue_nowait(
                    &self.shared.outbound,
                    Frame::WindowUpdate {
                        call_id: self.id,
                        credit,
                    },
                );
            }
        }
    }

    /// End the call locally with `status` and tell the server, unless the handle already ended
    fn abort(&mut self, status: Status) -> Status {
        if let Some(existing) = &self.status {
            return existing.clone();
        }
        if self.state.finish(status.clone()) && self.shared.calls.remove(self.id).is_some() {
            enqueue_nowait(&self.shared.outbound, Frame::Cancel { call_id: self.id });
        }
        self.terminate(status)
    }

    /// Replace the outcome of a finished call whose server broke the calling convention
    fn violate(&mut self, status: Status) -> Status {
        self.shared.metrics.protocol_error();
        self.status = Some(status.clone());
        status
    }
}

impl Drop for CallCore {
    fn drop(&mut self) {
        if self.status.is_some() {
            return;
        }
        if self.state.finish(Status::cancelled("Call handle dropped")) {
            if self.shared.calls.remove(self.id).is_some() {
                debug!(call_id = self.id, "Call handle dropped, cancelling");
                enqueue_nowait(&self.shared.outbound, Frame::Cancel { call_id: self.id });
            }
            self.shared.metrics.call_finished(Code::Cancelled);
        } else if let Some(status) = self.state.status() {
            // ended on the server but never read to the end
            self.shared.metrics.call_finished(status.code());
        }
    }
}

/// Response messages of a call followed by its terminal status
pub struct Streaming<T> {
    core: CallCore,
    codec: SerializationFormat,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Streaming<T> {
    pub(crate) fn new(core: CallCore, codec: SerializationFormat) -> Self {
        Self {
            core,
            codec,
            _marker: PhantomData,
        }
    }

    /// Next response, `Ok(None)` after an OK status, or the failure status.
    ///
    /// Once the call is over every further call returns the same outcome.
    pub async fn message(&mut self) -> Result<Option<T>, Status> {
        match self.core.recv().await? {
            Some(payload) => match self.codec.decode(&payload) {
                Ok(message) => Ok(Some(message)),
                Err(e) => Err(self.core.abort(
                    Status::internal(format!("Failed to decode response: {e}")).with_cause(e),
                )),
            },
            None => Ok(None),
        }
    }

    /// Terminal status, once the call is over
    pub fn status(&self) -> Option<Status> {
        self.core.status.clone()
    }

    /// Stop the call; the server stops producing and the status becomes CANCELLED
    pub fn cancel(&mut self) {
        self.core.abort(Status::cancelled("Call cancelled by client"));
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<T, Status>>
    where
        T: Send + 'static,
    {
        stream::unfold(Some(self), |state| async move {
            let mut responses = state?;
            match responses.message().await {
                Ok(Some(message)) => Some((Ok(message), Some(responses))),
                Ok(None) => None,
                Err(status) => Some((Err(status), None)),
            }
        })
        .boxed()
    }
}

impl<T> std::fmt::Debug for Streaming<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streaming")
            .field("call_id", &self.core.id)
            .field("status", &self.core.status)
            .finish()
    }
}

/// Sending half of a call.
///
/// Dropping the sender half-closes the call.
pub struct RequestSender<T> {
    id: CallId,
    shared: Arc<Shared>,
    state: Arc<CallState>,
    codec: SerializationFormat,
    half_closed: bool,
    _marker: PhantomData<fn(&T)>,
}

impl<T: Serialize> RequestSender<T> {
    pub(crate) fn new(call: &CallCore, codec: SerializationFormat) -> Self {
        Self {
            id: call.id,
            shared: call.shared.clone(),
            state: call.state.clone(),
            codec,
            half_closed: false,
            _marker: PhantomData,
        }
    }

    /// Send one request.
    ///
    /// Waits while the server has no room for it. Once the call is over this
    /// returns the status the call ended with.
    pub async fn send(&mut self, message: &T) -> Result<(), Status> {
        if self.half_closed {
            return Err(violation(constants::ERR_SEND_AFTER_HALF_CLOSE));
        }
        let payload = self.codec.encode(message).map_err(|e| {
            Status::internal(format!("Failed to encode request: {e}")).with_cause(e)
        })?;
        if !self.state.credit.acquire().await {
            return Err(self.ended());
        }
        let len = payload.len() as u64;
        self.shared
            .send(Frame::Message {
                call_id: self.id,
                payload,
            })
            .await?;
        self.shared.metrics.message_sent(len);
        Ok(())
    }

    fn ended(&self) -> Status {
        match self.state.status() {
            Some(status) if !status.is_ok() => status,
            _ => violation(constants::ERR_SEND_AFTER_TERMINATION),
        }
    }

    /// Signal that no more requests follow; repeated calls do nothing
    pub async fn close_send(&mut self) {
        if std::mem::replace(&mut self.half_closed, true) {
            return;
        }
        if self.state.status().is_none() {
            let _ = self.shared.send(Frame::HalfClose { call_id: self.id }).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.half_closed
    }
}

impl<T> Drop for RequestSender<T> {
    fn drop(&mut self) {
        if !self.half_closed && self.state.status().is_none() {
            enqueue_nowait(&self.shared.outbound, Frame::HalfClose { call_id: self.id });
        }
    }
}

/// A client-streaming call: any number of requests, then one response
pub struct ClientStreamingCall<Req, Res> {
    sender: RequestSender<Req>,
    responses: Streaming<Res>,
}

impl<Req: Serialize, Res: DeserializeOwned> ClientStreamingCall<Req, Res> {
    pub(crate) fn new(sender: RequestSender<Req>, responses: Streaming<Res>) -> Self {
        Self { sender, responses }
    }

    pub async fn send(&mut self, message: &Req) -> Result<(), Status> {
        self.sender.send(message).await
    }

    /// Half-close and wait for the single response
    pub async fn close_and_recv(mut self) -> Result<Res, Status> {
        self.sender.close_send().await;
        single_response(&mut self.responses).await
    }
}

/// Read exactly one response followed by an OK status
pub(crate) async fn single_response<T: DeserializeOwned>(
    responses: &mut Streaming<T>,
) -> Result<T, Status> {
    let Some(response) = responses.message().await? else {
        return Err(responses
            .core
            .violate(violation(constants::ERR_MISSING_RESPONSE)));
    };
    match responses.message().await? {
        None => Ok(response),
        Some(_) => Err(responses
            .core
            .abort(violation(constants::ERR_EXTRA_RESPONSE))),
    }
}
