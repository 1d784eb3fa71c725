//! Call-multiplexing frames carried inside packets.
//!
//! Every frame except `Ready` names the call it belongs to. Within one call
//! the client sends `Headers`, any number of `Message`s and `HalfClose`; the
//! server answers with `Message`s and exactly one `Trailers`. Either side may
//! abandon a call with `Cancel`. `WindowUpdate` returns message credit to the
//! sender of the opposite direction.

use serde::{Deserialize, Serialize};

use crate::core::packet::Packet;
use crate::error::Result;

pub type CallId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Connection preface sent by the server once the TLS handshake is accepted
    Ready,
    Headers {
        call_id: CallId,
        method: String,
        metadata: Vec<(String, String)>,
        timeout_ms: Option<u64>,
        /// Response messages the client can queue before returning credit
        window: u32,
    },
    Message {
        call_id: CallId,
        payload: Vec<u8>,
    },
    HalfClose {
        call_id: CallId,
    },
    Cancel {
        call_id: CallId,
    },
    /// Terminal status of a call
    Trailers {
        call_id: CallId,
        code: u16,
        message: String,
    },
    WindowUpdate {
        call_id: CallId,
        credit: u32,
    },
}

impl Frame {
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Frame::Ready => None,
            Frame::Headers { call_id, .. }
            | Frame::Message { call_id, .. }
            | Frame::HalfClose { call_id }
            | Frame::Cancel { call_id }
            | Frame::Trailers { call_id, .. }
            | Frame::WindowUpdate { call_id, .. } => Some(*call_id),
        }
    }

    /// Short frame name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Ready => "READY",
            Frame::Headers { .. } => "HEADERS",
            Frame::Message { .. } => "MESSAGE",
            Frame::HalfClose { .. } => "HALF_CLOSE",
            Frame::Cancel { .. } => "CANCEL",
            Frame::Trailers { .. } => "TRAILERS",
            Frame::WindowUpdate { .. } => "WINDOW_UPDATE",
        }
    }

    pub fn to_packet(&self) -> Result<Packet> {
        Ok(Packet::new(bincode::serialize(self)?))
    }

    pub fn from_packet(packet: &Packet) -> Result<Self> {
        Ok(bincode::deserialize(&packet.payload)?)
    }
}
