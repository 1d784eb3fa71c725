//! Wire packet: `[magic(4)] [version(1)] [length(4, big endian)] [payload(N)]`.

use crate::config::{MAGIC_BYTES, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::error::{ProtocolError, Result};

/// Size of the fixed packet header in bytes
pub const HEADER_SIZE: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Wrap a payload in a packet tagged with the current protocol version
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    /// Serialize header and payload into a contiguous buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&MAGIC_BYTES);
        out.push(self.version);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a complete packet from a buffer.
    ///
    /// Validates magic, version and the declared length before allocating.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidHeader);
        }
        if buf[0..4] != MAGIC_BYTES {
            return Err(ProtocolError::InvalidHeader);
        }

        let version = buf[4];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::OversizedPacket(len));
        }
        if buf.len() < HEADER_SIZE + len {
            return Err(ProtocolError::InvalidHeader);
        }

        Ok(Self {
            version,
            payload: buf[HEADER_SIZE..HEADER_SIZE + len].to_vec(),
        })
    }
}
