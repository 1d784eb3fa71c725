//! Tokio codec framing [`Packet`]s over a byte stream.
//!
//! Decoding splits complete packets off the read buffer without copying the
//! remainder; a partial packet leaves the buffer untouched.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::{MAGIC_BYTES, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::core::packet::{Packet, HEADER_SIZE};
use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_payload: usize,
}

impl PacketCodec {
    /// Codec rejecting payloads larger than `max_payload` (capped at the protocol maximum)
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(MAX_PAYLOAD_SIZE),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        if src[0..4] != MAGIC_BYTES {
            return Err(ProtocolError::InvalidHeader);
        }

        let version = src[4];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let len = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;
        if len > self.max_payload {
            return Err(ProtocolError::OversizedPacket(len));
        }

        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(HEADER_SIZE + len);
        frame.advance(HEADER_SIZE);

        Ok(Some(Packet {
            version,
            payload: frame.to_vec(),
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        if item.payload.len() > self.max_payload {
            return Err(ProtocolError::OversizedPacket(item.payload.len()));
        }

        dst.reserve(HEADER_SIZE + item.payload.len());
        dst.put_slice(&MAGIC_BYTES);
        dst.put_u8(item.version);
        dst.put_u32(item.payload.len() as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}
