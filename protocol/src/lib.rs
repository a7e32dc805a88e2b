//! # Wire Protocol
//!
//! Defines the length-framed binary message format spoken between the
//! monitoring agent and the management servers it talks to: a fixed
//! 16-byte header followed by a sequence of typed fields.
//!
//! The header layout and invariants mirror the external interface
//! described by the daemon's specification:
//! - `size` counts the whole message (header + body) and is always a
//!   multiple of 8 (trailing zero padding is added as needed).
//! - `id` is the correlator a caller uses to match a reply to its
//!   request.
//! - `flags` carries [`MessageFlags::BINARY`] for opaque blob payloads
//!   and [`MessageFlags::END_OF_SEQUENCE`] for the last chunk of a
//!   streamed reply.

mod codes;
mod field;
mod header;

pub use codes::MessageCode;
pub use field::{FieldValue, Table};
pub use header::{peek_size, MessageFlags, MessageHeader, HEADER_LEN};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hard ceiling on total wire size for a single message, in bytes.
///
/// A few MiB is enough for the largest streamed table chunk; anything
/// bigger must be split across multiple `END_OF_SEQUENCE`-terminated
/// messages by the caller.
pub const MAX_MESSAGE_SIZE: u32 = 4 * 1024 * 1024;

/// Errors that can occur while encoding or decoding a [`FramedMessage`].
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("message exceeds maximum size: {0} > {MAX_MESSAGE_SIZE}")]
    TooLarge(u32),
    #[error("message too short to contain a header: {0} bytes")]
    Truncated(usize),
    #[error("declared size {declared} does not match available {available} bytes")]
    SizeMismatch { declared: u32, available: usize },
    #[error("declared size {0} is not 8-byte aligned")]
    Unaligned(u32),
    #[error("field encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// A single request/response unit exchanged over a [`Session`](crate)-level
/// connection: a header plus a field map keyed by field id.
///
/// Field order is not significant on the wire (each field carries its own
/// id), but encoding is deterministic because [`BTreeMap`] iterates in key
/// order — this keeps round-trip tests byte-exact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramedMessage {
    pub code: MessageCode,
    pub flags: MessageFlags,
    pub id: u32,
    pub fields: BTreeMap<u32, FieldValue>,
}

impl FramedMessage {
    /// Builds a new message with no fields set.
    pub fn new(code: MessageCode, id: u32) -> Self {
        Self {
            code,
            flags: MessageFlags::empty(),
            id,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, id: u32, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(id, value.into());
        self
    }

    pub fn set_field(&mut self, id: u32, value: impl Into<FieldValue>) -> &mut Self {
        self.fields.insert(id, value.into());
        self
    }

    pub fn field(&self, id: u32) -> Option<&FieldValue> {
        self.fields.get(&id)
    }

    pub fn is_binary(&self) -> bool {
        self.flags.contains(MessageFlags::BINARY)
    }

    pub fn is_end_of_sequence(&self) -> bool {
        self.flags.contains(MessageFlags::END_OF_SEQUENCE)
    }

    /// Encodes this message to its wire representation: a 16-byte header
    /// followed by the bincode-serialized field map, zero-padded up to
    /// the next multiple of 8 bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let body = bincode::serialize(&self.fields)?;
        let unpadded = HEADER_LEN + body.len();
        let padded = unpadded.div_ceil(8) * 8;
        let total = u32::try_from(padded).map_err(|_| FrameError::TooLarge(u32::MAX))?;
        if total > MAX_MESSAGE_SIZE {
            return Err(FrameError::TooLarge(total));
        }

        let mut buf = Vec::with_capacity(padded);
        let header = MessageHeader {
            code: self.code,
            flags: self.flags,
            id: self.id,
            size: total,
            field_count: self.fields.len() as u32,
        };
        header.write_to(&mut buf);
        buf.extend_from_slice(&body);
        buf.resize(padded, 0);
        Ok(buf)
    }

    /// Decodes a complete message from `buf`. `buf` must contain exactly
    /// one message (the caller is responsible for splitting a byte stream
    /// on `header.size` boundaries, see [`header::peek_size`]).
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Truncated(buf.len()));
        }
        let header = MessageHeader::read_from(&buf[..HEADER_LEN]);
        if header.size % 8 != 0 {
            return Err(FrameError::Unaligned(header.size));
        }
        if header.size as usize != buf.len() {
            return Err(FrameError::SizeMismatch {
                declared: header.size,
                available: buf.len(),
            });
        }
        if header.size > MAX_MESSAGE_SIZE {
            return Err(FrameError::TooLarge(header.size));
        }

        let body = &buf[HEADER_LEN..];
        let fields: BTreeMap<u32, FieldValue> = if header.field_count == 0 {
            BTreeMap::new()
        } else {
            bincode::deserialize(body)?
        };
        Ok(Self {
            code: header.code,
            flags: header.flags,
            id: header.id,
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn round_trip_empty_message() {
        let msg = FramedMessage::new(MessageCode::Keepalive, 42);
        let wire = msg.encode().unwrap();
        assert_eq!(wire.len() % 8, 0);
        let decoded = FramedMessage::decode(&wire).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trip_mixed_fields() {
        let msg = FramedMessage::new(MessageCode::GetParameter, 7)
            .with_field(1, "Agent.Uptime".to_string())
            .with_field(2, 123_456u32)
            .with_field(3, Uuid::nil())
            .with_field(4, vec![1u8, 2, 3, 4]);
        let wire = msg.encode().unwrap();
        let decoded = FramedMessage::decode(&wire).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn size_is_eight_byte_aligned_for_odd_bodies() {
        let msg = FramedMessage::new(MessageCode::DciData, 1).with_field(1, "x".to_string());
        let wire = msg.encode().unwrap();
        assert_eq!(wire.len() % 8, 0);
    }

    #[test]
    fn rejects_truncated_buffer() {
        let err = FramedMessage::decode(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, FrameError::Truncated(4)));
    }

    #[test]
    fn rejects_size_mismatch() {
        let msg = FramedMessage::new(MessageCode::Keepalive, 1);
        let mut wire = msg.encode().unwrap();
        wire.push(0); // now longer than declared size
        let err = FramedMessage::decode(&wire).unwrap_err();
        assert!(matches!(err, FrameError::SizeMismatch { .. }));
    }

    #[test]
    fn flags_round_trip() {
        let mut msg = FramedMessage::new(MessageCode::TcpProxyData, 1);
        msg.flags = MessageFlags::BINARY | MessageFlags::END_OF_SEQUENCE;
        let wire = msg.encode().unwrap();
        let decoded = FramedMessage::decode(&wire).unwrap();
        assert!(decoded.is_binary());
        assert!(decoded.is_end_of_sequence());
    }
}
