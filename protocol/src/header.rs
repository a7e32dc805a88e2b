use crate::codes::MessageCode;
use bitflags::bitflags;

/// Size in bytes of the fixed message header: `code(2) + flags(2) + id(4)
/// + size(4) + field_count(4)`.
pub const HEADER_LEN: usize = 16;

bitflags! {
    /// Bits carried in [`FramedMessage::flags`](crate::FramedMessage::flags).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
    pub struct MessageFlags: u16 {
        /// The body is a single opaque binary blob rather than typed fields
        /// (used for PDU passthrough and TCP-proxy data).
        const BINARY = 0x0001;
        /// This is the last chunk of a streamed reply.
        const END_OF_SEQUENCE = 0x0002;
    }
}

/// The fixed portion of a [`FramedMessage`](crate::FramedMessage).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub code: MessageCode,
    pub flags: MessageFlags,
    pub id: u32,
    /// Total wire size of the message, including this header, 8-byte aligned.
    pub size: u32,
    pub field_count: u32,
}

impl MessageHeader {
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.code.as_u16().to_be_bytes());
        buf.extend_from_slice(&self.flags.bits().to_be_bytes());
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf.extend_from_slice(&self.field_count.to_be_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= HEADER_LEN);
        let code = MessageCode::from_u16(u16::from_be_bytes([buf[0], buf[1]]));
        let flags = MessageFlags::from_bits_truncate(u16::from_be_bytes([buf[2], buf[3]]));
        let id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let size = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let field_count = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        Self {
            code,
            flags,
            id,
            size,
            field_count,
        }
    }
}

/// Peeks at the declared total size of a message from its first
/// [`HEADER_LEN`] bytes, without validating or decoding the rest. Used by
/// the session reader to know how many more bytes to buffer before calling
/// [`FramedMessage::decode`](crate::FramedMessage::decode).
pub fn peek_size(header_bytes: &[u8; HEADER_LEN]) -> u32 {
    u32::from_be_bytes([
        header_bytes[8],
        header_bytes[9],
        header_bytes[10],
        header_bytes[11],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let header = MessageHeader {
            code: MessageCode::GetTable,
            flags: MessageFlags::BINARY,
            id: 99,
            size: 32,
            field_count: 3,
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        let decoded = MessageHeader::read_from(&buf);
        assert_eq!(header, decoded);
        assert_eq!(peek_size(buf.as_slice().try_into().unwrap()), 32);
    }
}
