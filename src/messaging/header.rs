//! Messaging frame header.
//!
//! ```text
//! [version:1][flags:1][reserved:2][seq:4][ack:4][checksum:4] payload
//! ```
//!
//! All integers are big-endian. A request carries the sender's slot in
//! `seq`; its ACK echoes that slot in `ack` and sets [`FLAG_ACK`].

use super::MessagingError;

pub const MESSAGE_HEADER_LEN: usize = 16;

pub const MESSAGE_VERSION: u8 = 0;

/// Set on replies.
pub const FLAG_ACK: u8 = 0x1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u8,
    pub flags: u8,
    pub seq: u32,
    pub ack: u32,
    pub checksum: u32,
}

impl MessageHeader {
    pub fn request(seq: u32, payload: &[u8]) -> Self {
        Self {
            version: MESSAGE_VERSION,
            flags: 0,
            seq,
            ack: 0,
            checksum: checksum(payload),
        }
    }

    pub fn ack(seq: u32, payload: &[u8]) -> Self {
        Self {
            version: MESSAGE_VERSION,
            flags: FLAG_ACK,
            seq: 0,
            ack: seq,
            checksum: checksum(payload),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    /// Header followed by `payload`.
    pub fn encode_with(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MESSAGE_HEADER_LEN + payload.len());
        buf.push(self.version);
        buf.push(self.flags);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.ack.to_be_bytes());
        buf.extend_from_slice(&self.checksum.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// Split a frame into its header and payload. The checksum is not
    /// checked here.
    pub fn decode(data: &[u8]) -> Result<(Self, &[u8]), MessagingError> {
        if data.len() < MESSAGE_HEADER_LEN {
            return Err(MessagingError::Malformed("frame shorter than header"));
        }
        let word = |at: usize| u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let header = Self {
            version: data[0],
            flags: data[1],
            seq: word(4),
            ack: word(8),
            checksum: word(12),
        };
        Ok((header, &data[MESSAGE_HEADER_LEN..]))
    }

    pub fn verify(&self, payload: &[u8]) -> bool {
        self.checksum == checksum(payload)
    }
}

/// Sum of the payload read as big-endian 16-bit words. An odd trailing
/// byte counts as the high half of a word.
pub fn checksum(payload: &[u8]) -> u32 {
    payload.chunks(2).fold(0u32, |sum, chunk| {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]) as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        };
        sum.wrapping_add(word)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0x01, 0x02]), 0x0102);
        assert_eq!(checksum(&[0x01, 0x02, 0x03]), 0x0102 + 0x0300);
        assert_eq!(checksum(&[0xff; 4]), 0xffff * 2);
    }

    #[test]
    fn test_layout() {
        let payload = b"hi";
        let frame = MessageHeader::ack(7, payload).encode_with(payload);
        assert_eq!(
            frame,
            vec![0, FLAG_ACK, 0, 0, 0, 0, 0, 0, 0, 0, 0, 7, 0, 0, 0x68, 0x69, b'h', b'i']
        );

        let (header, body) = MessageHeader::decode(&frame).unwrap();
        assert!(header.is_ack());
        assert_eq!(header.ack, 7);
        assert_eq!(body, payload);
        assert!(header.verify(body));
        assert!(!header.verify(b"ho"));
    }

    #[test]
    fn test_request_starts_with_version_zero() {
        let frame = MessageHeader::request(3, b"ping").encode_with(b"ping");
        assert_eq!(frame[0], 0);
        assert_eq!(frame[1], 0);
        assert_eq!(&frame[4..8], &[0, 0, 0, 3]);
    }

    #[test]
    fn test_short_frame() {
        assert!(matches!(
            MessageHeader::decode(&[1, 0, 0]),
            Err(MessagingError::Malformed(_))
        ));
    }
}
