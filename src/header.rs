//! Tunnel Wire Header
//!
//! Every UDP datagram exchanged between peers starts with a fixed 36-byte
//! header. For encrypted packets the whole header is bound to the AEAD tag
//! as additional data; relay envelopes carry it in the clear.
//!
//! ## Layout (36 bytes, big-endian)
//!
//! ```text
//! [ver(4bits)+type(4bits)][subtype:1][reserved:2]
//! [remote_index:4][message_counter:8]
//! [relay_dest_addr:4][relay_src_addr:4][relay_dest_port:2][relay_src_port:2]
//! [network_id:8]
//! ```
//!
//! The relay fields are zero unless the packet is a relay envelope.

use crate::addr::{NetworkId, VpnAddr};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Current header version (high nibble of byte 0).
pub const VERSION: u8 = 1;

/// Size of the encoded header.
pub const HEADER_LEN: usize = 36;

/// Handshake subtype: Noise IX.
pub const SUBTYPE_HANDSHAKE_IX_PSK0: u8 = 0;

/// Non-tunnel message subtypes.
pub const SUBTYPE_NON_TUN_MAIN: u8 = 0;
pub const SUBTYPE_NON_TUN_ACK: u8 = 1;

/// Lighthouse subtypes.
pub const SUBTYPE_HOST_QUERY: u8 = 0;
pub const SUBTYPE_HOST_QUERY_REPLY: u8 = 1;
pub const SUBTYPE_HOST_UPDATE_NOTIFICATION: u8 = 2;

/// Test subtypes.
pub const SUBTYPE_TEST_REQUEST: u8 = 0;
pub const SUBTYPE_TEST_REPLY: u8 = 1;

/// Handshake stage 1 carries counter 1, stage 2 carries counter 2.
pub const HANDSHAKE_STAGE1_COUNTER: u64 = 1;
pub const HANDSHAKE_STAGE2_COUNTER: u64 = 2;

/// Errors parsing a wire header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header too short: {0} bytes")]
    TooShort(usize),

    #[error("unsupported header version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type {0}")]
    UnknownType(u8),
}

// ============================================================================
// Message Type
// ============================================================================

/// Packet type (low nibble of byte 0).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 0,
    Message = 1,
    RecvError = 2,
    LightHouse = 3,
    Test = 4,
    CloseTunnel = 5,
    NonTunMessage = 6,
    RelayPacket = 7,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = HeaderError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MessageType::Handshake,
            1 => MessageType::Message,
            2 => MessageType::RecvError,
            3 => MessageType::LightHouse,
            4 => MessageType::Test,
            5 => MessageType::CloseTunnel,
            6 => MessageType::NonTunMessage,
            7 => MessageType::RelayPacket,
            other => return Err(HeaderError::UnknownType(other)),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Handshake => "handshake",
            MessageType::Message => "message",
            MessageType::RecvError => "recv_error",
            MessageType::LightHouse => "lighthouse",
            MessageType::Test => "test",
            MessageType::CloseTunnel => "close_tunnel",
            MessageType::NonTunMessage => "non_tun_message",
            MessageType::RelayPacket => "relay_packet",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Relay Fields
// ============================================================================

/// Explicit source/destination carried by a relay envelope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayFields {
    pub dest_addr: VpnAddr,
    pub src_addr: VpnAddr,
    pub dest_port: u16,
    pub src_port: u16,
}

impl RelayFields {
    pub fn new(dest_addr: VpnAddr, src_addr: VpnAddr) -> Self {
        Self {
            dest_addr,
            src_addr,
            dest_port: 0,
            src_port: 0,
        }
    }
}

// ============================================================================
// Header
// ============================================================================

/// Parsed tunnel header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MessageType,
    pub subtype: u8,
    /// Index chosen by the receiver of this packet.
    pub remote_index: u32,
    /// Per-tunnel counter, also the AEAD nonce.
    pub message_counter: u64,
    pub relay: RelayFields,
    pub network_id: NetworkId,
}

impl Header {
    pub fn new(
        msg_type: MessageType,
        subtype: u8,
        remote_index: u32,
        message_counter: u64,
        network_id: NetworkId,
    ) -> Self {
        Self {
            version: VERSION,
            msg_type,
            subtype,
            remote_index,
            message_counter,
            relay: RelayFields::default(),
            network_id,
        }
    }

    /// Builder-style relay field setter.
    pub fn with_relay(mut self, relay: RelayFields) -> Self {
        self.relay = relay;
        self
    }

    /// Encode into a fixed-size buffer.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = (self.version << 4) | (self.msg_type.as_u8() & 0x0F);
        buf[1] = self.subtype;
        // bytes 2..4 reserved
        buf[4..8].copy_from_slice(&self.remote_index.to_be_bytes());
        buf[8..16].copy_from_slice(&self.message_counter.to_be_bytes());
        buf[16..20].copy_from_slice(&self.relay.dest_addr.as_u32().to_be_bytes());
        buf[20..24].copy_from_slice(&self.relay.src_addr.as_u32().to_be_bytes());
        buf[24..26].copy_from_slice(&self.relay.dest_port.to_be_bytes());
        buf[26..28].copy_from_slice(&self.relay.src_port.to_be_bytes());
        buf[28..36].copy_from_slice(&self.network_id.to_be_bytes());
        buf
    }

    /// Encode and append `payload`.
    pub fn encode_with(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(&self.encode());
        out.extend_from_slice(payload);
        out
    }

    /// Parse the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < HEADER_LEN {
            return Err(HeaderError::TooShort(data.len()));
        }

        let version = data[0] >> 4;
        if version != VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }
        let msg_type = MessageType::try_from(data[0] & 0x0F)?;

        let u32_at = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        let u16_at = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[i..i + 8]);
            u64::from_be_bytes(b)
        };

        Ok(Self {
            version,
            msg_type,
            subtype: data[1],
            remote_index: u32_at(4),
            message_counter: u64_at(8),
            relay: RelayFields {
                dest_addr: VpnAddr::new(u32_at(16)),
                src_addr: VpnAddr::new(u32_at(20)),
                dest_port: u16_at(24),
                src_port: u16_at(26),
            },
            network_id: u64_at(28),
        })
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ver={} type={} subtype={} remote_index={} counter={} network_id={}",
            self.version,
            self.msg_type,
            self.subtype,
            self.remote_index,
            self.message_counter,
            self.network_id
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
