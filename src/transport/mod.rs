//! Transport Layer Abstraction
//!
//! The tunnel core never touches sockets directly. Raw datagrams go out
//! through a [`UdpWriter`]; encrypted traffic to a peer goes through an
//! [`EncWriter`], which hides the lookup/handshake/relay decision behind a
//! narrow capability so the handshake and discovery code need no pointer
//! back to the engine.

pub mod udp;

pub use udp::UdpTransport;

use crate::addr::{NetworkAddrPair, NetworkId, VpnAddr};
use crate::header::{MessageType, RelayFields};
use crate::interface::RelayError;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

// ============================================================================
// Packet Channel
// ============================================================================

/// A datagram received from the outside socket.
#[derive(Clone, Debug)]
pub struct ReceivedPacket {
    /// Sender's public UDP address.
    pub remote_addr: SocketAddr,
    /// Packet data.
    pub data: Vec<u8>,
    /// Receipt timestamp (Unix milliseconds).
    pub timestamp_ms: u64,
}

impl ReceivedPacket {
    /// Create a new received packet with current timestamp.
    pub fn new(remote_addr: SocketAddr, data: Vec<u8>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            remote_addr,
            data,
            timestamp_ms,
        }
    }
}

/// Channel sender for received packets.
pub type PacketTx = tokio::sync::mpsc::Sender<ReceivedPacket>;

/// Channel receiver for received packets.
pub type PacketRx = tokio::sync::mpsc::Receiver<ReceivedPacket>;

/// Create a packet channel with the given buffer size.
pub fn packet_channel(buffer: usize) -> (PacketTx, PacketRx) {
    tokio::sync::mpsc::channel(buffer)
}

// ============================================================================
// Errors
// ============================================================================

/// Errors related to transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not started")]
    NotStarted,

    #[error("transport failed to bind: {0}")]
    Bind(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("mtu exceeded: packet {packet_size} > mtu {mtu}")]
    MtuExceeded { packet_size: usize, mtu: u16 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Capabilities
// ============================================================================

/// Raw datagram writer for the outside socket.
///
/// Writes are synchronous so they can be issued from code that holds
/// core locks; a full socket buffer is reported as an error, not awaited.
pub trait UdpWriter: Send + Sync {
    fn write_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), TransportError>;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Re-establish the socket after a local network change. Returns
    /// the number of rebinds so far.
    fn rebind(&self) -> Result<u64, TransportError> {
        Ok(0)
    }
}

/// Send encrypted traffic to a peer without knowing how it gets there.
pub trait EncWriter: Send + Sync {
    /// Encrypt and send to `pair`, starting a handshake (and queuing the
    /// packet) if no tunnel is ready. Failures are logged, not returned.
    fn send_message_to_vpn_addr(
        &self,
        msg_type: MessageType,
        subtype: u8,
        pair: NetworkAddrPair,
        payload: &[u8],
    );

    /// Wrap an already framed packet in a relay envelope and hand it to a
    /// relay host. `relay_addr` forces a specific relay. Returns the relay
    /// that was used.
    fn send_relay(
        &self,
        inner: &[u8],
        fields: RelayFields,
        network_id: NetworkId,
        relay_addr: Option<VpnAddr>,
    ) -> Result<VpnAddr, RelayError>;

    /// An established relay candidate other than the current one.
    fn better_relay_server(&self, network_id: NetworkId) -> Option<VpnAddr>;
}
