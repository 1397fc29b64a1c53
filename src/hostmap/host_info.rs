use super::RemoteList;
use crate::addr::{NetworkAddrPair, NetworkId, VpnAddr};
use crate::cert::Certificate;
use crate::connection_state::ConnectionState;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which handshake packet a stored copy belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStage {
    /// Initiator's first message (header counter 1).
    Stage1,
    /// Responder's reply (header counter 2).
    Stage2,
}

impl HandshakeStage {
    fn slot(self) -> usize {
        match self {
            HandshakeStage::Stage1 => 0,
            HandshakeStage::Stage2 => 1,
        }
    }
}

/// Mutable per-peer fields, guarded by the HostInfo lock.
#[derive(Debug, Default)]
pub struct HostInfoState {
    /// Session object; `None` until handshake stage 0 has run.
    pub connection_state: Option<Arc<ConnectionState>>,
    pub remotes: RemoteList,
    /// The stage 1 packet has been built and may be transmitted.
    pub handshake_ready: bool,
    pub handshake_counter: u32,
    pub handshake_start: Option<Instant>,
    pub handshake_complete: bool,
    handshake_packets: [Option<Vec<u8>>; 2],
    /// Peer's handshake timestamp (unix nanos) used to order competing
    /// handshakes for the same address.
    pub last_handshake_time: u64,
    /// Traffic for this peer goes through `relay_addr`.
    pub relay: bool,
    pub relay_addr: Option<VpnAddr>,
    /// Time from handshake start to completion, used to rank relays.
    pub hs_duration: Option<Duration>,
}

impl HostInfoState {
    pub fn handshake_packet(&self, stage: HandshakeStage) -> Option<&[u8]> {
        self.handshake_packets[stage.slot()].as_deref()
    }

    pub fn set_handshake_packet(&mut self, stage: HandshakeStage, packet: Vec<u8>) {
        self.handshake_packets[stage.slot()] = Some(packet);
    }
}

/// One peer relationship.
///
/// Identity and indices are fixed or atomically updated; everything the
/// handshake races over lives in [`HostInfoState`] behind the record lock.
/// The lock is taken after any HostMap lock, never before one.
pub struct HostInfo {
    vpn_addr: VpnAddr,
    network_id: NetworkId,
    local_index: AtomicU32,
    remote_index: AtomicU32,
    in_bytes: AtomicU64,
    out_bytes: AtomicU64,
    last_rebind_count: AtomicU64,
    state: Mutex<HostInfoState>,
}

impl HostInfo {
    pub fn new(pair: NetworkAddrPair) -> Self {
        Self {
            vpn_addr: pair.vpn_addr,
            network_id: pair.network_id,
            local_index: AtomicU32::new(0),
            remote_index: AtomicU32::new(0),
            in_bytes: AtomicU64::new(0),
            out_bytes: AtomicU64::new(0),
            last_rebind_count: AtomicU64::new(0),
            state: Mutex::new(HostInfoState::default()),
        }
    }

    pub fn vpn_addr(&self) -> VpnAddr {
        self.vpn_addr
    }

    pub fn network_id(&self) -> NetworkId {
        self.network_id
    }

    pub fn pair(&self) -> NetworkAddrPair {
        NetworkAddrPair::new(self.vpn_addr, self.network_id)
    }

    pub fn local_index(&self) -> u32 {
        self.local_index.load(Ordering::Acquire)
    }

    /// Only the handshake manager assigns indices, under the map locks.
    pub(crate) fn set_local_index(&self, index: u32) {
        self.local_index.store(index, Ordering::Release);
    }

    pub fn remote_index(&self) -> u32 {
        self.remote_index.load(Ordering::Acquire)
    }

    pub fn set_remote_index(&self, index: u32) {
        self.remote_index.store(index, Ordering::Release);
    }

    pub fn add_in_bytes(&self, n: usize) {
        self.in_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_out_bytes(&self, n: usize) {
        self.out_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn in_bytes(&self) -> u64 {
        self.in_bytes.load(Ordering::Relaxed)
    }

    pub fn out_bytes(&self) -> u64 {
        self.out_bytes.load(Ordering::Relaxed)
    }

    /// Record `count` as the rebind generation seen by this tunnel.
    /// Returns true if it differed from the previous one.
    pub fn swap_rebind_count(&self, count: u64) -> bool {
        self.last_rebind_count.swap(count, Ordering::AcqRel) != count
    }

    pub fn lock(&self) -> MutexGuard<'_, HostInfoState> {
        self.state.lock()
    }

    pub fn connection_state(&self) -> Option<Arc<ConnectionState>> {
        self.state.lock().connection_state.clone()
    }

    /// The tunnel has keys and accepts data.
    pub fn is_ready(&self) -> bool {
        self.connection_state()
            .is_some_and(|cs| cs.has_keys() && cs.is_ready())
    }

    /// Deep copy of everything a control client may look at.
    pub fn snapshot(&self) -> ControlHostInfo {
        let state = self.state.lock();
        let cs = state.connection_state.as_ref();
        let cert = cs.and_then(|cs| cs.peer_cert().cloned());

        ControlHostInfo {
            vpn_addr: self.vpn_addr,
            network_id: self.network_id,
            local_index: self.local_index(),
            remote_index: self.remote_index(),
            remote_addrs: state.remotes.addrs().to_vec(),
            current_remote: state.remotes.current(),
            cached_packets: cs.map(|cs| cs.queued_len()).unwrap_or(0),
            message_counter: cs.map(|cs| cs.message_counter()).unwrap_or(0),
            ready: cs.is_some_and(|cs| cs.is_ready()),
            name: cert.as_ref().map(|c| c.name.clone()).unwrap_or_default(),
            cert,
            relay: state.relay,
            relay_addr: state.relay_addr,
            in_bytes: self.in_bytes(),
            out_bytes: self.out_bytes(),
        }
    }
}

impl fmt::Debug for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostInfo")
            .field("vpn_addr", &self.vpn_addr)
            .field("network_id", &self.network_id)
            .field("local_index", &self.local_index())
            .field("remote_index", &self.remote_index())
            .finish()
    }
}

/// Detached copy of a HostInfo for the control surface. Shares nothing
/// with the live record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ControlHostInfo {
    pub vpn_addr: VpnAddr,
    pub network_id: NetworkId,
    pub local_index: u32,
    pub remote_index: u32,
    pub remote_addrs: Vec<SocketAddr>,
    pub current_remote: Option<SocketAddr>,
    pub cached_packets: usize,
    pub cert: Option<Certificate>,
    pub message_counter: u64,
    pub ready: bool,
    pub relay: bool,
    pub relay_addr: Option<VpnAddr>,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub name: String,
}
