//! Test doubles: recording capabilities and an in-memory mesh of engines.

use crate::addr::{NetworkAddrPair, NetworkId, VpnAddr};
use crate::cert::{generate_cert_state, StaticCertProvider};
use crate::config::Config;
use crate::firewall::{ipv4_packet, PROTO_UDP};
use crate::header::{MessageType, RelayFields};
use crate::hostmap::HostInfo;
use crate::interface::{Interface, InterfaceParts, RelayError};
use crate::lighthouse::Discovery;
use crate::overlay::{ChannelDevice, DeviceHandle};
use crate::transport::{
    packet_channel, EncWriter, PacketRx, PacketTx, ReceivedPacket, TransportError, UdpWriter,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SentMessage {
    pub msg_type: MessageType,
    pub subtype: u8,
    pub pair: NetworkAddrPair,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RelayCall {
    pub inner: Vec<u8>,
    pub fields: RelayFields,
    pub network_id: NetworkId,
    pub relay_addr: Option<VpnAddr>,
}

/// EncWriter that records calls. Relay sends succeed through `relay`
/// when set.
#[derive(Default)]
pub(crate) struct RecordingEnc {
    messages: Mutex<Vec<SentMessage>>,
    relays: Mutex<Vec<RelayCall>>,
    pub relay: Mutex<Option<VpnAddr>>,
    pub better_relay: Mutex<Option<VpnAddr>>,
}

impl RecordingEnc {
    pub fn take_messages(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *self.messages.lock())
    }

    pub fn take_relays(&self) -> Vec<RelayCall> {
        std::mem::take(&mut *self.relays.lock())
    }
}

impl EncWriter for RecordingEnc {
    fn send_message_to_vpn_addr(
        &self,
        msg_type: MessageType,
        subtype: u8,
        pair: NetworkAddrPair,
        payload: &[u8],
    ) {
        self.messages.lock().push(SentMessage {
            msg_type,
            subtype,
            pair,
            payload: payload.to_vec(),
        });
    }

    fn send_relay(
        &self,
        inner: &[u8],
        fields: RelayFields,
        network_id: NetworkId,
        relay_addr: Option<VpnAddr>,
    ) -> Result<VpnAddr, RelayError> {
        self.relays.lock().push(RelayCall {
            inner: inner.to_vec(),
            fields,
            network_id,
            relay_addr,
        });
        relay_addr
            .or(*self.relay.lock())
            .ok_or(RelayError::NoRelay(network_id))
    }

    fn better_relay_server(&self, _network_id: NetworkId) -> Option<VpnAddr> {
        *self.better_relay.lock()
    }
}

/// UdpWriter that records datagrams instead of sending them.
#[derive(Default)]
pub(crate) struct RecordingUdp {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    pub fail: AtomicBool,
}

impl RecordingUdp {
    pub fn take(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl UdpWriter for RecordingUdp {
    fn write_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), TransportError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(TransportError::SendFailed("unreachable".into()));
        }
        self.sent.lock().push((addr, data.to_vec()));
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Discovery with a fixed cache and lighthouse list.
#[derive(Default)]
pub(crate) struct StubDiscovery {
    pub cache: Mutex<HashMap<NetworkAddrPair, Vec<SocketAddr>>>,
    pub lighthouses: Vec<VpnAddr>,
    pub queries: Mutex<Vec<NetworkAddrPair>>,
}

impl Discovery for StubDiscovery {
    fn query_cache(&self, pair: NetworkAddrPair) -> Vec<SocketAddr> {
        self.cache.lock().get(&pair).cloned().unwrap_or_default()
    }

    fn query_server(&self, pair: NetworkAddrPair, _enc: &dyn EncWriter) {
        self.queries.lock().push(pair);
    }

    fn is_lighthouse(&self, pair: NetworkAddrPair) -> bool {
        self.lighthouses.contains(&pair.vpn_addr)
    }

    fn lighthouse_addrs(&self, _network_id: NetworkId) -> Vec<VpnAddr> {
        self.lighthouses.clone()
    }

    fn is_static(&self, _pair: NetworkAddrPair) -> bool {
        false
    }

    fn am_lighthouse(&self) -> bool {
        false
    }

    fn handle_request(
        &self,
        _from: NetworkAddrPair,
        _remote_addr: Option<SocketAddr>,
        _subtype: u8,
        _payload: &[u8],
        _enc: &dyn EncWriter,
    ) {
    }

    fn send_update(&self, _own: NetworkAddrPair, _addrs: &[SocketAddr], _enc: &dyn EncWriter) {}
}

// ============================================================================
// In-memory mesh
// ============================================================================

/// Datagram fabric connecting [`MemSocket`]s. Unknown destinations and
/// blocked paths drop silently, like UDP.
#[derive(Default)]
pub(crate) struct MemNet {
    ports: Mutex<HashMap<SocketAddr, PacketTx>>,
    blocked: Mutex<HashSet<(SocketAddr, SocketAddr)>>,
}

impl MemNet {
    /// Drop everything between `a` and `b`, both ways.
    pub fn block(&self, a: SocketAddr, b: SocketAddr) {
        let mut blocked = self.blocked.lock();
        blocked.insert((a, b));
        blocked.insert((b, a));
    }
}

pub(crate) struct MemSocket {
    addr: Mutex<SocketAddr>,
    net: Arc<MemNet>,
    rebinds: AtomicU64,
}

impl UdpWriter for MemSocket {
    fn write_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), TransportError> {
        let from = *self.addr.lock();
        if self.net.blocked.lock().contains(&(from, addr)) {
            return Ok(());
        }
        let port = self.net.ports.lock().get(&addr).cloned();
        match port {
            Some(tx) => tx
                .try_send(ReceivedPacket::new(from, data.to_vec()))
                .map_err(|e| TransportError::SendFailed(e.to_string())),
            None => Ok(()),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(*self.addr.lock())
    }

    fn rebind(&self) -> Result<u64, TransportError> {
        Ok(self.rebinds.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

pub(crate) struct TestNode {
    pub iface: Arc<Interface>,
    pub device: DeviceHandle,
    pub vpn: VpnAddr,
    socket: Arc<MemSocket>,
    rx: PacketRx,
}

impl TestNode {
    pub fn pair(&self) -> NetworkAddrPair {
        NetworkAddrPair::new(self.vpn, self.iface.primary_network())
    }

    pub fn addr(&self) -> SocketAddr {
        *self.socket.addr.lock()
    }

    /// Inject an IP packet from this node to `dst`.
    pub fn send_ip(&self, dst: &str, payload: &[u8]) -> Vec<u8> {
        let packet = ipv4_packet(&self.vpn.to_string(), dst, PROTO_UDP, payload);
        self.iface.consume_inside(&packet);
        packet
    }

    /// Next packet the engine wrote to the device.
    pub fn delivered(&mut self) -> Option<Vec<u8>> {
        self.device.delivered.try_recv().ok()
    }

    /// Established, ready tunnel to `vpn`.
    pub fn tunnel(&self, vpn: VpnAddr) -> Option<Arc<HostInfo>> {
        let pair = NetworkAddrPair::new(vpn, self.iface.primary_network());
        self.iface
            .main_hostmap()
            .query_vpn_addr(pair)
            .ok()
            .filter(|h| h.is_ready())
    }

    /// Hand the outside receiver to a run loop. [`Mesh::pump`] no longer
    /// sees this node's datagrams afterwards.
    pub fn take_rx(&mut self) -> PacketRx {
        let (_, closed) = packet_channel(1);
        std::mem::replace(&mut self.rx, closed)
    }

    /// Run one handshake retry step towards `vpn`.
    pub fn kick(&self, vpn: VpnAddr) {
        let pair = NetworkAddrPair::new(vpn, self.iface.primary_network());
        self.iface
            .handshakes()
            .handle_outbound(pair, self.iface.as_ref(), false);
    }
}

/// A set of engines on one [`MemNet`], driven by hand with [`Mesh::pump`].
pub(crate) struct Mesh {
    pub net: Arc<MemNet>,
    pub nodes: Vec<TestNode>,
}

impl Mesh {
    pub fn new() -> Self {
        Self {
            net: Arc::new(MemNet::default()),
            nodes: Vec::new(),
        }
    }

    /// Outside address node `index` gets.
    pub fn addr_of(index: usize) -> SocketAddr {
        SocketAddr::from(([192, 0, 2, index as u8 + 1], 4242))
    }

    pub fn add(&mut self, vpn: &str, configure: impl FnOnce(&mut Config)) -> usize {
        self.add_with(vpn, configure, |parts| parts)
    }

    pub fn add_with(
        &mut self,
        vpn: &str,
        configure: impl FnOnce(&mut Config),
        parts: impl FnOnce(InterfaceParts) -> InterfaceParts,
    ) -> usize {
        let index = self.nodes.len();
        let addr = Self::addr_of(index);
        let name = format!("node{}", index);

        let mut config = Config::new();
        config.pki.name = Some(name.clone());
        config.handshakes.try_interval_ms = 100;
        config.handshakes.retries = 2;
        configure(&mut config);

        let certs = Arc::new(StaticCertProvider::new(generate_cert_state(
            &name,
            vpn,
            config.network_id(),
        )));
        let (tx, rx) = packet_channel(256);
        self.net.ports.lock().insert(addr, tx);
        let socket = Arc::new(MemSocket {
            addr: Mutex::new(addr),
            net: self.net.clone(),
            rebinds: AtomicU64::new(0),
        });
        let (device, handle) = ChannelDevice::new(format!("mesh{}", index), 64);
        let iface = Interface::new(
            &config,
            parts(InterfaceParts::new(certs, socket.clone(), device)),
        )
        .expect("interface builds");

        self.nodes.push(TestNode {
            iface,
            device: handle,
            vpn: vpn.parse().expect("valid vpn addr"),
            socket,
            rx,
        });
        index
    }

    /// Give node `index` a new outside address.
    pub fn move_node(&mut self, index: usize, to: SocketAddr) {
        let node = &self.nodes[index];
        let mut ports = self.net.ports.lock();
        let from = *node.socket.addr.lock();
        if let Some(tx) = ports.remove(&from) {
            ports.insert(to, tx);
        }
        *node.socket.addr.lock() = to;
    }

    /// Deliver queued datagrams until the network is quiet. Returns how
    /// many were handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let mut progressed = false;
            for node in &mut self.nodes {
                while let Ok(packet) = node.rx.try_recv() {
                    node.iface.handle_outside(packet.remote_addr, &packet.data);
                    handled += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return handled;
            }
        }
    }

    /// Bring up a direct tunnel from `a` to `b` by sending an IP packet.
    /// `a` must know `b`'s address.
    pub fn connect(&mut self, a: usize, b: usize) {
        let dst = self.nodes[b].vpn;
        self.nodes[a].send_ip(&dst.to_string(), b"hello");
        self.nodes[a].kick(dst);
        self.pump();
        while self.nodes[b].delivered().is_some() {}
    }
}

/// Static host map entry pointing at mesh node `index`.
pub(crate) fn static_host(config: &mut Config, vpn: &str, index: usize) {
    config
        .lighthouse
        .static_host_map
        .insert(vpn.parse().expect("valid vpn addr"), vec![Mesh::addr_of(index)]);
}
