//! Control surface for embedders.
//!
//! [`Control`] owns the engine task and exposes the operations a host
//! application drives: inspecting tunnels, steering or closing them, sending
//! in-tunnel messages and reacting to network changes.

use crate::addr::{NetworkAddrPair, VpnAddr};
use crate::handshake::HandshakeMetrics;
use crate::hostmap::{ControlHostInfo, HostMap};
use crate::interface::{EngineError, Interface, RelayServer};
use crate::lighthouse::Discovery;
use crate::transport::PacketRx;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct Control {
    iface: Arc<Interface>,
    task: Mutex<Option<JoinHandle<Result<(), EngineError>>>>,
}

impl Control {
    pub fn new(iface: Arc<Interface>) -> Self {
        Self {
            iface,
            task: Mutex::new(None),
        }
    }

    pub fn interface(&self) -> &Arc<Interface> {
        &self.iface
    }

    /// Spawn the engine on the current runtime. Does not block; see
    /// [`Control::shutdown_block`].
    pub fn start(&self, packets: PacketRx) -> Result<(), EngineError> {
        let mut task = self.task.lock();
        if task.is_some() || self.iface.is_running() {
            return Err(EngineError::AlreadyRunning);
        }
        *task = Some(tokio::spawn(self.iface.clone().run(packets)));
        Ok(())
    }

    /// Tell peers we are leaving, lighthouses last, then stop the engine
    /// and wait for it.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let task = self.task.lock().take();
        let Some(task) = task else {
            return Err(EngineError::NotStarted);
        };
        let closed = self.close_all_tunnels(true) + self.close_all_tunnels(false);
        self.iface.stop();

        let result = match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Engine task failed");
                Ok(())
            }
        };
        info!(closed, "Goodbye");
        result
    }

    /// Block until SIGINT or SIGTERM, then [`Control::stop`].
    pub async fn shutdown_block(&self) -> Result<(), EngineError> {
        let signal = wait_for_signal().await;
        info!(signal, "Caught signal, shutting down");
        self.stop().await
    }

    fn hostmap(&self, pending: bool) -> &HostMap {
        if pending {
            self.iface.handshakes().pending()
        } else {
            self.iface.main_hostmap()
        }
    }

    fn pair(&self, vpn_addr: VpnAddr) -> NetworkAddrPair {
        NetworkAddrPair::new(vpn_addr, self.iface.primary_network())
    }

    /// Established (or with `pending`, handshaking) tunnels in the primary
    /// network.
    pub fn list_hostmap(&self, pending: bool) -> Vec<ControlHostInfo> {
        self.hostmap(pending).list(Some(self.iface.primary_network()))
    }

    pub fn get_host_info(&self, vpn_addr: VpnAddr, pending: bool) -> Option<ControlHostInfo> {
        self.hostmap(pending)
            .query_vpn_addr(self.pair(vpn_addr))
            .ok()
            .map(|h| h.snapshot())
    }

    /// Force an established tunnel onto `addr`. The tunnel stops relaying.
    pub fn set_remote_for_tunnel(&self, vpn_addr: VpnAddr, addr: SocketAddr) -> Option<ControlHostInfo> {
        let hostinfo = self.iface.main_hostmap().query_vpn_addr(self.pair(vpn_addr)).ok()?;
        {
            let mut state = hostinfo.lock();
            state.remotes.set_current(addr, self.iface.main_hostmap().preferred_ranges());
            state.relay = false;
            state.relay_addr = None;
        }
        info!(vpn_addr = %vpn_addr, udp_addr = %addr, "Remote forced for tunnel");
        Some(hostinfo.snapshot())
    }

    /// Close one established tunnel. Unless `local_only`, the peer is
    /// told. Returns false when there is no such tunnel.
    pub fn close_tunnel(&self, vpn_addr: VpnAddr, local_only: bool) -> bool {
        match self.iface.main_hostmap().query_vpn_addr(self.pair(vpn_addr)) {
            Ok(hostinfo) => {
                self.iface.close_tunnel(&hostinfo, local_only);
                true
            }
            Err(_) => false,
        }
    }

    /// Close every ready tunnel, notifying the peers. Returns how many
    /// were closed.
    pub fn close_all_tunnels(&self, exclude_lighthouses: bool) -> usize {
        let lighthouse = self.iface.lighthouse();
        let mut closed = 0;
        for hostinfo in self.iface.main_hostmap().hosts(None) {
            if exclude_lighthouses && lighthouse.is_lighthouse(hostinfo.pair()) {
                continue;
            }
            if !hostinfo.is_ready() {
                continue;
            }
            self.iface.close_tunnel(&hostinfo, false);
            closed += 1;
        }
        closed
    }

    /// Send `message` in-tunnel and wait for the peer's reply.
    pub async fn send_message(&self, vpn_addr: VpnAddr, message: &str) -> Result<String, EngineError> {
        let reply = self.iface.send_message(self.pair(vpn_addr), message.as_bytes()).await?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    /// Oldest unread router event as JSON, or an empty string.
    pub fn next_event(&self) -> String {
        self.iface.messaging().events().next_event()
    }

    /// The local network changed: rebind and re-announce.
    pub fn rebind(&self) -> Result<u64, EngineError> {
        self.iface.rebind()
    }

    pub fn name(&self) -> String {
        self.iface.name()
    }

    pub fn vpn_addr(&self) -> Option<VpnAddr> {
        self.iface.vpn_addr(self.iface.primary_network())
    }

    pub fn am_lighthouse(&self) -> bool {
        self.iface.lighthouse().am_lighthouse()
    }

    pub fn relay_server(&self) -> Option<RelayServer> {
        self.iface.relay_server(self.iface.primary_network())
    }

    pub fn handshake_metrics(&self) -> HandshakeMetrics {
        self.iface.handshakes().metrics()
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "Failed to listen for SIGTERM");
            return wait_for_ctrl_c().await;
        }
    };
    tokio::select! {
        name = wait_for_ctrl_c() => name,
        _ = term.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{PROTO_UDP, ipv4_packet};
    use crate::testing::{Mesh, static_host};
    use std::time::Duration;

    const A: &str = "10.1.0.1";
    const B: &str = "10.1.0.2";
    const C: &str = "10.1.0.3";

    fn vpn(s: &str) -> VpnAddr {
        s.parse().unwrap()
    }

    fn connected_mesh() -> Mesh {
        let mut mesh = Mesh::new();
        mesh.add(A, |c| {
            static_host(c, B, 1);
            static_host(c, C, 2);
        });
        mesh.add(B, |c| static_host(c, A, 0));
        mesh.add(C, |c| static_host(c, A, 0));
        mesh.connect(0, 1);
        mesh.connect(0, 2);
        mesh
    }

    #[test]
    fn test_list_and_get_host_info() {
        let mesh = connected_mesh();
        let control = Control::new(mesh.nodes[0].iface.clone());

        let mut hosts: Vec<_> = control.list_hostmap(false).into_iter().map(|h| h.vpn_addr).collect();
        hosts.sort();
        assert_eq!(hosts, vec![vpn(B), vpn(C)]);
        assert!(control.list_hostmap(true).is_empty());

        let info = control.get_host_info(vpn(B), false).unwrap();
        assert!(info.ready);
        assert_eq!(info.name, "node1");
        assert_eq!(info.current_remote, Some(Mesh::addr_of(1)));
        assert!(control.get_host_info(vpn(B), true).is_none());
        assert!(control.get_host_info(vpn("10.1.0.9"), false).is_none());

        assert_eq!(control.name(), "node0");
        assert_eq!(control.vpn_addr(), Some(vpn(A)));
        assert!(!control.am_lighthouse());
        assert_eq!(control.handshake_metrics().initiated, 2);
    }

    #[test]
    fn test_pending_handshake_is_listed() {
        let mut mesh = Mesh::new();
        mesh.add(A, |c| static_host(c, B, 1));
        let control = Control::new(mesh.nodes[0].iface.clone());

        mesh.nodes[0].send_ip(B, b"ping");
        let pending = control.list_hostmap(true);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].vpn_addr, vpn(B));
        assert_eq!(pending[0].cached_packets, 1);
        assert!(control.list_hostmap(false).is_empty());
    }

    #[test]
    fn test_set_remote_for_tunnel() {
        let mut mesh = connected_mesh();
        let control = Control::new(mesh.nodes[0].iface.clone());
        let moved = SocketAddr::from(([198, 51, 100, 7], 4242));

        mesh.move_node(1, moved);
        let info = control.set_remote_for_tunnel(vpn(B), moved).unwrap();
        assert_eq!(info.current_remote, Some(moved));
        assert!(!info.relay);

        mesh.nodes[0].send_ip(B, b"after move");
        mesh.pump();
        assert!(mesh.nodes[1].delivered().is_some());

        assert!(control.set_remote_for_tunnel(vpn("10.1.0.9"), moved).is_none());
    }

    #[test]
    fn test_close_tunnel_notifies_peer() {
        let mut mesh = connected_mesh();
        let control = Control::new(mesh.nodes[0].iface.clone());

        assert!(control.close_tunnel(vpn(B), false));
        mesh.pump();
        assert!(mesh.nodes[0].tunnel(vpn(B)).is_none());
        assert!(mesh.nodes[1].tunnel(vpn(A)).is_none());
        assert!(!control.close_tunnel(vpn(B), false));
    }

    #[test]
    fn test_close_tunnel_local_only() {
        let mut mesh = connected_mesh();
        let control = Control::new(mesh.nodes[0].iface.clone());

        assert!(control.close_tunnel(vpn(B), true));
        assert_eq!(mesh.pump(), 0);
        assert!(mesh.nodes[0].tunnel(vpn(B)).is_none());
        assert!(mesh.nodes[1].tunnel(vpn(A)).is_some());
    }

    #[test]
    fn test_close_all_tunnels_can_spare_lighthouses() {
        let mut mesh = Mesh::new();
        mesh.add(A, |c| {
            static_host(c, B, 1);
            static_host(c, C, 2);
            c.lighthouse.hosts = vec![vpn(C)];
        });
        mesh.add(B, |c| static_host(c, A, 0));
        mesh.add(C, |c| {
            static_host(c, A, 0);
            c.lighthouse.am_lighthouse = true;
        });
        mesh.connect(0, 1);
        mesh.connect(0, 2);
        let control = Control::new(mesh.nodes[0].iface.clone());

        assert_eq!(control.close_all_tunnels(true), 1);
        mesh.pump();
        assert!(mesh.nodes[0].tunnel(vpn(B)).is_none());
        assert!(mesh.nodes[0].tunnel(vpn(C)).is_some());

        assert_eq!(control.close_all_tunnels(false), 1);
        mesh.pump();
        assert!(control.list_hostmap(false).is_empty());
        assert!(mesh.nodes[2].tunnel(vpn(A)).is_none());
    }

    #[test]
    fn test_rebind_counts() {
        let mesh = connected_mesh();
        let control = Control::new(mesh.nodes[0].iface.clone());
        assert_eq!(control.rebind().unwrap(), 1);
        assert_eq!(control.rebind().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_send_message_without_tunnel_is_not_ready() {
        let mut mesh = Mesh::new();
        mesh.add(A, |c| static_host(c, B, 1));
        let control = Control::new(mesh.nodes[0].iface.clone());

        let err = control.send_message(vpn(B), "hi").await.unwrap_err();
        assert!(matches!(err, EngineError::Messaging(_)));
        assert_eq!(control.list_hostmap(true).len(), 1);
        assert_eq!(control.next_event(), "");
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let mut mesh = Mesh::new();
        mesh.add(A, |_| {});
        let control = Control::new(mesh.nodes[0].iface.clone());
        assert!(matches!(control.stop().await, Err(EngineError::NotStarted)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_carries_traffic() {
        let mut mesh = Mesh::new();
        mesh.add(A, |c| static_host(c, B, 1));
        mesh.add(B, |c| static_host(c, A, 0));

        let rx_a = mesh.nodes[0].take_rx();
        let rx_b = mesh.nodes[1].take_rx();
        let a = Control::new(mesh.nodes[0].iface.clone());
        let b = Control::new(mesh.nodes[1].iface.clone());
        a.start(rx_a).unwrap();
        b.start(rx_b).unwrap();
        assert!(matches!(
            a.start(crate::transport::packet_channel(1).1),
            Err(EngineError::AlreadyRunning)
        ));

        let packet = ipv4_packet(A, B, PROTO_UDP, b"through the loop");
        mesh.nodes[0].device.inject.send(packet.clone()).await.unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(5), mesh.nodes[1].device.delivered.recv())
            .await
            .expect("packet delivered before timeout")
            .unwrap();
        assert_eq!(delivered, packet);
        assert!(a.get_host_info(vpn(B), false).is_some_and(|h| h.ready));

        a.stop().await.unwrap();
        assert!(!a.interface().is_running());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(b.get_host_info(vpn(A), false).is_none());
        b.stop().await.unwrap();
    }
}
