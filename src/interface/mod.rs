//! The tunnel engine.
//!
//! [`Interface`] ties the pieces together: it reads IP packets from the
//! inside device and datagrams from the outside socket, owns the main host
//! map, and hands handshake work to the [`HandshakeManager`]. It is also
//! the [`EncWriter`] the other subsystems send through.
//!
//! Packet paths live in submodules:
//!
//! - `inside`: device packets to encrypted datagrams
//! - `outside`: datagrams to device packets and control dispatch
//! - `handshake`: the IX stages on the wire
//! - `relay`: envelopes through a lighthouse

mod handshake;
mod inside;
mod outside;
mod relay;

#[cfg(test)]
mod tests;

pub use relay::{RelayError, RelayServer};

use crate::addr::{NetworkAddrPair, NetworkId, VpnAddr};
use crate::cert::{CertError, CertProvider};
use crate::config::{Config, ConfigError, TunConfig};
use crate::firewall::{AllowAll, Firewall};
use crate::handshake::{HandshakeConfig, HandshakeError, HandshakeManager};
use crate::header::{MessageType, RelayFields};
use crate::hostmap::{HostInfo, HostMap};
use crate::lighthouse::{Discovery, LightHouse};
use crate::messaging::{EventRing, MessageProcessor, Messaging, MessagingError};
use crate::overlay::{Device, DeviceError, RouteTable};
use crate::transport::{EncWriter, PacketRx, TransportError, UdpWriter};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Errors surfaced by the engine and its control surface.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("no key material for network {0}")]
    UnknownNetwork(NetworkId),

    #[error("engine already running")]
    AlreadyRunning,

    #[error("engine not started")]
    NotStarted,
}

/// Collaborators an [`Interface`] is built from.
pub struct InterfaceParts {
    pub certs: Arc<dyn CertProvider>,
    pub outside: Arc<dyn UdpWriter>,
    pub device: Arc<dyn Device>,
    pub firewall: Arc<dyn Firewall>,
    /// Handles NonTunMessage requests; router events by default.
    pub processor: Option<Arc<dyn MessageProcessor>>,
}

impl InterfaceParts {
    pub fn new(certs: Arc<dyn CertProvider>, outside: Arc<dyn UdpWriter>, device: Arc<dyn Device>) -> Self {
        Self {
            certs,
            outside,
            device,
            firewall: Arc::new(AllowAll),
            processor: None,
        }
    }

    pub fn with_firewall(mut self, firewall: Arc<dyn Firewall>) -> Self {
        self.firewall = firewall;
        self
    }

    pub fn with_processor(mut self, processor: Arc<dyn MessageProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }
}

fn handshake_config(config: &Config) -> HandshakeConfig {
    HandshakeConfig {
        try_interval: config.handshakes.try_interval(),
        retries: config.handshakes.retries,
        trigger_buffer: config.handshakes.trigger_buffer.max(1),
        tick: config.timer.tick(),
        clock: config.timer.clock(),
    }
}

pub struct Interface {
    certs: Arc<dyn CertProvider>,
    networks: Vec<NetworkId>,
    primary_network: NetworkId,
    main: Arc<HostMap>,
    handshakes: Arc<HandshakeManager>,
    lighthouse: Arc<LightHouse>,
    discovery: Arc<dyn Discovery>,
    outside: Arc<dyn UdpWriter>,
    device: Arc<dyn Device>,
    firewall: Arc<dyn Firewall>,
    messaging: Messaging,
    routes: RouteTable,
    tun: TunConfig,
    relay_hosts: Mutex<HashMap<NetworkId, Arc<HostInfo>>>,
    rebind_count: AtomicU64,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
}

impl Interface {
    pub fn new(config: &Config, parts: InterfaceParts) -> Result<Arc<Self>, EngineError> {
        let networks = config.networks();
        let primary_network = config.network_id();
        for network_id in &networks {
            if parts.certs.cert_state(*network_id).is_none() {
                return Err(EngineError::UnknownNetwork(*network_id));
            }
        }

        let hs_config = handshake_config(config);
        let (trigger_tx, trigger_rx) = mpsc::channel(hs_config.trigger_buffer);
        let lighthouse = Arc::new(LightHouse::new(&config.lighthouse, trigger_tx.clone()));
        let discovery: Arc<dyn Discovery> = lighthouse.clone();

        let main = Arc::new(HostMap::new("main", config.preferred_ranges.clone()));
        let handshakes = Arc::new(HandshakeManager::new(
            hs_config,
            main.clone(),
            config.preferred_ranges.clone(),
            discovery.clone(),
            parts.outside.clone(),
            (trigger_tx, trigger_rx),
        ));

        let messaging = match parts.processor {
            Some(processor) => {
                Messaging::with_processor(&config.messaging, processor, Arc::new(EventRing::new()))
            }
            None => Messaging::new(&config.messaging),
        };

        let (shutdown, _) = watch::channel(false);

        info!(
            name = config.pki.name.as_deref().unwrap_or_default(),
            networks = ?networks,
            am_lighthouse = config.lighthouse.am_lighthouse,
            "Interface created"
        );

        Ok(Arc::new(Self {
            certs: parts.certs,
            networks,
            primary_network,
            main,
            handshakes,
            lighthouse,
            discovery,
            outside: parts.outside,
            device: parts.device,
            firewall: parts.firewall,
            messaging,
            routes: RouteTable::from_config(&config.tun.unsafe_routes),
            tun: config.tun.clone(),
            relay_hosts: Mutex::new(HashMap::new()),
            rebind_count: AtomicU64::new(0),
            shutdown,
            running: AtomicBool::new(false),
        }))
    }

    // === Accessors ===

    pub fn main_hostmap(&self) -> &Arc<HostMap> {
        &self.main
    }

    pub fn handshakes(&self) -> &Arc<HandshakeManager> {
        &self.handshakes
    }

    pub fn lighthouse(&self) -> &Arc<LightHouse> {
        &self.lighthouse
    }

    pub fn messaging(&self) -> &Messaging {
        &self.messaging
    }

    pub fn networks(&self) -> &[NetworkId] {
        &self.networks
    }

    pub fn primary_network(&self) -> NetworkId {
        self.primary_network
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// Our overlay address in `network_id`.
    pub fn vpn_addr(&self, network_id: NetworkId) -> Option<VpnAddr> {
        self.certs.cert_state(network_id).map(|c| c.vpn_addr())
    }

    /// Certificate name in the primary network.
    pub fn name(&self) -> String {
        self.certs
            .cert_state(self.primary_network)
            .map(|c| c.name().to_string())
            .unwrap_or_default()
    }

    fn own_pairs(&self) -> Vec<NetworkAddrPair> {
        self.networks
            .iter()
            .filter_map(|net| self.vpn_addr(*net).map(|vpn| NetworkAddrPair::new(vpn, *net)))
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // === Tunnel lifecycle ===

    /// Tear down the tunnel. Unless `local_only`, the peer is told first.
    pub fn close_tunnel(&self, hostinfo: &Arc<HostInfo>, local_only: bool) {
        if !local_only {
            if let Some(cs) = hostinfo.connection_state().filter(|cs| cs.has_keys()) {
                self.send(hostinfo, &cs, MessageType::CloseTunnel, 0, &[]);
            }
        }
        self.main.delete_host_info(hostinfo);
        self.handshakes.delete_host_info(hostinfo);
        self.forget_relay_host(hostinfo);
        self.messaging.cancel(hostinfo.pair());
        info!(
            vpn_addr = %hostinfo.vpn_addr(),
            network_id = hostinfo.network_id(),
            local_only,
            "Tunnel closed"
        );
    }

    /// Rebind the outside socket and announce our addresses again. Tunnels
    /// notice the change on their next send and re-query their peer.
    pub fn rebind(&self) -> Result<u64, EngineError> {
        let count = self.outside.rebind()?;
        self.rebind_count.fetch_add(1, Ordering::AcqRel);
        let addrs: Vec<_> = self.outside.local_addr().into_iter().collect();
        for pair in self.own_pairs() {
            self.discovery.send_update(pair, &addrs, self);
        }
        info!(rebinds = count, "Outside socket rebound");
        Ok(count)
    }

    /// Send an in-tunnel message and wait for the peer's reply. Without a
    /// ready tunnel a handshake is started and `NotReady` returned.
    pub async fn send_message(&self, pair: NetworkAddrPair, payload: &[u8]) -> Result<Vec<u8>, EngineError> {
        if !self.am_i_connected_with(pair) {
            self.get_or_handshake(pair);
            return Err(MessagingError::NotReady(pair).into());
        }
        Ok(self.messaging.send(self, pair, payload).await?)
    }

    pub(crate) fn rebind_count(&self) -> u64 {
        self.rebind_count.load(Ordering::Acquire)
    }

    // === Main loop ===

    /// Process traffic until [`Interface::stop`]. Runs the handshake and
    /// lighthouse loops alongside.
    pub async fn run(self: Arc<Self>, mut packets: PacketRx) -> Result<(), EngineError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyRunning);
        }
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            self.running.store(false, Ordering::Release);
            return Ok(());
        }

        // Devices without a reader are driven through consume_inside.
        let (_idle_tx, idle_rx) = mpsc::channel(1);
        let mut inside = self.device.reader().unwrap_or(idle_rx);

        let enc: Arc<dyn EncWriter> = self.clone();
        let handshakes = tokio::spawn(self.handshakes.clone().run(enc.clone(), shutdown.clone()));
        let updates = tokio::spawn(self.lighthouse.clone().run_updates(
            self.own_pairs(),
            self.outside.local_addr(),
            enc,
            shutdown.clone(),
        ));

        info!(device = %self.device.name(), "Interface running");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                packet = packets.recv() => match packet {
                    Some(packet) => self.handle_outside(packet.remote_addr, &packet.data),
                    None => {
                        debug!("Outside packet channel closed");
                        break;
                    }
                },
                Some(packet) = inside.recv() => self.consume_inside(&packet),
            }
        }

        self.shutdown.send_replace(true);
        match handshakes.await {
            Ok(Err(e)) => warn!(error = %e, "Handshake manager exited with error"),
            Err(e) => warn!(error = %e, "Handshake manager task failed"),
            Ok(Ok(())) => {}
        }
        if let Err(e) = updates.await {
            warn!(error = %e, "Lighthouse update task failed");
        }
        self.running.store(false, Ordering::Release);
        info!("Interface stopped");
        Ok(())
    }

    /// Ask [`Interface::run`] to return.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

impl EncWriter for Interface {
    fn send_message_to_vpn_addr(
        &self,
        msg_type: MessageType,
        subtype: u8,
        pair: NetworkAddrPair,
        payload: &[u8],
    ) {
        let Some(hostinfo) = self.get_or_handshake(pair) else {
            debug!(to = %pair, msg_type = %msg_type, "No tunnel for message, dropping");
            return;
        };
        self.send_or_queue(&hostinfo, msg_type, subtype, payload);
    }

    fn send_relay(
        &self,
        inner: &[u8],
        fields: RelayFields,
        network_id: NetworkId,
        relay_addr: Option<VpnAddr>,
    ) -> Result<VpnAddr, RelayError> {
        self.relay_packet(inner, fields, network_id, relay_addr)
    }

    fn better_relay_server(&self, network_id: NetworkId) -> Option<VpnAddr> {
        self.pick_better_relay(network_id)
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("networks", &self.networks)
            .field("main", &self.main)
            .field("handshakes", &self.handshakes)
            .finish()
    }
}
