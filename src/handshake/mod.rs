//! Handshake orchestration.
//!
//! The [`HandshakeManager`] owns the pending host map and drives every
//! outstanding handshake from a single timer wheel. Each wheel firing (or
//! discovery trigger) runs [`HandshakeManager::handle_outbound`] for one
//! peer, which retransmits the stored stage 1 packet, escalates to relays
//! once direct attempts are exhausted, and finally abandons the attempt.
//!
//! Completion moves a record from pending to main under both map locks,
//! resolving handshake races in a fixed precedence (see
//! [`HandshakeManager::check_and_complete`]).

mod details;

pub use details::HandshakeDetails;
pub(crate) use details::now_nanos;

use crate::addr::{NetworkAddrPair, NetworkId, VpnAddr};
use crate::cert::CertError;
use crate::connection_state::ConnectionError;
use crate::header::{HeaderError, RelayFields};
use crate::hostmap::{HandshakeStage, HostInfo, HostMap};
use crate::lighthouse::Discovery;
use crate::timer_wheel::TimerWheel;
use crate::transport::{EncWriter, UdpWriter};
use crate::utils::index::{allocate_index, IndexError, MAX_INDEX_ATTEMPTS};
use ipnet::IpNet;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Errors from handshake processing. Races are reported separately as
/// [`CompleteError`].
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("malformed handshake payload: {0}")]
    MalformedPayload(&'static str),

    #[error("index allocation failed: {0}")]
    Index(#[from] IndexError),

    #[error("session error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("certificate rejected: {0}")]
    Cert(#[from] CertError),

    #[error("bad header: {0}")]
    Header(#[from] HeaderError),

    #[error("no key material for network {0}")]
    UnknownNetwork(NetworkId),

    #[error("refusing to handshake with ourselves")]
    SelfHandshake,

    #[error("handshake answered by {got}, expected {expected}")]
    IdentityMismatch { expected: VpnAddr, got: VpnAddr },

    #[error("handshake manager is already running")]
    AlreadyRunning,
}

/// Outcome of a lost completion race. Each variant carries the record
/// that won.
#[derive(Debug, Error)]
pub enum CompleteError {
    #[error("handshake packet already seen")]
    AlreadySeen(Arc<HostInfo>),

    #[error("existing tunnel is newer")]
    ExistingNewer(Arc<HostInfo>),

    #[error("local index collision")]
    LocalIndexCollision(Arc<HostInfo>),

    #[error("existing pending handshake wins")]
    ExistingHandshake(Arc<HostInfo>),
}

impl CompleteError {
    pub fn host(&self) -> &Arc<HostInfo> {
        match self {
            CompleteError::AlreadySeen(h)
            | CompleteError::ExistingNewer(h)
            | CompleteError::LocalIndexCollision(h)
            | CompleteError::ExistingHandshake(h) => h,
        }
    }
}

/// Retry policy and scheduler resolution.
#[derive(Clone, Debug)]
pub struct HandshakeConfig {
    pub try_interval: Duration,
    pub retries: u32,
    pub trigger_buffer: usize,
    /// Timer wheel resolution.
    pub tick: Duration,
    /// Period of the loop advancing the wheel.
    pub clock: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            try_interval: Duration::from_millis(1000),
            retries: 5,
            trigger_buffer: 64,
            tick: Duration::from_millis(90),
            clock: Duration::from_millis(110),
        }
    }
}

impl HandshakeConfig {
    /// Longest a handshake can stay scheduled.
    pub fn timeout(&self) -> Duration {
        self.try_interval * (self.retries + 1)
    }
}

/// Counters kept by the manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandshakeMetrics {
    pub initiated: u64,
    pub timed_out: u64,
}

/// What `handle_outbound` decided while holding the record lock.
enum Outbound {
    Done,
    Abandon,
    Relay { packet: Vec<u8>, escalate: bool, relay_addr: Option<VpnAddr>, counter: u32 },
    Direct { packet: Vec<u8>, remotes: Vec<SocketAddr>, query: bool },
}

/// Drives outstanding handshakes.
pub struct HandshakeManager {
    config: HandshakeConfig,
    pending: HostMap,
    main: Arc<HostMap>,
    wheel: Mutex<TimerWheel<NetworkAddrPair>>,
    discovery: Arc<dyn Discovery>,
    outside: Arc<dyn UdpWriter>,
    trigger_tx: mpsc::Sender<NetworkAddrPair>,
    trigger_rx: Mutex<Option<mpsc::Receiver<NetworkAddrPair>>>,
    initiated: AtomicU64,
    timed_out: AtomicU64,
}

impl HandshakeManager {
    pub fn new(
        config: HandshakeConfig,
        main: Arc<HostMap>,
        preferred_ranges: Vec<IpNet>,
        discovery: Arc<dyn Discovery>,
        outside: Arc<dyn UdpWriter>,
        trigger: (mpsc::Sender<NetworkAddrPair>, mpsc::Receiver<NetworkAddrPair>),
    ) -> Self {
        let wheel = TimerWheel::new(config.tick, config.timeout());
        let (trigger_tx, trigger_rx) = trigger;
        Self {
            config,
            pending: HostMap::new("pending", preferred_ranges),
            main,
            wheel: Mutex::new(wheel),
            discovery,
            outside,
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            initiated: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    pub fn pending(&self) -> &HostMap {
        &self.pending
    }

    pub fn metrics(&self) -> HandshakeMetrics {
        HandshakeMetrics {
            initiated: self.initiated.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }

    /// Wake the handshake for `pair` outside its schedule. Dropped if the
    /// trigger channel is full.
    pub fn trigger(&self, pair: NetworkAddrPair) -> bool {
        self.trigger_tx.try_send(pair).is_ok()
    }

    fn schedule(&self, pair: NetworkAddrPair, delay: Duration) {
        self.wheel.lock().add(pair, delay);
    }

    // === Registry ===

    /// Return the record for `pair`, creating a pending one with `init` and
    /// a fresh local index if neither map has it. An established tunnel in
    /// main is returned as is. A created record gets its first retry
    /// scheduled.
    pub fn add_vpn_addr<F>(
        &self,
        pair: NetworkAddrPair,
        init: F,
    ) -> Result<(Arc<HostInfo>, bool), HandshakeError>
    where
        F: FnOnce(&Arc<HostInfo>),
    {
        let mut pending = self.pending.write();
        let main = self.main.read();
        if let Some(established) = main.host(pair) {
            return Ok((established.clone(), false));
        }

        let (hostinfo, created) = pending.add_vpn_addr(pair, init);
        if !created {
            return Ok((hostinfo, false));
        }

        let net = pair.network_id;
        let index = allocate_index(MAX_INDEX_ATTEMPTS, |i| {
            pending.index(net, i).is_some() || main.index(net, i).is_some()
        });
        match index {
            Ok(index) => {
                hostinfo.set_local_index(index);
                pending.add_index(index, &hostinfo);
            }
            Err(e) => {
                pending.delete_host_info(&hostinfo);
                return Err(e.into());
            }
        }
        drop(main);
        drop(pending);

        self.schedule(pair, self.config.try_interval);
        self.initiated.fetch_add(1, Ordering::Relaxed);
        debug!(
            vpn_addr = %pair.vpn_addr,
            network_id = pair.network_id,
            local_index = hostinfo.local_index(),
            "Handshake initiated"
        );
        Ok((hostinfo, true))
    }

    /// Give a responder-side record a local index unique across pending
    /// and main, and register it in the pending index table.
    pub fn add_index_host_info(&self, hostinfo: &Arc<HostInfo>) -> Result<u32, HandshakeError> {
        let mut pending = self.pending.write();
        let main = self.main.read();
        let net = hostinfo.network_id();

        let index = allocate_index(MAX_INDEX_ATTEMPTS, |i| {
            pending.index(net, i).is_some() || main.index(net, i).is_some()
        })?;
        hostinfo.set_local_index(index);
        pending.add_index(index, hostinfo);
        Ok(index)
    }

    pub fn query_index(&self, network_id: NetworkId, index: u32) -> Option<Arc<HostInfo>> {
        self.pending.query_index(network_id, index).ok()
    }

    pub fn query_vpn_addr(&self, pair: NetworkAddrPair) -> Option<Arc<HostInfo>> {
        self.pending.query_vpn_addr(pair).ok()
    }

    pub fn delete_host_info(&self, hostinfo: &Arc<HostInfo>) -> bool {
        self.pending.delete_host_info(hostinfo)
    }

    // === Completion ===

    /// Promote `hostinfo` to main unless it lost a race.
    ///
    /// Precedence, all under the pending then main write locks:
    /// 1. main already holds a record whose `stage` packet is identical
    ///    (`AlreadySeen`), or whose handshake is at least as new
    ///    (`ExistingNewer`);
    /// 2. our local index is owned by another record in main or pending
    ///    (`LocalIndexCollision`);
    /// 3. another pending handshake exists for the peer: it wins unless
    ///    `overwrite`, in which case its parked packets move to us and it
    ///    is dropped.
    pub fn check_and_complete(
        &self,
        hostinfo: &Arc<HostInfo>,
        stage: HandshakeStage,
        overwrite: bool,
    ) -> Result<(), CompleteError> {
        let mut pending = self.pending.write();
        let mut main = self.main.write();
        let pair = hostinfo.pair();
        let net = pair.network_id;

        let (packet, handshake_time) = {
            let state = hostinfo.lock();
            (state.handshake_packet(stage).map(<[u8]>::to_vec), state.last_handshake_time)
        };

        if let Some(existing) = main.host(pair) {
            if !Arc::ptr_eq(existing, hostinfo) {
                let state = existing.lock();
                if packet.is_some() && state.handshake_packet(stage) == packet.as_deref() {
                    drop(state);
                    return Err(CompleteError::AlreadySeen(existing.clone()));
                }
                if state.last_handshake_time >= handshake_time {
                    drop(state);
                    return Err(CompleteError::ExistingNewer(existing.clone()));
                }
            }
        }

        let local_index = hostinfo.local_index();
        if let Some(owner) = main.index(net, local_index) {
            if !Arc::ptr_eq(owner, hostinfo) {
                return Err(CompleteError::LocalIndexCollision(owner.clone()));
            }
        }
        if let Some(owner) = pending.index(net, local_index) {
            if !Arc::ptr_eq(owner, hostinfo) {
                return Err(CompleteError::LocalIndexCollision(owner.clone()));
            }
        }

        if let Some(shadow) = main.remote_index(net, hostinfo.remote_index()) {
            if !Arc::ptr_eq(shadow, hostinfo) {
                debug!(
                    vpn_addr = %pair.vpn_addr,
                    remote_index = hostinfo.remote_index(),
                    shadowed = %shadow.vpn_addr(),
                    "New host shadows existing host remote index"
                );
            }
        }

        if let Some(loser) = pending.host(pair).cloned() {
            if !Arc::ptr_eq(&loser, hostinfo) {
                if !overwrite {
                    return Err(CompleteError::ExistingHandshake(loser));
                }
                let parked = loser
                    .connection_state()
                    .map(|cs| cs.take_queued())
                    .unwrap_or_default();
                if !parked.is_empty() {
                    if let Some(cs) = hostinfo.connection_state() {
                        cs.requeue(parked);
                    }
                }
                pending.delete_host_info(&loser);
                info!(
                    vpn_addr = %pair.vpn_addr,
                    network_id = net,
                    "Handshake race lost, adopting the new handshake"
                );
            }
        }

        main.add_host_info(hostinfo);
        pending.delete_host_info(hostinfo);
        Ok(())
    }

    /// Promote `hostinfo` to main unconditionally, replacing whatever was
    /// there for the same peer.
    pub fn complete(&self, hostinfo: &Arc<HostInfo>) {
        let mut pending = self.pending.write();
        let mut main = self.main.write();
        if let Some(replaced) = main.add_host_info(hostinfo) {
            debug!(
                vpn_addr = %replaced.vpn_addr(),
                local_index = replaced.local_index(),
                "Replaced existing tunnel"
            );
        }
        pending.delete_host_info(hostinfo);
    }

    // === Retry state machine ===

    /// Advance the wheel to `now` and run every handshake that came due.
    pub fn next_outbound_handshake_timer_tick(&self, now: Instant, enc: &dyn EncWriter) {
        let due: Vec<NetworkAddrPair> = {
            let mut wheel = self.wheel.lock();
            wheel.advance(now);
            std::iter::from_fn(|| wheel.purge()).collect()
        };
        for pair in due {
            self.handle_outbound(pair, enc, false);
        }
    }

    /// One retry step for `pair`.
    pub fn handle_outbound(&self, pair: NetworkAddrPair, enc: &dyn EncWriter, lighthouse_triggered: bool) {
        let Some(hostinfo) = self.query_vpn_addr(pair) else {
            return;
        };
        let is_lighthouse = self.discovery.is_lighthouse(pair);
        let retries = self.config.retries;

        let outbound = {
            let mut state = hostinfo.lock();

            if state.handshake_complete {
                Outbound::Done
            } else if !state.handshake_ready {
                drop(state);
                self.schedule(pair, self.config.try_interval);
                return;
            } else if state.handshake_counter >= retries && !is_lighthouse {
                if state.remotes.is_empty() {
                    Outbound::Abandon
                } else {
                    match state.handshake_packet(HandshakeStage::Stage1) {
                        Some(packet) => {
                            let escalate = state.handshake_counter == 2 * retries;
                            // Once escalated, keep using the relay picked then.
                            let relay_addr = if state.handshake_counter > 2 * retries {
                                state.relay_addr
                            } else {
                                None
                            };
                            let packet = packet.to_vec();
                            state.handshake_counter += 1;
                            Outbound::Relay {
                                packet,
                                escalate,
                                relay_addr,
                                counter: state.handshake_counter,
                            }
                        }
                        None => Outbound::Abandon,
                    }
                }
            } else if state.handshake_counter >= retries {
                Outbound::Abandon
            } else if lighthouse_triggered && state.handshake_counter > 0 {
                return;
            } else {
                // Pick up whatever discovery learned since the last attempt.
                for addr in self.discovery.query_cache(pair) {
                    state.remotes.add(addr, self.pending.preferred_ranges());
                }
                let query = state.remotes.len() <= 1;
                let remotes = state.remotes.addrs().to_vec();
                match state.handshake_packet(HandshakeStage::Stage1) {
                    Some(packet) => {
                        let packet = packet.to_vec();
                        state.handshake_counter += 1;
                        Outbound::Direct { packet, remotes, query }
                    }
                    None => Outbound::Abandon,
                }
            }
        };

        match outbound {
            Outbound::Done => {
                self.delete_host_info(&hostinfo);
            }
            Outbound::Abandon => self.abandon(&hostinfo),
            Outbound::Relay { packet, escalate, relay_addr, counter } => {
                let relay_addr = if escalate {
                    enc.better_relay_server(pair.network_id)
                } else {
                    relay_addr
                };
                let own = self.own_addr(&hostinfo);
                let fields = RelayFields::new(pair.vpn_addr, own);
                match enc.send_relay(&packet, fields, pair.network_id, relay_addr) {
                    Ok(relay) => {
                        let mut state = hostinfo.lock();
                        state.relay = true;
                        state.relay_addr = Some(relay);
                        drop(state);
                        debug!(
                            vpn_addr = %pair.vpn_addr,
                            relay = %relay,
                            attempt = counter,
                            "Handshake sent through relay"
                        );
                    }
                    Err(e) => {
                        debug!(vpn_addr = %pair.vpn_addr, error = %e, "Handshake relay attempt failed");
                    }
                }

                if counter >= 3 * retries {
                    self.abandon(&hostinfo);
                } else if !lighthouse_triggered {
                    self.schedule(pair, self.config.try_interval * 2);
                }
            }
            Outbound::Direct { packet, remotes, query } => {
                if query {
                    self.discovery.query_server(pair, enc);
                }
                let mut sent = 0;
                for addr in &remotes {
                    match self.outside.write_to(&packet, *addr) {
                        Ok(()) => sent += 1,
                        Err(e) => {
                            warn!(vpn_addr = %pair.vpn_addr, udp_addr = %addr, error = %e, "Failed to send handshake")
                        }
                    }
                }
                debug!(
                    vpn_addr = %pair.vpn_addr,
                    remotes = remotes.len(),
                    sent,
                    "Handshake message sent"
                );
                if !lighthouse_triggered {
                    self.schedule(pair, self.config.try_interval);
                }
            }
        }
    }

    fn abandon(&self, hostinfo: &Arc<HostInfo>) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
        let counter = hostinfo.lock().handshake_counter;
        info!(
            vpn_addr = %hostinfo.vpn_addr(),
            network_id = hostinfo.network_id(),
            attempts = counter,
            "Handshake timed out"
        );
        self.delete_host_info(hostinfo);
    }

    fn own_addr(&self, hostinfo: &HostInfo) -> VpnAddr {
        hostinfo
            .connection_state()
            .map(|cs| cs.cert_state().vpn_addr())
            .unwrap_or(VpnAddr::UNSPECIFIED)
    }

    /// Drive the wheel and the trigger channel until `shutdown` flips.
    pub async fn run(
        self: Arc<Self>,
        enc: Arc<dyn EncWriter>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), HandshakeError> {
        let mut trigger_rx = self
            .trigger_rx
            .lock()
            .take()
            .ok_or(HandshakeError::AlreadyRunning)?;
        let mut clock = tokio::time::interval(self.config.clock);
        clock.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!("Handshake manager loop starting");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(pair) = trigger_rx.recv() => {
                    self.handle_outbound(pair, enc.as_ref(), true);
                }
                now = clock.tick() => {
                    self.next_outbound_handshake_timer_tick(now.into_std(), enc.as_ref());
                }
            }
        }
        debug!("Handshake manager loop stopped");
        Ok(())
    }
}

impl std::fmt::Debug for HandshakeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeManager")
            .field("pending", &self.pending.len())
            .field("metrics", &self.metrics())
            .finish()
    }
}
