//! Discovery
//!
//! Lighthouses are well-known nodes that learn every client's public
//! addresses and answer queries for them. The [`Discovery`] trait is the
//! narrow view the handshake and send paths need; [`LightHouse`] is the
//! implementation backed by configuration (static host map, lighthouse
//! list) and by what the lighthouses report back.
//!
//! Wire format shared by query replies and update notifications:
//!
//! ```text
//! [vpn_addr: 4][count: 1][(ipv4: 4, port: 2) * count]
//! ```
//!
//! A query carries only the 4-byte address being looked up. IPv6
//! underlay addresses are not advertised.

use crate::addr::{NetworkAddrPair, NetworkId, VpnAddr};
use crate::config::LighthouseConfig;
use crate::header::{
    MessageType, SUBTYPE_HOST_QUERY, SUBTYPE_HOST_QUERY_REPLY, SUBTYPE_HOST_UPDATE_NOTIFICATION,
};
use crate::transport::EncWriter;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// Most addresses carried in one reply or update.
pub const MAX_ADVERTISED_ADDRS: usize = 32;

/// Errors decoding lighthouse messages.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LighthouseError {
    #[error("lighthouse message too short: expected {expected}, got {got}")]
    TooShort { expected: usize, got: usize },
}

/// Narrow discovery capability consumed by the engine.
pub trait Discovery: Send + Sync {
    /// Addresses already known for `pair`, without network traffic.
    fn query_cache(&self, pair: NetworkAddrPair) -> Vec<SocketAddr>;

    /// Ask the lighthouses where `pair` is. Answers arrive asynchronously
    /// and wake the handshake for `pair`.
    fn query_server(&self, pair: NetworkAddrPair, enc: &dyn EncWriter);

    fn is_lighthouse(&self, pair: NetworkAddrPair) -> bool;

    fn lighthouse_addrs(&self, network_id: NetworkId) -> Vec<VpnAddr>;

    /// The peer has configured static addresses.
    fn is_static(&self, pair: NetworkAddrPair) -> bool;

    /// This node serves discovery and relay for others.
    fn am_lighthouse(&self) -> bool;

    /// Handle a decrypted lighthouse message from an established peer.
    fn handle_request(
        &self,
        from: NetworkAddrPair,
        remote_addr: Option<SocketAddr>,
        subtype: u8,
        payload: &[u8],
        enc: &dyn EncWriter,
    );

    /// Report our own addresses for `own` to every lighthouse.
    fn send_update(&self, own: NetworkAddrPair, addrs: &[SocketAddr], enc: &dyn EncWriter);
}

/// Addresses reported for one virtual address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostAddrs {
    pub vpn_addr: VpnAddr,
    pub addrs: Vec<SocketAddr>,
}

impl HostAddrs {
    pub fn new(vpn_addr: VpnAddr, addrs: Vec<SocketAddr>) -> Self {
        Self { vpn_addr, addrs }
    }

    pub fn encode(&self) -> Vec<u8> {
        let v4: Vec<SocketAddrV4> = self
            .addrs
            .iter()
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(*v4),
                SocketAddr::V6(_) => None,
            })
            .take(MAX_ADVERTISED_ADDRS)
            .collect();

        let mut buf = Vec::with_capacity(5 + v4.len() * 6);
        buf.extend_from_slice(&self.vpn_addr.as_u32().to_be_bytes());
        buf.push(v4.len() as u8);
        for addr in v4 {
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, LighthouseError> {
        let vpn_addr = decode_vpn_addr(data)?;
        let count = *data.get(4).ok_or(LighthouseError::TooShort {
            expected: 5,
            got: data.len(),
        })? as usize;

        let expected = 5 + count * 6;
        if data.len() < expected {
            return Err(LighthouseError::TooShort {
                expected,
                got: data.len(),
            });
        }

        let addrs = data[5..expected]
            .chunks_exact(6)
            .map(|c| {
                let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
                let port = u16::from_be_bytes([c[4], c[5]]);
                SocketAddr::V4(SocketAddrV4::new(ip, port))
            })
            .collect();

        Ok(Self { vpn_addr, addrs })
    }
}

fn decode_vpn_addr(data: &[u8]) -> Result<VpnAddr, LighthouseError> {
    let bytes: [u8; 4] = data
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(LighthouseError::TooShort {
            expected: 4,
            got: data.len(),
        })?;
    Ok(VpnAddr::new(u32::from_be_bytes(bytes)))
}

/// Configuration-backed discovery with a learned address cache.
pub struct LightHouse {
    am_lighthouse: bool,
    lighthouses: Vec<VpnAddr>,
    static_host_map: HashMap<VpnAddr, Vec<SocketAddr>>,
    advertise_addrs: Vec<SocketAddr>,
    interval: Duration,
    /// Addresses learned from replies (clients) or updates (lighthouses).
    addr_map: RwLock<HashMap<NetworkAddrPair, Vec<SocketAddr>>>,
    trigger: mpsc::Sender<NetworkAddrPair>,
}

impl LightHouse {
    pub fn new(config: &LighthouseConfig, trigger: mpsc::Sender<NetworkAddrPair>) -> Self {
        let mut lighthouses = Vec::new();
        for addr in &config.hosts {
            if !lighthouses.contains(addr) {
                lighthouses.push(*addr);
            }
        }
        Self {
            am_lighthouse: config.am_lighthouse,
            lighthouses,
            static_host_map: config.static_host_map.clone(),
            advertise_addrs: config.advertise_addrs.clone(),
            interval: Duration::from_secs(config.interval_secs.max(1)),
            addr_map: RwLock::new(HashMap::new()),
            trigger,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Replace the learned addresses for `pair`.
    pub fn learn(&self, pair: NetworkAddrPair, addrs: Vec<SocketAddr>) {
        let mut map = self.addr_map.write();
        if addrs.is_empty() {
            map.remove(&pair);
        } else {
            map.insert(pair, addrs);
        }
    }

    /// Number of peers with learned addresses.
    pub fn learned_len(&self) -> usize {
        self.addr_map.read().len()
    }

    fn handle_host_query(&self, from: NetworkAddrPair, payload: &[u8], enc: &dyn EncWriter) {
        if !self.am_lighthouse {
            debug!(from = %from, "Host query received but we are not a lighthouse");
            return;
        }
        let vpn_addr = match decode_vpn_addr(payload) {
            Ok(addr) => addr,
            Err(e) => {
                debug!(from = %from, error = %e, "Malformed host query");
                return;
            }
        };

        let target = NetworkAddrPair::new(vpn_addr, from.network_id);
        let reply = HostAddrs::new(vpn_addr, self.query_cache(target));
        trace!(
            from = %from,
            target = %vpn_addr,
            addrs = reply.addrs.len(),
            "Answering host query"
        );
        enc.send_message_to_vpn_addr(
            MessageType::LightHouse,
            SUBTYPE_HOST_QUERY_REPLY,
            from,
            &reply.encode(),
        );
    }

    fn handle_host_query_reply(&self, from: NetworkAddrPair, payload: &[u8]) {
        if !self.is_lighthouse(from) {
            debug!(from = %from, "Host query reply from a non-lighthouse, ignoring");
            return;
        }
        let reply = match HostAddrs::decode(payload) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(from = %from, error = %e, "Malformed host query reply");
                return;
            }
        };

        let pair = NetworkAddrPair::new(reply.vpn_addr, from.network_id);
        if reply.addrs.is_empty() {
            trace!(target = %pair, "Lighthouse has no addresses for host");
            return;
        }
        debug!(
            target = %pair,
            addrs = reply.addrs.len(),
            lighthouse = %from.vpn_addr,
            "Learned host addresses"
        );
        self.learn(pair, reply.addrs);

        if self.trigger.try_send(pair).is_err() {
            trace!(target = %pair, "Handshake trigger channel full");
        }
    }

    fn handle_host_update(
        &self,
        from: NetworkAddrPair,
        remote_addr: Option<SocketAddr>,
        payload: &[u8],
    ) {
        if !self.am_lighthouse {
            debug!(from = %from, "Host update received but we are not a lighthouse");
            return;
        }
        let update = match HostAddrs::decode(payload) {
            Ok(update) => update,
            Err(e) => {
                debug!(from = %from, error = %e, "Malformed host update");
                return;
            }
        };
        if update.vpn_addr != from.vpn_addr {
            debug!(
                from = %from,
                claimed = %update.vpn_addr,
                "Host update for another address, ignoring"
            );
            return;
        }

        let mut addrs = update.addrs;
        if let Some(observed) = remote_addr {
            if !addrs.contains(&observed) {
                addrs.insert(0, observed);
            }
        }
        addrs.truncate(MAX_ADVERTISED_ADDRS);
        trace!(from = %from, addrs = addrs.len(), "Host update stored");
        self.learn(from, addrs);
    }

    /// Periodically report `own` addresses until `shutdown` flips.
    pub async fn run_updates(
        self: Arc<Self>,
        own: Vec<NetworkAddrPair>,
        local_addr: Option<SocketAddr>,
        enc: Arc<dyn EncWriter>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if self.am_lighthouse || self.lighthouses.is_empty() {
            return;
        }
        let addrs: Vec<SocketAddr> = local_addr
            .filter(|addr| !addr.ip().is_unspecified())
            .into_iter()
            .collect();

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    for pair in &own {
                        self.send_update(*pair, &addrs, enc.as_ref());
                    }
                }
            }
        }
        debug!("Lighthouse update loop stopped");
    }
}

impl Discovery for LightHouse {
    fn query_cache(&self, pair: NetworkAddrPair) -> Vec<SocketAddr> {
        let mut addrs = self.addr_map.read().get(&pair).cloned().unwrap_or_default();
        if let Some(fixed) = self.static_host_map.get(&pair.vpn_addr) {
            for addr in fixed {
                if !addrs.contains(addr) {
                    addrs.push(*addr);
                }
            }
        }
        addrs
    }

    fn query_server(&self, pair: NetworkAddrPair, enc: &dyn EncWriter) {
        if self.am_lighthouse || self.is_lighthouse(pair) {
            return;
        }
        let payload = pair.vpn_addr.as_u32().to_be_bytes();
        for lighthouse in &self.lighthouses {
            enc.send_message_to_vpn_addr(
                MessageType::LightHouse,
                SUBTYPE_HOST_QUERY,
                NetworkAddrPair::new(*lighthouse, pair.network_id),
                &payload,
            );
        }
        trace!(target = %pair, lighthouses = self.lighthouses.len(), "Host query sent");
    }

    fn is_lighthouse(&self, pair: NetworkAddrPair) -> bool {
        self.lighthouses.contains(&pair.vpn_addr)
    }

    fn lighthouse_addrs(&self, _network_id: NetworkId) -> Vec<VpnAddr> {
        self.lighthouses.clone()
    }

    fn is_static(&self, pair: NetworkAddrPair) -> bool {
        self.static_host_map.contains_key(&pair.vpn_addr)
    }

    fn am_lighthouse(&self) -> bool {
        self.am_lighthouse
    }

    fn handle_request(
        &self,
        from: NetworkAddrPair,
        remote_addr: Option<SocketAddr>,
        subtype: u8,
        payload: &[u8],
        enc: &dyn EncWriter,
    ) {
        match subtype {
            SUBTYPE_HOST_QUERY => self.handle_host_query(from, payload, enc),
            SUBTYPE_HOST_QUERY_REPLY => self.handle_host_query_reply(from, payload),
            SUBTYPE_HOST_UPDATE_NOTIFICATION => self.handle_host_update(from, remote_addr, payload),
            other => debug!(from = %from, subtype = other, "Unknown lighthouse subtype"),
        }
    }

    fn send_update(&self, own: NetworkAddrPair, addrs: &[SocketAddr], enc: &dyn EncWriter) {
        if self.am_lighthouse {
            return;
        }
        let mut all: Vec<SocketAddr> = addrs.to_vec();
        for addr in &self.advertise_addrs {
            if !all.contains(addr) {
                all.push(*addr);
            }
        }
        let payload = HostAddrs::new(own.vpn_addr, all).encode();
        for lighthouse in &self.lighthouses {
            enc.send_message_to_vpn_addr(
                MessageType::LightHouse,
                SUBTYPE_HOST_UPDATE_NOTIFICATION,
                NetworkAddrPair::new(*lighthouse, own.network_id),
                &payload,
            );
        }
    }
}

impl std::fmt::Debug for LightHouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightHouse")
            .field("am_lighthouse", &self.am_lighthouse)
            .field("lighthouses", &self.lighthouses)
            .field("learned", &self.learned_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingEnc;

    fn pair(addr: &str) -> NetworkAddrPair {
        NetworkAddrPair::new(addr.parse().unwrap(), 1)
    }

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn client(static_map: &[(&str, &str)]) -> (LightHouse, mpsc::Receiver<NetworkAddrPair>) {
        let (tx, rx) = mpsc::channel(8);
        let config = LighthouseConfig {
            hosts: vec!["10.1.0.1".parse().unwrap()],
            static_host_map: static_map
                .iter()
                .map(|(vpn, addr)| (vpn.parse().unwrap(), vec![sa(addr)]))
                .collect(),
            ..Default::default()
        };
        (LightHouse::new(&config, tx), rx)
    }

    fn server() -> LightHouse {
        let (tx, _rx) = mpsc::channel(8);
        let config = LighthouseConfig {
            am_lighthouse: true,
            ..Default::default()
        };
        LightHouse::new(&config, tx)
    }

    #[test]
    fn test_host_addrs_wire_format() {
        let msg = HostAddrs::new(
            "10.1.0.7".parse().unwrap(),
            vec![sa("1.2.3.4:4242"), sa("[::1]:4242"), sa("5.6.7.8:1")],
        );
        let bytes = msg.encode();
        assert_eq!(bytes.len(), 5 + 2 * 6);
        assert_eq!(&bytes[..5], &[10, 1, 0, 7, 2]);
        assert_eq!(&bytes[5..11], &[1, 2, 3, 4, 0x10, 0x92]);

        let decoded = HostAddrs::decode(&bytes).unwrap();
        assert_eq!(decoded.vpn_addr, msg.vpn_addr);
        assert_eq!(decoded.addrs, vec![sa("1.2.3.4:4242"), sa("5.6.7.8:1")]);

        assert_eq!(
            HostAddrs::decode(&bytes[..8]),
            Err(LighthouseError::TooShort { expected: 17, got: 8 })
        );
    }

    #[test]
    fn test_static_map_seeds_cache() {
        let (lh, _rx) = client(&[("10.1.0.1", "192.0.2.1:4242")]);
        assert!(lh.is_static(pair("10.1.0.1")));
        assert!(lh.is_lighthouse(pair("10.1.0.1")));
        assert_eq!(lh.query_cache(pair("10.1.0.1")), vec![sa("192.0.2.1:4242")]);
        assert!(lh.query_cache(pair("10.1.0.9")).is_empty());
    }

    #[test]
    fn test_query_server_asks_every_lighthouse() {
        let (lh, _rx) = client(&[]);
        let enc = RecordingEnc::default();

        lh.query_server(pair("10.1.0.9"), &enc);
        let sent = enc.take_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_type, MessageType::LightHouse);
        assert_eq!(sent[0].subtype, SUBTYPE_HOST_QUERY);
        assert_eq!(sent[0].pair, pair("10.1.0.1"));
        assert_eq!(sent[0].payload, vec![10, 1, 0, 9]);

        // Never query for a lighthouse itself.
        lh.query_server(pair("10.1.0.1"), &enc);
        assert!(enc.take_messages().is_empty());
    }

    #[test]
    fn test_reply_caches_and_triggers() {
        let (lh, mut rx) = client(&[]);
        let enc = RecordingEnc::default();
        let reply = HostAddrs::new("10.1.0.9".parse().unwrap(), vec![sa("198.51.100.2:4242")]);

        // Replies from non-lighthouses are ignored.
        lh.handle_request(pair("10.1.0.5"), None, SUBTYPE_HOST_QUERY_REPLY, &reply.encode(), &enc);
        assert!(lh.query_cache(pair("10.1.0.9")).is_empty());

        lh.handle_request(pair("10.1.0.1"), None, SUBTYPE_HOST_QUERY_REPLY, &reply.encode(), &enc);
        assert_eq!(lh.query_cache(pair("10.1.0.9")), vec![sa("198.51.100.2:4242")]);
        assert_eq!(rx.try_recv().unwrap(), pair("10.1.0.9"));
    }

    #[test]
    fn test_lighthouse_answers_from_updates() {
        let lh = server();
        let enc = RecordingEnc::default();
        let from = pair("10.1.0.5");
        let observed = sa("203.0.113.5:50000");

        let update = HostAddrs::new(from.vpn_addr, vec![sa("192.168.1.5:4242")]);
        lh.handle_request(from, Some(observed), SUBTYPE_HOST_UPDATE_NOTIFICATION, &update.encode(), &enc);
        assert_eq!(lh.query_cache(from), vec![observed, sa("192.168.1.5:4242")]);

        // A spoofed update for someone else is dropped.
        let spoof = HostAddrs::new("10.1.0.6".parse().unwrap(), vec![sa("6.6.6.6:1")]);
        lh.handle_request(from, None, SUBTYPE_HOST_UPDATE_NOTIFICATION, &spoof.encode(), &enc);
        assert!(lh.query_cache(pair("10.1.0.6")).is_empty());

        lh.handle_request(pair("10.1.0.7"), None, SUBTYPE_HOST_QUERY, &[10, 1, 0, 5], &enc);
        let sent = enc.take_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subtype, SUBTYPE_HOST_QUERY_REPLY);
        assert_eq!(sent[0].pair, pair("10.1.0.7"));
        let reply = HostAddrs::decode(&sent[0].payload).unwrap();
        assert_eq!(reply.addrs, vec![observed, sa("192.168.1.5:4242")]);
    }

    #[test]
    fn test_send_update_includes_advertised() {
        let (tx, _rx) = mpsc::channel(8);
        let config = LighthouseConfig {
            hosts: vec!["10.1.0.1".parse().unwrap(), "10.1.0.2".parse().unwrap()],
            advertise_addrs: vec![sa("198.51.100.9:4242")],
            ..Default::default()
        };
        let lh = LightHouse::new(&config, tx);
        let enc = RecordingEnc::default();

        lh.send_update(pair("10.1.0.5"), &[sa("192.168.1.5:4242")], &enc);
        let sent = enc.take_messages();
        assert_eq!(sent.len(), 2);
        let update = HostAddrs::decode(&sent[1].payload).unwrap();
        assert_eq!(update.vpn_addr, "10.1.0.5".parse::<VpnAddr>().unwrap());
        assert_eq!(update.addrs, vec![sa("192.168.1.5:4242"), sa("198.51.100.9:4242")]);

        // Lighthouses never report themselves.
        let enc = RecordingEnc::default();
        server().send_update(pair("10.1.0.1"), &[], &enc);
        assert!(enc.take_messages().is_empty());
    }
}
