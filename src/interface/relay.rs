//! Relay forwarding.
//!
//! A node that cannot reach a peer directly wraps the framed packet in a
//! RelayPacket envelope and hands it to a lighthouse it already has a
//! tunnel with. The lighthouse re-addresses the envelope to the
//! destination's tunnel and forwards it; the destination unwraps it and
//! processes the inner packet as if it had arrived directly.

use super::Interface;
use crate::addr::{NetworkAddrPair, NetworkId, VpnAddr};
use crate::connection_state::ConnectionError;
use crate::header::{Header, MessageType, RelayFields, HEADER_LEN};
use crate::hostmap::HostInfo;
use crate::transport::TransportError;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace};

/// A candidate must beat the current relay by this much before we switch.
const RELAY_HYSTERESIS: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no relay available in network {0}")]
    NoRelay(NetworkId),

    #[error("relay {0} has no established tunnel")]
    NotReady(VpnAddr),

    #[error("relay {0} has no known address")]
    NoRemote(VpnAddr),

    #[error("relay envelope: {0}")]
    Connection(#[from] ConnectionError),

    #[error("relay send: {0}")]
    Transport(#[from] TransportError),
}

/// The relay currently preferred for a network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RelayServer {
    pub vpn_addr: VpnAddr,
    pub network_id: NetworkId,
    pub remote: Option<SocketAddr>,
    pub hs_duration_ms: Option<u64>,
}

impl Interface {
    /// Ready tunnel with a known address.
    fn is_usable_relay(&self, hostinfo: &HostInfo) -> bool {
        hostinfo.is_ready() && hostinfo.lock().remotes.best().is_some()
    }

    fn relay_rtt(hostinfo: &HostInfo) -> Duration {
        hostinfo.lock().hs_duration.unwrap_or(Duration::MAX)
    }

    /// Best relay for `network_id`: the cached one while it stays usable,
    /// otherwise the lighthouse whose handshake completed fastest.
    pub fn relay_host(&self, network_id: NetworkId) -> Option<Arc<HostInfo>> {
        let cached = self.relay_hosts.lock().get(&network_id).cloned();
        if let Some(hostinfo) = cached {
            let current = self
                .main
                .query_vpn_addr(hostinfo.pair())
                .is_ok_and(|h| Arc::ptr_eq(&h, &hostinfo));
            if current && self.is_usable_relay(&hostinfo) {
                return Some(hostinfo);
            }
        }

        let best = self
            .discovery
            .lighthouse_addrs(network_id)
            .into_iter()
            .filter_map(|vpn| self.main.query_vpn_addr(NetworkAddrPair::new(vpn, network_id)).ok())
            .filter(|h| self.is_usable_relay(h))
            .min_by_key(|h| Self::relay_rtt(h))?;

        self.relay_hosts.lock().insert(network_id, best.clone());
        Some(best)
    }

    pub fn relay_server(&self, network_id: NetworkId) -> Option<RelayServer> {
        let hostinfo = self.relay_host(network_id)?;
        let state = hostinfo.lock();
        Some(RelayServer {
            vpn_addr: hostinfo.vpn_addr(),
            network_id,
            remote: state.remotes.best(),
            hs_duration_ms: state.hs_duration.map(|d| d.as_millis() as u64),
        })
    }

    /// Offer a freshly established lighthouse tunnel as relay. It replaces
    /// the current relay only when clearly faster.
    pub(super) fn update_relay_host_info(&self, hostinfo: &Arc<HostInfo>) {
        let network_id = hostinfo.network_id();
        if !self.discovery.is_lighthouse(hostinfo.pair()) || !self.is_usable_relay(hostinfo) {
            return;
        }
        let candidate_rtt = Self::relay_rtt(hostinfo);

        let current = self.relay_hosts.lock().get(&network_id).cloned();
        let replace = match current {
            None => true,
            Some(ref current) if Arc::ptr_eq(current, hostinfo) => false,
            Some(ref current) if !self.is_usable_relay(current) => true,
            Some(ref current) => {
                candidate_rtt.saturating_add(RELAY_HYSTERESIS) < Self::relay_rtt(current)
            }
        };
        if replace {
            self.relay_hosts.lock().insert(network_id, hostinfo.clone());
            info!(
                relay = %hostinfo.vpn_addr(),
                network_id,
                hs_duration_ms = candidate_rtt.as_millis() as u64,
                "Relay host selected"
            );
        }
    }

    /// Forget `hostinfo` as relay if it is the current one.
    pub(super) fn forget_relay_host(&self, hostinfo: &Arc<HostInfo>) {
        let mut relays = self.relay_hosts.lock();
        let network_id = hostinfo.network_id();
        if relays.get(&network_id).is_some_and(|h| Arc::ptr_eq(h, hostinfo)) {
            relays.remove(&network_id);
        }
    }

    /// A usable lighthouse other than the current relay, chosen at random.
    pub(super) fn pick_better_relay(&self, network_id: NetworkId) -> Option<VpnAddr> {
        let current = self
            .relay_hosts
            .lock()
            .get(&network_id)
            .map(|h| h.vpn_addr());
        let mut candidates = self.discovery.lighthouse_addrs(network_id);
        candidates.shuffle(&mut rand::thread_rng());
        candidates.into_iter().find(|vpn| {
            Some(*vpn) != current
                && self
                    .main
                    .query_vpn_addr(NetworkAddrPair::new(*vpn, network_id))
                    .is_ok_and(|h| self.is_usable_relay(&h))
        })
    }

    /// Wrap `inner` in an envelope and send it to the relay. A lighthouse
    /// sends straight to the destination's tunnel.
    pub(super) fn relay_packet(
        &self,
        inner: &[u8],
        fields: RelayFields,
        network_id: NetworkId,
        relay_addr: Option<VpnAddr>,
    ) -> Result<VpnAddr, RelayError> {
        let relay = if self.discovery.am_lighthouse() {
            self.main
                .query_vpn_addr(NetworkAddrPair::new(fields.dest_addr, network_id))
                .map_err(|_| RelayError::NoRelay(network_id))?
        } else {
            let wanted = relay_addr.or_else(|| {
                self.main
                    .query_vpn_addr(NetworkAddrPair::new(fields.dest_addr, network_id))
                    .ok()
                    .and_then(|h| h.lock().relay_addr)
            });
            let forced = wanted
                .and_then(|vpn| self.main.query_vpn_addr(NetworkAddrPair::new(vpn, network_id)).ok())
                .filter(|h| self.is_usable_relay(h));
            match forced {
                Some(hostinfo) => hostinfo,
                None => self.relay_host(network_id).ok_or(RelayError::NoRelay(network_id))?,
            }
        };

        let cs = relay
            .connection_state()
            .filter(|cs| cs.has_keys())
            .ok_or(RelayError::NotReady(relay.vpn_addr()))?;
        let remote = relay
            .lock()
            .remotes
            .best()
            .ok_or(RelayError::NoRemote(relay.vpn_addr()))?;

        let counter = cs.next_counter()?;
        let envelope = Header::new(MessageType::RelayPacket, 0, relay.remote_index(), counter, network_id)
            .with_relay(fields)
            .encode_with(inner);
        self.outside.write_to(&envelope, remote)?;
        relay.add_out_bytes(envelope.len());
        trace!(
            relay = %relay.vpn_addr(),
            dest = %fields.dest_addr,
            len = inner.len(),
            "Relay packet sent"
        );
        Ok(relay.vpn_addr())
    }

    /// Handle a RelayPacket envelope from `addr`.
    pub(super) fn handle_relay_packet(&self, addr: SocketAddr, packet: &[u8], header: &Header) {
        let network_id = header.network_id;
        let Ok(sender) = self.main.query_index(network_id, header.remote_index) else {
            debug!(udp_addr = %addr, index = header.remote_index, "Relay packet from unknown tunnel");
            return;
        };
        sender.add_in_bytes(packet.len());
        let inner = &packet[HEADER_LEN..];
        let own = self.certs.cert_state(network_id).map(|c| c.vpn_addr());

        if self.discovery.am_lighthouse() && own != Some(header.relay.dest_addr) {
            // The sender cannot claim another source.
            let fields = RelayFields {
                src_addr: sender.vpn_addr(),
                ..header.relay
            };
            if let Err(e) = self.relay_packet(inner, fields, network_id, None) {
                debug!(
                    from = %sender.vpn_addr(),
                    dest = %fields.dest_addr,
                    error = %e,
                    "Failed to forward relay packet"
                );
            }
            return;
        }

        let inner_header = match Header::parse(inner) {
            Ok(h) => h,
            Err(e) => {
                debug!(relay = %sender.vpn_addr(), error = %e, "Malformed relayed packet");
                return;
            }
        };
        if inner_header.network_id != network_id {
            debug!(relay = %sender.vpn_addr(), "Relayed packet crosses networks, dropping");
            return;
        }

        let via = Some(sender.vpn_addr());
        match inner_header.msg_type {
            MessageType::Handshake => {
                if !self.am_i_connected_with(sender.pair()) {
                    debug!(relay = %sender.vpn_addr(), "Relayed handshake through unestablished relay");
                    return;
                }
                self.handle_handshake(None, via, inner, &inner_header);
            }
            MessageType::Message
            | MessageType::LightHouse
            | MessageType::Test
            | MessageType::CloseTunnel
            | MessageType::NonTunMessage => {
                self.handle_encrypted(None, via, inner, &inner_header);
            }
            other => {
                debug!(relay = %sender.vpn_addr(), msg_type = %other, "Unexpected relayed packet type");
            }
        }
    }

    pub fn am_i_connected_with(&self, pair: NetworkAddrPair) -> bool {
        self.main.query_vpn_addr(pair).is_ok_and(|h| h.is_ready())
    }
}
