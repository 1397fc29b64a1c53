//! Packets from the inside device.

use super::Interface;
use crate::addr::{NetworkAddrPair, VpnAddr};
use crate::connection_state::{CachedPacket, ConnectionError, ConnectionState};
use crate::firewall::FirewallPacket;
use crate::header::{Header, MessageType, RelayFields};
use crate::hostmap::HostInfo;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

impl Interface {
    /// Route one IP packet read from the inside device into a tunnel.
    pub fn consume_inside(&self, packet: &[u8]) {
        let fw = match FirewallPacket::parse(packet, false) {
            Ok(fw) => fw,
            Err(e) => {
                trace!(error = %e, "Dropping unparseable inside packet");
                return;
            }
        };
        let network_id = self.primary_network;
        let Some(cert) = self.certs.cert_state(network_id) else {
            return;
        };

        let dst = VpnAddr::from(fw.remote_ip);
        if dst == cert.vpn_addr() {
            trace!(dst = %dst, "Dropping packet addressed to ourselves");
            return;
        }
        if self.tun.drop_local_broadcast && fw.remote_ip == cert.vpn_cidr.broadcast() {
            trace!(dst = %dst, "Dropping local broadcast");
            return;
        }
        if self.tun.drop_multicast && dst.is_multicast() {
            trace!(dst = %dst, "Dropping multicast");
            return;
        }

        let Some(hostinfo) = self.get_or_handshake(NetworkAddrPair::new(dst, network_id)) else {
            debug!(dst = %dst, "No route for inside packet");
            return;
        };

        if let Some(reason) = self.firewall.drop_reason(&fw, false, &hostinfo) {
            debug!(dst = %dst, vpn_addr = %hostinfo.vpn_addr(), reason = %reason, "Dropping outbound packet");
            return;
        }

        self.send_or_queue(&hostinfo, MessageType::Message, 0, packet);
    }

    /// Tunnel for `pair`, starting a handshake if there is none. Addresses
    /// outside the overlay go through the unsafe route's gateway.
    pub(crate) fn get_or_handshake(&self, pair: NetworkAddrPair) -> Option<Arc<HostInfo>> {
        let cert = self.certs.cert_state(pair.network_id)?;
        let pair = if cert.contains(pair.vpn_addr) {
            pair
        } else {
            let via = self.routes.route_for(pair.vpn_addr.to_ipv4())?;
            NetworkAddrPair::new(via, pair.network_id)
        };
        if pair.vpn_addr == cert.vpn_addr() {
            return None;
        }

        if let Ok(hostinfo) = self.main.query_vpn_addr(pair) {
            return Some(hostinfo);
        }

        let preferred = self.main.preferred_ranges();
        let added = self.handshakes.add_vpn_addr(pair, |hostinfo| {
            let cached = self.discovery.query_cache(pair);
            if !cached.is_empty() {
                hostinfo.lock().remotes.set(cached, preferred);
            }
        });
        let (hostinfo, created) = match added {
            Ok(added) => added,
            Err(e) => {
                warn!(vpn_addr = %pair.vpn_addr, error = %e, "Failed to start handshake");
                return None;
            }
        };

        let mut state = hostinfo.lock();
        if !state.handshake_ready {
            if let Err(e) = self.handshake_stage0(&hostinfo, &mut state) {
                drop(state);
                warn!(vpn_addr = %pair.vpn_addr, error = %e, "Failed to build handshake");
                self.handshakes.delete_host_info(&hostinfo);
                return None;
            }
        }
        drop(state);

        if created && self.discovery.is_static(pair) {
            self.handshakes.trigger(pair);
        }
        Some(hostinfo)
    }

    /// Send now if the tunnel is ready, otherwise park the packet on it.
    pub(crate) fn send_or_queue(&self, hostinfo: &Arc<HostInfo>, msg_type: MessageType, subtype: u8, payload: &[u8]) {
        let Some(cs) = hostinfo.connection_state() else {
            debug!(vpn_addr = %hostinfo.vpn_addr(), "Tunnel has no session, dropping packet");
            return;
        };
        let packet = CachedPacket {
            msg_type,
            subtype,
            payload: payload.to_vec(),
        };
        match cs.queue_if_not_ready(packet) {
            Some(packet) => self.send(hostinfo, &cs, packet.msg_type, packet.subtype, &packet.payload),
            None => trace!(vpn_addr = %hostinfo.vpn_addr(), "Packet queued until tunnel is ready"),
        }
    }

    /// Encrypt and send on an established tunnel, directly or through its
    /// relay.
    pub(crate) fn send(
        &self,
        hostinfo: &Arc<HostInfo>,
        cs: &ConnectionState,
        msg_type: MessageType,
        subtype: u8,
        payload: &[u8],
    ) {
        let pair = hostinfo.pair();
        if hostinfo.swap_rebind_count(self.rebind_count()) && msg_type != MessageType::CloseTunnel {
            // Our address changed; have the peer learn the new one.
            self.discovery.query_server(pair, self);
        }

        let header = Header::new(msg_type, subtype, hostinfo.remote_index(), 0, pair.network_id);
        let packet = match cs.encrypt(header, payload) {
            Ok(packet) => packet,
            Err(ConnectionError::CounterExhausted) => {
                info!(vpn_addr = %pair.vpn_addr, "Message counter exhausted, re-keying tunnel");
                self.close_tunnel(hostinfo, true);
                if msg_type != MessageType::CloseTunnel {
                    if let Some(fresh) = self.get_or_handshake(pair) {
                        self.send_or_queue(&fresh, msg_type, subtype, payload);
                    }
                }
                return;
            }
            Err(e) => {
                warn!(vpn_addr = %pair.vpn_addr, error = %e, "Failed to encrypt packet");
                return;
            }
        };

        let (relay, relay_addr, remote) = {
            let state = hostinfo.lock();
            (state.relay, state.relay_addr, state.remotes.best())
        };
        if relay {
            let fields = RelayFields::new(pair.vpn_addr, cs.cert_state().vpn_addr());
            if let Err(e) = self.relay_packet(&packet, fields, pair.network_id, relay_addr) {
                debug!(vpn_addr = %pair.vpn_addr, error = %e, "Failed to relay packet");
                return;
            }
        } else {
            let Some(remote) = remote else {
                debug!(vpn_addr = %pair.vpn_addr, "No known address for tunnel, dropping packet");
                return;
            };
            if let Err(e) = self.outside.write_to(&packet, remote) {
                warn!(vpn_addr = %pair.vpn_addr, udp_addr = %remote, error = %e, "Failed to send packet");
                return;
            }
        }
        hostinfo.add_out_bytes(packet.len());
    }

    /// Send packets that queued up while the handshake ran.
    pub(crate) fn flush_queued(&self, hostinfo: &Arc<HostInfo>, cs: &ConnectionState, queued: Vec<CachedPacket>) {
        if queued.is_empty() {
            return;
        }
        trace!(vpn_addr = %hostinfo.vpn_addr(), count = queued.len(), "Flushing queued packets");
        for packet in queued {
            self.send(hostinfo, cs, packet.msg_type, packet.subtype, &packet.payload);
        }
    }
}
