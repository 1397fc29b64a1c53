//! Datagrams from the outside socket.

use super::Interface;
use crate::addr::VpnAddr;
use crate::firewall::FirewallPacket;
use crate::header::{Header, MessageType, SUBTYPE_TEST_REPLY, SUBTYPE_TEST_REQUEST};
use crate::hostmap::HostInfo;
use std::net::SocketAddr;
use tracing::{debug, info, trace};

impl Interface {
    /// Handle one datagram received from `addr`.
    pub fn handle_outside(&self, addr: SocketAddr, packet: &[u8]) {
        let header = match Header::parse(packet) {
            Ok(header) => header,
            Err(e) => {
                trace!(udp_addr = %addr, error = %e, "Dropping unparseable packet");
                return;
            }
        };
        match header.msg_type {
            MessageType::Handshake => self.handle_handshake(Some(addr), None, packet, &header),
            MessageType::RelayPacket => self.handle_relay_packet(addr, packet, &header),
            MessageType::RecvError => self.handle_recv_error(addr, &header),
            MessageType::Message
            | MessageType::LightHouse
            | MessageType::Test
            | MessageType::CloseTunnel
            | MessageType::NonTunMessage => self.handle_encrypted(Some(addr), None, packet, &header),
        }
    }

    /// Decrypt a tunnel packet and dispatch it by type. `addr` is absent
    /// for packets that came through relay `via`.
    pub(super) fn handle_encrypted(
        &self,
        addr: Option<SocketAddr>,
        via: Option<VpnAddr>,
        packet: &[u8],
        header: &Header,
    ) {
        let hostinfo = match self.main.query_index(header.network_id, header.remote_index) {
            Ok(hostinfo) => hostinfo,
            Err(_) => {
                debug!(
                    index = header.remote_index,
                    udp_addr = ?addr,
                    relay = ?via,
                    msg_type = %header.msg_type,
                    "Packet for unknown tunnel"
                );
                if let Some(addr) = addr {
                    self.send_recv_error(addr, header);
                }
                return;
            }
        };
        let Some(cs) = hostinfo.connection_state() else {
            return;
        };
        let payload = match cs.decrypt(packet, header) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(vpn_addr = %hostinfo.vpn_addr(), udp_addr = ?addr, error = %e, "Failed to decrypt packet");
                return;
            }
        };

        if let Some(addr) = addr {
            self.handle_roaming(&hostinfo, addr);
        }
        hostinfo.add_in_bytes(packet.len());

        let pair = hostinfo.pair();
        match header.msg_type {
            MessageType::Message => self.deliver_inside(&hostinfo, &payload),
            MessageType::LightHouse => {
                self.discovery.handle_request(pair, addr, header.subtype, &payload, self);
            }
            MessageType::Test => {
                if header.subtype == SUBTYPE_TEST_REQUEST {
                    self.send_or_queue(&hostinfo, MessageType::Test, SUBTYPE_TEST_REPLY, &payload);
                }
            }
            MessageType::CloseTunnel => {
                info!(vpn_addr = %pair.vpn_addr, "Peer closed tunnel");
                self.close_tunnel(&hostinfo, true);
            }
            MessageType::NonTunMessage => self.messaging.handle_inbound(self, pair, &payload),
            MessageType::Handshake | MessageType::RelayPacket | MessageType::RecvError => {}
        }
    }

    /// A direct packet authenticated from a new address moves the tunnel
    /// there.
    fn handle_roaming(&self, hostinfo: &HostInfo, addr: SocketAddr) {
        let mut state = hostinfo.lock();
        if state.relay || state.remotes.current() == Some(addr) {
            return;
        }
        let previous = state.remotes.current();
        state.remotes.set_current(addr, self.main.preferred_ranges());
        drop(state);
        info!(
            vpn_addr = %hostinfo.vpn_addr(),
            udp_addr = %addr,
            previous = ?previous,
            "Host roamed to new udp address"
        );
    }

    fn deliver_inside(&self, hostinfo: &HostInfo, payload: &[u8]) {
        let fw = match FirewallPacket::parse(payload, true) {
            Ok(fw) => fw,
            Err(e) => {
                debug!(vpn_addr = %hostinfo.vpn_addr(), error = %e, "Dropping unparseable tunnel packet");
                return;
            }
        };
        if let Some(reason) = self.firewall.drop_reason(&fw, true, hostinfo) {
            debug!(vpn_addr = %hostinfo.vpn_addr(), reason = %reason, "Dropping inbound packet");
            return;
        }
        if let Err(e) = self.device.write(payload) {
            debug!(device = %self.device.name(), error = %e, "Failed to write to device");
        }
    }

    /// Tell the sender we have no tunnel for the index it used.
    fn send_recv_error(&self, addr: SocketAddr, header: &Header) {
        let reply = Header::new(MessageType::RecvError, 0, header.remote_index, 0, header.network_id).encode();
        if let Err(e) = self.outside.write_to(&reply, addr) {
            trace!(udp_addr = %addr, error = %e, "Failed to send recv error");
        }
    }

    /// The peer lost our tunnel. Only believed when it comes from the
    /// address we are talking to.
    fn handle_recv_error(&self, addr: SocketAddr, header: &Header) {
        let Ok(hostinfo) = self.main.query_remote_index(header.network_id, header.remote_index) else {
            trace!(udp_addr = %addr, index = header.remote_index, "Recv error for unknown tunnel");
            return;
        };
        let matches = {
            let state = hostinfo.lock();
            !state.relay && state.remotes.current() == Some(addr)
        };
        if !matches {
            debug!(vpn_addr = %hostinfo.vpn_addr(), udp_addr = %addr, "Ignoring recv error from unexpected address");
            return;
        }
        info!(vpn_addr = %hostinfo.vpn_addr(), udp_addr = %addr, "Peer lost tunnel state, closing");
        self.close_tunnel(&hostinfo, true);
    }
}
