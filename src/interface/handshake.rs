//! IX handshake stages on the wire.
//!
//! Stage 0 builds the initiator's first message and parks it on the
//! pending record; the handshake manager transmits it. Stage 1 runs on
//! the responder and answers with stage 2; stage 2 completes the
//! initiator. Both sides move the record into the main map only through
//! the manager, which settles races between simultaneous handshakes.

use super::Interface;
use crate::addr::{NetworkAddrPair, VpnAddr};
use crate::connection_state::ConnectionState;
use crate::handshake::{CompleteError, HandshakeDetails, HandshakeError};
use crate::header::{
    Header, MessageType, RelayFields, HANDSHAKE_STAGE1_COUNTER, HANDSHAKE_STAGE2_COUNTER, HEADER_LEN,
    SUBTYPE_HANDSHAKE_IX_PSK0,
};
use crate::hostmap::{HandshakeStage, HostInfo, HostInfoState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};

impl Interface {
    /// Build the stage 1 packet for a fresh pending record.
    pub(super) fn handshake_stage0(
        &self,
        hostinfo: &HostInfo,
        state: &mut HostInfoState,
    ) -> Result<(), HandshakeError> {
        let network_id = hostinfo.network_id();
        let cert = self
            .certs
            .cert_state(network_id)
            .ok_or(HandshakeError::UnknownNetwork(network_id))?;
        if cert.vpn_addr() == hostinfo.vpn_addr() {
            return Err(HandshakeError::SelfHandshake);
        }

        let cs = Arc::new(ConnectionState::new(cert.clone(), true));
        let mut details = HandshakeDetails::new(cert.vpn_addr(), network_id, cert.name());
        details.initiator_index = hostinfo.local_index();
        let message = cs.write_stage1(&details.encode())?;
        let packet = Header::new(
            MessageType::Handshake,
            SUBTYPE_HANDSHAKE_IX_PSK0,
            0,
            HANDSHAKE_STAGE1_COUNTER,
            network_id,
        )
        .encode_with(&message);

        state.set_handshake_packet(HandshakeStage::Stage1, packet);
        state.last_handshake_time = details.time;
        state.connection_state = Some(cs);
        state.handshake_start = Some(Instant::now());
        state.handshake_ready = true;
        Ok(())
    }

    pub(super) fn handle_handshake(
        &self,
        addr: Option<SocketAddr>,
        via: Option<VpnAddr>,
        packet: &[u8],
        header: &Header,
    ) {
        if header.subtype != SUBTYPE_HANDSHAKE_IX_PSK0 {
            debug!(subtype = header.subtype, "Unknown handshake subtype");
            return;
        }
        match header.message_counter {
            HANDSHAKE_STAGE1_COUNTER => self.handshake_stage1(addr, via, packet, header),
            HANDSHAKE_STAGE2_COUNTER => self.handshake_stage2(addr, via, packet, header),
            other => debug!(counter = other, "Unexpected handshake message counter"),
        }
    }

    /// Responder: read the initiator's message, answer it and promote the
    /// tunnel.
    fn handshake_stage1(&self, addr: Option<SocketAddr>, via: Option<VpnAddr>, packet: &[u8], header: &Header) {
        let network_id = header.network_id;
        let Some(cert) = self.certs.cert_state(network_id) else {
            debug!(network_id, "Handshake for a network we are not in");
            return;
        };

        let cs = Arc::new(ConnectionState::new(cert.clone(), false));
        let payload = match cs.read_stage1(&packet[HEADER_LEN..]) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(udp_addr = ?addr, error = %e, "Failed to read handshake stage 1");
                return;
            }
        };
        let details = match HandshakeDetails::decode(&payload) {
            Ok(details) => details,
            Err(e) => {
                debug!(udp_addr = ?addr, error = %e, "Malformed handshake details");
                return;
            }
        };
        let Some(remote_static) = cs.remote_static() else {
            return;
        };
        if details.network_id != network_id {
            debug!(udp_addr = ?addr, claimed = details.network_id, network_id, "Handshake network mismatch");
            return;
        }
        let peer_cert = details.certificate(remote_static);
        if let Err(e) = self.certs.verify(&peer_cert) {
            debug!(vpn_addr = %peer_cert.vpn_addr, udp_addr = ?addr, error = %e, "Invalid certificate from peer");
            return;
        }
        let pair = NetworkAddrPair::new(peer_cert.vpn_addr, network_id);

        let hostinfo = Arc::new(HostInfo::new(pair));
        hostinfo.set_remote_index(details.initiator_index);
        {
            let mut state = hostinfo.lock();
            state.connection_state = Some(cs.clone());
            state.last_handshake_time = details.time;
            state.handshake_start = Some(Instant::now());
            state.handshake_ready = true;
            state.set_handshake_packet(HandshakeStage::Stage1, packet.to_vec());
            match via {
                Some(relay) => {
                    state.relay = true;
                    state.relay_addr = Some(relay);
                }
                None => {
                    if let Some(addr) = addr {
                        state.remotes.set_current(addr, self.main.preferred_ranges());
                    }
                }
            }
        }
        if let Err(e) = self.handshakes.add_index_host_info(&hostinfo) {
            debug!(vpn_addr = %pair.vpn_addr, error = %e, "Failed to allocate responder index");
            return;
        }

        let mut reply = HandshakeDetails::new(cert.vpn_addr(), network_id, cert.name());
        reply.initiator_index = details.initiator_index;
        reply.responder_index = hostinfo.local_index();
        let message = match cs.write_stage2(&reply.encode()) {
            Ok(message) => message,
            Err(e) => {
                debug!(vpn_addr = %pair.vpn_addr, error = %e, "Failed to write handshake stage 2");
                self.handshakes.delete_host_info(&hostinfo);
                return;
            }
        };
        let stage2 = Header::new(
            MessageType::Handshake,
            SUBTYPE_HANDSHAKE_IX_PSK0,
            details.initiator_index,
            HANDSHAKE_STAGE2_COUNTER,
            network_id,
        )
        .encode_with(&message);
        if let Err(e) = cs.establish(peer_cert.clone()) {
            debug!(vpn_addr = %pair.vpn_addr, error = %e, "Failed to derive session keys");
            self.handshakes.delete_host_info(&hostinfo);
            return;
        }
        hostinfo
            .lock()
            .set_handshake_packet(HandshakeStage::Stage2, stage2.clone());

        // Ties go to the higher address so both sides keep the same tunnel.
        let overwrite = peer_cert.vpn_addr > cert.vpn_addr();
        match self
            .handshakes
            .check_and_complete(&hostinfo, HandshakeStage::Stage1, overwrite)
        {
            Ok(()) => {}
            Err(CompleteError::AlreadySeen(existing)) => {
                self.handshakes.delete_host_info(&hostinfo);
                let stored = existing
                    .lock()
                    .handshake_packet(HandshakeStage::Stage2)
                    .map(<[u8]>::to_vec);
                if let Some(stored) = stored {
                    trace!(vpn_addr = %pair.vpn_addr, "Retransmitted stage 1, resending stage 2");
                    self.send_handshake_reply(&stored, pair, addr, via);
                }
                return;
            }
            Err(e) => {
                debug!(vpn_addr = %pair.vpn_addr, error = %e, "Dropping handshake stage 1");
                self.handshakes.delete_host_info(&hostinfo);
                return;
            }
        }

        self.send_handshake_reply(&stage2, pair, addr, via);
        hostinfo.lock().handshake_complete = true;
        let queued = cs.mark_ready();
        self.flush_queued(&hostinfo, &cs, queued);
        info!(
            vpn_addr = %pair.vpn_addr,
            network_id,
            name = %peer_cert.name,
            udp_addr = ?addr,
            relay = ?via,
            local_index = hostinfo.local_index(),
            remote_index = hostinfo.remote_index(),
            "Handshake message received, tunnel established"
        );
    }

    fn send_handshake_reply(
        &self,
        packet: &[u8],
        pair: NetworkAddrPair,
        addr: Option<SocketAddr>,
        via: Option<VpnAddr>,
    ) {
        match (via, addr) {
            (Some(relay), _) => {
                let own = self.vpn_addr(pair.network_id).unwrap_or(VpnAddr::UNSPECIFIED);
                let fields = RelayFields::new(pair.vpn_addr, own);
                if let Err(e) = self.relay_packet(packet, fields, pair.network_id, Some(relay)) {
                    debug!(vpn_addr = %pair.vpn_addr, relay = %relay, error = %e, "Failed to relay handshake reply");
                }
            }
            (None, Some(addr)) => {
                if let Err(e) = self.outside.write_to(packet, addr) {
                    debug!(vpn_addr = %pair.vpn_addr, udp_addr = %addr, error = %e, "Failed to send handshake reply");
                }
            }
            (None, None) => {}
        }
    }

    /// Initiator: the responder answered.
    fn handshake_stage2(&self, addr: Option<SocketAddr>, via: Option<VpnAddr>, packet: &[u8], header: &Header) {
        let Some(hostinfo) = self.handshakes.query_index(header.network_id, header.remote_index) else {
            trace!(index = header.remote_index, udp_addr = ?addr, "Stage 2 for unknown handshake");
            return;
        };
        let pair = hostinfo.pair();

        let completed = {
            let mut state = hostinfo.lock();
            if state.handshake_complete {
                trace!(vpn_addr = %pair.vpn_addr, "Duplicate stage 2");
                return;
            }
            let Some(cs) = state.connection_state.clone() else {
                return;
            };
            self.finish_initiator(&hostinfo, &mut state, &cs, addr, via, packet)
                .map(|name| (cs, name))
        };

        let (cs, name) = match completed {
            Ok(completed) => completed,
            Err(e @ (HandshakeError::IdentityMismatch { .. } | HandshakeError::Cert(_))) => {
                info!(vpn_addr = %pair.vpn_addr, error = %e, "Handshake rejected, abandoning");
                self.handshakes.delete_host_info(&hostinfo);
                return;
            }
            Err(e) => {
                debug!(vpn_addr = %pair.vpn_addr, error = %e, "Failed to process handshake stage 2");
                return;
            }
        };

        self.handshakes.complete(&hostinfo);
        let queued = cs.mark_ready();
        self.flush_queued(&hostinfo, &cs, queued);
        let duration = hostinfo.lock().hs_duration;
        info!(
            vpn_addr = %pair.vpn_addr,
            network_id = pair.network_id,
            name = %name,
            udp_addr = ?addr,
            relay = ?via,
            duration_ms = duration.map(|d| d.as_millis() as u64),
            "Handshake completed"
        );
        self.update_relay_host_info(&hostinfo);
    }

    /// Verify the responder and install the session. Runs under the
    /// record's lock so a duplicate stage 2 cannot race us.
    fn finish_initiator(
        &self,
        hostinfo: &HostInfo,
        state: &mut HostInfoState,
        cs: &ConnectionState,
        addr: Option<SocketAddr>,
        via: Option<VpnAddr>,
        packet: &[u8],
    ) -> Result<String, HandshakeError> {
        let payload = cs.read_stage2(&packet[HEADER_LEN..])?;
        let details = HandshakeDetails::decode(&payload)?;
        let remote_static = cs
            .remote_static()
            .ok_or(HandshakeError::MalformedPayload("missing static key"))?;
        let peer_cert = details.certificate(remote_static);
        if peer_cert.vpn_addr != hostinfo.vpn_addr() || details.network_id != hostinfo.network_id() {
            return Err(HandshakeError::IdentityMismatch {
                expected: hostinfo.vpn_addr(),
                got: peer_cert.vpn_addr,
            });
        }
        self.certs.verify(&peer_cert)?;

        hostinfo.set_remote_index(details.responder_index);
        match via {
            Some(relay) => {
                state.relay = true;
                state.relay_addr = Some(relay);
            }
            None => {
                if let Some(addr) = addr {
                    state.remotes.set_current(addr, self.main.preferred_ranges());
                }
                state.relay = false;
                state.relay_addr = None;
            }
        }
        state.last_handshake_time = details.time;
        state.hs_duration = state.handshake_start.map(|start| start.elapsed());
        let name = peer_cert.name.clone();
        cs.establish(peer_cert)?;
        state.set_handshake_packet(HandshakeStage::Stage2, packet.to_vec());
        state.handshake_complete = true;
        Ok(name)
    }
}
