//! Handshake payload.
//!
//! Both IX messages carry a small details record next to the Noise
//! keys. Layout (big-endian):
//!
//! ```text
//! [initiator_index:4][responder_index:4][time:8][vpn_addr:4]
//! [network_id:8][name_len:1][name:name_len]
//! ```

use crate::addr::{NetworkId, VpnAddr};
use crate::cert::Certificate;
use secp256k1::PublicKey;
use std::time::{SystemTime, UNIX_EPOCH};

use super::HandshakeError;

const FIXED_LEN: usize = 4 + 4 + 8 + 4 + 8 + 1;

/// Payload exchanged inside handshake stage 1 and stage 2.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeDetails {
    pub initiator_index: u32,
    pub responder_index: u32,
    /// Sender wall clock in nanoseconds since the unix epoch.
    pub time: u64,
    pub vpn_addr: VpnAddr,
    pub network_id: NetworkId,
    pub name: String,
}

impl HandshakeDetails {
    pub fn new(vpn_addr: VpnAddr, network_id: NetworkId, name: impl Into<String>) -> Self {
        Self {
            initiator_index: 0,
            responder_index: 0,
            time: now_nanos(),
            vpn_addr,
            network_id,
            name: name.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Names longer than a length byte can describe are cut.
        let name = &self.name.as_bytes()[..self.name.len().min(u8::MAX as usize)];

        let mut out = Vec::with_capacity(FIXED_LEN + name.len());
        out.extend_from_slice(&self.initiator_index.to_be_bytes());
        out.extend_from_slice(&self.responder_index.to_be_bytes());
        out.extend_from_slice(&self.time.to_be_bytes());
        out.extend_from_slice(&self.vpn_addr.as_u32().to_be_bytes());
        out.extend_from_slice(&self.network_id.to_be_bytes());
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, HandshakeError> {
        if data.len() < FIXED_LEN {
            return Err(HandshakeError::MalformedPayload("too short"));
        }
        let name_len = data[FIXED_LEN - 1] as usize;
        if data.len() != FIXED_LEN + name_len {
            return Err(HandshakeError::MalformedPayload("name length mismatch"));
        }
        let name = std::str::from_utf8(&data[FIXED_LEN..])
            .map_err(|_| HandshakeError::MalformedPayload("name is not utf-8"))?;

        let mut u64_buf = [0u8; 8];
        let mut u32_buf = [0u8; 4];
        u32_buf.copy_from_slice(&data[0..4]);
        let initiator_index = u32::from_be_bytes(u32_buf);
        u32_buf.copy_from_slice(&data[4..8]);
        let responder_index = u32::from_be_bytes(u32_buf);
        u64_buf.copy_from_slice(&data[8..16]);
        let time = u64::from_be_bytes(u64_buf);
        u32_buf.copy_from_slice(&data[16..20]);
        let vpn_addr = VpnAddr::new(u32::from_be_bytes(u32_buf));
        u64_buf.copy_from_slice(&data[20..28]);
        let network_id = u64::from_be_bytes(u64_buf);

        Ok(Self {
            initiator_index,
            responder_index,
            time,
            vpn_addr,
            network_id,
            name: name.to_string(),
        })
    }

    /// Certificate for the sender, bound to the static key the Noise
    /// handshake authenticated.
    pub fn certificate(&self, public_key: PublicKey) -> Certificate {
        Certificate::new(self.name.clone(), self.vpn_addr, self.network_id, public_key)
    }
}

pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let mut details = HandshakeDetails::new("10.1.0.9".parse().unwrap(), 42, "laptop");
        details.initiator_index = 0xaabbccdd;
        details.responder_index = 7;

        let bytes = details.encode();
        assert_eq!(bytes.len(), FIXED_LEN + 6);
        assert_eq!(&bytes[0..4], &[0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(HandshakeDetails::decode(&bytes).unwrap(), details);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(HandshakeDetails::decode(&[0u8; 5]).is_err());

        let mut bytes = HandshakeDetails::new(VpnAddr::new(1), 1, "ab").encode();
        bytes.push(b'c');
        assert!(matches!(
            HandshakeDetails::decode(&bytes),
            Err(HandshakeError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_long_name_truncated() {
        let details = HandshakeDetails::new(VpnAddr::new(1), 1, "n".repeat(300));
        let decoded = HandshakeDetails::decode(&details.encode()).unwrap();
        assert_eq!(decoded.name.len(), 255);
    }
}
