//! Per-network key material and peer certificates.
//!
//! A node holds one [`CertState`] per network it participates in: the
//! static keypair used for the Noise handshake plus the certificate it
//! presents to peers. Peers present their certificate inside the handshake
//! payload and the [`CertProvider`] decides whether it is acceptable.

use crate::addr::{NetworkId, VpnAddr};
use ipnet::Ipv4Net;
use secp256k1::{Keypair, PublicKey, Secp256k1, SecretKey};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors from certificate handling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CertError {
    #[error("no certificate for network {0}")]
    UnknownNetwork(NetworkId),

    #[error("address {vpn_addr} is outside network {cidr}")]
    OutsideNetwork { vpn_addr: VpnAddr, cidr: Ipv4Net },

    #[error("certificate claims our own address {0}")]
    SelfAddress(VpnAddr),

    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),
}

fn serialize_pubkey<S: Serializer>(key: &PublicKey, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(key.serialize()))
}

/// Identity a peer presents for one network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Certificate {
    pub name: String,
    pub vpn_addr: VpnAddr,
    pub network_id: NetworkId,
    #[serde(serialize_with = "serialize_pubkey")]
    pub public_key: PublicKey,
}

impl Certificate {
    pub fn new(
        name: impl Into<String>,
        vpn_addr: VpnAddr,
        network_id: NetworkId,
        public_key: PublicKey,
    ) -> Self {
        Self {
            name: name.into(),
            vpn_addr,
            network_id,
            public_key,
        }
    }
}

impl fmt::Display for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}@{})", self.name, self.vpn_addr, self.network_id)
    }
}

/// Our key material and certificate for one network.
pub struct CertState {
    pub certificate: Certificate,
    pub keypair: Keypair,
    pub vpn_cidr: Ipv4Net,
}

impl CertState {
    pub fn new(
        name: impl Into<String>,
        vpn_addr: VpnAddr,
        network_id: NetworkId,
        vpn_cidr: Ipv4Net,
        keypair: Keypair,
    ) -> Self {
        let certificate = Certificate::new(name, vpn_addr, network_id, keypair.public_key());
        Self {
            certificate,
            keypair,
            vpn_cidr,
        }
    }

    /// Build from a hex-encoded secret key.
    pub fn from_secret_hex(
        secret_hex: &str,
        name: impl Into<String>,
        vpn_addr: VpnAddr,
        network_id: NetworkId,
        vpn_cidr: Ipv4Net,
    ) -> Result<Self, CertError> {
        let bytes =
            hex::decode(secret_hex.trim()).map_err(|e| CertError::InvalidSecretKey(e.to_string()))?;
        let secret =
            SecretKey::from_slice(&bytes).map_err(|e| CertError::InvalidSecretKey(e.to_string()))?;
        let keypair = Keypair::from_secret_key(&Secp256k1::new(), &secret);
        Ok(Self::new(name, vpn_addr, network_id, vpn_cidr, keypair))
    }

    pub fn vpn_addr(&self) -> VpnAddr {
        self.certificate.vpn_addr
    }

    pub fn network_id(&self) -> NetworkId {
        self.certificate.network_id
    }

    pub fn name(&self) -> &str {
        &self.certificate.name
    }

    /// Whether `addr` belongs to this network's overlay range.
    pub fn contains(&self, addr: VpnAddr) -> bool {
        self.vpn_cidr.contains(&addr.to_ipv4())
    }
}

impl fmt::Debug for CertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertState")
            .field("certificate", &self.certificate)
            .field("vpn_cidr", &self.vpn_cidr)
            .field("keypair", &"[redacted]")
            .finish()
    }
}

/// Source of local key material and the acceptance policy for peers.
pub trait CertProvider: Send + Sync {
    /// Key material for `network_id`, if we participate in that network.
    fn cert_state(&self, network_id: NetworkId) -> Option<Arc<CertState>>;

    /// Decide whether a peer certificate may establish a tunnel.
    fn verify(&self, cert: &Certificate) -> Result<(), CertError>;
}

/// Provider backed by a fixed set of per-network states from configuration.
pub struct StaticCertProvider {
    states: HashMap<NetworkId, Arc<CertState>>,
}

impl StaticCertProvider {
    pub fn new(primary: CertState) -> Self {
        let mut states = HashMap::new();
        states.insert(primary.network_id(), Arc::new(primary));
        Self { states }
    }

    /// Add another network, replacing any existing state for it.
    pub fn with_network(mut self, state: CertState) -> Self {
        self.states.insert(state.network_id(), Arc::new(state));
        self
    }

    pub fn networks(&self) -> impl Iterator<Item = NetworkId> + '_ {
        self.states.keys().copied()
    }
}

impl CertProvider for StaticCertProvider {
    fn cert_state(&self, network_id: NetworkId) -> Option<Arc<CertState>> {
        self.states.get(&network_id).cloned()
    }

    fn verify(&self, cert: &Certificate) -> Result<(), CertError> {
        let state = self
            .states
            .get(&cert.network_id)
            .ok_or(CertError::UnknownNetwork(cert.network_id))?;

        if !state.contains(cert.vpn_addr) || cert.vpn_addr.is_unspecified() {
            return Err(CertError::OutsideNetwork {
                vpn_addr: cert.vpn_addr,
                cidr: state.vpn_cidr,
            });
        }
        if cert.vpn_addr == state.vpn_addr() {
            return Err(CertError::SelfAddress(cert.vpn_addr));
        }
        Ok(())
    }
}

/// Fresh random key material for tests.
#[cfg(test)]
pub(crate) fn generate_cert_state(name: &str, vpn_addr: &str, network_id: NetworkId) -> CertState {
    let secp = Secp256k1::new();
    let (secret, _) = secp.generate_keypair(&mut rand::thread_rng());
    CertState::new(
        name,
        vpn_addr.parse().expect("valid test address"),
        network_id,
        "10.1.0.0/16".parse().expect("valid test cidr"),
        Keypair::from_secret_key(&secp, &secret),
    )
}
