//! Overlay addressing.
//!
//! Peers are identified inside a logical network by a 32-bit virtual
//! address. A node may take part in several networks at once (a
//! lighthouse usually serves many), so every registry key pairs the
//! address with its [`NetworkId`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// 64-bit identifier partitioning all per-peer registries.
pub type NetworkId = u64;

/// A peer's overlay (virtual) IPv4 address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "Ipv4Addr", into = "Ipv4Addr")]
pub struct VpnAddr(u32);

impl VpnAddr {
    /// The unspecified address, used on the wire for "no address".
    pub const UNSPECIFIED: VpnAddr = VpnAddr(0);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn to_ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.0)
    }

    pub fn is_unspecified(&self) -> bool {
        self.0 == 0
    }

    /// Class D (224.0.0.0/4).
    pub fn is_multicast(&self) -> bool {
        (self.0 >> 24) & 0xf0 == 0xe0
    }
}

impl From<Ipv4Addr> for VpnAddr {
    fn from(ip: Ipv4Addr) -> Self {
        Self(u32::from(ip))
    }
}

impl From<VpnAddr> for Ipv4Addr {
    fn from(addr: VpnAddr) -> Self {
        addr.to_ipv4()
    }
}

impl FromStr for VpnAddr {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Ipv4Addr::from_str(s)?.into())
    }
}

impl fmt::Display for VpnAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ipv4())
    }
}

/// `(vpn_addr, network_id)`: the key used by the handshake timer wheel
/// and the handshake trigger channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NetworkAddrPair {
    pub vpn_addr: VpnAddr,
    pub network_id: NetworkId,
}

impl NetworkAddrPair {
    pub fn new(vpn_addr: VpnAddr, network_id: NetworkId) -> Self {
        Self { vpn_addr, network_id }
    }
}

impl fmt::Display for NetworkAddrPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.vpn_addr, self.network_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vpn_addr_parse_display() {
        let addr: VpnAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(addr.as_u32(), 0x0a010203);
        assert_eq!(addr.to_string(), "10.1.2.3");
    }

    #[test]
    fn test_multicast() {
        assert!(VpnAddr::from(Ipv4Addr::new(224, 0, 0, 1)).is_multicast());
        assert!(VpnAddr::from(Ipv4Addr::new(239, 255, 255, 250)).is_multicast());
        assert!(!VpnAddr::from(Ipv4Addr::new(10, 0, 0, 1)).is_multicast());
    }

    #[test]
    fn test_serde_as_dotted_quad() {
        let addr: VpnAddr = serde_yaml::from_str("10.0.0.7").unwrap();
        assert_eq!(addr, VpnAddr::new(0x0a000007));
        let out = serde_yaml::to_string(&addr).unwrap();
        assert_eq!(out.trim(), "10.0.0.7");
    }
}
