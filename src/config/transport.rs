//! Outside socket and inside device configuration.

use crate::addr::VpnAddr;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// Default UDP bind address.
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:4242";

/// Default outside MTU.
const DEFAULT_MTU: u16 = 1300;

/// Outside UDP socket (`listen.*`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    /// Bind address (`listen.bind_addr`). Defaults to "0.0.0.0:4242".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<String>,

    /// Largest datagram read or written (`listen.mtu`). Defaults to 1300.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u16>,
}

impl ListenConfig {
    /// Get the bind address, using default if not configured.
    pub fn bind_addr(&self) -> &str {
        self.bind_addr.as_deref().unwrap_or(DEFAULT_BIND_ADDR)
    }

    /// Get the MTU, using default if not configured.
    pub fn mtu(&self) -> u16 {
        self.mtu.unwrap_or(DEFAULT_MTU)
    }

    pub(super) fn merge(&mut self, other: ListenConfig) {
        if other.bind_addr.is_some() {
            self.bind_addr = other.bind_addr;
        }
        if other.mtu.is_some() {
            self.mtu = other.mtu;
        }
    }
}

/// A route for a range outside the overlay, reached through a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsafeRouteConfig {
    pub route: Ipv4Net,
    pub via: VpnAddr,
}

/// Inside device behavior (`tun.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unsafe_routes: Vec<UnsafeRouteConfig>,
    /// Drop packets to the overlay broadcast address (`tun.drop_local_broadcast`).
    #[serde(default = "TunConfig::default_drop_local_broadcast")]
    pub drop_local_broadcast: bool,
    /// Drop multicast packets (`tun.drop_multicast`).
    #[serde(default = "TunConfig::default_drop_multicast")]
    pub drop_multicast: bool,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            unsafe_routes: Vec::new(),
            drop_local_broadcast: true,
            drop_multicast: true,
        }
    }
}

impl TunConfig {
    fn default_drop_local_broadcast() -> bool { true }
    fn default_drop_multicast() -> bool { true }
}
