//! Inside device and routes.
//!
//! The engine reads IP packets from the inside device and writes decrypted
//! packets back to it. A real TUN interface is platform glue outside this
//! crate; [`ChannelDevice`] connects the engine to channels instead, which
//! is what embedders and tests use.

use crate::addr::VpnAddr;
use crate::config::UnsafeRouteConfig;
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Packets read from the inside device.
pub type InsideRx = mpsc::Receiver<Vec<u8>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device {0} is closed")]
    Closed(String),

    #[error("device {0} is not keeping up, packet dropped")]
    Full(String),
}

/// Inside interface of the overlay.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver a decrypted packet to the host.
    fn write(&self, packet: &[u8]) -> Result<(), DeviceError>;

    /// Stream of packets the host sends into the overlay. Can be taken
    /// once; devices driven some other way return `None`.
    fn reader(&self) -> Option<InsideRx> {
        None
    }
}

/// Host side of a [`ChannelDevice`].
#[derive(Debug)]
pub struct DeviceHandle {
    /// Packets sent into the overlay.
    pub inject: mpsc::Sender<Vec<u8>>,
    /// Packets the overlay delivered.
    pub delivered: mpsc::Receiver<Vec<u8>>,
}

/// Device backed by a pair of channels.
#[derive(Debug)]
pub struct ChannelDevice {
    name: String,
    delivered: mpsc::Sender<Vec<u8>>,
    inside: Mutex<Option<InsideRx>>,
}

impl ChannelDevice {
    pub fn new(name: impl Into<String>, buffer: usize) -> (Arc<Self>, DeviceHandle) {
        let (inject, inside) = mpsc::channel(buffer);
        let (delivered_tx, delivered) = mpsc::channel(buffer);
        let device = Arc::new(Self {
            name: name.into(),
            delivered: delivered_tx,
            inside: Mutex::new(Some(inside)),
        });
        (device, DeviceHandle { inject, delivered })
    }
}

impl Device for ChannelDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, packet: &[u8]) -> Result<(), DeviceError> {
        self.delivered.try_send(packet.to_vec()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeviceError::Full(self.name.clone()),
            mpsc::error::TrySendError::Closed(_) => DeviceError::Closed(self.name.clone()),
        })
    }

    fn reader(&self) -> Option<InsideRx> {
        self.inside.lock().take()
    }
}

/// Routes for destinations outside the overlay network, reached through
/// a peer. Lookups pick the longest matching prefix.
#[derive(Clone, Debug, Default)]
pub struct RouteTable {
    routes: Vec<(Ipv4Net, VpnAddr)>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(routes: &[UnsafeRouteConfig]) -> Self {
        let mut table = Self::new();
        for route in routes {
            table.add_route(route.route, route.via);
        }
        table
    }

    /// Add or replace the route for `net`.
    pub fn add_route(&mut self, net: Ipv4Net, via: VpnAddr) {
        let net = net.trunc();
        self.routes.retain(|(existing, _)| *existing != net);
        self.routes.push((net, via));
        self.routes.sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));
    }

    pub fn route_for(&self, addr: Ipv4Addr) -> Option<VpnAddr> {
        self.routes
            .iter()
            .find(|(net, _)| net.contains(&addr))
            .map(|(_, via)| *via)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
