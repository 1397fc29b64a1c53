//! meshtun: an encrypted mesh-overlay tunnel engine
//!
//! Nodes hold certificates binding a static key to a virtual address and
//! build authenticated Noise IX tunnels to each other over one UDP socket.
//! Peers are found through lighthouses, reached through a lighthouse relay
//! when a direct path fails, and can exchange acknowledged in-tunnel
//! messages alongside IP traffic.

pub mod addr;
pub mod cert;
pub mod config;
pub mod connection_state;
pub mod control;
pub mod firewall;
pub mod handshake;
pub mod header;
pub mod hostmap;
pub mod interface;
pub mod lighthouse;
pub mod messaging;
pub mod noise;
pub mod overlay;
pub mod timer_wheel;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export addressing types
pub use addr::{NetworkAddrPair, NetworkId, VpnAddr};

// Re-export config types
pub use config::{
    Config, ConfigError, HandshakesConfig, LighthouseConfig, ListenConfig, MessagingConfig,
    TimerConfig, TunConfig, UnsafeRouteConfig,
};

// Re-export certificate types
pub use cert::{CertError, CertProvider, CertState, Certificate, StaticCertProvider};

// Re-export wire types
pub use header::{Header, HeaderError, MessageType, RelayFields, HEADER_LEN};
pub use noise::{CipherState, HandshakeState, NoiseError, ReplayWindow};

// Re-export tunnel state types
pub use connection_state::{ConnectionError, ConnectionState};
pub use handshake::{HandshakeConfig, HandshakeError, HandshakeManager, HandshakeMetrics};
pub use hostmap::{ControlHostInfo, HostInfo, HostMap, HostMapError, RemoteList};
pub use timer_wheel::TimerWheel;

// Re-export engine types
pub use control::Control;
pub use firewall::{AllowAll, DropReason, Firewall, FirewallPacket};
pub use interface::{EngineError, Interface, InterfaceParts, RelayError, RelayServer};
pub use lighthouse::{Discovery, LightHouse};
pub use messaging::{EventRing, MessageProcessor, Messaging, MessagingError};
pub use overlay::{ChannelDevice, Device, DeviceError, DeviceHandle, RouteTable};

// Re-export transport types
pub use transport::{
    packet_channel, EncWriter, PacketRx, PacketTx, ReceivedPacket, TransportError, UdpTransport,
    UdpWriter,
};
