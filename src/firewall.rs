//! Packet filter hook.
//!
//! The engine consults a [`Firewall`] for every packet crossing the inside
//! device, in both directions, after the tunnel is known. Rule evaluation
//! is up to the implementation; [`AllowAll`] accepts everything.

use crate::hostmap::HostInfo;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const IPV4_MIN_HEADER_LEN: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FirewallError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    #[error("not an IPv4 packet (version {0})")]
    NotIpv4(u8),

    #[error("invalid IPv4 header length {0}")]
    BadHeaderLength(usize),
}

/// Why a packet was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    NoMatchingRule,
    Rejected(String),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::NoMatchingRule => write!(f, "no matching rule"),
            DropReason::Rejected(why) => write!(f, "rejected: {}", why),
        }
    }
}

/// Addressing of one IPv4 packet seen from this node: `local` is our
/// side, `remote` the peer's.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FirewallPacket {
    pub local_ip: Ipv4Addr,
    pub remote_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_port: u16,
    pub protocol: u8,
    /// Non-first fragment; ports are unknown.
    pub fragment: bool,
}

impl FirewallPacket {
    pub fn parse(data: &[u8], incoming: bool) -> Result<Self, FirewallError> {
        if data.len() < IPV4_MIN_HEADER_LEN {
            return Err(FirewallError::TooShort(data.len()));
        }
        let version = data[0] >> 4;
        if version != 4 {
            return Err(FirewallError::NotIpv4(version));
        }
        let ihl = ((data[0] & 0x0f) as usize) * 4;
        if ihl < IPV4_MIN_HEADER_LEN || data.len() < ihl {
            return Err(FirewallError::BadHeaderLength(ihl));
        }

        let protocol = data[9];
        let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
        let fragment_offset = u16::from_be_bytes([data[6], data[7]]) & 0x1fff;
        let fragment = fragment_offset != 0;

        let (src_port, dst_port) = match protocol {
            PROTO_TCP | PROTO_UDP if !fragment => {
                if data.len() < ihl + 4 {
                    return Err(FirewallError::TooShort(data.len()));
                }
                (
                    u16::from_be_bytes([data[ihl], data[ihl + 1]]),
                    u16::from_be_bytes([data[ihl + 2], data[ihl + 3]]),
                )
            }
            _ => (0, 0),
        };

        Ok(if incoming {
            Self {
                local_ip: dst,
                remote_ip: src,
                local_port: dst_port,
                remote_port: src_port,
                protocol,
                fragment,
            }
        } else {
            Self {
                local_ip: src,
                remote_ip: dst,
                local_port: src_port,
                remote_port: dst_port,
                protocol,
                fragment,
            }
        })
    }
}

pub trait Firewall: Send + Sync {
    /// `None` lets the packet through.
    fn drop_reason(&self, packet: &FirewallPacket, incoming: bool, host: &HostInfo) -> Option<DropReason>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Firewall for AllowAll {
    fn drop_reason(&self, _packet: &FirewallPacket, _incoming: bool, _host: &HostInfo) -> Option<DropReason> {
        None
    }
}

/// Minimal IPv4 packet for tests: header plus 4 bytes of ports.
#[cfg(test)]
pub(crate) fn ipv4_packet(src: &str, dst: &str, protocol: u8, payload: &[u8]) -> Vec<u8> {
    let src: Ipv4Addr = src.parse().expect("valid src");
    let dst: Ipv4Addr = dst.parse().expect("valid dst");
    let total = IPV4_MIN_HEADER_LEN + 4 + payload.len();
    let mut p = vec![0u8; IPV4_MIN_HEADER_LEN];
    p[0] = 0x45;
    p[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    p[8] = 64;
    p[9] = protocol;
    p[12..16].copy_from_slice(&src.octets());
    p[16..20].copy_from_slice(&dst.octets());
    p.extend_from_slice(&1234u16.to_be_bytes());
    p.extend_from_slice(&80u16.to_be_bytes());
    p.extend_from_slice(payload);
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directions() {
        let data = ipv4_packet("10.1.0.1", "10.1.0.2", PROTO_TCP, b"x");

        let out = FirewallPacket::parse(&data, false).unwrap();
        assert_eq!(out.local_ip, Ipv4Addr::new(10, 1, 0, 1));
        assert_eq!(out.remote_ip, Ipv4Addr::new(10, 1, 0, 2));
        assert_eq!((out.local_port, out.remote_port), (1234, 80));

        let inc = FirewallPacket::parse(&data, true).unwrap();
        assert_eq!(inc.local_ip, Ipv4Addr::new(10, 1, 0, 2));
        assert_eq!((inc.local_port, inc.remote_port), (80, 1234));
        assert_eq!(inc.protocol, PROTO_TCP);
        assert!(!inc.fragment);
    }

    #[test]
    fn test_icmp_and_fragments_have_no_ports() {
        let icmp = ipv4_packet("10.1.0.1", "10.1.0.2", PROTO_ICMP, b"");
        assert_eq!(FirewallPacket::parse(&icmp, false).unwrap().remote_port, 0);

        let mut frag = ipv4_packet("10.1.0.1", "10.1.0.2", PROTO_UDP, b"");
        frag[7] = 0x10;
        let parsed = FirewallPacket::parse(&frag, false).unwrap();
        assert!(parsed.fragment);
        assert_eq!((parsed.local_port, parsed.remote_port), (0, 0));
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(FirewallPacket::parse(&[0x45; 4], false), Err(FirewallError::TooShort(4)));
        let mut v6 = ipv4_packet("10.1.0.1", "10.1.0.2", PROTO_UDP, b"");
        v6[0] = 0x60;
        assert_eq!(FirewallPacket::parse(&v6, false), Err(FirewallError::NotIpv4(6)));
        let mut bad = ipv4_packet("10.1.0.1", "10.1.0.2", PROTO_UDP, b"");
        bad[0] = 0x44;
        assert_eq!(FirewallPacket::parse(&bad, false), Err(FirewallError::BadHeaderLength(16)));
    }
}
