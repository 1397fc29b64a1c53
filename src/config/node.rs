//! Engine tuning subsections.
//!
//! Handshake retry policy, scheduler resolution, messaging reliability and
//! lighthouse discovery.

use crate::addr::VpnAddr;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

// ============================================================================
// Handshakes
// ============================================================================

/// Handshake retry policy (`handshakes.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakesConfig {
    /// Interval between stage 1 retransmissions (`handshakes.try_interval_ms`).
    #[serde(default = "HandshakesConfig::default_try_interval_ms")]
    pub try_interval_ms: u64,
    /// Direct attempts before relaying (`handshakes.retries`).
    #[serde(default = "HandshakesConfig::default_retries")]
    pub retries: u32,
    /// Capacity of the handshake trigger channel (`handshakes.trigger_buffer`).
    #[serde(default = "HandshakesConfig::default_trigger_buffer")]
    pub trigger_buffer: usize,
}

impl Default for HandshakesConfig {
    fn default() -> Self {
        Self {
            try_interval_ms: 1000,
            retries: 5,
            trigger_buffer: 64,
        }
    }
}

impl HandshakesConfig {
    fn default_try_interval_ms() -> u64 { 1000 }
    fn default_retries() -> u32 { 5 }
    fn default_trigger_buffer() -> usize { 64 }

    pub fn try_interval(&self) -> Duration {
        Duration::from_millis(self.try_interval_ms)
    }
}

// ============================================================================
// Timer
// ============================================================================

/// Scheduler resolution (`timer.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Timer wheel tick (`timer.tick_ms`).
    #[serde(default = "TimerConfig::default_tick_ms")]
    pub tick_ms: u64,
    /// Period of the loop advancing the wheel (`timer.clock_ms`).
    #[serde(default = "TimerConfig::default_clock_ms")]
    pub clock_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 90,
            clock_ms: 110,
        }
    }
}

impl TimerConfig {
    fn default_tick_ms() -> u64 { 90 }
    fn default_clock_ms() -> u64 { 110 }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn clock(&self) -> Duration {
        Duration::from_millis(self.clock_ms.max(1))
    }
}

// ============================================================================
// Messaging
// ============================================================================

/// In-tunnel reliable messaging (`messaging.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Wait for an ACK per attempt (`messaging.ack_timeout_secs`).
    #[serde(default = "MessagingConfig::default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    /// Transmissions before giving up (`messaging.max_attempts`).
    #[serde(default = "MessagingConfig::default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 8,
            max_attempts: 3,
        }
    }
}

impl MessagingConfig {
    fn default_ack_timeout_secs() -> u64 { 8 }
    fn default_max_attempts() -> u32 { 3 }
}

// ============================================================================
// Lighthouse
// ============================================================================

/// Discovery (`lighthouse.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LighthouseConfig {
    /// Serve discovery and relay for other nodes (`lighthouse.am_lighthouse`).
    #[serde(default)]
    pub am_lighthouse: bool,
    /// Virtual addresses of the lighthouses to query (`lighthouse.hosts`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<VpnAddr>,
    /// Fixed public addresses for known hosts (`lighthouse.static_host_map`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub static_host_map: HashMap<VpnAddr, Vec<SocketAddr>>,
    /// Extra public addresses to report to lighthouses (`lighthouse.advertise_addrs`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advertise_addrs: Vec<SocketAddr>,
    /// Period of the update loop in seconds (`lighthouse.interval_secs`).
    #[serde(default = "LighthouseConfig::default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for LighthouseConfig {
    fn default() -> Self {
        Self {
            am_lighthouse: false,
            hosts: Vec::new(),
            static_host_map: HashMap::new(),
            advertise_addrs: Vec::new(),
            interval_secs: 10,
        }
    }
}

impl LighthouseConfig {
    fn default_interval_secs() -> u64 { 10 }
}
