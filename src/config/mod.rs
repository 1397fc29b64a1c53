//! meshtun Configuration System
//!
//! Loads configuration from YAML files with a cascading priority system:
//! 1. `./meshtun.yaml` (current directory - highest priority)
//! 2. `~/.config/meshtun/meshtun.yaml` (user config directory)
//! 3. `/etc/meshtun/meshtun.yaml` (system - lowest priority)
//!
//! Values from higher priority files override those from lower priority files.
//!
//! # YAML Structure
//!
//! ```yaml
//! pki:
//!   secret: "0102...1f20"
//!   vpn_addr: 10.1.0.1
//!   network_id: 1
//!   vpn_cidr: 10.1.0.0/16
//! listen:
//!   bind_addr: "0.0.0.0:4242"
//! lighthouse:
//!   hosts: [10.1.0.100]
//!   static_host_map:
//!     10.1.0.100: ["203.0.113.7:4242"]
//! ```

mod node;
mod transport;

use crate::addr::{NetworkId, VpnAddr};
use crate::cert::{CertError, CertState, StaticCertProvider};
use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use node::{HandshakesConfig, LighthouseConfig, MessagingConfig, TimerConfig};
pub use transport::{ListenConfig, TunConfig, UnsafeRouteConfig};

/// Default config filename.
const CONFIG_FILENAME: &str = "meshtun.yaml";

/// Network used when `pki.network_id` is not set.
pub const DEFAULT_NETWORK_ID: NetworkId = 1;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("missing required setting {0}")]
    MissingField(&'static str),

    #[error("certificate error: {0}")]
    Cert(#[from] CertError),
}

/// An additional network joined with the same key (`pki.extra_networks[]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network_id: NetworkId,
    pub vpn_addr: VpnAddr,
    pub vpn_cidr: Ipv4Net,
}

/// Key material and overlay identity (`pki.*`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkiConfig {
    /// Hex-encoded secp256k1 secret key (`pki.secret`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpn_addr: Option<VpnAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<NetworkId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpn_cidr: Option<Ipv4Net>,
    /// Name presented to peers (`pki.name`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_networks: Vec<NetworkConfig>,
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pki: PkiConfig,

    #[serde(default)]
    pub listen: ListenConfig,

    #[serde(default)]
    pub handshakes: HandshakesConfig,

    #[serde(default)]
    pub timer: TimerConfig,

    #[serde(default)]
    pub messaging: MessagingConfig,

    #[serde(default)]
    pub lighthouse: LighthouseConfig,

    /// Remote address ranges tried first (`preferred_ranges`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_ranges: Vec<IpNet>,

    #[serde(default)]
    pub tun: TunConfig,
}

impl Config {
    /// Create a new empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the standard search paths.
    ///
    /// Returns a tuple of (config, paths_loaded) where paths_loaded contains
    /// the paths that were successfully loaded.
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let search_paths = Self::search_paths();
        Self::load_from_paths(&search_paths)
    }

    /// Load configuration from specific paths.
    ///
    /// Paths are processed in order, with later paths overriding earlier ones.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut config = Config::default();
        let mut loaded_paths = Vec::new();

        for path in paths {
            if path.exists() {
                let file_config = Self::load_file(path)?;
                config.merge(file_config);
                loaded_paths.push(path.clone());
            }
        }

        Ok((config, loaded_paths))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the standard search paths in priority order (lowest to highest).
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        paths.push(PathBuf::from("/etc/meshtun").join(CONFIG_FILENAME));

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("meshtun").join(CONFIG_FILENAME));
        }

        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));

        paths
    }

    /// Merge another configuration into this one.
    ///
    /// Optional values from `other` override when present; defaulted
    /// sections override when they differ from their defaults.
    pub fn merge(&mut self, other: Config) {
        let pki = other.pki;
        if pki.secret.is_some() {
            self.pki.secret = pki.secret;
        }
        if pki.vpn_addr.is_some() {
            self.pki.vpn_addr = pki.vpn_addr;
        }
        if pki.network_id.is_some() {
            self.pki.network_id = pki.network_id;
        }
        if pki.vpn_cidr.is_some() {
            self.pki.vpn_cidr = pki.vpn_cidr;
        }
        if pki.name.is_some() {
            self.pki.name = pki.name;
        }
        if !pki.extra_networks.is_empty() {
            self.pki.extra_networks = pki.extra_networks;
        }

        self.listen.merge(other.listen);

        if other.handshakes != HandshakesConfig::default() {
            self.handshakes = other.handshakes;
        }
        if other.timer != TimerConfig::default() {
            self.timer = other.timer;
        }
        if other.messaging != MessagingConfig::default() {
            self.messaging = other.messaging;
        }
        if other.lighthouse != LighthouseConfig::default() {
            self.lighthouse = other.lighthouse;
        }
        if !other.preferred_ranges.is_empty() {
            self.preferred_ranges = other.preferred_ranges;
        }
        if other.tun != TunConfig::default() {
            self.tun = other.tun;
        }
    }

    pub fn network_id(&self) -> NetworkId {
        self.pki.network_id.unwrap_or(DEFAULT_NETWORK_ID)
    }

    /// Primary network first, then `pki.extra_networks` in order.
    pub fn networks(&self) -> Vec<NetworkId> {
        let mut networks = vec![self.network_id()];
        for extra in &self.pki.extra_networks {
            if !networks.contains(&extra.network_id) {
                networks.push(extra.network_id);
            }
        }
        networks
    }

    /// Build the per-network key material. Fails if the primary identity
    /// is incomplete or the secret is invalid.
    pub fn cert_provider(&self) -> Result<StaticCertProvider, ConfigError> {
        let secret = self
            .pki
            .secret
            .as_deref()
            .ok_or(ConfigError::MissingField("pki.secret"))?;
        let vpn_addr = self
            .pki
            .vpn_addr
            .ok_or(ConfigError::MissingField("pki.vpn_addr"))?;
        let vpn_cidr = self
            .pki
            .vpn_cidr
            .ok_or(ConfigError::MissingField("pki.vpn_cidr"))?;
        let name = self.pki.name.clone().unwrap_or_else(|| vpn_addr.to_string());

        let primary = CertState::from_secret_hex(secret, &name, vpn_addr, self.network_id(), vpn_cidr)?;
        let mut provider = StaticCertProvider::new(primary);
        for extra in &self.pki.extra_networks {
            let state = CertState::from_secret_hex(
                secret,
                &name,
                extra.vpn_addr,
                extra.network_id,
                extra.vpn_cidr,
            )?;
            provider = provider.with_network(state);
        }
        Ok(provider)
    }

    /// Serialize this configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::CertProvider;
    use std::fs;
    use tempfile::TempDir;

    const SECRET: &str = "0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20";

    #[test]
    fn test_empty_config() {
        let config = Config::new();
        assert!(config.pki.secret.is_none());
        assert_eq!(config.network_id(), DEFAULT_NETWORK_ID);
        assert_eq!(config.listen.bind_addr(), "0.0.0.0:4242");
        assert_eq!(config.handshakes.retries, 5);
        assert_eq!(config.timer.tick_ms, 90);
        assert_eq!(config.messaging.max_attempts, 3);
        assert!(config.tun.drop_multicast);
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = format!(
            r#"
pki:
  secret: "{SECRET}"
  vpn_addr: 10.1.0.1
  network_id: 7
  vpn_cidr: 10.1.0.0/16
  name: alpha
listen:
  bind_addr: "127.0.0.1:0"
  mtu: 1400
handshakes:
  try_interval_ms: 100
  retries: 2
lighthouse:
  hosts: [10.1.0.100]
  static_host_map:
    10.1.0.100: ["203.0.113.7:4242"]
preferred_ranges: ["192.168.0.0/16"]
tun:
  unsafe_routes:
    - route: 172.16.0.0/24
      via: 10.1.0.5
"#
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(config.network_id(), 7);
        assert_eq!(config.listen.mtu(), 1400);
        assert_eq!(config.handshakes.retries, 2);
        assert_eq!(config.handshakes.trigger_buffer, 64);
        let lh: VpnAddr = "10.1.0.100".parse().unwrap();
        assert_eq!(config.lighthouse.hosts, vec![lh]);
        assert_eq!(config.lighthouse.static_host_map[&lh].len(), 1);
        assert_eq!(config.preferred_ranges.len(), 1);
        assert_eq!(config.tun.unsafe_routes[0].via, "10.1.0.5".parse().unwrap());
        assert!(config.tun.drop_local_broadcast);
    }

    #[test]
    fn test_cert_provider() {
        let mut config = Config::new();
        assert!(matches!(
            config.cert_provider(),
            Err(ConfigError::MissingField("pki.secret"))
        ));

        config.pki.secret = Some(SECRET.to_string());
        config.pki.vpn_addr = Some("10.1.0.1".parse().unwrap());
        config.pki.vpn_cidr = Some("10.1.0.0/16".parse().unwrap());
        config.pki.extra_networks.push(NetworkConfig {
            network_id: 9,
            vpn_addr: "10.9.0.1".parse().unwrap(),
            vpn_cidr: "10.9.0.0/16".parse().unwrap(),
        });

        let provider = config.cert_provider().unwrap();
        let primary = provider.cert_state(DEFAULT_NETWORK_ID).unwrap();
        assert_eq!(primary.name(), "10.1.0.1");
        assert_eq!(provider.cert_state(9).unwrap().vpn_addr().to_string(), "10.9.0.1");
    }

    #[test]
    fn test_invalid_secret_is_an_error() {
        let mut config = Config::new();
        config.pki.secret = Some("not hex".to_string());
        config.pki.vpn_addr = Some("10.1.0.1".parse().unwrap());
        config.pki.vpn_cidr = Some("10.1.0.0/16".parse().unwrap());
        assert!(matches!(config.cert_provider(), Err(ConfigError::Cert(_))));
    }

    #[test]
    fn test_merge_preserves_base_when_override_empty() {
        let mut base = Config::new();
        base.pki.secret = Some("base".to_string());
        base.handshakes.retries = 9;

        base.merge(Config::new());
        assert_eq!(base.pki.secret.as_deref(), Some("base"));
        assert_eq!(base.handshakes.retries, 9);
    }

    #[test]
    fn test_load_from_paths_merges() {
        let temp_dir = TempDir::new().unwrap();
        let low_priority = temp_dir.path().join("low.yaml");
        let high_priority = temp_dir.path().join("high.yaml");

        fs::write(
            &low_priority,
            r#"
pki:
  secret: "low"
  vpn_addr: 10.1.0.1
listen:
  mtu: 1200
"#,
        )
        .unwrap();
        fs::write(
            &high_priority,
            r#"
pki:
  secret: "high"
"#,
        )
        .unwrap();

        let paths = vec![low_priority, high_priority];
        let (config, loaded) = Config::load_from_paths(&paths).unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(config.pki.secret.as_deref(), Some("high"));
        assert_eq!(config.pki.vpn_addr, Some("10.1.0.1".parse().unwrap()));
        assert_eq!(config.listen.mtu(), 1200);
    }

    #[test]
    fn test_load_skips_missing_files() {
        let temp_dir = TempDir::new().unwrap();
        let existing = temp_dir.path().join("exists.yaml");
        let missing = temp_dir.path().join("missing.yaml");
        fs::write(&existing, "pki:\n  name: solo\n").unwrap();

        let paths = vec![missing, existing.clone()];
        let (config, loaded) = Config::load_from_paths(&paths).unwrap();

        assert_eq!(loaded, vec![existing]);
        assert_eq!(config.pki.name.as_deref(), Some("solo"));
    }

    #[test]
    fn test_load_file_reports_parse_errors() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        fs::write(&path, "listen: [not, a, map]\n").unwrap();
        assert!(matches!(
            Config::load_file(&path),
            Err(ConfigError::ParseYaml { .. })
        ));
    }

    #[test]
    fn test_search_paths_includes_expected() {
        let paths = Config::search_paths();
        assert!(paths.iter().any(|p| p.ends_with("meshtun.yaml")));
        assert!(paths
            .iter()
            .any(|p| p.starts_with("/etc/meshtun") && p.ends_with("meshtun.yaml")));
    }

    #[test]
    fn test_to_yaml_omits_unset_secret() {
        let yaml = Config::new().to_yaml().unwrap();
        assert!(yaml.contains("handshakes:"));
        assert!(!yaml.contains("secret:"));
    }
}
