//! Application configuration
//!
//! Stored as TOML. Every section has defaults so a missing or partial
//! file works; the username and device selection are written back when
//! changed through the control API.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{DeviceSelection, Volumes};
use crate::constants::*;
use crate::discovery::DiscoveryOptions;
use crate::error::{Error, Result};
use crate::signaling::ControlOptions;

/// Full application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub identity: IdentityConfig,
    pub discovery: DiscoveryConfig,
    pub control: ControlConfig,
    pub audio: AudioConfig,
    pub api: ApiConfig,
}

/// Who we are on the network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Stable peer id; generated on first run when absent
    pub id: Option<String>,
    pub display_name: String,
    /// Name shown to other peers; falls back to `display_name`
    pub username: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            id: None,
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            username: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub broadcast_port: u16,
    pub beacon_interval_ms: u64,
    pub peer_ttl_secs: u64,
    pub prune_after_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_port: DEFAULT_BROADCAST_PORT,
            beacon_interval_ms: DEFAULT_BEACON_INTERVAL.as_millis() as u64,
            peer_ttl_secs: DEFAULT_PEER_TTL.as_secs(),
            prune_after_secs: DEFAULT_PRUNE_AFTER.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub port: u16,
    pub call_timeout_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_CONTROL_PORT,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT.as_secs(),
        }
    }
}

/// Device ids as reported by `GET /devices`; `None` is the host default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub input_volume: u8,
    pub output_volume: u8,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            input_volume: 100,
            output_volume: 100,
        }
    }
}

/// Local HTTP control surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: Ipv4Addr,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: Ipv4Addr::LOCALHOST,
            port: DEFAULT_API_PORT,
        }
    }
}

impl AppConfig {
    /// Platform config file location
    pub fn default_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("net", "lan-voice", "lan-voice")
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(Error::Config(format!("{}: {}", path.display(), e))),
        }
    }

    /// Write to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Generate a peer id if none is set; returns whether one was generated
    pub fn ensure_identity(&mut self) -> bool {
        if self.identity.id.as_deref().map_or(false, |id| !id.trim().is_empty()) {
            return false;
        }
        self.identity.id = Some(uuid::Uuid::new_v4().to_string());
        true
    }

    pub fn peer_id(&self) -> String {
        self.identity.id.clone().unwrap_or_default()
    }

    pub fn username(&self) -> String {
        self.identity
            .username
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| self.identity.display_name.clone())
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        let mut options = DiscoveryOptions::new(self.peer_id());
        options.display_name = self.identity.display_name.clone();
        options.username = Some(self.username());
        options.broadcast_port = self.discovery.broadcast_port;
        options.control_port = self.control.port;
        options.beacon_interval = Duration::from_millis(self.discovery.beacon_interval_ms.max(1));
        options.peer_ttl = Duration::from_secs(self.discovery.peer_ttl_secs);
        // Never delete a peer that could still be listed
        options.prune_after = Duration::from_secs(
            self.discovery.prune_after_secs.max(self.discovery.peer_ttl_secs),
        );
        options
    }

    pub fn control_options(&self) -> ControlOptions {
        ControlOptions {
            port: self.control.port,
            ..ControlOptions::default()
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.control.call_timeout_secs)
    }

    pub fn devices(&self) -> DeviceSelection {
        DeviceSelection::new(self.audio.input_device.clone(), self.audio.output_device.clone())
    }

    pub fn volumes(&self) -> Volumes {
        Volumes::new(self.audio.input_volume.into(), self.audio.output_volume.into())
    }

    pub fn api_address(&self) -> SocketAddr {
        SocketAddr::from((self.api.bind_address, self.api.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.discovery.broadcast_port, 37020);
        assert_eq!(config.control.port, 38020);
        assert_eq!(config.identity.display_name, "Concord");
        assert_eq!(config.username(), "Concord");
        assert_eq!(config.api_address().to_string(), "127.0.0.1:5001");
        assert_eq!(config.volumes(), Volumes::default());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [identity]
            username = "alice"

            [control]
            port = 40000
        "#,
        )
        .unwrap();
        assert_eq!(config.username(), "alice");
        assert_eq!(config.control.port, 40000);
        assert_eq!(config.control.call_timeout_secs, 10);
        assert_eq!(config.discovery.peer_ttl_secs, 15);
        assert_eq!(config.discovery_options().control_port, 40000);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[control]\nport = \"not a port\"\n").unwrap();
        assert!(matches!(AppConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_then_load_preserves_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        assert!(config.ensure_identity());
        assert!(!config.ensure_identity());
        config.identity.username = Some("bob".into());
        config.audio.output_device = Some("output:Speakers".into());
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.devices().output.as_deref(), Some("output:Speakers"));
    }

    #[test]
    fn test_prune_never_below_ttl() {
        let mut config = AppConfig::default();
        config.discovery.peer_ttl_secs = 60;
        config.discovery.prune_after_secs = 10;
        let options = config.discovery_options();
        assert_eq!(options.prune_after, Duration::from_secs(60));
    }
}
