//! TOML-based configuration persistence for the host application.
//!
//! Reads and writes `AppConfig` to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\MaixLink\config.toml`
//! - Linux:    `~/.config/maixlink/config.toml`
//! - macOS:    `~/Library/Application Support/MaixLink/config.toml`
//!
//! # What is TOML? (for beginners)
//!
//! TOML is a configuration file format designed to be easy to read and write.
//! A typical MaixLink file looks like:
//!
//! ```toml
//! [link]
//! heartbeat_timeout_secs = 10
//!
//! [discovery]
//! prefix = "maixcam"
//!
//! [[devices]]
//! name = "bench-cam"
//! ip = "192.168.1.20"
//! ```
//!
//! # Serde default values
//!
//! Every field carries a `#[serde(default = "...")]` and every section a
//! `#[serde(default)]`, so an empty file, a missing file, or a file written by
//! an older version all load into a complete `AppConfig`.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use maix_core::protocol::messages::{DEFAULT_CLIENT_TOKEN, DEVICE_PORT};
use maix_frame_hub::FrameHubConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::network::discovery::{DiscoverySettings, DEFAULT_PREFIX, DEFAULT_SERVICE};
use crate::infrastructure::network::link::LinkSettings;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level application configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub frame_hub: FrameHubSection,
    /// Devices to connect to without waiting for discovery.
    #[serde(default)]
    pub devices: Vec<KnownDevice>,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Schema version string – bump when breaking changes are introduced.
    #[serde(default = "default_version")]
    pub version: String,
    /// `tracing` log level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Device link settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkConfig {
    /// WebSocket port on the device.
    #[serde(default = "default_device_port")]
    pub port: u16,
    /// Token sent in the `Auth` frame.
    #[serde(default = "default_client_token")]
    pub client_token: String,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
}

/// mDNS discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Only instances whose name starts with this are reported.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_stale_timeout_ms")]
    pub stale_timeout_ms: u64,
}

/// Frame hub HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameHubSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// IP address to bind to.  `"0.0.0.0"` serves every interface.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_frame_hub_port")]
    pub port: u16,
}

/// A device the user has connected to before.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnownDevice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub ip: String,
    /// Connect on startup of `serve`.
    #[serde(default)]
    pub auto_connect: bool,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_version() -> String {
    "1.0".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_device_port() -> u16 {
    DEVICE_PORT
}
fn default_client_token() -> String {
    DEFAULT_CLIENT_TOKEN.to_string()
}
fn default_heartbeat_timeout_secs() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}
fn default_interval_ms() -> u64 {
    1000
}
fn default_stale_timeout_ms() -> u64 {
    4000
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_frame_hub_port() -> u16 {
    maix_frame_hub::domain::config::DEFAULT_PORT
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            log_level: default_log_level(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: default_device_port(),
            client_token: default_client_token(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            prefix: default_prefix(),
            interval_ms: default_interval_ms(),
            stale_timeout_ms: default_stale_timeout_ms(),
        }
    }
}

impl Default for FrameHubSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            bind_address: default_bind_address(),
            port: default_frame_hub_port(),
        }
    }
}

// ── Conversions into runtime settings ─────────────────────────────────────────

impl LinkConfig {
    pub fn settings(&self) -> LinkSettings {
        LinkSettings {
            port: self.port,
            client_token: self.client_token.clone(),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
        }
    }
}

impl DiscoveryConfig {
    pub fn settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            prefix: self.prefix.clone(),
            service: DEFAULT_SERVICE.to_string(),
            interval: Duration::from_millis(self.interval_ms),
            stale_timeout: Duration::from_millis(self.stale_timeout_ms),
        }
    }
}

impl FrameHubSection {
    /// Builds the frame hub config.  An unparsable bind address falls back to
    /// all interfaces.
    pub fn settings(&self) -> FrameHubConfig {
        let ip = self
            .bind_address
            .parse::<IpAddr>()
            .unwrap_or_else(|_| {
                tracing::warn!(
                    "invalid frame hub bind address {:?}; using 0.0.0.0",
                    self.bind_address
                );
                IpAddr::from([0, 0, 0, 0])
            });
        FrameHubConfig {
            bind_addr: SocketAddr::new(ip, self.port),
            ..FrameHubConfig::default()
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads `AppConfig` from the platform config file, returning
/// `AppConfig::default()` if the file does not yet exist.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads `AppConfig` from `path`, returning the defaults if it does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persists `config` to the platform config file.
///
/// # Errors
///
/// See [`save_config_to`].
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    save_config_to(config, &config_file_path()?)
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config base directory including the `MaixLink`
/// subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("MaixLink"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("maixlink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("MaixLink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_defaults_match_device_protocol() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.link.port, 7899);
        assert_eq!(cfg.link.client_token, "maixvision");
        assert_eq!(cfg.link.heartbeat_timeout_secs, 10);
        assert_eq!(cfg.discovery.prefix, "maixcam");
        assert_eq!(cfg.discovery.interval_ms, 1000);
        assert_eq!(cfg.discovery.stale_timeout_ms, 4000);
        assert_eq!(cfg.frame_hub.port, 9090);
        assert_eq!(cfg.general.log_level, "info");
        assert!(cfg.devices.is_empty());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        // Arrange
        let toml_str = r#"
[link]
heartbeat_timeout_secs = 3

[[devices]]
ip = "192.168.1.20"
"#;

        // Act
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.link.heartbeat_timeout_secs, 3);
        assert_eq!(cfg.link.port, 7899);
        assert_eq!(cfg.devices.len(), 1);
        assert_eq!(cfg.devices[0].name, None);
        assert!(!cfg.devices[0].auto_connect);
    }

    #[test]
    fn test_invalid_toml_returns_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[[[ not valid toml").unwrap();

        let result = load_config_from(&path);

        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_save_then_load_round_trip_creates_directories() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut cfg = AppConfig::default();
        cfg.general.log_level = "debug".to_string();
        cfg.devices.push(KnownDevice {
            name: Some("bench-cam".to_string()),
            ip: "10.0.0.7".to_string(),
            auto_connect: true,
        });

        // Act
        save_config_to(&cfg, &path).unwrap();
        let loaded = load_config_from(&path).unwrap();

        // Assert
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn test_settings_conversions() {
        let mut cfg = AppConfig::default();
        cfg.link.heartbeat_timeout_secs = 2;
        cfg.discovery.interval_ms = 250;
        cfg.frame_hub.bind_address = "127.0.0.1".to_string();
        cfg.frame_hub.port = 0;

        assert_eq!(cfg.link.settings().heartbeat_timeout, Duration::from_secs(2));
        assert_eq!(cfg.discovery.settings().interval, Duration::from_millis(250));
        assert_eq!(cfg.discovery.settings().service, "_ssh._tcp.local");
        assert_eq!(
            cfg.frame_hub.settings().bind_addr,
            "127.0.0.1:0".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_bad_bind_address_falls_back_to_all_interfaces() {
        let mut section = FrameHubSection::default();
        section.bind_address = "not-an-ip".to_string();
        assert!(section.settings().bind_addr.ip().is_unspecified());
    }

    #[test]
    fn test_config_file_path_ends_with_config_toml() {
        if let Ok(path) = config_file_path() {
            assert!(path.ends_with("config.toml"), "got {path:?}");
        }
    }
}
