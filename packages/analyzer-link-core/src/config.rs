//! Scan and connection configuration.
//!
//! Values resolve with priority:
//! 1. Environment variables (`ANALYZER_LINK_DEVICE_PORT`, `ANALYZER_LINK_SCAN_TIMEOUT_MS`)
//! 2. Config file (`~/.config/analyzer-link/config.toml`)
//! 3. Built-in defaults

use crate::protocol::DEFAULT_DEVICE_PORT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the device port to sweep
const ENV_DEVICE_PORT: &str = "ANALYZER_LINK_DEVICE_PORT";

/// Environment variable overriding the per-probe scan timeout
const ENV_SCAN_TIMEOUT_MS: &str = "ANALYZER_LINK_SCAN_TIMEOUT_MS";

/// Options for one `scan_for_devices` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanConfiguration {
    /// Per-probe / per-identification timeout
    pub timeout_ms: u64,
    /// Upper bound on simultaneous probes
    pub concurrency: usize,
    pub ports: Vec<u16>,
    /// CIDR, single address or `a.b.c.x-y`; local /24s when absent
    pub ip_range: Option<String>,
    /// Verify open ports with the device-info handshake
    pub deep_scan: bool,
    pub enable_broadcast: bool,
    /// Whole-scan deadline; exceeding it yields `status = timeout`
    pub max_scan_duration_ms: u64,
}

impl Default for ScanConfiguration {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            concurrency: 50,
            ports: vec![DEFAULT_DEVICE_PORT],
            ip_range: None,
            deep_scan: true,
            enable_broadcast: true,
            max_scan_duration_ms: 300_000,
        }
    }
}

/// Partial scan options, as found in the `[scan]` table of the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ScanOverrides {
    pub timeout_ms: Option<u64>,
    pub concurrency: Option<usize>,
    pub ports: Option<Vec<u16>>,
    pub ip_range: Option<String>,
    pub deep_scan: Option<bool>,
    pub enable_broadcast: Option<bool>,
    pub max_scan_duration_ms: Option<u64>,
}

impl ScanConfiguration {
    /// Copy of `self` with every `Some` override applied.
    pub fn merged(&self, overrides: &ScanOverrides) -> Self {
        let mut merged = self.clone();
        if let Some(v) = overrides.timeout_ms {
            merged.timeout_ms = v;
        }
        if let Some(v) = overrides.concurrency {
            merged.concurrency = v;
        }
        if let Some(ref v) = overrides.ports {
            merged.ports = v.clone();
        }
        if overrides.ip_range.is_some() {
            merged.ip_range = overrides.ip_range.clone();
        }
        if let Some(v) = overrides.deep_scan {
            merged.deep_scan = v;
        }
        if let Some(v) = overrides.enable_broadcast {
            merged.enable_broadcast = v;
        }
        if let Some(v) = overrides.max_scan_duration_ms {
            merged.max_scan_duration_ms = v;
        }
        merged
    }

    /// Clamp values that would stall or disable the sweep.
    pub(crate) fn normalized(mut self) -> Self {
        self.concurrency = self.concurrency.max(1);
        self.timeout_ms = self.timeout_ms.max(1);
        if self.ports.is_empty() {
            self.ports.push(DEFAULT_DEVICE_PORT);
        }
        self
    }
}

/// Connection manager tuning. Mutable at runtime via `set_configuration`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    pub heartbeat_interval_ms: u64,
    pub connection_timeout_ms: u64,
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `n * retry_interval_ms`
    pub retry_interval_ms: u64,
    pub quality_check_interval_ms: u64,
    pub auto_reconnect: bool,
    /// Disable Nagle and enable TCP keep-alive on connect
    pub enable_optimization: bool,
    /// Read buffer size for the receive loop
    pub buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5000,
            connection_timeout_ms: 5000,
            max_retries: 5,
            retry_interval_ms: 2000,
            quality_check_interval_ms: 10_000,
            auto_reconnect: true,
            enable_optimization: true,
            buffer_size: 65_536,
        }
    }
}

/// Partial connection settings (`[connection]` table, or a runtime update).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfigUpdate {
    pub heartbeat_interval_ms: Option<u64>,
    pub connection_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_interval_ms: Option<u64>,
    pub quality_check_interval_ms: Option<u64>,
    pub auto_reconnect: Option<bool>,
    pub enable_optimization: Option<bool>,
    pub buffer_size: Option<usize>,
}

impl ConnectionConfig {
    /// Apply `update`; returns true when a timer interval changed.
    pub fn apply(&mut self, update: &ConnectionConfigUpdate) -> bool {
        let before = (self.heartbeat_interval_ms, self.quality_check_interval_ms);

        if let Some(v) = update.heartbeat_interval_ms {
            self.heartbeat_interval_ms = v.max(1);
        }
        if let Some(v) = update.connection_timeout_ms {
            self.connection_timeout_ms = v.max(1);
        }
        if let Some(v) = update.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = update.retry_interval_ms {
            self.retry_interval_ms = v;
        }
        if let Some(v) = update.quality_check_interval_ms {
            self.quality_check_interval_ms = v.max(1);
        }
        if let Some(v) = update.auto_reconnect {
            self.auto_reconnect = v;
        }
        if let Some(v) = update.enable_optimization {
            self.enable_optimization = v;
        }
        if let Some(v) = update.buffer_size {
            self.buffer_size = v.max(1);
        }

        before != (self.heartbeat_interval_ms, self.quality_check_interval_ms)
    }
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    scan: Option<ScanOverrides>,
    connection: Option<ConnectionConfigUpdate>,
}

/// Where the effective configuration came from
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    /// Using default hardcoded values
    Default,
    /// At least one value came from an environment variable
    Environment,
    /// Loaded from config file
    ConfigFile,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::ConfigFile => write!(f, "config file"),
        }
    }
}

/// Effective runtime configuration
#[derive(Debug, Clone)]
pub struct Settings {
    pub scan: ScanConfiguration,
    pub connection: ConnectionConfig,
    pub source: ConfigSource,
}

/// Get the path to the configuration file
fn get_config_file_path() -> Option<PathBuf> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("analyzer-link").join("config.toml"))
}

/// Load configuration from the config file
fn load_config_file(path: &Path) -> Option<ConfigFile> {
    if !path.exists() {
        return None;
    }

    match fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::debug!("Loaded config from {:?}", path);
                Some(config)
            }
            Err(e) => {
                tracing::warn!("Failed to parse config file {:?}: {}", path, e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read config file {:?}: {}", path, e);
            None
        }
    }
}

/// Load settings from the process environment and the default config path.
pub fn load_settings() -> Settings {
    load_settings_from(get_config_file_path().as_deref(), |key| {
        std::env::var(key).ok()
    })
}

/// Load settings from an explicit file and environment lookup.
pub fn load_settings_from(
    config_path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings {
        scan: ScanConfiguration::default(),
        connection: ConnectionConfig::default(),
        source: ConfigSource::Default,
    };

    if let Some(file) = config_path.and_then(load_config_file) {
        if let Some(ref scan) = file.scan {
            settings.scan = settings.scan.merged(scan);
        }
        if let Some(ref connection) = file.connection {
            settings.connection.apply(connection);
        }
        settings.source = ConfigSource::ConfigFile;
    }

    if let Some(port) = env(ENV_DEVICE_PORT).and_then(|v| v.trim().parse::<u16>().ok()) {
        if port > 0 {
            tracing::info!("Using device port from environment variable: {}", port);
            settings.scan.ports = vec![port];
            settings.source = ConfigSource::Environment;
        }
    }

    if let Some(ms) = env(ENV_SCAN_TIMEOUT_MS).and_then(|v| v.trim().parse::<u64>().ok()) {
        tracing::info!("Using scan timeout from environment variable: {}ms", ms);
        settings.scan.timeout_ms = ms;
        settings.source = ConfigSource::Environment;
    }

    settings
}

/// Get the path to the config file for documentation purposes
pub fn get_config_file_path_string() -> String {
    get_config_file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "~/.config/analyzer-link/config.toml".to_string())
}

/// Generate example config file content
pub fn generate_example_config() -> String {
    r#"# Analyzer Link Configuration
# Place this file at: ~/.config/analyzer-link/config.toml

[scan]
# timeout_ms = 1000
# concurrency = 50
# ports = [4045]
# ip_range = "192.168.1.0/24"
# deep_scan = true
# enable_broadcast = true

[connection]
# heartbeat_interval_ms = 5000
# connection_timeout_ms = 5000
# max_retries = 5
# retry_interval_ms = 2000
# quality_check_interval_ms = 10000
# auto_reconnect = true
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn write_temp_config(name: &str, content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "analyzer-link-config-{}-{}",
            name,
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_sources() {
        let settings = load_settings_from(None, |_| None);
        assert_eq!(settings.source, ConfigSource::Default);
        assert_eq!(settings.scan, ScanConfiguration::default());
        assert_eq!(settings.connection, ConnectionConfig::default());
        assert_eq!(settings.scan.ports, vec![4045]);
    }

    #[test]
    fn test_file_then_env_priority() {
        let path = write_temp_config(
            "priority",
            "[scan]\nports = [5000, 5001]\nconcurrency = 8\n\n[connection]\nmax_retries = 2\n",
        );

        let settings = load_settings_from(Some(&path), |_| None);
        assert_eq!(settings.source, ConfigSource::ConfigFile);
        assert_eq!(settings.scan.ports, vec![5000, 5001]);
        assert_eq!(settings.scan.concurrency, 8);
        assert_eq!(settings.connection.max_retries, 2);
        assert!(settings.scan.deep_scan);

        let env: HashMap<&str, &str> = [(ENV_DEVICE_PORT, "4100")].into_iter().collect();
        let settings = load_settings_from(Some(&path), |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(settings.source, ConfigSource::Environment);
        assert_eq!(settings.scan.ports, vec![4100]);
        assert_eq!(settings.scan.concurrency, 8);
    }

    #[test]
    fn test_broken_file_falls_back() {
        let path = write_temp_config("broken", "[scan\nports = nope");
        let settings = load_settings_from(Some(&path), |_| None);
        assert_eq!(settings.source, ConfigSource::Default);
    }

    #[test]
    fn test_connection_update_reports_timer_change() {
        let mut config = ConnectionConfig::default();
        assert!(!config.apply(&ConnectionConfigUpdate {
            max_retries: Some(1),
            ..Default::default()
        }));
        assert_eq!(config.max_retries, 1);
        assert!(config.apply(&ConnectionConfigUpdate {
            heartbeat_interval_ms: Some(250),
            ..Default::default()
        }));
    }

    #[test]
    fn test_scan_normalization() {
        let config = ScanConfiguration {
            concurrency: 0,
            ports: Vec::new(),
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.ports, vec![DEFAULT_DEVICE_PORT]);
    }
}
