//! Host-facing facade over the scanner, connection manager and event bus.

use crate::config::{ConnectionConfigUpdate, ScanConfiguration, ScanOverrides, Settings};
use crate::connection::{ConnectionManager, ConnectionQuality, ConnectionState, DiagnosticResult};
use crate::error::{LinkError, Result};
use crate::events::{EventBus, NetworkEvent, SubscriptionId};
use crate::protocol::{WifiSettings, DEFAULT_DEVICE_PORT};
use crate::scanner::{DeviceRecord, NetworkScanner, ProgressCallback, ScanResult};
use std::net::Ipv6Addr;
use std::sync::Arc;

/// Split `host:port` into its parts.
///
/// A bare host gets the default device port. IPv6 hosts are written bare
/// (`::1`) or bracketed when a port follows (`[::1]:4045`). Empty hosts and
/// ports outside 1-65535 are rejected.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let endpoint = endpoint.trim();
    let invalid = |why: &str| LinkError::InvalidAddress(format!("{:?}: {}", endpoint, why));

    let (host, port) = if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| invalid("missing closing bracket"))?;
        if host.parse::<Ipv6Addr>().is_err() {
            return Err(invalid("bracketed host is not an IPv6 address"));
        }
        match after {
            "" => (host, None),
            _ => {
                let port = after
                    .strip_prefix(':')
                    .ok_or_else(|| invalid("expected ':' after ']'"))?;
                (host, Some(port))
            }
        }
    } else if endpoint.parse::<Ipv6Addr>().is_ok() {
        (endpoint, None)
    } else {
        match endpoint.rsplit_once(':') {
            Some((host, port)) => (host.trim(), Some(port)),
            None => (endpoint, None),
        }
    };

    if host.is_empty() {
        return Err(invalid("host is empty"));
    }
    if host.contains(':') && host.parse::<Ipv6Addr>().is_err() {
        return Err(invalid("host contains ':'; bracket IPv6 addresses"));
    }
    let port = match port {
        Some(port) => port
            .trim()
            .parse::<u32>()
            .map_err(|_| invalid("port is not a number"))?,
        None => u32::from(DEFAULT_DEVICE_PORT),
    };
    let port = u16::try_from(port)
        .ok()
        .filter(|&p| p > 0)
        .ok_or_else(|| invalid("port must be within 1-65535"))?;

    Ok((host.to_string(), port))
}

/// One scanner, one connection manager and their shared event bus.
#[derive(Debug)]
pub struct AnalyzerLink {
    scanner: NetworkScanner,
    connection: ConnectionManager,
    events: Arc<EventBus>,
    scan_defaults: ScanConfiguration,
}

impl AnalyzerLink {
    pub fn new(settings: &Settings) -> Self {
        let events = Arc::new(EventBus::new());
        Self {
            scanner: NetworkScanner::new(),
            connection: ConnectionManager::new(settings.connection.clone(), events.clone()),
            events,
            scan_defaults: settings.scan.clone(),
        }
    }

    /// Assemble from explicit parts; the connection manager's event bus is shared.
    pub fn from_parts(
        scanner: NetworkScanner,
        connection: ConnectionManager,
        scan_defaults: ScanConfiguration,
    ) -> Self {
        let events = connection.events().clone();
        Self {
            scanner,
            connection,
            events,
            scan_defaults,
        }
    }

    pub fn scanner(&self) -> &NetworkScanner {
        &self.scanner
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn scan_defaults(&self) -> &ScanConfiguration {
        &self.scan_defaults
    }

    /// Scan with `overrides` applied on top of the configured defaults.
    pub async fn scan_for_devices(&self, overrides: &ScanOverrides) -> Result<ScanResult> {
        self.scan_for_devices_with_progress(overrides, None).await
    }

    pub async fn scan_for_devices_with_progress(
        &self,
        overrides: &ScanOverrides,
        on_progress: Option<ProgressCallback>,
    ) -> Result<ScanResult> {
        let config = self.scan_defaults.merged(overrides);
        self.scanner
            .scan_for_devices_with_progress(config, on_progress)
            .await
    }

    pub fn stop_scan(&self) -> bool {
        self.scanner.stop_scan()
    }

    pub fn get_cached_devices(&self) -> Vec<DeviceRecord> {
        self.scanner.get_cached_devices()
    }

    pub fn get_online_devices(&self) -> Vec<DeviceRecord> {
        self.scanner.get_online_devices()
    }

    pub fn clear_cache(&self) {
        self.scanner.clear_cache();
    }

    pub async fn refresh_device(&self, host: &str, port: u16) -> Option<DeviceRecord> {
        self.scanner
            .refresh_device(host, port, self.scan_defaults.timeout_ms)
            .await
    }

    pub async fn connect(&self, host: &str, port: u16) -> Result<()> {
        self.connection.connect(host, port).await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub async fn send_data(&self, data: &[u8]) -> Result<()> {
        self.connection.send_data(data).await
    }

    pub async fn provision_wifi(&self, settings: &WifiSettings) -> Result<()> {
        self.connection.provision_wifi(settings).await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn get_connection_quality(&self) -> ConnectionQuality {
        self.connection.get_connection_quality()
    }

    pub fn get_network_events(&self, limit: usize) -> Vec<NetworkEvent> {
        self.events.get_events(limit)
    }

    pub fn subscribe(&self, callback: impl Fn(&NetworkEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.events.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub async fn run_diagnostics(&self, host: &str, port: u32) -> Vec<DiagnosticResult> {
        self.connection.run_diagnostics(host, port).await
    }

    pub fn set_configuration(&self, update: &ConnectionConfigUpdate) {
        self.connection.set_configuration(update);
    }

    pub async fn force_reconnect(&self, host: &str, port: u16) -> Result<()> {
        self.connection.force_reconnect(host, port).await
    }
}
