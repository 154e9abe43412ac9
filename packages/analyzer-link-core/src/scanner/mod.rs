//! Analyzer discovery on the local network.
//!
//! A scan combines:
//! - UDP broadcast discovery (analyzers announcing themselves)
//! - A TCP sweep of every address × port in the target ranges
//! - The device-info handshake to tell analyzers from other open ports
//!
//! Results land in a TTL cache owned by the [`NetworkScanner`].

pub mod broadcast;
mod cache;
pub mod identify;
pub mod interfaces;
pub mod probe;

pub use broadcast::BroadcastListener;
pub use cache::OFFLINE_TTL_SECS;
pub use identify::identify;
pub use interfaces::{InterfaceProvider, LocalNetwork, SystemInterfaces};
pub use probe::is_port_open;

use crate::config::ScanConfiguration;
use crate::error::{LinkError, Result};
use crate::protocol::{DeviceCapabilities, DeviceInfo};
use cache::DeviceCache;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// What a record is known to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Passed the device-info handshake or announced itself as an analyzer
    LogicAnalyzer,
    /// Open port found without verification (deep scan off)
    Candidate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub ip_address: String,
    pub port: u16,
    pub firmware_version: Option<String>,
    pub device_name: Option<String>,
    pub response_time_ms: f64,
    pub device_type: DeviceType,
    pub serial_number: Option<String>,
    /// RSSI in dBm, only known from broadcast announcements
    pub signal_strength: Option<i32>,
    pub last_seen: DateTime<Utc>,
    pub is_online: bool,
    pub capabilities: Option<DeviceCapabilities>,
}

impl DeviceRecord {
    /// Cache and de-duplication key
    pub fn key(&self) -> String {
        format!("{}:{}", self.ip_address, self.port)
    }

    pub(crate) fn from_handshake(host: &str, port: u16, info: DeviceInfo) -> Self {
        Self {
            ip_address: host.to_string(),
            port,
            firmware_version: Some(info.firmware_version),
            device_name: None,
            response_time_ms: 0.0,
            device_type: DeviceType::LogicAnalyzer,
            serial_number: None,
            signal_strength: None,
            last_seen: Utc::now(),
            is_online: true,
            capabilities: Some(info.capabilities),
        }
    }

    pub(crate) fn candidate(host: &str, port: u16, response_time_ms: f64) -> Self {
        Self {
            ip_address: host.to_string(),
            port,
            firmware_version: None,
            device_name: None,
            response_time_ms,
            device_type: DeviceType::Candidate,
            serial_number: None,
            signal_strength: None,
            last_seen: Utc::now(),
            is_online: true,
            capabilities: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Completed,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub devices: Vec<DeviceRecord>,
    pub scan_duration_ms: u64,
    pub ip_range_description: String,
    pub ports: Vec<u16>,
    pub status: ScanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Progress updates during a scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    pub stage: ScanStage,
    pub message: String,
    pub percent: Option<u8>,
    pub devices_found: Option<usize>,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanStage {
    Starting,
    DetectingNetwork,
    Broadcast,
    PortSweep,
    Complete,
    Failed,
}

/// Callback type for scan progress updates
pub type ProgressCallback = Box<dyn Fn(ScanProgress) + Send + Sync>;

struct ProgressReporter {
    started: Instant,
    callback: Option<ProgressCallback>,
}

impl ProgressReporter {
    fn emit(&self, stage: ScanStage, message: &str, percent: Option<u8>, devices: Option<usize>) {
        tracing::debug!("[Scan] {}", message);
        if let Some(ref callback) = self.callback {
            callback(ScanProgress {
                stage,
                message: message.to_string(),
                percent,
                devices_found: devices,
                elapsed_secs: self.started.elapsed().as_secs_f64(),
            });
        }
    }
}

/// Clears the single-flight flag however the scan ends.
struct ScanGuard<'a> {
    scanner: &'a NetworkScanner,
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        *self.scanner.lock_cancel() = None;
        self.scanner.scanning.store(false, Ordering::SeqCst);
    }
}

/// Merge duplicate `ip:port` records, keeping the first and filling its gaps.
fn deduplicate_devices(devices: Vec<DeviceRecord>) -> Vec<DeviceRecord> {
    let mut merged: Vec<DeviceRecord> = Vec::with_capacity(devices.len());

    for device in devices {
        let key = device.key();
        let Some(existing) = merged.iter_mut().find(|d| d.key() == key) else {
            merged.push(device);
            continue;
        };
        if existing.firmware_version.is_none() {
            existing.firmware_version = device.firmware_version;
        }
        if existing.device_name.is_none() {
            existing.device_name = device.device_name;
        }
        if existing.serial_number.is_none() {
            existing.serial_number = device.serial_number;
        }
        if existing.signal_strength.is_none() {
            existing.signal_strength = device.signal_strength;
        }
        if existing.capabilities.is_none() {
            existing.capabilities = device.capabilities;
        }
        if existing.device_type == DeviceType::Candidate {
            existing.device_type = device.device_type;
        }
    }

    merged
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Probe one endpoint and, for deep scans, confirm it is an analyzer.
async fn probe_endpoint(
    ip: Ipv4Addr,
    port: u16,
    config: &ScanConfiguration,
    cancel: &CancellationToken,
) -> Option<DeviceRecord> {
    if cancel.is_cancelled() {
        return None;
    }

    let host = ip.to_string();
    let started = Instant::now();
    let check = async {
        if !is_port_open(&host, port, config.timeout_ms).await {
            return None;
        }
        if !config.deep_scan {
            return Some(DeviceRecord::candidate(&host, port, elapsed_ms(started)));
        }
        let mut record = identify(&host, port, config.timeout_ms).await?;
        record.response_time_ms = elapsed_ms(started);
        Some(record)
    };

    tokio::select! {
        _ = cancel.cancelled() => None,
        found = check => found,
    }
}

/// Discovers analyzers and remembers what it found.
///
/// At most one scan runs per instance; a second concurrent call is rejected
/// with [`LinkError::ScanInProgress`].
pub struct NetworkScanner {
    scanning: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    cache: Mutex<DeviceCache>,
    interfaces: Arc<dyn InterfaceProvider>,
    broadcast: BroadcastListener,
}

impl Default for NetworkScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NetworkScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkScanner")
            .field("scanning", &self.is_scanning())
            .field("broadcast", &self.broadcast)
            .finish_non_exhaustive()
    }
}

impl NetworkScanner {
    pub fn new() -> Self {
        Self::with_interfaces(Arc::new(SystemInterfaces))
    }

    /// Scanner reading local networks from `interfaces`
    pub fn with_interfaces(interfaces: Arc<dyn InterfaceProvider>) -> Self {
        Self {
            scanning: AtomicBool::new(false),
            cancel: Mutex::new(None),
            cache: Mutex::new(DeviceCache::default()),
            interfaces,
            broadcast: BroadcastListener::default(),
        }
    }

    pub fn with_broadcast_listener(mut self, broadcast: BroadcastListener) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    fn lock_cancel(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, DeviceCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn scan_for_devices(&self, config: ScanConfiguration) -> Result<ScanResult> {
        self.scan_for_devices_with_progress(config, None).await
    }

    /// Run one scan, reporting progress through `on_progress`.
    ///
    /// Only a concurrent scan is an error. Everything else, including a
    /// failing interface lookup, is reported through [`ScanResult::status`].
    pub async fn scan_for_devices_with_progress(
        &self,
        config: ScanConfiguration,
        on_progress: Option<ProgressCallback>,
    ) -> Result<ScanResult> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("Scan requested while another scan is running");
            return Err(LinkError::ScanInProgress);
        }
        let cancel = CancellationToken::new();
        *self.lock_cancel() = Some(cancel.clone());
        let _guard = ScanGuard { scanner: self };

        let progress = ProgressReporter {
            started: Instant::now(),
            callback: on_progress,
        };
        let config = config.normalized();
        Ok(self.run_scan(&config, &cancel, &progress).await)
    }

    async fn run_scan(
        &self,
        config: &ScanConfiguration,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> ScanResult {
        progress.emit(ScanStage::Starting, "Starting analyzer scan...", Some(0), None);

        let failed = |description: String, error: LinkError| {
            tracing::error!("Scan failed: {}", error);
            progress.emit(ScanStage::Failed, &format!("Scan failed: {}", error), None, None);
            ScanResult {
                devices: Vec::new(),
                scan_duration_ms: progress.started.elapsed().as_millis() as u64,
                ip_range_description: description,
                ports: config.ports.clone(),
                status: ScanStatus::Failed,
                error: Some(error.to_string()),
            }
        };

        progress.emit(
            ScanStage::DetectingNetwork,
            "Detecting local networks...",
            Some(5),
            None,
        );
        let locals = match self.lookup_local_networks().await {
            Ok(locals) => locals,
            Err(e) if config.ip_range.is_some() => {
                tracing::warn!("Interface lookup failed, scanning explicit range only: {}", e);
                Vec::new()
            }
            Err(e) => return failed(String::new(), e),
        };
        let targets = match interfaces::resolve_targets(config.ip_range.as_deref(), &locals) {
            Ok(targets) => targets,
            Err(e) => return failed(config.ip_range.clone().unwrap_or_default(), e),
        };
        tracing::info!(
            "Scanning {} hosts on ports {:?} ({})",
            targets.hosts.len(),
            config.ports,
            targets.description
        );

        let scan_token = cancel.child_token();
        let broadcast_targets: Vec<Ipv4Addr> = locals.iter().map(|l| l.broadcast).collect();
        let broadcast = async {
            if !config.enable_broadcast {
                return Vec::new();
            }
            progress.emit(
                ScanStage::Broadcast,
                "Listening for analyzer announcements...",
                Some(10),
                None,
            );
            self.broadcast
                .discover(config, &broadcast_targets, &scan_token)
                .await
        };
        let sweep = self.sweep(&targets.hosts, config, &scan_token, progress);

        let work = futures::future::join(broadcast, sweep);
        tokio::pin!(work);
        let mut timed_out = false;
        let (announced, swept) = tokio::select! {
            found = &mut work => found,
            _ = tokio::time::sleep(Duration::from_millis(config.max_scan_duration_ms)) => {
                tracing::warn!("Scan exceeded {}ms, stopping", config.max_scan_duration_ms);
                timed_out = true;
                scan_token.cancel();
                work.await
            }
        };

        let mut devices = deduplicate_devices(swept.into_iter().chain(announced).collect());
        devices.sort_by(|a, b| a.key().cmp(&b.key()));
        if cancel.is_cancelled() {
            // Hosts the sweep never reached keep their last known state
            tracing::info!("Scan cancelled with {} devices found", devices.len());
            self.lock_cache().merge(&devices, Utc::now());
        } else {
            self.lock_cache().replace(&devices, Utc::now());
        }

        let status = if timed_out {
            ScanStatus::Timeout
        } else {
            ScanStatus::Completed
        };
        progress.emit(
            ScanStage::Complete,
            &format!("Scan complete: {} analyzers found", devices.len()),
            Some(100),
            Some(devices.len()),
        );

        ScanResult {
            devices,
            scan_duration_ms: progress.started.elapsed().as_millis() as u64,
            ip_range_description: targets.description,
            ports: config.ports.clone(),
            status,
            error: None,
        }
    }

    /// Enumerate interfaces off the async workers; the OS query blocks.
    async fn lookup_local_networks(&self) -> Result<Vec<LocalNetwork>> {
        let interfaces = self.interfaces.clone();
        tokio::task::spawn_blocking(move || interfaces.local_networks())
            .await
            .map_err(|e| LinkError::Interface(format!("interface lookup task failed: {}", e)))?
    }

    /// Sweep every host × port with at most `config.concurrency` probes in flight.
    async fn sweep(
        &self,
        hosts: &[Ipv4Addr],
        config: &ScanConfiguration,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Vec<DeviceRecord> {
        let endpoints: Vec<(Ipv4Addr, u16)> = hosts
            .iter()
            .flat_map(|ip| config.ports.iter().map(move |port| (*ip, *port)))
            .collect();
        let total = endpoints.len();

        progress.emit(
            ScanStage::PortSweep,
            &format!("Probing {} endpoints...", total),
            Some(15),
            Some(0),
        );

        let mut results = futures::stream::iter(endpoints)
            .map(|(ip, port)| probe_endpoint(ip, port, config, cancel))
            .buffer_unordered(config.concurrency);

        let mut found = Vec::new();
        let mut checked = 0usize;
        while let Some(result) = results.next().await {
            checked += 1;
            if let Some(device) = result {
                tracing::info!("Found analyzer candidate at {}", device.key());
                found.push(device);
            }
            if checked % 64 == 0 || checked == total {
                let percent = 15 + (checked * 80 / total.max(1)) as u8;
                progress.emit(
                    ScanStage::PortSweep,
                    &format!("Checked {}/{} endpoints", checked, total),
                    Some(percent),
                    Some(found.len()),
                );
            }
        }

        found
    }

    /// Cancel the running scan. Returns false when nothing was running.
    pub fn stop_scan(&self) -> bool {
        match self.lock_cancel().as_ref() {
            Some(token) => {
                tracing::info!("Scan cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Snapshot of every cached device
    pub fn get_cached_devices(&self) -> Vec<DeviceRecord> {
        self.lock_cache().all()
    }

    pub fn get_online_devices(&self) -> Vec<DeviceRecord> {
        self.lock_cache().online()
    }

    pub fn clear_cache(&self) {
        self.lock_cache().clear();
    }

    /// Re-identify one device and update its cache entry.
    pub async fn refresh_device(&self, host: &str, port: u16, timeout_ms: u64) -> Option<DeviceRecord> {
        let started = Instant::now();
        match identify(host, port, timeout_ms).await {
            Some(mut record) => {
                record.response_time_ms = elapsed_ms(started);
                self.lock_cache().upsert(record.clone());
                Some(record)
            }
            None => {
                self.lock_cache().mark_offline(&format!("{}:{}", host, port));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::handshake::tests::CANONICAL_RESPONSE;
    use crate::test_support::{spawn_fake_analyzer, spawn_silent_server};

    struct FixedInterfaces(Vec<LocalNetwork>);

    impl InterfaceProvider for FixedInterfaces {
        fn local_networks(&self) -> Result<Vec<LocalNetwork>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenInterfaces;

    impl InterfaceProvider for BrokenInterfaces {
        fn local_networks(&self) -> Result<Vec<LocalNetwork>> {
            Err(LinkError::Interface("enumeration failed".to_string()))
        }
    }

    /// Remembers which thread enumerated interfaces.
    #[derive(Default)]
    struct ThreadRecordingInterfaces(Mutex<Option<std::thread::ThreadId>>);

    impl InterfaceProvider for ThreadRecordingInterfaces {
        fn local_networks(&self) -> Result<Vec<LocalNetwork>> {
            *self.0.lock().unwrap() = Some(std::thread::current().id());
            Ok(Vec::new())
        }
    }

    fn hermetic_scanner() -> NetworkScanner {
        NetworkScanner::with_interfaces(Arc::new(FixedInterfaces(Vec::new())))
    }

    fn loopback_config(port: u16) -> ScanConfiguration {
        ScanConfiguration {
            ports: vec![port],
            ip_range: Some("127.0.0.1/32".to_string()),
            enable_broadcast: false,
            deep_scan: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_end_to_end_single_device() {
        let port = spawn_fake_analyzer(CANONICAL_RESPONSE).await;
        let scanner = hermetic_scanner();

        let result = scanner.scan_for_devices(loopback_config(port)).await.unwrap();
        assert_eq!(result.status, ScanStatus::Completed);
        assert_eq!(result.devices.len(), 1);
        let device = &result.devices[0];
        assert_eq!(device.port, port);
        assert_eq!(device.ip_address, "127.0.0.1");
        assert_eq!(device.device_type, DeviceType::LogicAnalyzer);
        assert_eq!(result.ports, vec![port]);
        assert_eq!(result.ip_range_description, "127.0.0.1/32");

        let cached = scanner.get_online_devices();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].key(), device.key());
        assert!(!scanner.is_scanning());
    }

    #[tokio::test]
    async fn test_shallow_scan_reports_candidates() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let scanner = hermetic_scanner();

        let config = ScanConfiguration {
            deep_scan: false,
            ..loopback_config(port)
        };
        let result = scanner.scan_for_devices(config).await.unwrap();
        assert_eq!(result.devices.len(), 1);
        assert_eq!(result.devices[0].device_type, DeviceType::Candidate);
    }

    #[tokio::test]
    async fn test_deep_scan_drops_non_analyzers() {
        let port = spawn_fake_analyzer("HTTP/1.1 400 Bad Request\r\n\r\n").await;
        let scanner = hermetic_scanner();
        let result = scanner.scan_for_devices(loopback_config(port)).await.unwrap();
        assert_eq!(result.status, ScanStatus::Completed);
        assert!(result.devices.is_empty());
    }

    #[tokio::test]
    async fn test_single_flight() {
        let port = spawn_silent_server().await;
        let scanner = hermetic_scanner();
        let slow = ScanConfiguration {
            timeout_ms: 500,
            ..loopback_config(port)
        };

        let (first, second) = tokio::join!(scanner.scan_for_devices(slow.clone()), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            scanner.scan_for_devices(slow.clone()).await
        });
        assert!(first.is_ok());
        assert!(matches!(second, Err(LinkError::ScanInProgress)));

        assert!(!scanner.is_scanning());
        assert!(scanner.scan_for_devices(loopback_config(port)).await.is_ok());
    }

    #[tokio::test]
    async fn test_interface_failure_reports_failed_status() {
        let scanner = NetworkScanner::with_interfaces(Arc::new(BrokenInterfaces));
        let config = ScanConfiguration {
            ip_range: None,
            enable_broadcast: false,
            ..Default::default()
        };
        let result = scanner.scan_for_devices(config).await.unwrap();
        assert_eq!(result.status, ScanStatus::Failed);
        assert!(result.devices.is_empty());
        assert!(result.error.unwrap().contains("enumeration failed"));
        assert!(!scanner.is_scanning());
    }

    #[tokio::test]
    async fn test_interface_lookup_runs_off_the_runtime_thread() {
        let interfaces = Arc::new(ThreadRecordingInterfaces::default());
        let scanner = NetworkScanner::with_interfaces(interfaces.clone());
        let port = spawn_fake_analyzer(CANONICAL_RESPONSE).await;

        let result = scanner.scan_for_devices(loopback_config(port)).await.unwrap();
        assert_eq!(result.devices.len(), 1);
        let lookup_thread = interfaces.0.lock().unwrap().expect("interfaces were queried");
        assert_ne!(lookup_thread, std::thread::current().id());
    }

    #[tokio::test]
    async fn test_invalid_range_reports_failed_status() {
        let scanner = hermetic_scanner();
        let config = ScanConfiguration {
            ip_range: Some("not-an-ip".to_string()),
            ..loopback_config(4045)
        };
        let result = scanner.scan_for_devices(config).await.unwrap();
        assert_eq!(result.status, ScanStatus::Failed);
        assert!(!scanner.is_scanning());
    }

    #[tokio::test]
    async fn test_stop_scan_returns_partial_result() {
        let port = spawn_silent_server().await;
        let scanner = hermetic_scanner();
        let config = ScanConfiguration {
            timeout_ms: 10_000,
            ..loopback_config(port)
        };

        assert!(!scanner.stop_scan());
        let start = Instant::now();
        let (result, stopped) = tokio::join!(scanner.scan_for_devices(config), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            scanner.stop_scan()
        });
        assert!(stopped);
        let result = result.unwrap();
        assert_eq!(result.status, ScanStatus::Completed);
        assert!(result.devices.is_empty());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stopped_scan_keeps_unreached_devices_online() {
        let port = spawn_silent_server().await;
        let scanner = hermetic_scanner();
        scanner
            .lock_cache()
            .replace(&[DeviceRecord::candidate("10.0.0.9", 4045, 1.0)], Utc::now());
        let config = ScanConfiguration {
            timeout_ms: 10_000,
            ..loopback_config(port)
        };

        let (result, stopped) = tokio::join!(scanner.scan_for_devices(config), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            scanner.stop_scan()
        });
        assert!(stopped);
        assert_eq!(result.unwrap().status, ScanStatus::Completed);

        let online = scanner.get_online_devices();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].key(), "10.0.0.9:4045");
    }

    #[tokio::test]
    async fn test_scan_deadline_yields_timeout() {
        let port = spawn_silent_server().await;
        let scanner = hermetic_scanner();
        let config = ScanConfiguration {
            timeout_ms: 10_000,
            max_scan_duration_ms: 200,
            ..loopback_config(port)
        };

        let start = Instant::now();
        let result = scanner.scan_for_devices(config).await.unwrap();
        assert_eq!(result.status, ScanStatus::Timeout);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_progress_stages() {
        let port = spawn_fake_analyzer(CANONICAL_RESPONSE).await;
        let scanner = hermetic_scanner();
        let stages = Arc::new(Mutex::new(Vec::new()));
        let seen = stages.clone();

        scanner
            .scan_for_devices_with_progress(
                loopback_config(port),
                Some(Box::new(move |p: ScanProgress| seen.lock().unwrap().push(p.stage))),
            )
            .await
            .unwrap();

        let stages = stages.lock().unwrap();
        assert_eq!(stages.first(), Some(&ScanStage::Starting));
        assert_eq!(stages.last(), Some(&ScanStage::Complete));
        assert!(stages.contains(&ScanStage::PortSweep));
        assert!(!stages.contains(&ScanStage::Broadcast));
    }

    #[tokio::test]
    async fn test_refresh_device_updates_cache() {
        let port = spawn_fake_analyzer(CANONICAL_RESPONSE).await;
        let scanner = hermetic_scanner();
        scanner.scan_for_devices(loopback_config(port)).await.unwrap();

        let refreshed = scanner.refresh_device("127.0.0.1", port, 1000).await;
        assert!(refreshed.is_some());

        let closed = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        assert!(scanner.refresh_device("127.0.0.1", closed, 300).await.is_none());
        assert_eq!(scanner.get_online_devices().len(), 1);

        scanner.clear_cache();
        assert!(scanner.get_cached_devices().is_empty());
    }

    #[test]
    fn test_deduplicate_fills_gaps() {
        let swept = DeviceRecord::candidate("10.0.0.1", 4045, 3.0);
        let mut announced = DeviceRecord::candidate("10.0.0.1", 4045, 9.0);
        announced.serial_number = Some("S1".to_string());
        announced.device_type = DeviceType::LogicAnalyzer;
        let other = DeviceRecord::candidate("10.0.0.2", 4045, 1.0);

        let merged = deduplicate_devices(vec![swept, announced, other]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].response_time_ms, 3.0);
        assert_eq!(merged[0].serial_number.as_deref(), Some("S1"));
        assert_eq!(merged[0].device_type, DeviceType::LogicAnalyzer);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let json = serde_json::to_value(DeviceRecord::candidate("10.0.0.1", 4045, 1.5)).unwrap();
        assert_eq!(json["ipAddress"], "10.0.0.1");
        assert_eq!(json["deviceType"], "candidate");
        assert_eq!(json["isOnline"], true);
        assert!(json.get("lastSeen").is_some());
    }
}
