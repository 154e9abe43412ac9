//! UDP broadcast discovery.
//!
//! A JSON discovery request is broadcast to the advertisement port; analyzers
//! answer with a JSON self-announcement:
//!
//! ```json
//! {"type": "discovery_response", "device_type": "logic_analyzer",
//!  "ip": "192.168.1.40", "port": 4045, "version": "LOGIC_ANALYZER_V6_5",
//!  "name": "bench-1", "serial": "E661A4", "rssi": -52}
//! ```
//!
//! Every field except the type marker is optional; the sender address and the
//! default device port fill the gaps.

use super::{identify::identify, DeviceRecord, DeviceType};
use crate::config::ScanConfiguration;
use crate::protocol::DEFAULT_DEVICE_PORT;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Port analyzers listen on for discovery requests
pub const DISCOVERY_PORT: u16 = 4046;

/// Broadcast addresses always targeted, in addition to per-interface ones
pub const DEFAULT_BROADCAST_TARGETS: [Ipv4Addr; 4] = [
    Ipv4Addr::new(255, 255, 255, 255),
    Ipv4Addr::new(192, 168, 1, 255),
    Ipv4Addr::new(192, 168, 0, 255),
    Ipv4Addr::new(10, 0, 0, 255),
];

#[derive(Debug, Serialize)]
struct DiscoveryRequest<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    service: &'a str,
    timestamp: i64,
}

#[derive(Debug, Default, Deserialize)]
struct Announcement {
    device_type: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(alias = "ip_address", alias = "ipAddress")]
    ip: Option<String>,
    port: Option<u16>,
    #[serde(alias = "firmware_version", alias = "firmwareVersion")]
    version: Option<String>,
    #[serde(alias = "device_name", alias = "deviceName")]
    name: Option<String>,
    #[serde(alias = "serial_number", alias = "serialNumber")]
    serial: Option<String>,
    #[serde(alias = "signal_strength", alias = "signalStrength")]
    rssi: Option<i32>,
}

fn is_analyzer_marker(value: &str) -> bool {
    let value = value.to_ascii_lowercase();
    value.contains("logic_analyzer")
        || value.contains("logic-analyzer")
        || value.contains("logicanalyzer")
}

/// Turn one datagram into a candidate record. Anything unexpected is ignored.
fn parse_announcement(
    datagram: &[u8],
    from: SocketAddr,
    response_time: Duration,
) -> Option<DeviceRecord> {
    let announcement: Announcement = serde_json::from_slice(datagram).ok()?;

    let marked = announcement
        .device_type
        .as_deref()
        .into_iter()
        .chain(announcement.kind.as_deref())
        .any(is_analyzer_marker);
    if !marked {
        return None;
    }

    let ip = announcement
        .ip
        .as_deref()
        .and_then(|ip| ip.parse::<Ipv4Addr>().ok())
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| from.ip().to_string());

    Some(DeviceRecord {
        ip_address: ip,
        port: announcement.port.filter(|&p| p > 0).unwrap_or(DEFAULT_DEVICE_PORT),
        firmware_version: announcement.version,
        device_name: announcement.name,
        response_time_ms: response_time.as_secs_f64() * 1000.0,
        device_type: DeviceType::LogicAnalyzer,
        serial_number: announcement.serial,
        signal_strength: announcement.rssi,
        last_seen: Utc::now(),
        is_online: true,
        capabilities: None,
    })
}

/// Sends discovery broadcasts and collects announcements.
#[derive(Debug, Clone)]
pub struct BroadcastListener {
    discovery_port: u16,
    targets: Vec<Ipv4Addr>,
}

impl Default for BroadcastListener {
    fn default() -> Self {
        Self {
            discovery_port: DISCOVERY_PORT,
            targets: DEFAULT_BROADCAST_TARGETS.to_vec(),
        }
    }
}

impl BroadcastListener {
    /// Listener with custom destination port and addresses
    pub fn with_targets(discovery_port: u16, targets: Vec<Ipv4Addr>) -> Self {
        Self {
            discovery_port,
            targets,
        }
    }

    /// Broadcast a discovery request and collect answers for `config.timeout_ms`.
    ///
    /// Never fails; socket errors end collection early and whatever arrived so
    /// far is returned. With `config.deep_scan`, candidates that do not pass the
    /// device-info handshake are dropped.
    pub async fn discover(
        &self,
        config: &ScanConfiguration,
        extra_targets: &[Ipv4Addr],
        cancel: &CancellationToken,
    ) -> Vec<DeviceRecord> {
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!("Broadcast discovery unavailable: {}", e);
                return Vec::new();
            }
        };
        if let Err(e) = socket.set_broadcast(true) {
            tracing::warn!("Failed to enable broadcast: {}", e);
        }

        let request = DiscoveryRequest {
            kind: "discovery_request",
            service: "logic_analyzer",
            timestamp: Utc::now().timestamp_millis(),
        };
        let request = match serde_json::to_vec(&request) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to encode discovery request: {}", e);
                return Vec::new();
            }
        };

        let started = Instant::now();
        let mut sent_to = HashSet::new();
        for target in self.targets.iter().chain(extra_targets) {
            if !sent_to.insert(*target) {
                continue;
            }
            if let Err(e) = socket.send_to(&request, (*target, self.discovery_port)).await {
                tracing::debug!("Discovery broadcast to {} failed: {}", target, e);
            }
        }

        let candidates = collect_announcements(&socket, config.timeout_ms, started, cancel).await;
        tracing::debug!("Broadcast discovery collected {} candidates", candidates.len());

        if !config.deep_scan || candidates.is_empty() {
            return candidates;
        }

        let verifications = candidates.into_iter().map(|candidate| async move {
            let verified = identify(&candidate.ip_address, candidate.port, config.timeout_ms).await?;
            Some(merge_announcement(verified, candidate))
        });
        tokio::select! {
            _ = cancel.cancelled() => Vec::new(),
            results = futures::future::join_all(verifications) => {
                results.into_iter().flatten().collect()
            }
        }
    }
}

async fn collect_announcements(
    socket: &UdpSocket,
    timeout_ms: u64,
    started: Instant,
    cancel: &CancellationToken,
) -> Vec<DeviceRecord> {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut found: Vec<DeviceRecord> = Vec::new();
    let mut buf = [0u8; 2048];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)) => received,
        };

        match received {
            Ok(Ok((len, from))) => {
                let Some(record) = parse_announcement(&buf[..len], from, started.elapsed()) else {
                    tracing::trace!("Ignoring datagram from {}", from);
                    continue;
                };
                if !found.iter().any(|d| d.key() == record.key()) {
                    found.push(record);
                }
            }
            Ok(Err(e)) => {
                tracing::debug!("Broadcast receive failed: {}", e);
                break;
            }
            Err(_) => break,
        }
    }

    found
}

/// Keep the handshake's facts, fill in what only the announcement knows.
fn merge_announcement(mut verified: DeviceRecord, announced: DeviceRecord) -> DeviceRecord {
    verified.response_time_ms = announced.response_time_ms;
    verified.serial_number = announced.serial_number;
    verified.signal_strength = announced.signal_strength;
    if announced.device_name.is_some() {
        verified.device_name = announced.device_name;
    }
    verified
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::handshake::tests::CANONICAL_RESPONSE;
    use crate::test_support::spawn_fake_analyzer;

    fn from() -> SocketAddr {
        "192.168.1.77:4046".parse().unwrap()
    }

    #[test]
    fn test_parse_announcement_fields() {
        let json = br#"{"device_type":"logic_analyzer","port":5000,"name":"bench","serial":"AB12","rssi":-40}"#;
        let record = parse_announcement(json, from(), Duration::from_millis(3)).unwrap();
        assert_eq!(record.ip_address, "192.168.1.77");
        assert_eq!(record.port, 5000);
        assert_eq!(record.device_name.as_deref(), Some("bench"));
        assert_eq!(record.serial_number.as_deref(), Some("AB12"));
        assert_eq!(record.signal_strength, Some(-40));
        assert_eq!(record.device_type, DeviceType::LogicAnalyzer);
    }

    #[test]
    fn test_parse_announcement_type_alias_and_defaults() {
        let json = br#"{"type":"LogicAnalyzer","ip_address":"10.0.0.9"}"#;
        let record = parse_announcement(json, from(), Duration::ZERO).unwrap();
        assert_eq!(record.ip_address, "10.0.0.9");
        assert_eq!(record.port, DEFAULT_DEVICE_PORT);
    }

    #[test]
    fn test_ignores_foreign_datagrams() {
        assert!(parse_announcement(b"not json", from(), Duration::ZERO).is_none());
        assert!(parse_announcement(br#"{"type":"printer"}"#, from(), Duration::ZERO).is_none());
        assert!(parse_announcement(br#"{"port":4045}"#, from(), Duration::ZERO).is_none());
        assert!(parse_announcement(br#"[1,2,3]"#, from(), Duration::ZERO).is_none());
    }

    /// Fake analyzer answering discovery on loopback with the given datagrams.
    async fn spawn_responder(replies: Vec<String>) -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                let request: serde_json::Value = match serde_json::from_slice(&buf[..len]) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if request["type"] != "discovery_request" {
                    continue;
                }
                for reply in &replies {
                    let _ = socket.send_to(reply.as_bytes(), from).await;
                }
            }
        });
        port
    }

    fn quick_config(deep_scan: bool) -> ScanConfiguration {
        ScanConfiguration {
            timeout_ms: 300,
            deep_scan,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_discover_collects_announcements() {
        let replies = vec![
            r#"{"device_type":"logic_analyzer","ip":"127.0.0.1","port":4045}"#.to_string(),
            r#"{"device_type":"logic_analyzer","ip":"127.0.0.1","port":4045}"#.to_string(),
            "garbage".to_string(),
            r#"{"type":"media_server","ip":"127.0.0.1","port":8200}"#.to_string(),
        ];
        let port = spawn_responder(replies).await;
        let listener = BroadcastListener::with_targets(port, vec![Ipv4Addr::LOCALHOST]);

        let found = listener
            .discover(&quick_config(false), &[], &CancellationToken::new())
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].port, 4045);
    }

    #[tokio::test]
    async fn test_deep_scan_keeps_only_verified() {
        let tcp_port = spawn_fake_analyzer(CANONICAL_RESPONSE).await;
        let closed = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let replies = vec![
            format!(r#"{{"device_type":"logic_analyzer","ip":"127.0.0.1","port":{},"serial":"S1"}}"#, tcp_port),
            format!(r#"{{"device_type":"logic_analyzer","ip":"127.0.0.1","port":{}}}"#, closed),
        ];
        let port = spawn_responder(replies).await;
        let listener = BroadcastListener::with_targets(port, vec![Ipv4Addr::LOCALHOST]);

        let found = listener
            .discover(&quick_config(true), &[], &CancellationToken::new())
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].port, tcp_port);
        assert_eq!(found[0].serial_number.as_deref(), Some("S1"));
        assert!(found[0].capabilities.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_discovery_returns_early() {
        let listener = BroadcastListener::with_targets(9, vec![Ipv4Addr::LOCALHOST]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let config = ScanConfiguration {
            timeout_ms: 10_000,
            ..Default::default()
        };
        let start = Instant::now();
        assert!(listener.discover(&config, &[], &cancel).await.is_empty());
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
