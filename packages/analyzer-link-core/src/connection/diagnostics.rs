//! Connection diagnostics.
//!
//! Every run checks reachability, connect latency and the address itself.
//! With a live connection it also measures throughput and heartbeat stability
//! and writes a test pattern. Each test passes or fails on its own; a run
//! always returns the full list.

use super::ConnectionManager;
use crate::protocol::DEFAULT_DEVICE_PORT;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;

const LATENCY_ROUNDS: usize = 5;
const LATENCY_PASS_MS: f64 = 500.0;
const LATENCY_GOOD_MS: f64 = 100.0;

const THROUGHPUT_WRITES: usize = 10;
const THROUGHPUT_CHUNK: usize = 1024;

const STABILITY_PROBES: usize = 10;
const STABILITY_SPACING: Duration = Duration::from_millis(100);
const STABILITY_PASS_RATE: f64 = 90.0;

const INTEGRITY_PATTERN_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticResult {
    pub test_name: String,
    pub passed: bool,
    pub details: String,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
}

impl DiagnosticResult {
    fn new(test_name: &str, passed: bool, details: String, started: Instant, severity: Severity) -> Self {
        Self {
            test_name: test_name.to_string(),
            passed,
            details,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            timestamp: Utc::now(),
            severity,
        }
    }
}

/// Run every applicable test against `host:port`.
pub async fn run_diagnostics(manager: &ConnectionManager, host: &str, port: u32) -> Vec<DiagnosticResult> {
    tracing::info!("Running diagnostics for {}:{}", host, port);
    let timeout_ms = manager.get_configuration().connection_timeout_ms;

    let mut results = vec![
        connection_test(host, port, timeout_ms).await,
        latency_test(host, port, timeout_ms).await,
    ];
    results.extend(check_network_configuration(host, port));

    if manager.is_connected() {
        results.push(throughput_test(manager).await);
        results.push(stability_test(manager).await);
        results.push(data_integrity_test(manager).await);
    }

    let failed = results.iter().filter(|r| !r.passed).count();
    tracing::info!(
        "Diagnostics complete: {}/{} passed",
        results.len() - failed,
        results.len()
    );
    results
}

async fn timed_connect(host: &str, port: u16, timeout_ms: u64) -> Result<Duration, String> {
    let started = Instant::now();
    match timeout(Duration::from_millis(timeout_ms), TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            let elapsed = started.elapsed();
            drop(stream);
            Ok(elapsed)
        }
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("timed out after {}ms", timeout_ms)),
    }
}

fn valid_port(port: u32) -> Option<u16> {
    u16::try_from(port).ok().filter(|&p| p > 0)
}

async fn connection_test(host: &str, port: u32, timeout_ms: u64) -> DiagnosticResult {
    const NAME: &str = "Connection Test";
    let started = Instant::now();
    let Some(port) = valid_port(port) else {
        return DiagnosticResult::new(NAME, false, format!("Invalid port {}", port), started, Severity::Error);
    };

    match timed_connect(host, port, timeout_ms).await {
        Ok(elapsed) => DiagnosticResult::new(
            NAME,
            true,
            format!("Connected to {}:{} in {:.1}ms", host, port, elapsed.as_secs_f64() * 1000.0),
            started,
            Severity::Info,
        ),
        Err(reason) => DiagnosticResult::new(
            NAME,
            false,
            format!("Cannot connect to {}:{}: {}", host, port, reason),
            started,
            Severity::Error,
        ),
    }
}

async fn latency_test(host: &str, port: u32, timeout_ms: u64) -> DiagnosticResult {
    const NAME: &str = "Latency Test";
    let started = Instant::now();
    let Some(port) = valid_port(port) else {
        return DiagnosticResult::new(NAME, false, format!("Invalid port {}", port), started, Severity::Error);
    };

    let mut samples = Vec::with_capacity(LATENCY_ROUNDS);
    for round in 1..=LATENCY_ROUNDS {
        match timed_connect(host, port, timeout_ms).await {
            Ok(elapsed) => samples.push(elapsed.as_secs_f64() * 1000.0),
            Err(reason) => {
                return DiagnosticResult::new(
                    NAME,
                    false,
                    format!("Round {} of {} failed: {}", round, LATENCY_ROUNDS, reason),
                    started,
                    Severity::Error,
                );
            }
        }
    }

    let avg = samples.iter().sum::<f64>() / samples.len() as f64;
    let severity = if avg < LATENCY_GOOD_MS {
        Severity::Info
    } else {
        Severity::Warning
    };
    DiagnosticResult::new(
        NAME,
        avg < LATENCY_PASS_MS,
        format!("Average connect latency {:.1}ms over {} rounds", avg, LATENCY_ROUNDS),
        started,
        severity,
    )
}

/// Static checks on the address: IPv4 syntax, port range, default port, scope.
pub fn check_network_configuration(host: &str, port: u32) -> Vec<DiagnosticResult> {
    let started = Instant::now();
    let ip = host.trim().parse::<Ipv4Addr>().ok();
    let mut results = Vec::with_capacity(4);

    results.push(match ip {
        Some(ip) => DiagnosticResult::new(
            "IP Address Format",
            true,
            format!("{} is a valid IPv4 address", ip),
            started,
            Severity::Info,
        ),
        None => DiagnosticResult::new(
            "IP Address Format",
            false,
            format!("{:?} is not a valid IPv4 address", host),
            started,
            Severity::Error,
        ),
    });

    let in_range = valid_port(port).is_some();
    results.push(DiagnosticResult::new(
        "Port Range",
        in_range,
        if in_range {
            format!("Port {} is within 1-65535", port)
        } else {
            format!("Port {} is outside 1-65535", port)
        },
        started,
        if in_range { Severity::Info } else { Severity::Error },
    ));

    let default_port = port == u32::from(DEFAULT_DEVICE_PORT);
    results.push(DiagnosticResult::new(
        "Default Port",
        default_port,
        if default_port {
            format!("Using the default device port {}", DEFAULT_DEVICE_PORT)
        } else {
            format!(
                "Port {} differs from the default device port {}",
                port, DEFAULT_DEVICE_PORT
            )
        },
        started,
        if default_port { Severity::Info } else { Severity::Warning },
    ));

    results.push(match ip {
        Some(ip) if ip.is_private() || ip.is_loopback() => DiagnosticResult::new(
            "Network Scope",
            true,
            format!("{} is on a local network", ip),
            started,
            Severity::Info,
        ),
        Some(ip) => DiagnosticResult::new(
            "Network Scope",
            false,
            format!("{} is not a private or loopback address", ip),
            started,
            Severity::Warning,
        ),
        None => DiagnosticResult::new(
            "Network Scope",
            false,
            "Scope unknown for a non-IPv4 host".to_string(),
            started,
            Severity::Warning,
        ),
    });

    results
}

async fn throughput_test(manager: &ConnectionManager) -> DiagnosticResult {
    const NAME: &str = "Throughput Test";
    let started = Instant::now();
    let chunk = [0x5Au8; THROUGHPUT_CHUNK];

    for write in 1..=THROUGHPUT_WRITES {
        if let Err(e) = manager.send_data(&chunk).await {
            return DiagnosticResult::new(
                NAME,
                false,
                format!("Write {} of {} failed: {}", write, THROUGHPUT_WRITES, e),
                started,
                Severity::Error,
            );
        }
    }

    let secs = started.elapsed().as_secs_f64().max(f64::EPSILON);
    let bytes = (THROUGHPUT_WRITES * THROUGHPUT_CHUNK) as f64;
    DiagnosticResult::new(
        NAME,
        true,
        format!("{:.0} bytes/sec ({} bytes in {:.1}ms)", bytes / secs, bytes, secs * 1000.0),
        started,
        Severity::Info,
    )
}

async fn stability_test(manager: &ConnectionManager) -> DiagnosticResult {
    let started = Instant::now();
    let mut succeeded = 0usize;
    for probe in 0..STABILITY_PROBES {
        if probe > 0 {
            tokio::time::sleep(STABILITY_SPACING).await;
        }
        if manager.send_heartbeat().await {
            succeeded += 1;
        }
    }

    let rate = succeeded as f64 / STABILITY_PROBES as f64 * 100.0;
    let passed = rate > STABILITY_PASS_RATE;
    DiagnosticResult::new(
        "Stability Test",
        passed,
        format!("{}/{} heartbeats succeeded ({:.0}%)", succeeded, STABILITY_PROBES, rate),
        started,
        if passed { Severity::Info } else { Severity::Warning },
    )
}

/// Writes a fixed pattern. The device does not echo it, so completion of the
/// write is all that is checked.
async fn data_integrity_test(manager: &ConnectionManager) -> DiagnosticResult {
    const NAME: &str = "Data Integrity Test";
    let started = Instant::now();
    let pattern: Vec<u8> = (0..INTEGRITY_PATTERN_LEN).map(|i| i as u8).collect();

    match manager.send_data(&pattern).await {
        Ok(()) => DiagnosticResult::new(
            NAME,
            true,
            format!("Wrote {} byte test pattern (response not verified)", pattern.len()),
            started,
            Severity::Info,
        ),
        Err(e) => DiagnosticResult::new(
            NAME,
            false,
            format!("Test pattern write failed: {}", e),
            started,
            Severity::Error,
        ),
    }
}
