//! Link quality bookkeeping for the live connection.
//!
//! Stability score:
//!
//! ```text
//! 100
//!   - min(30, (avg_latency - 100ms) / 10)   when avg_latency > 100ms
//!   - 5  per retry
//!   - 10 per disconnection
//!   - 2  per percent of packet loss
//! clamped to [0, 100]
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Response-time history size that triggers trimming
pub const MAX_RESPONSE_SAMPLES: usize = 1000;

/// History size kept after trimming
pub const TRIMMED_RESPONSE_SAMPLES: usize = 500;

/// Samples considered by each quality check
pub const QUALITY_WINDOW: usize = 100;

const LATENCY_PENALTY_THRESHOLD_MS: f64 = 100.0;
const MAX_LATENCY_PENALTY: f64 = 30.0;
const RETRY_PENALTY: f64 = 5.0;
const DISCONNECTION_PENALTY: f64 = 10.0;
const PACKET_LOSS_WEIGHT: f64 = 2.0;
const HEARTBEAT_FAILURE_PENALTY: f64 = 10.0;

/// Snapshot of link health for the current connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionQuality {
    pub latency_ms: f64,
    pub packet_loss_pct: f64,
    /// Always within [0, 100]
    pub stability_score: f64,
    pub avg_response_time_ms: f64,
    pub min_response_time_ms: f64,
    pub max_response_time_ms: f64,
    pub retry_count: u32,
    pub disconnection_count: u32,
    pub throughput_bps: f64,
    pub last_test_time: Option<DateTime<Utc>>,
}

impl Default for ConnectionQuality {
    fn default() -> Self {
        Self {
            latency_ms: 0.0,
            packet_loss_pct: 0.0,
            stability_score: 100.0,
            avg_response_time_ms: 0.0,
            min_response_time_ms: 0.0,
            max_response_time_ms: 0.0,
            retry_count: 0,
            disconnection_count: 0,
            throughput_bps: 0.0,
            last_test_time: None,
        }
    }
}

/// Stability score for the given link statistics, clamped to [0, 100].
pub fn stability_score(
    avg_latency_ms: f64,
    retry_count: u32,
    disconnection_count: u32,
    packet_loss_pct: f64,
) -> f64 {
    let mut score = 100.0;

    if avg_latency_ms > LATENCY_PENALTY_THRESHOLD_MS {
        score -= ((avg_latency_ms - LATENCY_PENALTY_THRESHOLD_MS) / 10.0).min(MAX_LATENCY_PENALTY);
    }
    score -= f64::from(retry_count) * RETRY_PENALTY;
    score -= f64::from(disconnection_count) * DISCONNECTION_PENALTY;
    score -= packet_loss_pct.max(0.0) * PACKET_LOSS_WEIGHT;

    clamp_score(score)
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Copy)]
struct ResponseSample {
    duration_ms: f64,
    bytes: usize,
}

/// Mutable quality state owned by one connection manager.
#[derive(Debug, Default)]
pub(crate) struct QualityTracker {
    quality: ConnectionQuality,
    samples: VecDeque<ResponseSample>,
    heartbeats_sent: u64,
    heartbeats_failed: u64,
}

impl QualityTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record one completed write and its round-trip time.
    pub(crate) fn record_response(&mut self, elapsed: Duration, bytes: usize) {
        let duration_ms = elapsed.as_secs_f64() * 1000.0;
        self.samples.push_back(ResponseSample { duration_ms, bytes });
        if self.samples.len() > MAX_RESPONSE_SAMPLES {
            let excess = self.samples.len() - TRIMMED_RESPONSE_SAMPLES;
            self.samples.drain(..excess);
        }
        self.quality.latency_ms = duration_ms;
    }

    pub(crate) fn record_heartbeat(&mut self, success: bool) {
        self.heartbeats_sent += 1;
        if !success {
            self.heartbeats_failed += 1;
            self.quality.stability_score =
                clamp_score(self.quality.stability_score - HEARTBEAT_FAILURE_PENALTY);
        }
        self.quality.packet_loss_pct =
            self.heartbeats_failed as f64 / self.heartbeats_sent as f64 * 100.0;
    }

    pub(crate) fn record_retry(&mut self) {
        self.quality.retry_count += 1;
    }

    pub(crate) fn record_disconnection(&mut self) {
        self.quality.disconnection_count += 1;
    }

    /// Recompute statistics over the most recent [`QUALITY_WINDOW`] samples.
    pub(crate) fn recompute(&mut self, now: DateTime<Utc>) -> ConnectionQuality {
        let window: Vec<ResponseSample> = self
            .samples
            .iter()
            .rev()
            .take(QUALITY_WINDOW)
            .copied()
            .collect();

        if !window.is_empty() {
            let total_ms: f64 = window.iter().map(|s| s.duration_ms).sum();
            let total_bytes: usize = window.iter().map(|s| s.bytes).sum();
            let avg = total_ms / window.len() as f64;

            self.quality.avg_response_time_ms = avg;
            self.quality.latency_ms = avg;
            self.quality.min_response_time_ms = window
                .iter()
                .map(|s| s.duration_ms)
                .fold(f64::INFINITY, f64::min);
            self.quality.max_response_time_ms =
                window.iter().map(|s| s.duration_ms).fold(0.0, f64::max);
            self.quality.throughput_bps = if total_ms > 0.0 {
                total_bytes as f64 / (total_ms / 1000.0)
            } else {
                0.0
            };
        }

        self.quality.stability_score = stability_score(
            self.quality.avg_response_time_ms,
            self.quality.retry_count,
            self.quality.disconnection_count,
            self.quality.packet_loss_pct,
        );
        self.quality.last_test_time = Some(now);
        self.quality.clone()
    }

    pub(crate) fn snapshot(&self) -> ConnectionQuality {
        self.quality.clone()
    }

    #[cfg(test)]
    pub(crate) fn sample_count(&self) -> usize {
        self.samples.len()
    }
}
