//! Foreground monitor for one analyzer connection
//!
//! Connects, then streams connection events and a periodic quality
//! summary until Ctrl+C or the optional duration elapses.

use crate::OutputFormat;
use analyzer_link_core::{AnalyzerLink, ConnectionQuality, NetworkEvent, NetworkEventKind};
use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration};

const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Run until interrupted, printing every event published on the link.
pub async fn run_monitor(
    link: &AnalyzerLink,
    host: &str,
    port: u16,
    duration_secs: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    // Bus callbacks are synchronous; forward into the select loop
    let (tx, mut rx) = mpsc::unbounded_channel::<NetworkEvent>();
    let subscription = link.subscribe(move |event| {
        let _ = tx.send(event.clone());
    });

    link.connect(host, port)
        .await
        .with_context(|| format!("Failed to connect to {}:{}", host, port))?;

    tracing::info!("Monitoring {}:{} (Ctrl+C to stop)", host, port);

    let deadline = sleep(
        duration_secs
            .map(Duration::from_secs)
            .unwrap_or(Duration::MAX),
    );
    tokio::pin!(deadline);

    let mut status = interval(STATUS_INTERVAL);
    // First tick fires immediately; the Connected event already covers it
    status.tick().await;

    loop {
        tokio::select! {
            Some(event) = rx.recv() => print_event(&event, format),
            _ = status.tick() => {
                print_status(link.connection_state(), &link.get_connection_quality(), format);
            }
            _ = &mut deadline => {
                tracing::info!("Monitor duration elapsed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, disconnecting");
                break;
            }
        }
    }

    link.unsubscribe(subscription);
    link.disconnect().await;

    let quality = link.get_connection_quality();
    match format {
        OutputFormat::Text => {
            println!();
            println!("Final quality for {}:{}", host, port);
            println!("  Latency:        {:.1}ms", quality.latency_ms);
            println!("  Packet loss:    {:.1}%", quality.packet_loss_pct);
            println!("  Stability:      {:.0}/100", quality.stability_score);
            println!("  Retries:        {}", quality.retry_count);
            println!("  Disconnections: {}", quality.disconnection_count);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "final": quality }));
        }
    }

    Ok(())
}

fn print_event(event: &NetworkEvent, format: OutputFormat) {
    match format {
        OutputFormat::Text => {
            let time = event.timestamp.format("%H:%M:%S");
            let summary = match &event.kind {
                NetworkEventKind::Connected { host, port } => {
                    format!("connected to {}:{}", host, port)
                }
                NetworkEventKind::Disconnected { host, port, reason } => {
                    format!("disconnected from {}:{} ({:?})", host, port, reason)
                }
                NetworkEventKind::Error { operation } => format!("{} failed", operation),
                NetworkEventKind::QualityChanged(q) => format!(
                    "quality: {:.1}ms latency, {:.1}% loss, stability {:.0}",
                    q.latency_ms, q.packet_loss_pct, q.stability_score
                ),
                NetworkEventKind::Reconnecting {
                    attempt, delay_ms, ..
                } => format!("reconnect attempt {} in {}ms", attempt, delay_ms),
            };
            match &event.message {
                Some(message) => println!("[{}] {}: {}", time, summary, message),
                None => println!("[{}] {}", time, summary),
            }
        }
        OutputFormat::Json => match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("Failed to encode event: {}", e),
        },
    }
}

fn print_status(
    state: analyzer_link_core::ConnectionState,
    quality: &ConnectionQuality,
    format: OutputFormat,
) {
    match format {
        OutputFormat::Text => println!(
            "  state {:?}, stability {:.0}, {} retries, {} disconnections",
            state, quality.stability_score, quality.retry_count, quality.disconnection_count
        ),
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "state": state, "quality": quality }));
        }
    }
}
