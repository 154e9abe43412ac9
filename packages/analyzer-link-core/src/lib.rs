//! Analyzer Link Core Library
//!
//! Network discovery and connection management for LAN-attached logic analyzers:
//! - Wire framing and device commands (byte-stuffed frames, device-info handshake)
//! - Device discovery (UDP broadcast, bounded TCP sweep, handshake verification)
//! - A self-healing device connection (heartbeats, quality metrics, reconnect)
//! - Diagnostics and a bounded lifecycle event history
//!
//! # Example
//!
//! ```no_run
//! use analyzer_link_core::{config, AnalyzerLink, ScanOverrides};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = config::load_settings();
//!     let link = AnalyzerLink::new(&settings);
//!
//!     // Find analyzers on the local networks
//!     let result = link.scan_for_devices(&ScanOverrides::default()).await?;
//!     println!("Found {} analyzers", result.devices.len());
//!
//!     // Connect to the first one and keep the link alive
//!     if let Some(device) = result.devices.first() {
//!         link.connect(&device.ip_address, device.port).await?;
//!         println!("Stability: {:.0}", link.get_connection_quality().stability_score);
//!         link.disconnect().await;
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod protocol;
pub mod scanner;
pub mod service;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::{ConfigSource, ConnectionConfig, ConnectionConfigUpdate, ScanConfiguration, ScanOverrides, Settings};
pub use connection::{ConnectionManager, ConnectionQuality, ConnectionState, DiagnosticResult, Severity};
pub use error::LinkError;
pub use events::{EventBus, NetworkEvent, NetworkEventKind, NetworkEventType, SubscriptionId};
pub use protocol::WifiSettings;
pub use scanner::{DeviceRecord, DeviceType, NetworkScanner, ScanProgress, ScanResult, ScanStage, ScanStatus};
pub use service::{parse_endpoint, AnalyzerLink};
