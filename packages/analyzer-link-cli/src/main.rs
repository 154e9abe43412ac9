//! Analyzer Link CLI - find and talk to network logic analyzers from a terminal
//!
//! This binary can:
//! - Scan local networks for analyzers (broadcast + TCP sweep)
//! - Identify a single endpoint via the device-info handshake
//! - Run connection diagnostics
//! - Hold a connection open and stream lifecycle/quality events
//! - Send WiFi provisioning to a connected analyzer

mod monitor;

use analyzer_link_core::{
    config, parse_endpoint, scanner, AnalyzerLink, ScanOverrides, Severity, WifiSettings,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "analyzer-link")]
#[command(author = "Stratiform LLC")]
#[command(version)]
#[command(about = "Discover, monitor and diagnose network logic analyzers")]
#[command(long_about = "
Analyzer Link finds logic analyzers on the local network and keeps a
reliable connection to one of them.

Quick start:
  1. Find devices:       analyzer-link scan
  2. Check a device:     analyzer-link diagnose 192.168.1.40:4045
  3. Watch the link:     analyzer-link monitor 192.168.1.40:4045
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan local networks for analyzers
    Scan {
        /// CIDR, single address or a.b.c.x-y (default: local /24 networks)
        #[arg(short, long)]
        range: Option<String>,

        /// Device port to probe (repeatable)
        #[arg(short, long = "port")]
        ports: Vec<u16>,

        /// Per-probe timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Maximum simultaneous probes
        #[arg(long)]
        concurrency: Option<usize>,

        /// Skip UDP broadcast discovery
        #[arg(long)]
        no_broadcast: bool,

        /// Report open ports without the device-info handshake
        #[arg(long)]
        shallow: bool,
    },

    /// Ask one endpoint to identify itself
    Identify {
        /// host:port of the device
        endpoint: String,
    },

    /// Run connection diagnostics against an endpoint
    Diagnose {
        /// host:port of the device
        endpoint: String,

        /// Connect first so link tests (throughput, stability) also run
        #[arg(long)]
        connect: bool,
    },

    /// Connect and stream connection events until Ctrl+C
    Monitor {
        /// host:port of the device
        endpoint: String,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration_secs: Option<u64>,
    },

    /// Send WiFi credentials to an analyzer
    Wifi {
        /// host:port of the device
        endpoint: String,

        /// Network name (truncated to 32 bytes)
        #[arg(long)]
        ssid: String,

        /// Network password (truncated to 63 bytes)
        #[arg(long)]
        password: String,

        /// Static IP for the device; DHCP when omitted
        #[arg(long, default_value = "")]
        static_ip: String,

        /// Port the device should listen on
        #[arg(long, default_value = "4045")]
        wifi_port: u16,
    },

    /// Show configuration paths and settings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("analyzer_link={},analyzer_link_core={}", log_level, log_level).into()
            }),
        )
        .with_target(false)
        .init();

    let settings = config::load_settings();
    let link = AnalyzerLink::new(&settings);

    match cli.command {
        Commands::Scan {
            ref range,
            ref ports,
            timeout_ms,
            concurrency,
            no_broadcast,
            shallow,
        } => {
            let overrides = ScanOverrides {
                ip_range: range.clone(),
                ports: (!ports.is_empty()).then(|| ports.clone()),
                timeout_ms,
                concurrency,
                enable_broadcast: no_broadcast.then_some(false),
                deep_scan: shallow.then_some(false),
                ..Default::default()
            };
            cmd_scan(&cli, &link, &overrides).await
        }
        Commands::Identify { ref endpoint } => cmd_identify(&cli, &settings, endpoint).await,
        Commands::Diagnose {
            ref endpoint,
            connect,
        } => cmd_diagnose(&cli, &link, endpoint, connect).await,
        Commands::Monitor {
            ref endpoint,
            duration_secs,
        } => {
            let (host, port) = parse_endpoint(endpoint)?;
            monitor::run_monitor(&link, &host, port, duration_secs, cli.format).await
        }
        Commands::Wifi {
            ref endpoint,
            ref ssid,
            ref password,
            ref static_ip,
            wifi_port,
        } => {
            let wifi = WifiSettings {
                ssid: ssid.clone(),
                password: password.clone(),
                static_ip: static_ip.clone(),
                port: wifi_port,
            };
            cmd_wifi(&cli, &link, endpoint, &wifi).await
        }
        Commands::Config => cmd_config(&cli, &settings),
    }
}

async fn cmd_scan(cli: &Cli, link: &AnalyzerLink, overrides: &ScanOverrides) -> Result<()> {
    match cli.format {
        OutputFormat::Text => println!("Scanning for analyzers..."),
        OutputFormat::Json => {}
    }

    // Create progress callback for text mode
    let progress_callback: Option<scanner::ProgressCallback> = match cli.format {
        OutputFormat::Text => Some(Box::new(|progress: scanner::ScanProgress| {
            if let Some(pct) = progress.percent {
                println!("  [{:>3}%] {}", pct, progress.message);
            } else {
                println!("  {}", progress.message);
            }
        })),
        OutputFormat::Json => None,
    };

    let result = link
        .scan_for_devices_with_progress(overrides, progress_callback)
        .await?;

    match cli.format {
        OutputFormat::Text => {
            println!();
            if let Some(ref error) = result.error {
                println!("Scan {:?}: {}", result.status, error);
                return Ok(());
            }
            println!(
                "Found {} analyzers on {} in {:.1}s ({:?}):",
                result.devices.len(),
                result.ip_range_description,
                result.scan_duration_ms as f64 / 1000.0,
                result.status
            );
            println!();
            for device in &result.devices {
                let firmware = device.firmware_version.as_deref().unwrap_or("-");
                let channels = device
                    .capabilities
                    .map(|c| format!("{} ch", c.channel_count))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {:21} {:>8.1}ms  {:24} {}",
                    device.key(),
                    device.response_time_ms,
                    firmware,
                    channels
                );
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

async fn cmd_identify(cli: &Cli, settings: &config::Settings, endpoint: &str) -> Result<()> {
    let (host, port) = parse_endpoint(endpoint)?;
    let device = scanner::identify(&host, port, settings.scan.timeout_ms).await;

    match cli.format {
        OutputFormat::Text => match device {
            Some(device) => {
                println!("{} is a logic analyzer", device.key());
                println!(
                    "Firmware:  {}",
                    device.firmware_version.as_deref().unwrap_or("-")
                );
                if let Some(caps) = device.capabilities {
                    println!("Max freq:  {} Hz", caps.max_frequency);
                    println!("Blast:     {} Hz", caps.blast_frequency);
                    println!("Buffer:    {} samples", caps.buffer_size);
                    println!("Channels:  {}", caps.channel_count);
                }
            }
            None => println!("{}:{} did not answer as a supported analyzer", host, port),
        },
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "device": device }));
        }
    }

    Ok(())
}

async fn cmd_diagnose(cli: &Cli, link: &AnalyzerLink, endpoint: &str, connect: bool) -> Result<()> {
    let (host, port) = parse_endpoint(endpoint)?;

    if connect {
        if let Err(e) = link.connect(&host, port).await {
            tracing::warn!("Running diagnostics without a live connection: {}", e);
        }
    }
    let results = link.run_diagnostics(&host, u32::from(port)).await;
    link.disconnect().await;

    match cli.format {
        OutputFormat::Text => {
            println!("Diagnostics for {}:{}", host, port);
            println!();
            for result in &results {
                let mark = match (result.passed, result.severity) {
                    (true, _) => "PASS",
                    (false, Severity::Warning) | (false, Severity::Info) => "WARN",
                    (false, Severity::Error) => "FAIL",
                };
                println!(
                    "  [{}] {:20} {:>8.1}ms  {}",
                    mark, result.test_name, result.duration_ms, result.details
                );
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }

    Ok(())
}

async fn cmd_wifi(cli: &Cli, link: &AnalyzerLink, endpoint: &str, wifi: &WifiSettings) -> Result<()> {
    let (host, port) = parse_endpoint(endpoint)?;
    link.connect(&host, port)
        .await
        .with_context(|| format!("Failed to connect to {}:{}", host, port))?;
    let sent = link.provision_wifi(wifi).await;
    link.disconnect().await;
    sent.context("Failed to send WiFi provisioning")?;

    match cli.format {
        OutputFormat::Text => {
            println!("Sent WiFi settings for '{}' to {}:{}", wifi.ssid, host, port);
            println!("The analyzer will rejoin the network; rescan to find its new address.");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "status": "sent",
                "host": host,
                "port": port,
                "ssid": wifi.ssid,
            }));
        }
    }

    Ok(())
}

fn cmd_config(cli: &Cli, settings: &config::Settings) -> Result<()> {
    let config_path = config::get_config_file_path_string();

    match cli.format {
        OutputFormat::Text => {
            println!("Configuration");
            println!("=============");
            println!();
            println!("Config file:      {}", config_path);
            println!("Source:           {}", settings.source);
            println!("Scan ports:       {:?}", settings.scan.ports);
            println!("Scan timeout:     {}ms", settings.scan.timeout_ms);
            println!("Concurrency:      {}", settings.scan.concurrency);
            println!("Heartbeat:        {}ms", settings.connection.heartbeat_interval_ms);
            println!("Max retries:      {}", settings.connection.max_retries);
            println!();
            println!("Environment variables:");
            println!("  ANALYZER_LINK_DEVICE_PORT     - Override the device port to scan");
            println!("  ANALYZER_LINK_SCAN_TIMEOUT_MS - Override the per-probe timeout");
            println!();
            println!("Example config.toml:");
            println!();
            println!("{}", config::generate_example_config());
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "config_file": config_path,
                "source": settings.source.to_string(),
                "scan": settings.scan,
                "connection": settings.connection,
            }));
        }
    }

    Ok(())
}
