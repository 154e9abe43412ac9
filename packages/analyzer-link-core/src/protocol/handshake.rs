//! Device-info handshake parsing.
//!
//! The analyzer answers a device-info request with plain text, one field per line:
//!
//! ```text
//! LOGIC_ANALYZER_V6_5
//! FREQ:100000000
//! BLASTFREQ:200000000
//! BUFFER:262144
//! CHANNELS:24
//! ```
//!
//! Anything that does not match exactly is "not an analyzer" and yields `None`.

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

/// Number of lines in a complete handshake response
pub const HANDSHAKE_LINES: usize = 5;

/// Firmware releases this client can talk to
pub const SUPPORTED_FIRMWARE: &str = ">=6.0.0, <7.0.0";

/// Capture limits reported by the device during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapabilities {
    pub max_frequency: u32,
    pub blast_frequency: u32,
    pub buffer_size: u32,
    pub channel_count: u32,
}

/// Parsed handshake response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Raw first line, e.g. `LOGIC_ANALYZER_V6_5`
    pub firmware_version: String,
    pub version: Version,
    pub capabilities: DeviceCapabilities,
}

/// Extract `major.minor` from a banner ending in `V<major>_<minor>`.
pub fn parse_firmware_version(line: &str) -> Option<Version> {
    let line = line.trim();
    let v_pos = line.rfind('V')?;
    if v_pos > 0 && !line[..v_pos].ends_with('_') {
        return None;
    }

    let (major, minor) = line[v_pos + 1..].split_once('_')?;
    Some(Version::new(parse_digits(major)?.into(), parse_digits(minor)?.into(), 0))
}

/// Whether `version` falls inside [`SUPPORTED_FIRMWARE`]
pub fn is_supported_firmware(version: &Version) -> bool {
    VersionReq::parse(SUPPORTED_FIRMWARE)
        .map(|req| req.matches(version))
        .unwrap_or(false)
}

/// Number of newline-terminated lines in `buf`.
pub fn complete_line_count(buf: &[u8]) -> usize {
    buf.iter().filter(|&&b| b == b'\n').count()
}

/// Parse a full handshake response. Extra trailing lines are ignored.
pub fn parse_device_info(text: &str) -> Option<DeviceInfo> {
    let lines: Vec<&str> = text
        .split('\n')
        .map(|l| l.trim_end_matches('\r'))
        .collect();
    if lines.len() < HANDSHAKE_LINES {
        return None;
    }

    let firmware_version = lines[0].trim().to_string();
    let version = parse_firmware_version(&firmware_version)?;
    if !is_supported_firmware(&version) {
        tracing::debug!("Unsupported firmware version: {}", firmware_version);
        return None;
    }

    let capabilities = DeviceCapabilities {
        max_frequency: parse_field(lines[1], "FREQ")?,
        blast_frequency: parse_field(lines[2], "BLASTFREQ")?,
        buffer_size: parse_field(lines[3], "BUFFER")?,
        channel_count: parse_field(lines[4], "CHANNELS")?,
    };

    Some(DeviceInfo {
        firmware_version,
        version,
        capabilities,
    })
}

fn parse_field(line: &str, key: &str) -> Option<u32> {
    let value = line.trim().strip_prefix(key)?.strip_prefix(':')?;
    parse_digits(value)
}

fn parse_digits(value: &str) -> Option<u32> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}
