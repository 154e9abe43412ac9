//! WiFi provisioning payload (command 2).
//!
//! Fixed-width layout, every text field null-padded:
//!
//! ```text
//! ┌──────────────┬────────────────┬───────────────┬──────────────┐
//! │ SSID (33)    │ Password (64)  │ Static IP (16)│ Port (u16 LE)│
//! └──────────────┴────────────────┴───────────────┴──────────────┘
//! ```
//!
//! Each text field keeps at least one trailing NUL, so content is truncated to
//! 32 / 63 / 15 bytes. Oversized input is truncated, never rejected.

use super::command::DeviceCommand;
use super::frame::WireStruct;
use serde::{Deserialize, Serialize};

pub const SSID_FIELD_LEN: usize = 33;
pub const PASSWORD_FIELD_LEN: usize = 64;
pub const STATIC_IP_FIELD_LEN: usize = 16;

/// Unframed payload size, excluding the command byte
pub const PROVISIONING_PAYLOAD_LEN: usize =
    SSID_FIELD_LEN + PASSWORD_FIELD_LEN + STATIC_IP_FIELD_LEN + 2;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WifiSettings {
    pub ssid: String,
    pub password: String,
    /// Empty for DHCP
    pub static_ip: String,
    pub port: u16,
}

impl WireStruct for WifiSettings {
    fn write_to(&self, out: &mut Vec<u8>) {
        put_padded(out, &self.ssid, SSID_FIELD_LEN);
        put_padded(out, &self.password, PASSWORD_FIELD_LEN);
        put_padded(out, &self.static_ip, STATIC_IP_FIELD_LEN);
        out.extend_from_slice(&self.port.to_le_bytes());
    }
}

fn put_padded(out: &mut Vec<u8>, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let take = bytes.len().min(width - 1);
    out.extend_from_slice(&bytes[..take]);
    out.resize(out.len() + width - take, 0);
}

/// Framed network-config request ready for the wire
pub fn network_config_request(settings: &WifiSettings) -> Vec<u8> {
    let mut pkt = DeviceCommand::NetworkConfig.packet();
    pkt.add_struct(settings);
    pkt.serialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::decode_frame;

    fn settings(ssid: &str, password: &str, ip: &str, port: u16) -> WifiSettings {
        WifiSettings {
            ssid: ssid.to_string(),
            password: password.to_string(),
            static_ip: ip.to_string(),
            port,
        }
    }

    #[test]
    fn test_layout() {
        let mut out = Vec::new();
        settings("lab", "secret", "192.168.1.50", 4045).write_to(&mut out);
        assert_eq!(out.len(), PROVISIONING_PAYLOAD_LEN);
        assert_eq!(&out[..3], b"lab");
        assert!(out[3..SSID_FIELD_LEN].iter().all(|&b| b == 0));
        assert_eq!(&out[SSID_FIELD_LEN..SSID_FIELD_LEN + 6], b"secret");
        let ip_start = SSID_FIELD_LEN + PASSWORD_FIELD_LEN;
        assert_eq!(&out[ip_start..ip_start + 12], b"192.168.1.50");
        assert_eq!(&out[out.len() - 2..], &4045u16.to_le_bytes());
    }

    #[test]
    fn test_oversized_fields_truncate() {
        let long = "x".repeat(200);
        let mut out = Vec::new();
        settings(&long, &long, &long, 1).write_to(&mut out);
        assert_eq!(out.len(), PROVISIONING_PAYLOAD_LEN);
        assert_eq!(out[SSID_FIELD_LEN - 2], b'x');
        assert_eq!(out[SSID_FIELD_LEN - 1], 0);
        assert_eq!(out[SSID_FIELD_LEN + PASSWORD_FIELD_LEN - 1], 0);
        assert_eq!(out[SSID_FIELD_LEN + PASSWORD_FIELD_LEN + STATIC_IP_FIELD_LEN - 1], 0);
    }

    #[test]
    fn test_framed_request_round_trips() {
        let s = settings("lab", "pw", "", 4045);
        let payload = decode_frame(&network_config_request(&s));
        assert_eq!(payload[0], DeviceCommand::NetworkConfig.id());
        assert_eq!(payload.len(), 1 + PROVISIONING_PAYLOAD_LEN);
    }
}
