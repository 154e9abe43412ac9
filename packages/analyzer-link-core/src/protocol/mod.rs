//! Analyzer wire protocol.
//!
//! - `frame`: byte-stuffed request framing
//! - `command`: request command ids
//! - `handshake`: device-info response parsing
//! - `provisioning`: WiFi configuration payload

pub mod command;
pub mod frame;
pub mod handshake;
pub mod provisioning;

pub use command::{device_info_request, DeviceCommand};
pub use frame::{decode_frame, encode_frame, OutputPacket, WireStruct};
pub use handshake::{parse_device_info, DeviceCapabilities, DeviceInfo};
pub use provisioning::{network_config_request, WifiSettings};

/// Default TCP port the analyzer firmware listens on
pub const DEFAULT_DEVICE_PORT: u16 = 4045;
