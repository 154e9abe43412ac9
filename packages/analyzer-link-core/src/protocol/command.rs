//! Request command identifiers understood by the analyzer firmware.

use super::frame::OutputPacket;

/// First payload byte of every framed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceCommand {
    /// Ask for the 5-line identification banner
    DeviceInfo = 0,
    /// Push WiFi credentials and listen port (see `provisioning`)
    NetworkConfig = 2,
}

impl DeviceCommand {
    #[inline]
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Packet pre-filled with this command's id
    pub fn packet(self) -> OutputPacket {
        let mut pkt = OutputPacket::new();
        pkt.add_byte(self.id());
        pkt
    }
}

/// Framed "device info" request (command 0, no arguments)
pub fn device_info_request() -> Vec<u8> {
    DeviceCommand::DeviceInfo.packet().serialize()
}
