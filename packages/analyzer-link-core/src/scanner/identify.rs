//! Device identification via the device-info handshake.

use super::DeviceRecord;
use crate::protocol::device_info_request;
use crate::protocol::handshake::{complete_line_count, parse_device_info, HANDSHAKE_LINES};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Upper bound on handshake bytes read before giving up on a chatty peer
const MAX_HANDSHAKE_BYTES: usize = 4096;

/// Ask `host:port` to identify itself.
///
/// Returns `None` for anything that is not a supported analyzer: connect
/// failures, timeouts, short or malformed responses and unsupported firmware.
/// `response_time_ms` is left at zero for the caller to fill in.
pub async fn identify(host: &str, port: u16, timeout_ms: u64) -> Option<DeviceRecord> {
    let response = match timeout(
        Duration::from_millis(timeout_ms),
        read_handshake(host, port),
    )
    .await
    {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            tracing::debug!("Identify {}:{} failed: {}", host, port, e);
            return None;
        }
        Err(_) => {
            tracing::debug!("Identify {}:{} timed out after {}ms", host, port, timeout_ms);
            return None;
        }
    };

    let text = String::from_utf8_lossy(&response);
    match parse_device_info(&text) {
        Some(info) => {
            tracing::info!(
                "Identified analyzer at {}:{} (firmware {})",
                host,
                port,
                info.firmware_version
            );
            Some(DeviceRecord::from_handshake(host, port, info))
        }
        None => {
            tracing::debug!("{}:{} is not a compatible analyzer", host, port);
            None
        }
    }
}

/// Send the device-info request and collect the reply until it has enough lines
/// or the peer closes.
async fn read_handshake(host: &str, port: u16) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect((host, port)).await?;
    stream.write_all(&device_info_request()).await?;
    stream.flush().await?;

    let mut response = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        response.extend_from_slice(&chunk[..n]);
        if complete_line_count(&response) >= HANDSHAKE_LINES
            || response.len() >= MAX_HANDSHAKE_BYTES
        {
            break;
        }
    }
    Ok(response)
}
