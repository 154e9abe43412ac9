use thiserror::Error;

/// Errors surfaced by the connection lifecycle and by caller misuse.
///
/// Discovery paths (probing, identification, broadcast) never produce these;
/// they degrade to `false`, `None` or an empty list instead.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("A scan is already in progress")]
    ScanInProgress,

    #[error("Not connected to a device")]
    NotConnected,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection to {host}:{port} timed out after {ms}ms")]
    ConnectTimeout { host: String, port: u16, ms: u64 },

    #[error("Connection to {host}:{port} failed: {reason}")]
    ConnectionFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Send timed out after {ms}ms")]
    SendTimeout { ms: u64 },

    #[error("Connection closed while the operation was in flight")]
    ConnectionClosed,

    #[error("Network interface error: {0}")]
    Interface(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;
