//! Error types for the bluecore library
//!
//! Each layer has its own error vocabulary. `HciError` covers the transport
//! and packet framing, `L2capError` covers channel and signalling failures,
//! and `Error` is what the public host API returns.

use thiserror::Error;

use crate::l2cap::L2capError;

/// Errors that can occur when talking to the controller
#[derive(Error, Debug)]
pub enum HciError {
    #[error("Failed to open HCI socket: {0}")]
    SocketError(#[from] std::io::Error),

    #[error("Failed to bind to HCI device: {0}")]
    BindError(std::io::Error),

    #[error("Failed to send HCI packet: {0}")]
    SendError(std::io::Error),

    #[error("Failed to receive HCI event: {0}")]
    ReceiveError(std::io::Error),

    #[error("Invalid parameter length: {0}")]
    InvalidParamLength(usize),

    #[error("Invalid HCI packet format")]
    InvalidPacketFormat,

    #[error("Timed out waiting for command 0x{0:04x} to complete")]
    Timeout(u16),

    #[error("Unsupported operation")]
    Unsupported,
}

/// Errors returned by the host API
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("No free {0} available")]
    ResourceExhausted(&'static str),

    #[error("Operation already in progress")]
    Already,

    #[error("Resource busy")]
    Busy,

    #[error("Operation cannot be performed now, retry later")]
    RetryLater,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Controller rejected command 0x{opcode:04x} with status 0x{status:02x}")]
    Controller { opcode: u16, status: u8 },

    #[error("Connection not established")]
    NotConnected,

    #[error("Invalid state for operation")]
    InvalidState,

    #[error("Operation not supported by the controller")]
    NotSupported,

    #[error("Host is shutting down or the link was lost")]
    Shutdown,

    #[error("HCI error: {0}")]
    Hci(#[from] HciError),

    #[error("L2CAP error: {0}")]
    L2cap(#[from] L2capError),
}

impl Error {
    /// Controller status code carried by this error, if any.
    pub fn controller_status(&self) -> Option<u8> {
        match self {
            Self::Controller { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type for host operations
pub type Result<T> = std::result::Result<T, Error>;
