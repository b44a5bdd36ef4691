//! Type definitions for L2CAP operations
//!
//! Local errors, signalling-level result codes and channel configuration.

use std::fmt;
use thiserror::Error;

/// Error types specific to L2CAP operations
#[derive(Debug, Error)]
pub enum L2capError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Remote device rejected connection: {0}")]
    ConnectionRejected(LeConnResult),

    #[error("Channel not found")]
    ChannelNotFound,

    #[error("Operation not supported")]
    NotSupported,

    #[error("Invalid state for operation")]
    InvalidState,

    #[error("MTU exceeded")]
    MtuExceeded,

    #[error("PDU of {0} bytes exceeds the negotiated MPS")]
    MpsExceeded(usize),

    #[error("SDU length mismatch: expected {expected} bytes, got {received}")]
    SduLengthMismatch { expected: u16, received: usize },

    #[error("Credit counter would exceed 0xFFFF")]
    CreditOverflow,

    #[error("PDU received without an available credit")]
    NoCredits,

    #[error("Resource limit reached")]
    ResourceLimitReached,

    #[error("PSM not registered")]
    PsmNotRegistered,

    #[error("PSM already registered")]
    PsmInUse,

    #[error("Security requirements not met")]
    SecurityRequirementsNotMet,

    #[error("Connection not established")]
    NotConnected,
}

/// Result type for L2CAP operations
pub type L2capResult<T> = std::result::Result<T, L2capError>;

/// Result codes of LE credit based and enhanced credit based connection
/// responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeConnResult {
    Success,
    PsmNotSupported,
    NoResources,
    Authentication,
    Authorization,
    EncryptionKeySize,
    Encryption,
    InvalidSourceCid,
    SourceCidInUse,
    UnacceptableParameters,
    InvalidParameters,
    Other(u16),
}

impl LeConnResult {
    pub fn value(self) -> u16 {
        match self {
            Self::Success => 0x0000,
            Self::PsmNotSupported => 0x0002,
            Self::NoResources => 0x0004,
            Self::Authentication => 0x0005,
            Self::Authorization => 0x0006,
            Self::EncryptionKeySize => 0x0007,
            Self::Encryption => 0x0008,
            Self::InvalidSourceCid => 0x0009,
            Self::SourceCidInUse => 0x000A,
            Self::UnacceptableParameters => 0x000B,
            Self::InvalidParameters => 0x000C,
            Self::Other(value) => value,
        }
    }

    pub fn from_value(value: u16) -> Self {
        match value {
            0x0000 => Self::Success,
            0x0002 => Self::PsmNotSupported,
            0x0004 => Self::NoResources,
            0x0005 => Self::Authentication,
            0x0006 => Self::Authorization,
            0x0007 => Self::EncryptionKeySize,
            0x0008 => Self::Encryption,
            0x0009 => Self::InvalidSourceCid,
            0x000A => Self::SourceCidInUse,
            0x000B => Self::UnacceptableParameters,
            0x000C => Self::InvalidParameters,
            other => Self::Other(other),
        }
    }

    /// Results that ask the initiator to raise link security and retry
    pub fn needs_security(self) -> bool {
        matches!(
            self,
            Self::Authentication | Self::Encryption | Self::EncryptionKeySize
        )
    }
}

impl fmt::Display for LeConnResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:04x})", self, self.value())
    }
}

/// Result codes of an enhanced credit based reconfigure response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfResult {
    Success,
    MtuReduced,
    MpsReduced,
    InvalidDestinationCid,
    Unacceptable,
}

impl ReconfResult {
    pub fn value(self) -> u16 {
        match self {
            Self::Success => 0x0000,
            Self::MtuReduced => 0x0001,
            Self::MpsReduced => 0x0002,
            Self::InvalidDestinationCid => 0x0003,
            Self::Unacceptable => 0x0004,
        }
    }

    pub fn from_value(value: u16) -> Self {
        match value {
            0x0000 => Self::Success,
            0x0001 => Self::MtuReduced,
            0x0002 => Self::MpsReduced,
            0x0003 => Self::InvalidDestinationCid,
            _ => Self::Unacceptable,
        }
    }
}

/// L2CAP Channel State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Channel is closed
    Disconnected,
    /// Waiting for the connection response
    Connecting,
    /// BR/EDR configuration exchange in progress
    Config,
    /// Channel is open and ready for data transfer
    Connected,
    /// Waiting for the disconnection response
    Disconnecting,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Config => write!(f, "Config"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Link the channel layer runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// BR/EDR ACL-U
    Classic,
    /// LE-U
    LE,
}

/// LE Credit-Based Connection configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeCreditBasedConfig {
    /// Maximum Transmission Unit
    pub mtu: u16,
    /// Maximum PDU size
    pub mps: u16,
    /// Initial credits
    pub initial_credits: u16,
}

/// Link security level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecurityLevel {
    /// No encryption, no authentication
    None = 1,
    /// Encryption without authentication
    Encryption = 2,
    /// Encryption with an authenticated key
    Authenticated = 3,
    /// Authenticated LE Secure Connections with a 128-bit key
    SecureConnections = 4,
}

impl Default for SecurityLevel {
    fn default() -> Self {
        Self::None
    }
}
