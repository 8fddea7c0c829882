//! Core WEIR protocol types and constants.
//!
//! This crate provides:
//! - The packet header version tag shared by the transport and crypto layers
//! - Protocol-wide constants
//! - Tracing initialization used by every WEIR component

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Current header version emitted by this implementation.
pub const WEIR_VERSION: ProtocolVersion = ProtocolVersion::V2;

/// Errors from decoding protocol-level fields.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unsupported header version: {0}")]
    UnsupportedVersion(u8),
}

/// Packet header version tag.
///
/// The tag is carried in every packet header and pins layout details that
/// changed between protocol revisions. The payload cipher consumes it too:
/// version 1 headers place the packet counter at the front of the cipher IV,
/// later (and pre-release) versions place it in the trailing word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ProtocolVersion {
    /// Pre-release header layout.
    V0,
    /// First public header layout.
    V1,
    /// Current header layout.
    V2,
}

impl ProtocolVersion {
    /// Wire encoding of the version tag.
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::V0 => 0,
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::V0),
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(ProtocolError::UnsupportedVersion(other)),
        }
    }
}

impl From<ProtocolVersion> for u8 {
    fn from(version: ProtocolVersion) -> u8 {
        version.as_u8()
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

/// Initialize tracing with sensible defaults.
///
/// Log level is controlled by the `RUST_LOG` environment variable.
/// Defaults to `info` if not set.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Initialize tracing with a specific default level.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
