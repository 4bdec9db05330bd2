//! # Error Types
//!
//! Error handling for the gateway, from socket failures up to routing misses.
//!
//! ## Error Categories
//! - **I/O Errors**: socket and file system failures
//! - **Protocol Violations**: bad magic, bad reserved byte, sequence gaps, checksum mismatch
//! - **Cryptographic Errors**: AEAD seal/open failures
//! - **Compression Errors**: decompression failures and size limit violations
//! - **Routing Errors**: lookups that miss, duplicate registrations, full storage
//!
//! Protocol violations are terminal for the connection that produced them;
//! routing errors are terminal only for the call that produced them.
//!
//! ## Example Usage
//! ```rust
//! use session_gateway::error::{GatewayError, Result};
//!
//! fn parse_port(raw: &str) -> Result<u16> {
//!     raw.parse::<u16>()
//!         .map_err(|e| GatewayError::ConfigError(format!("bad port {raw}: {e}")))
//! }
//!
//! assert!(parse_port("9000").is_ok());
//! assert!(parse_port("not-a-port").is_err());
//! ```

use crate::core::Uid;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Wire format
    pub const ERR_TRUNCATED_AUTH_REQUEST: &str = "auth request shorter than its fixed fields";
    pub const ERR_PLATFORM_NOT_TERMINATED: &str = "platform string is not NUL terminated";
    pub const ERR_PLATFORM_LENGTH: &str = "platform length does not match payload";
    pub const ERR_UNKNOWN_LINK_TYPE: &str = "unknown link type";
    pub const ERR_TRUNCATED_AUTH_RESPONSE: &str = "auth response has the wrong size";
    pub const ERR_UNKNOWN_ERROR_CODE: &str = "unknown auth error code";
    pub const ERR_TRUNCATED_BROADCAST: &str = "broadcast target list is truncated";
    pub const ERR_MISSING_UID: &str = "payload is missing its leading uid";
    pub const ERR_TRUNCATED_CONFIRM: &str = "connect-confirm has the wrong size";
    pub const ERR_TRUNCATED_BUNDLE: &str = "bundled block runs past the payload";
    pub const ERR_EXPECTED_AUTH: &str = "first frame must be an authentication request";
    pub const ERR_UNSUPPORTED_ROLE: &str = "link type cannot authenticate at the gateway";

    /// Connection lifecycle
    pub const ERR_CONNECTION_GONE: &str = "connection handle no longer alive";
    pub const ERR_LANE_START: &str = "execution lane failed to start";
    pub const ERR_NOT_UNMANAGED: &str = "connection is not waiting for authentication";
    pub const ERR_UID_TAKEN: &str = "uid already registered";
    pub const ERR_ALREADY_STARTED: &str = "gateway already started";
    pub const ERR_NOT_AUTHENTICATED: &str = "link has not authenticated yet";
}

/// Primary error type for all gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Invalid frame magic: {0:#04x}")]
    InvalidMagic(u8),

    #[error("Sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u32, actual: u32 },

    #[error("Frame checksum mismatch")]
    ChecksumMismatch,

    #[error("Payload too large: {0} bytes")]
    OversizedPayload(usize),

    #[error("Malformed payload: {0}")]
    Malformed(&'static str),

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("No server registered for identity {0:#018x}")]
    ServerNotFound(u64),

    #[error("Server uid {0} is already registered")]
    DuplicateServer(Uid),

    #[error("No route to uid {0}")]
    RouteMiss(Uid),

    #[error("Too many broadcast targets: {0}")]
    TooManyTargets(usize),

    #[error("Storage is full")]
    StorageFull,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl GatewayError {
    /// Errors that mean the peer broke the wire protocol. The offending
    /// connection is closed immediately.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            GatewayError::InvalidHeader
                | GatewayError::InvalidMagic(_)
                | GatewayError::SequenceMismatch { .. }
                | GatewayError::ChecksumMismatch
                | GatewayError::OversizedPayload(_)
                | GatewayError::Malformed(_)
                | GatewayError::DecryptionFailure
                | GatewayError::DecompressionFailure
        )
    }
}

/// Type alias for Results using GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;
