//! Error types for oisflash.

use std::io;
use thiserror::Error;

/// Result type for oisflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for oisflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Bus send/receive or pin failure.
    #[error("Link error: {0}")]
    Link(#[source] io::Error),

    /// Firmware file I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The bootloader answered with something other than ACK.
    #[error("NACK from target (response {byte:#04x})")]
    Nack {
        /// Raw response byte.
        byte: u8,
    },

    /// The target kept reporting busy until the deadline.
    #[error("Target busy")]
    Busy,

    /// Deadline exceeded while waiting for the target.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Erase range does not match the flash geometry.
    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    /// Firmware image could not be loaded.
    #[error("Image error: {0}")]
    Image(String),

    /// Version tag is corrupt.
    #[error("Version error: {0}")]
    Version(#[from] VersionError),

    /// Module version differs from the image version after an update.
    #[error("Verify mismatch: phone {phone}, module {module}")]
    VerifyMismatch {
        /// Version carried by the firmware image.
        phone: String,
        /// Version reported by the module after the update.
        module: String,
    },

    /// Firmware buffer allocation failed.
    #[error("Out of memory allocating {requested} bytes")]
    OutOfMemory {
        /// Requested buffer size.
        requested: usize,
    },

    /// Malformed response or invalid argument at the protocol layer.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A bootloader command was issued without a synced session.
    #[error("Bootloader session not connected")]
    NotConnected,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the error came from the target not acknowledging in time
    /// (NACK, busy or timeout), as opposed to a local failure.
    pub fn is_no_ack(&self) -> bool {
        matches!(self, Self::Nack { .. } | Self::Busy | Self::Timeout(_))
    }

    /// Payload-free category of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Link(_) => ErrorKind::Link,
            Self::Io(_) => ErrorKind::Io,
            Self::Nack { .. } => ErrorKind::Nack,
            Self::Busy => ErrorKind::Busy,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Address(_) => ErrorKind::Address,
            Self::Image(_) => ErrorKind::Image,
            Self::Version(_) => ErrorKind::Version,
            Self::VerifyMismatch { .. } => ErrorKind::VerifyMismatch,
            Self::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}

/// Error category, kept after the error itself has been logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ErrorKind {
    Link,
    Io,
    Nack,
    Busy,
    Timeout,
    Address,
    Image,
    Version,
    VerifyMismatch,
    OutOfMemory,
    Protocol,
    NotConnected,
    Config,
}

/// Errors from converting an address range into flash pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddressError {
    /// Start address or end of the range does not fall on a page boundary.
    #[error("range {address:#010x}+{length:#x} is not aligned to flash pages")]
    Unaligned {
        /// Requested start address.
        address: u32,
        /// Requested length in bytes.
        length: u32,
    },
}

/// Errors from validating a version tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VersionError {
    /// A byte of the tag is not an ASCII letter or digit.
    #[error("byte {byte:#04x} at index {index} is not alphanumeric")]
    NonAlphanumeric {
        /// Position in the tag.
        index: usize,
        /// Offending byte.
        byte: u8,
    },

    /// The tag is not exactly eight bytes.
    #[error("expected 8 bytes, got {0}")]
    Length(usize),
}
