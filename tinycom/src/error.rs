//! Error types for tinycom.

use std::io;
use thiserror::Error;

/// Result type for tinycom operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for tinycom operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (log file, port handle).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error reported by the native serial driver.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Port enumeration is not implemented for this operating system.
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// The port could not be opened (missing device, permission, rejected setting).
    #[error("Failed to open {port}: {reason}")]
    PortOpen {
        /// Port name/path.
        port: String,
        /// Driver or backend message.
        reason: String,
    },

    /// Transient I/O failure on an open port.
    #[error("Serial I/O error: {0}")]
    PortIo(String),

    /// A write timed out, hit a removed device, or targeted a closed session.
    #[error("Serial write error: {0}")]
    Write(String),

    /// Hex-mode input was not an even-length string of hex digits.
    #[error("Invalid hex input: {0}")]
    InvalidHex(String),

    /// The background reader stopped on an error.
    #[error("Serial read error: {0}")]
    ReadLoop(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build a [`Error::PortOpen`] for the given port.
    pub fn port_open(port: impl Into<String>, reason: impl ToString) -> Self {
        Self::PortOpen {
            port: port.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error came from opening a port rather than using one.
    pub fn is_open_failure(&self) -> bool {
        matches!(self, Self::PortOpen { .. })
    }
}
