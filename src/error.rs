//! Error types for the STC ISP engine.

use std::io;

use thiserror::Error;

/// Result type for ISP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ISP operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed packet envelope or checksum mismatch.
    #[error("Framing error: {0}")]
    Framing(String),

    /// Correctly framed reply with unexpected content.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Short read on the transport.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The BSL refuses to talk until the device is mass-erased.
    #[error("MCU is locked")]
    Locked,

    /// USB support is not compiled in or libusb cannot be used.
    #[error("USB support not available: {0}")]
    UsbUnavailable(String),

    /// The embedding application asked to stop waiting for the MCU.
    #[error("Operation cancelled")]
    Cancelled,

    /// Unknown option name or bad option value.
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// USB error.
    #[cfg(feature = "usb")]
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// The embedded model table is broken.
    #[error("Model database error: {0}")]
    ModelDatabase(#[from] serde_yaml::Error),
}

impl Error {
    pub(crate) fn framing(msg: impl Into<String>) -> Self {
        Error::Framing(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Framing errors and timeouts are expected while the MCU is still
    /// booting; anything else aborts synchronization.
    pub fn is_retryable_during_sync(&self) -> bool {
        matches!(self, Error::Framing(_) | Error::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_framing_and_timeout_are_retryable() {
        assert!(Error::framing("x").is_retryable_during_sync());
        assert!(Error::Timeout("x".into()).is_retryable_during_sync());
        assert!(!Error::protocol("x").is_retryable_during_sync());
        assert!(!Error::Locked.is_retryable_during_sync());
        assert!(!Error::Cancelled.is_retryable_during_sync());
    }
}
