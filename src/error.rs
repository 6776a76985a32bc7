//! Error types for the ble-host library
//!
//! Two classes of failure are distinguished: programmer errors (contract
//! violations by the embedder, surfaced as [`Error::InvalidArgument`]) and
//! protocol errors (carried as ATT error codes on the operations that can
//! produce them).

use thiserror::Error;

/// Errors that can occur in the HCI layer
#[derive(Error, Debug)]
pub enum HciError {
    #[error("Invalid HCI packet format")]
    InvalidPacketFormat,

    #[error("Controller reported hardware error: 0x{0:02X}")]
    HardwareError(u8),

    #[error("Adapter is stopped")]
    Stopped,
}

/// General errors that can occur in the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("HCI error: {0}")]
    Hci(#[from] HciError),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection is shutting down")]
    Disconnecting,

    #[error("Operation already in progress")]
    Busy,

    #[error("Peer has not enabled the required subscription")]
    NotSubscribed,
}

impl Error {
    /// Shorthand for the fail-fast contract-violation class
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}
