//! Common error type for the diagnostic driver stack

use thiserror::Error;

use crate::element::ContentError;
use crate::routing::RoutingError;

/// Result type for driver operations
pub type ComResult<T> = Result<T, ComError>;

/// Errors that can occur while setting up or running diagnostics
#[derive(Debug, Error)]
pub enum ComError {
    /// The view has no active node with a diagnostic-capable interface
    #[error("No active diagnostic-capable nodes in the view")]
    NoActiveNodes,

    /// Invalid system snapshot or view configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bus or transport could not be brought up
    #[error("Bus initialization failed: {0}")]
    BusInit(String),

    /// No usable diagnostic route to a target node
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Element content could not be converted or packed
    #[error("Content error: {0}")]
    Content(#[from] ContentError),

    /// Send or receive failure on the wire
    #[error("Transport error: {0}")]
    Transport(String),

    /// Timeout waiting for a device response
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Device rejected a request with a negative response
    #[error("Negative response from '{node}': NRC 0x{nrc:02X} for service 0x{service:02X}")]
    NegativeResponse {
        /// Negative response code sent by the device
        nrc: u8,
        /// Service ID that was rejected
        service: u8,
        /// Name of the responding node
        node: String,
    },

    /// Stored and freshly computed checksums disagree
    #[error("Checksum mismatch: {0}")]
    Checksum(String),

    /// A consumer queue overflowed and updates were dropped
    #[error("Overflow: {0}")]
    Overflow(String),

    /// An exclusive resource is already in use
    #[error("Resource busy: {0}")]
    Busy(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ComError {
    /// Whether the error originates from the target device rather than
    /// from the tool side. Device-reported errors keep the session alive;
    /// tool-side errors usually mean setup or wiring is broken.
    pub fn is_device_reported(&self) -> bool {
        matches!(self, ComError::NegativeResponse { .. })
    }
}
