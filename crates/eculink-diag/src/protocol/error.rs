//! Diagnostic protocol errors

use thiserror::Error;

use super::NegativeResponseCode;

#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    #[error("Negative response: {nrc} (0x{nrc:02X}) for service 0x{service_id:02X}")]
    NegativeResponse {
        service_id: u8,
        nrc: NegativeResponseCode,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Response timeout")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Security access failed: {0}")]
    SecurityAccessFailed(String),

    #[error("Session transition failed: {0}")]
    SessionTransitionFailed(String),

    #[error("Element address out of protocol range: {0}")]
    AddressRange(String),

    #[error("Operation not supported by this protocol: {0}")]
    Unsupported(String),
}

impl ProtocolError {
    /// NRC carried by this error, if the device reported one.
    pub fn nrc(&self) -> Option<NegativeResponseCode> {
        match self {
            Self::NegativeResponse { nrc, .. } => Some(*nrc),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<crate::transport::TransportError> for ProtocolError {
    fn from(e: crate::transport::TransportError) -> Self {
        match e {
            crate::transport::TransportError::Timeout(_) => Self::Timeout,
            other => Self::Transport(other.to_string()),
        }
    }
}
