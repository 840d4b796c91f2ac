//! Transport layer for diagnostic communication
//!
//! This module provides bus dispatchers for talking to nodes:
//! - SocketCAN dispatcher for CAN/ISO-TP (Linux only)
//! - TCP dispatcher for Ethernet-attached nodes
//! - Mock dispatcher for testing
//!
//! Each dispatcher carries two inbound planes: the diagnostic plane
//! (responses and unsolicited value pushes, segmented messages) and the
//! monitoring plane (raw frames, CAN only).
//!
//! # Example
//!
//! ```ignore
//! use eculink_diag::transport::{create_dispatcher, BusDispatcher};
//! use eculink_diag::config::TransportConfig;
//!
//! let config = TransportConfig::Mock(Default::default());
//! let dispatcher = create_dispatcher(&config).await?;
//! let response = dispatcher.send_receive(&[0x10, 0x03], Duration::from_secs(1)).await?;
//! ```

mod dispatcher;
pub mod error;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub mod tcp;

pub use dispatcher::{BusDispatcher, BusFrame, DispatcherKind, ServiceEvent};
pub use error::TransportError;

use std::sync::Arc;

use crate::config::TransportConfig;

/// Create a bus dispatcher based on configuration
pub async fn create_dispatcher(
    config: &TransportConfig,
) -> Result<Arc<dyn BusDispatcher>, TransportError> {
    match config {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        TransportConfig::SocketCan(cfg) => {
            let dispatcher = socketcan::SocketCanDispatcher::new(cfg).await?;
            Ok(Arc::new(dispatcher))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        TransportConfig::SocketCan(_) => Err(TransportError::Unsupported(
            "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
        )),
        TransportConfig::Tcp(cfg) => {
            let dispatcher = tcp::TcpDispatcher::new(cfg).await?;
            Ok(Arc::new(dispatcher))
        }
        TransportConfig::Mock(cfg) => {
            let dispatcher = mock::MockDispatcher::new(cfg);
            Ok(Arc::new(dispatcher))
        }
    }
}
