//! Bus dispatcher trait and frame types

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::TransportError;

/// One raw frame on a CAN segment.
///
/// Carried on the monitoring plane for signal consumers. `timestamp_us` is
/// microseconds since the dispatcher was opened, monotonic per dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusFrame {
    pub id: u32,
    pub extended: bool,
    pub dlc: u8,
    pub data: [u8; 8],
    pub timestamp_us: u64,
}

impl BusFrame {
    /// Build a frame from a payload slice; at most 8 bytes are taken.
    pub fn new(id: u32, payload: &[u8]) -> Self {
        let take = payload.len().min(8);
        let mut data = [0u8; 8];
        data[..take].copy_from_slice(&payload[..take]);
        Self {
            id,
            extended: false,
            dlc: take as u8,
            data,
            timestamp_us: 0,
        }
    }

    pub fn extended(mut self, extended: bool) -> Self {
        self.extended = extended;
        self
    }

    pub fn at(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    /// The valid payload bytes, bounded by the DLC.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.dlc.min(8) as usize]
    }
}

/// One unsolicited diagnostic-plane message (rail value push).
///
/// The transport sublayer reassembles segmented messages before delivery;
/// payload length is unbounded here.
#[derive(Debug, Clone)]
pub struct ServiceEvent {
    pub payload: Vec<u8>,
    pub timestamp_us: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherKind {
    Can,
    Ethernet,
    Mock,
}

/// Transport-agnostic bus access for the diagnostic driver.
///
/// Implementations carry two planes of traffic:
/// - the diagnostic plane: request/response service messages plus
///   unsolicited pushes, with segmentation handled below this interface;
/// - the monitoring plane: every raw frame seen on the segment, for CAN
///   signal consumers. Dispatchers without raw frame access (Ethernet)
///   simply never publish frames.
///
/// Physical bus access is serialized inside the implementation; the driver
/// issues concurrent sends from the cycling and polling contexts and relies
/// on that.
#[async_trait]
pub trait BusDispatcher: Send + Sync {
    /// Send a service request and wait for the matching response.
    async fn send_receive(
        &self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Send a service message without waiting for a response.
    ///
    /// Used for tester present with suppressed positive response.
    async fn send(&self, request: &[u8]) -> Result<(), TransportError>;

    /// Subscribe to unsolicited diagnostic-plane messages.
    fn subscribe_events(&self) -> broadcast::Receiver<ServiceEvent>;

    /// Subscribe to raw frames on the monitoring plane.
    fn subscribe_frames(&self) -> broadcast::Receiver<BusFrame>;

    async fn is_open(&self) -> bool;

    /// Close the dispatcher; subsequent sends fail with [`TransportError::Closed`].
    async fn close(&self) -> Result<(), TransportError>;

    fn kind(&self) -> DispatcherKind;
}
