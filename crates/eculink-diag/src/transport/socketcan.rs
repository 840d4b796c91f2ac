//! SocketCAN dispatcher (Linux only).
//!
//! Runs two sockets per segment: an ISO-TP socket for the diagnostic plane
//! and a raw CAN socket feeding the monitoring plane. Both are blocking
//! kernel sockets, so reads run on dedicated blocking threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use socketcan::{CanSocket, EmbeddedFrame, ExtendedId, Frame, Id, Socket, StandardId};
use socketcan_isotp::IsoTpSocket;
use tokio::sync::broadcast::{self, error as broadcast_error};
use tokio::task::JoinHandle;

use super::{BusDispatcher, BusFrame, DispatcherKind, ServiceEvent, TransportError};
use crate::config::SocketCanDispatcherConfig;

pub struct SocketCanDispatcher {
    socket: Arc<Mutex<IsoTpSocket>>,
    open: AtomicBool,
    stop: Arc<AtomicBool>,
    started: Instant,
    incoming_tx: broadcast::Sender<ServiceEvent>,
    frame_tx: broadcast::Sender<BusFrame>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SocketCanDispatcher {
    pub async fn new(config: &SocketCanDispatcherConfig) -> Result<Self, TransportError> {
        let tx_id = parse_can_id(&config.tx_id)?;
        let rx_id = parse_can_id(&config.rx_id)?;

        let mut socket = Self::create_isotp_socket(&config.interface, tx_id, rx_id)?;
        Self::drain_socket(&mut socket);

        let (incoming_tx, _) = broadcast::channel(1024);
        let (frame_tx, _) = broadcast::channel(1024);

        let dispatcher = Self {
            socket: Arc::new(Mutex::new(socket)),
            open: AtomicBool::new(true),
            stop: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
            incoming_tx,
            frame_tx,
            listener_handle: Mutex::new(None),
            monitor_handle: Mutex::new(None),
        };

        dispatcher.start_service_listener();
        dispatcher.start_monitor(&config.interface)?;

        Ok(dispatcher)
    }

    fn create_isotp_socket(
        interface: &str,
        tx_id: u32,
        rx_id: u32,
    ) -> Result<IsoTpSocket, TransportError> {
        let socket = IsoTpSocket::open(interface, to_can_id(rx_id)?, to_can_id(tx_id)?)
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("Failed to open ISO-TP socket: {}", e))
            })?;

        socket.set_nonblocking(true).map_err(|e| {
            TransportError::InvalidConfig(format!("Failed to set non-blocking: {}", e))
        })?;

        Ok(socket)
    }

    /// Clear stale messages left over from a previous session.
    fn drain_socket(socket: &mut IsoTpSocket) {
        loop {
            match socket.read() {
                Ok(data) if !data.is_empty() => {
                    tracing::debug!(data = ?data, "drained stale message from socket");
                }
                Ok(_) | Err(_) => break,
            }
        }
    }

    fn start_service_listener(&self) {
        let socket = self.socket.clone();
        let incoming_tx = self.incoming_tx.clone();
        let stop = self.stop.clone();
        let started = self.started;

        let handle = tokio::task::spawn_blocking(move || {
            while !stop.load(Ordering::SeqCst) {
                let mut socket_guard = socket.lock();
                match socket_guard.read() {
                    Ok(data) if !data.is_empty() => {
                        let event = ServiceEvent {
                            payload: data.to_vec(),
                            timestamp_us: started.elapsed().as_micros() as u64,
                        };
                        let _ = incoming_tx.send(event);
                    }
                    Ok(_) => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        tracing::error!(?e, "ISO-TP read error");
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
                drop(socket_guard);
            }
            tracing::debug!("ISO-TP listener stopped");
        });

        *self.listener_handle.lock() = Some(handle);
    }

    /// Raw socket feeding the monitoring plane. Sees every frame on the
    /// segment, including our own diagnostic traffic.
    fn start_monitor(&self, interface: &str) -> Result<(), TransportError> {
        let raw = CanSocket::open(interface).map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "Failed to open raw CAN socket on {}: {}",
                interface, e
            ))
        })?;
        raw.set_nonblocking(true).map_err(|e| {
            TransportError::InvalidConfig(format!("Failed to set non-blocking: {}", e))
        })?;

        let frame_tx = self.frame_tx.clone();
        let stop = self.stop.clone();
        let started = self.started;

        let handle = tokio::task::spawn_blocking(move || {
            while !stop.load(Ordering::SeqCst) {
                match raw.read_frame() {
                    Ok(frame) => {
                        let bus_frame = BusFrame::new(frame.raw_id(), frame.data())
                            .extended(frame.is_extended())
                            .at(started.elapsed().as_micros() as u64);
                        let _ = frame_tx.send(bus_frame);
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        tracing::error!(?e, "raw CAN read error");
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            tracing::debug!("CAN monitor stopped");
        });

        *self.monitor_handle.lock() = Some(handle);
        Ok(())
    }
}

#[async_trait]
impl BusDispatcher for SocketCanDispatcher {
    async fn send_receive(
        &self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        // Subscribe before sending so the response cannot slip past.
        let mut rx = self.incoming_tx.subscribe();
        self.send(request).await?;

        let request_sid = request.first().copied().unwrap_or(0);
        let expected_positive = request_sid.wrapping_add(0x40);
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout("response timeout".to_string()));
            }

            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(event)) => {
                    if let Some(&first) = event.payload.first() {
                        if first == expected_positive {
                            return Ok(event.payload);
                        }
                        if first == 0x7F && event.payload.get(1) == Some(&request_sid) {
                            return Ok(event.payload);
                        }
                        // Different message (periodic push), keep waiting
                        tracing::debug!(
                            data = ?event.payload,
                            expected = expected_positive,
                            "ignoring non-matching response"
                        );
                    }
                }
                Ok(Err(broadcast_error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast_error::RecvError::Closed)) => {
                    return Err(TransportError::Closed);
                }
                Err(_) => {
                    return Err(TransportError::Timeout("response timeout".to_string()));
                }
            }
        }
    }

    async fn send(&self, request: &[u8]) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let socket = self.socket.clone();
        let request = request.to_vec();

        tokio::task::spawn_blocking(move || {
            let socket_guard = socket.lock();
            socket_guard
                .write(&request)
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        })
        .await
        .map_err(|e| TransportError::SendFailed(format!("Task join error: {}", e)))??;

        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.incoming_tx.subscribe()
    }

    fn subscribe_frames(&self) -> broadcast::Receiver<BusFrame> {
        self.frame_tx.subscribe()
    }

    async fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.listener_handle.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.monitor_handle.lock().take() {
            handle.abort();
        }
        Ok(())
    }

    fn kind(&self) -> DispatcherKind {
        DispatcherKind::Can
    }
}

impl Drop for SocketCanDispatcher {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn to_can_id(raw: u32) -> Result<Id, TransportError> {
    if raw <= 0x7FF {
        StandardId::new(raw as u16)
            .map(Id::Standard)
            .ok_or_else(|| {
                TransportError::InvalidConfig(format!("Invalid standard CAN ID: 0x{:X}", raw))
            })
    } else {
        ExtendedId::new(raw).map(Id::Extended).ok_or_else(|| {
            TransportError::InvalidConfig(format!("Invalid extended CAN ID: 0x{:X}", raw))
        })
    }
}

/// Parse a CAN ID from string (supports hex with 0x prefix)
fn parse_can_id(s: &str) -> Result<u32, TransportError> {
    let s = s.trim();
    let (s, radix) = if s.starts_with("0x") || s.starts_with("0X") {
        (&s[2..], 16)
    } else {
        (s, 10)
    };

    u32::from_str_radix(s, radix)
        .map_err(|e| TransportError::InvalidConfig(format!("Invalid CAN ID '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_and_decimal_ids() {
        assert_eq!(parse_can_id("0x18DA01F1").unwrap(), 0x18DA01F1);
        assert_eq!(parse_can_id("291").unwrap(), 291);
        assert!(parse_can_id("garbage").is_err());
    }

    #[test]
    fn standard_and_extended_ids_split_at_11_bits() {
        assert!(matches!(to_can_id(0x123).unwrap(), Id::Standard(_)));
        assert!(matches!(to_can_id(0x18DA01F1).unwrap(), Id::Extended(_)));
        assert!(to_can_id(0xFFFF_FFFF).is_err());
    }
}
