//! Mock dispatcher for testing

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::{BusDispatcher, BusFrame, DispatcherKind, ServiceEvent, TransportError};
use crate::config::MockDispatcherConfig;

/// Mock dispatcher with scripted request/response pairs.
///
/// Tests script the diagnostic plane with [`push_response`](Self::push_response)
/// and feed the monitoring/event planes with `inject_*`. Every sent request
/// is recorded so tests can assert what went out on the wire.
pub struct MockDispatcher {
    config: MockDispatcherConfig,
    open: AtomicBool,
    /// When set, `send_receive` times out instead of answering.
    silent: AtomicBool,
    started: Instant,
    frame_tx: broadcast::Sender<BusFrame>,
    event_tx: broadcast::Sender<ServiceEvent>,
    /// Scripted responses (request prefix -> response)
    responses: RwLock<Vec<(Vec<u8>, Vec<u8>)>>,
    /// One-shot responses, consumed in order before the persistent set
    once: RwLock<Vec<(Vec<u8>, Vec<u8>)>>,
    sent: RwLock<Vec<Vec<u8>>>,
}

impl MockDispatcher {
    pub fn new(config: &MockDispatcherConfig) -> Self {
        let (frame_tx, _) = broadcast::channel(256);
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config: config.clone(),
            open: AtomicBool::new(true),
            silent: AtomicBool::new(false),
            started: Instant::now(),
            frame_tx,
            event_tx,
            responses: RwLock::new(Self::default_responses()),
            once: RwLock::new(Vec::new()),
            sent: RwLock::new(Vec::new()),
        }
    }

    /// Script a response; later entries win over the built-in defaults.
    pub fn push_response(&self, request: Vec<u8>, response: Vec<u8>) {
        self.responses.write().insert(0, (request, response));
    }

    /// Script a response consumed by its first matching request. One-shots
    /// win over persistent entries, which makes retry sequences scriptable.
    pub fn push_response_once(&self, request: Vec<u8>, response: Vec<u8>) {
        self.once.write().push((request, response));
    }

    /// Simulate a raw frame arriving on the segment.
    pub fn inject_frame(&self, frame: BusFrame) {
        let _ = self.frame_tx.send(frame);
    }

    /// Simulate an unsolicited diagnostic-plane push (rail value).
    pub fn inject_event(&self, payload: Vec<u8>) {
        let event = ServiceEvent {
            payload,
            timestamp_us: self.started.elapsed().as_micros() as u64,
        };
        let _ = self.event_tx.send(event);
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Stop answering requests; `send_receive` reports a timeout.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Everything sent through this dispatcher, in order.
    pub fn sent_requests(&self) -> Vec<Vec<u8>> {
        self.sent.read().clone()
    }

    fn default_responses() -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![
            // Session control - default (0x10 01 -> 0x50 01)
            (vec![0x10, 0x01], vec![0x50, 0x01, 0x00, 0x32, 0x01, 0xF4]),
            // Session control - extended (0x10 03 -> 0x50 03)
            (vec![0x10, 0x03], vec![0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]),
            // Security access - zero seed means already unlocked
            (vec![0x27], vec![0x67, 0x01, 0x00, 0x00, 0x00, 0x00]),
            // Tester present, suppressed positive response
            (vec![0x3E, 0x80], vec![]),
        ]
    }

    fn find_response(&self, request: &[u8]) -> Option<Vec<u8>> {
        {
            let mut once = self.once.write();
            if let Some(pos) = once.iter().position(|(req, _)| request.starts_with(req)) {
                return Some(once.remove(pos).1);
            }
        }

        let responses = self.responses.read();

        for (req, resp) in responses.iter() {
            if req.as_slice() == request {
                return Some(resp.clone());
            }
        }

        for (req, resp) in responses.iter() {
            if request.starts_with(req) {
                return Some(resp.clone());
            }
        }

        // Minimal positive response for anything unscripted
        request
            .first()
            .map(|sid| vec![sid.wrapping_add(0x40)])
    }

    async fn simulate_latency(&self) {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
    }
}

#[async_trait]
impl BusDispatcher for MockDispatcher {
    async fn send_receive(
        &self,
        request: &[u8],
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.simulate_latency().await;
        self.sent.write().push(request.to_vec());

        if self.silent.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout("no response".to_string()));
        }

        self.find_response(request)
            .ok_or_else(|| TransportError::ReceiveFailed("no mock response scripted".to_string()))
    }

    async fn send(&self, request: &[u8]) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.simulate_latency().await;
        self.sent.write().push(request.to_vec());
        tracing::debug!(request = %hex::encode(request), "mock dispatcher sent");
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.event_tx.subscribe()
    }

    fn subscribe_frames(&self) -> broadcast::Receiver<BusFrame> {
        self.frame_tx.subscribe()
    }

    async fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn kind(&self) -> DispatcherKind {
        DispatcherKind::Mock
    }
}
