//! TCP dispatcher for Ethernet-attached nodes.
//!
//! Wire format is a 4-byte big-endian length prefix followed by the service
//! payload. Unsolicited pushes and responses share one inbound stream; the
//! response matcher filters by service id. Ethernet segments carry no raw
//! CAN frames, so the monitoring plane stays empty here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use super::{BusDispatcher, BusFrame, DispatcherKind, ServiceEvent, TransportError};
use crate::config::TcpDispatcherConfig;

const MAX_CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY_MS: u64 = 1000;
/// Upper bound on a single service payload; anything larger is a framing error.
const MAX_PAYLOAD_LEN: usize = 4096;

pub struct TcpDispatcher {
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    open: Arc<AtomicBool>,
    incoming_tx: broadcast::Sender<ServiceEvent>,
    frame_tx: broadcast::Sender<BusFrame>,
    reader_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TcpDispatcher {
    /// Connect to the node and start the inbound reader.
    pub async fn new(config: &TcpDispatcherConfig) -> Result<Self, TransportError> {
        let addr = format!("{}:{}", config.host, config.port);
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);

        let mut last_error = TransportError::ConnectionFailed("no attempt".to_string());
        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            match Self::connect(&addr, connect_timeout).await {
                Ok(dispatcher) => {
                    info!(%addr, attempt, "tcp dispatcher connected");
                    return Ok(dispatcher);
                }
                Err(e) => {
                    warn!(%addr, attempt, error = %e, "tcp connect failed");
                    last_error = e;
                    if attempt < MAX_CONNECT_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(CONNECT_RETRY_DELAY_MS)).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn connect(addr: &str, timeout: Duration) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout("connect timeout".to_string()))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (read_half, write_half) = stream.into_split();
        let (incoming_tx, _) = broadcast::channel(256);
        let (frame_tx, _) = broadcast::channel(16);

        let open = Arc::new(AtomicBool::new(true));
        let started = Instant::now();

        let handle = tokio::spawn(Self::reader_loop(
            read_half,
            incoming_tx.clone(),
            open.clone(),
            started,
        ));

        Ok(Self {
            writer: Arc::new(Mutex::new(Some(write_half))),
            open,
            incoming_tx,
            frame_tx,
            reader_handle: Mutex::new(Some(handle)),
        })
    }

    async fn reader_loop(
        mut read_half: OwnedReadHalf,
        incoming_tx: broadcast::Sender<ServiceEvent>,
        open: Arc<AtomicBool>,
        started: Instant,
    ) {
        loop {
            let mut len_buf = [0u8; 4];
            match read_half.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("tcp peer closed connection");
                    open.store(false, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    error!(error = %e, "tcp read failed");
                    open.store(false, Ordering::SeqCst);
                    break;
                }
            }

            let len = u32::from_be_bytes(len_buf) as usize;
            if len == 0 || len > MAX_PAYLOAD_LEN {
                error!(len, "tcp framing violated, dropping connection");
                open.store(false, Ordering::SeqCst);
                break;
            }

            let mut payload = vec![0u8; len];
            if let Err(e) = read_half.read_exact(&mut payload).await {
                error!(error = %e, "tcp body read failed");
                open.store(false, Ordering::SeqCst);
                break;
            }

            let event = ServiceEvent {
                payload,
                timestamp_us: started.elapsed().as_micros() as u64,
            };
            let _ = incoming_tx.send(event);
        }
    }

    async fn write_payload(&self, payload: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;

        let len = payload.len() as u32;
        writer
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        writer
            .write_all(payload)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    /// Wait for the response matching `sid`. Negative responses are returned
    /// to the caller unchanged; retry handling lives above the transport.
    async fn wait_for_response(
        &self,
        mut rx: broadcast::Receiver<ServiceEvent>,
        sid: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let expected = sid.wrapping_add(0x40);
        let start = Instant::now();

        loop {
            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(TransportError::Timeout("response timeout".to_string()));
            }

            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(event)) => match event.payload.first() {
                    Some(&first) if first == expected => return Ok(event.payload),
                    Some(0x7F) if event.payload.get(1) == Some(&sid) => {
                        return Ok(event.payload);
                    }
                    _ => continue,
                },
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(skipped, "tcp inbound lagged while waiting for response");
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(TransportError::Closed);
                }
                Err(_) => return Err(TransportError::Timeout("response timeout".to_string())),
            }
        }
    }
}

#[async_trait]
impl BusDispatcher for TcpDispatcher {
    async fn send_receive(
        &self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        // Subscribe before the write so the response cannot slip past.
        let rx = self.incoming_tx.subscribe();
        self.write_payload(request).await?;
        self.wait_for_response(rx, request.first().copied().unwrap_or(0), timeout)
            .await
    }

    async fn send(&self, request: &[u8]) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.write_payload(request).await
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
        if let Some(handle) = self.reader_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        Ok(())
    }

    fn kind(&self) -> DispatcherKind {
        DispatcherKind::Ethernet
    }
}

impl Drop for TcpDispatcher {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
