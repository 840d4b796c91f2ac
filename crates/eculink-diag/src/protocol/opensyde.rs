//! openSYDE-style protocol services
//!
//! Element access, rail control and NVM services for nodes speaking the
//! full diagnostic service set. One instance per active node.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use eculink_core::ElementId;

use super::{
    rail_sub_function, service_id, session_kind, DataPoolMeta, NegativeResponseCode, PackedElement,
    ProtocolError, RailValue,
};
use crate::transport::{BusDispatcher, ServiceEvent};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
const RESPONSE_PENDING_TIMEOUT: Duration = Duration::from_millis(30000);

pub struct OpenSydeProtocol {
    dispatcher: Arc<dyn BusDispatcher>,
    timeout: Duration,
    security_level: u8,
    /// Inbound diagnostic-plane events, drained on each cycle.
    events: Mutex<broadcast::Receiver<ServiceEvent>>,
}

impl OpenSydeProtocol {
    pub fn new(dispatcher: Arc<dyn BusDispatcher>, security_level: u8) -> Self {
        let events = Mutex::new(dispatcher.subscribe_events());
        Self {
            dispatcher,
            timeout: DEFAULT_TIMEOUT,
            security_level,
            events,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn dispatcher(&self) -> &Arc<dyn BusDispatcher> {
        &self.dispatcher
    }

    /// Send a request and handle response pending.
    async fn send_request(&self, request: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let start = std::time::Instant::now();

        loop {
            let response = self.dispatcher.send_receive(request, self.timeout).await?;

            if response.first() == Some(&service_id::NEGATIVE_RESPONSE) {
                if response.len() < 3 {
                    return Err(ProtocolError::InvalidResponse(
                        "Negative response too short".to_string(),
                    ));
                }

                let service_id = response[1];
                let nrc = NegativeResponseCode::from(response[2]);

                // Node needs more time, poll again
                if nrc == NegativeResponseCode::ResponsePending {
                    if start.elapsed() > RESPONSE_PENDING_TIMEOUT {
                        return Err(ProtocolError::Timeout);
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }

                return Err(ProtocolError::NegativeResponse { service_id, nrc });
            }

            return Ok(response);
        }
    }

    /// Session control (0x10)
    async fn session_control(&self, session: u8) -> Result<(), ProtocolError> {
        let request = vec![service_id::DIAGNOSTIC_SESSION_CONTROL, session];
        let response = self.send_request(&request).await?;

        if response.len() < 2 || response[1] != session {
            return Err(ProtocolError::SessionTransitionFailed(format!(
                "unexpected session control response: {}",
                hex::encode(&response)
            )));
        }
        Ok(())
    }

    /// Security access (0x27): request seed, then send the derived key.
    ///
    /// A node reporting an all-zero seed is already unlocked and expects
    /// no key.
    async fn security_unlock(&self) -> Result<(), ProtocolError> {
        if self.security_level == 0 {
            return Ok(());
        }
        let seed_sub = self.security_level * 2 - 1;
        let request = vec![service_id::SECURITY_ACCESS, seed_sub];
        let response = self.send_request(&request).await?;

        if response.len() < 3 {
            return Err(ProtocolError::SecurityAccessFailed(
                "seed response too short".to_string(),
            ));
        }
        let seed = &response[2..];

        if seed.iter().all(|&b| b == 0) {
            debug!(level = self.security_level, "node already unlocked");
            return Ok(());
        }

        let key = derive_key(seed);
        let key_sub = self.security_level * 2;
        let mut request = vec![service_id::SECURITY_ACCESS, key_sub];
        request.extend_from_slice(&key);

        self.send_request(&request).await?;
        Ok(())
    }

    /// Enter the extended session and unlock the configured security level.
    pub async fn enter_diagnostic(&self) -> Result<(), ProtocolError> {
        self.session_control(session_kind::EXTENDED).await?;
        self.security_unlock().await
    }

    pub async fn return_to_default_session(&self) -> Result<(), ProtocolError> {
        self.session_control(session_kind::DEFAULT).await
    }

    /// Tester present (0x3E) with suppressed positive response.
    pub async fn tester_present(&self) -> Result<(), ProtocolError> {
        let request = vec![service_id::TESTER_PRESENT, 0x80];
        self.dispatcher.send(&request).await?;
        Ok(())
    }

    /// Set the transmission interval of one rail (0x2A 0x01).
    pub async fn set_rail_rate(&self, rail: u8, interval_ms: u16) -> Result<(), ProtocolError> {
        let mut request = vec![
            service_id::RAIL_CONTROL,
            rail_sub_function::SET_RATE,
            rail,
        ];
        request.extend_from_slice(&interval_ms.to_be_bytes());
        self.send_request(&request).await?;
        Ok(())
    }

    /// Register an element for cyclic transmission (0x2A 0x02).
    pub async fn register_cyclic(&self, rail: u8, element: &ElementId) -> Result<(), ProtocolError> {
        let packed = PackedElement::try_from_id(element)?;
        let mut request = vec![
            service_id::RAIL_CONTROL,
            rail_sub_function::REGISTER_CYCLIC,
            rail,
        ];
        packed.write_to(&mut request);
        self.send_request(&request).await?;
        Ok(())
    }

    /// Register an element for change-driven transmission (0x2A 0x03).
    ///
    /// The threshold travels as four little-endian bytes regardless of the
    /// element's width.
    pub async fn register_on_change(
        &self,
        rail: u8,
        element: &ElementId,
        threshold_le: [u8; 4],
    ) -> Result<(), ProtocolError> {
        let packed = PackedElement::try_from_id(element)?;
        let mut request = vec![
            service_id::RAIL_CONTROL,
            rail_sub_function::REGISTER_ON_CHANGE,
            rail,
        ];
        packed.write_to(&mut request);
        request.extend_from_slice(&threshold_le);
        self.send_request(&request).await?;
        Ok(())
    }

    /// Stop every transmission on the node (0x2A 0x04).
    pub async fn stop_all_transmissions(&self) -> Result<(), ProtocolError> {
        let request = vec![service_id::RAIL_CONTROL, rail_sub_function::STOP_ALL];
        self.send_request(&request).await?;
        Ok(())
    }

    /// Read one element value (0x22). Returns the raw big-endian bytes.
    pub async fn read_element(&self, element: &ElementId) -> Result<Vec<u8>, ProtocolError> {
        let packed = PackedElement::try_from_id(element)?;
        let mut request = vec![service_id::READ_ELEMENT];
        packed.write_to(&mut request);

        let response = self.send_request(&request).await?;
        let value = parse_addressed_response(&response, service_id::READ_ELEMENT, &packed)?;
        if value.is_empty() {
            return Err(ProtocolError::InvalidResponse(
                "read response carries no value".to_string(),
            ));
        }
        Ok(value.to_vec())
    }

    /// Write one element value (0x2E). `raw` is big endian.
    pub async fn write_element(&self, element: &ElementId, raw: &[u8]) -> Result<(), ProtocolError> {
        let packed = PackedElement::try_from_id(element)?;
        let mut request = vec![service_id::WRITE_ELEMENT];
        packed.write_to(&mut request);
        request.extend_from_slice(raw);

        let response = self.send_request(&request).await?;
        parse_addressed_response(&response, service_id::WRITE_ELEMENT, &packed)?;
        Ok(())
    }

    /// Read NVM memory (0x23).
    pub async fn read_memory(&self, address: u32, len: u16) -> Result<Vec<u8>, ProtocolError> {
        let mut request = vec![service_id::READ_MEMORY_BY_ADDRESS];
        request.extend_from_slice(&address.to_be_bytes());
        request.extend_from_slice(&len.to_be_bytes());

        let response = self.send_request(&request).await?;
        if response.len() != 1 + len as usize {
            return Err(ProtocolError::InvalidResponse(format!(
                "memory read returned {} bytes, expected {}",
                response.len().saturating_sub(1),
                len
            )));
        }
        Ok(response[1..].to_vec())
    }

    /// Write NVM memory (0x3D).
    pub async fn write_memory(&self, address: u32, data: &[u8]) -> Result<(), ProtocolError> {
        let mut request = vec![service_id::WRITE_MEMORY_BY_ADDRESS];
        request.extend_from_slice(&address.to_be_bytes());
        request.extend_from_slice(data);

        let response = self.send_request(&request).await?;
        if response.len() < 5 || response[1..5] != address.to_be_bytes() {
            return Err(ProtocolError::InvalidResponse(
                "memory write response does not echo the address".to_string(),
            ));
        }
        Ok(())
    }

    /// Read data pool metadata (0xBA): version, definition checksum, name.
    pub async fn data_pool_meta(&self, data_pool: u8) -> Result<DataPoolMeta, ProtocolError> {
        let request = vec![service_id::DATA_POOL_META, data_pool];
        let response = self.send_request(&request).await?;

        // 0xFA [pool] [v0 v1 v2] [crc_be32] [name_len] [name...]
        if response.len() < 10 || response[1] != data_pool {
            return Err(ProtocolError::InvalidResponse(
                "malformed data pool metadata response".to_string(),
            ));
        }
        let name_len = response[9] as usize;
        if response.len() < 10 + name_len {
            return Err(ProtocolError::InvalidResponse(
                "data pool name truncated".to_string(),
            ));
        }
        let name = String::from_utf8_lossy(&response[10..10 + name_len]).to_string();

        Ok(DataPoolMeta {
            version: [response[2], response[3], response[4]],
            definition_crc: u32::from_be_bytes([
                response[5],
                response[6],
                response[7],
                response[8],
            ]),
            name,
        })
    }

    /// Tell the node a list image was rewritten in NVM (0xBC). Returns the
    /// application acknowledgment.
    pub async fn notify_nvm_written(&self, data_pool: u8, list: u16) -> Result<bool, ProtocolError> {
        let mut request = vec![service_id::NVM_WRITE_NOTIFY, data_pool];
        request.extend_from_slice(&list.to_be_bytes());

        let response = self.send_request(&request).await?;
        if response.len() < 5 || response[1] != data_pool || response[2..4] != list.to_be_bytes() {
            return Err(ProtocolError::InvalidResponse(
                "malformed NVM notification response".to_string(),
            ));
        }
        Ok(response[4] != 0)
    }

    /// Drain rail values pushed by the node since the last call.
    pub fn drain_rail_values(&self) -> Vec<RailValue> {
        let mut values = Vec::new();
        let mut rx = self.events.lock();

        loop {
            match rx.try_recv() {
                Ok(event) => {
                    if let Some(value) = parse_rail_event(&event) {
                        values.push(value);
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "rail value stream lagged, values lost");
                }
                Err(broadcast::error::TryRecvError::Closed) => break,
            }
        }
        values
    }
}

/// Derive the key for a security seed.
///
/// Engineering sample exchange: the node checks that the tester echoes the
/// seed back.
fn derive_key(seed: &[u8]) -> Vec<u8> {
    seed.to_vec()
}

/// Validate a positive response that echoes the packed element address and
/// return the remaining payload.
fn parse_addressed_response<'a>(
    response: &'a [u8],
    request_sid: u8,
    expected: &PackedElement,
) -> Result<&'a [u8], ProtocolError> {
    let positive = request_sid.wrapping_add(0x40);
    if response.first() != Some(&positive) {
        return Err(ProtocolError::InvalidResponse(format!(
            "expected service 0x{:02X}, got {}",
            positive,
            hex::encode(response)
        )));
    }
    match PackedElement::parse(&response[1..]) {
        Some((echoed, rest)) if echoed == *expected => Ok(rest),
        Some(_) => Err(ProtocolError::InvalidResponse(
            "response echoes a different element".to_string(),
        )),
        None => Err(ProtocolError::InvalidResponse(
            "response too short for element echo".to_string(),
        )),
    }
}

/// Parse an unsolicited rail value push (0xEA).
fn parse_rail_event(event: &ServiceEvent) -> Option<RailValue> {
    let payload = &event.payload;
    if payload.first() != Some(&service_id::RAIL_EVENT) {
        return None;
    }
    let (address, raw) = PackedElement::parse(&payload[1..])?;
    if raw.is_empty() {
        return None;
    }
    Some(RailValue {
        address,
        raw: raw.to_vec(),
        timestamp_ms: event.timestamp_us / 1000,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockDispatcherConfig;
    use crate::transport::mock::MockDispatcher;

    fn protocol_with_mock() -> (OpenSydeProtocol, Arc<MockDispatcher>) {
        let mock = Arc::new(MockDispatcher::new(&MockDispatcherConfig::default()));
        let protocol = OpenSydeProtocol::new(mock.clone(), 1);
        (protocol, mock)
    }

    #[tokio::test]
    async fn zero_seed_skips_key_exchange() {
        let (protocol, mock) = protocol_with_mock();

        protocol.enter_diagnostic().await.unwrap();

        let sent = mock.sent_requests();
        assert_eq!(sent[0], vec![0x10, 0x03]);
        assert_eq!(sent[1], vec![0x27, 0x01]);
        assert_eq!(sent.len(), 2, "no key expected after a zero seed");
    }

    #[tokio::test]
    async fn nonzero_seed_answered_with_key() {
        let (protocol, mock) = protocol_with_mock();
        mock.push_response(vec![0x27, 0x01], vec![0x67, 0x01, 0xAA, 0xBB, 0xCC, 0xDD]);
        mock.push_response(vec![0x27, 0x02], vec![0x67, 0x02]);

        protocol.enter_diagnostic().await.unwrap();

        let sent = mock.sent_requests();
        assert_eq!(sent[2], vec![0x27, 0x02, 0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[tokio::test]
    async fn response_pending_is_retried() {
        let (protocol, mock) = protocol_with_mock();
        let element = ElementId::new(0, 0, 1, 2);
        mock.push_response(
            vec![0x22, 0x00, 0x00, 0x01, 0x00, 0x02],
            vec![0x62, 0x00, 0x00, 0x01, 0x00, 0x02, 0x12, 0x34],
        );
        mock.push_response_once(
            vec![0x22, 0x00, 0x00, 0x01, 0x00, 0x02],
            vec![0x7F, 0x22, 0x78],
        );

        let value = protocol.read_element(&element).await.unwrap();
        assert_eq!(value, vec![0x12, 0x34]);

        // The request went out twice: pending, then answered.
        let reads = mock
            .sent_requests()
            .iter()
            .filter(|r| r.first() == Some(&0x22))
            .count();
        assert_eq!(reads, 2);
    }

    #[tokio::test]
    async fn negative_response_surfaces_device_nrc() {
        let (protocol, mock) = protocol_with_mock();
        let element = ElementId::new(0, 0, 0, 9);
        mock.push_response(vec![0x22], vec![0x7F, 0x22, 0x31]);

        let err = protocol.read_element(&element).await.unwrap_err();
        match err {
            ProtocolError::NegativeResponse { service_id, nrc } => {
                assert_eq!(service_id, 0x22);
                assert_eq!(nrc, NegativeResponseCode::RequestOutOfRange);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_rejects_mismatched_echo() {
        let (protocol, mock) = protocol_with_mock();
        let element = ElementId::new(0, 0, 0, 1);
        // Echo names element 2 instead of 1
        mock.push_response(
            vec![0x22],
            vec![0x62, 0x00, 0x00, 0x00, 0x00, 0x02, 0x55],
        );

        let err = protocol.read_element(&element).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn on_change_request_carries_little_endian_threshold() {
        let (protocol, mock) = protocol_with_mock();
        let element = ElementId::new(0, 1, 2, 3);
        mock.push_response(vec![0x2A, 0x03], vec![0x6A]);

        protocol
            .register_on_change(1, &element, [0x10, 0x00, 0x00, 0x00])
            .await
            .unwrap();

        let sent = mock.sent_requests();
        assert_eq!(
            sent[0],
            vec![0x2A, 0x03, 0x01, 0x01, 0x00, 0x02, 0x00, 0x03, 0x10, 0x00, 0x00, 0x00]
        );
    }

    #[tokio::test]
    async fn rail_events_drain_in_order() {
        let (protocol, mock) = protocol_with_mock();

        mock.inject_event(vec![0xEA, 0x00, 0x00, 0x01, 0x00, 0x02, 0x11]);
        mock.inject_event(vec![0x62, 0x00, 0x00, 0x01, 0x00, 0x02, 0x99]); // not a push
        mock.inject_event(vec![0xEA, 0x00, 0x00, 0x01, 0x00, 0x03, 0x22, 0x33]);

        let values = protocol.drain_rail_values();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].address.element, 2);
        assert_eq!(values[0].raw, vec![0x11]);
        assert_eq!(values[1].address.element, 3);
        assert_eq!(values[1].raw, vec![0x22, 0x33]);

        assert!(protocol.drain_rail_values().is_empty());
    }

    #[tokio::test]
    async fn data_pool_meta_parses_version_crc_and_name() {
        let (protocol, mock) = protocol_with_mock();
        let mut response = vec![0xFA, 0x01, 0x01, 0x02, 0x03, 0xDE, 0xAD, 0xBE, 0xEF, 0x04];
        response.extend_from_slice(b"Ctrl");
        mock.push_response(vec![0xBA, 0x01], response);

        let meta = protocol.data_pool_meta(1).await.unwrap();
        assert_eq!(meta.version, [1, 2, 3]);
        assert_eq!(meta.definition_crc, 0xDEADBEEF);
        assert_eq!(meta.name, "Ctrl");
    }
}
