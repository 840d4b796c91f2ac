//! Realtime CAN frame dispatch to display consumers
//!
//! The cycling task drains raw frames off the monitoring plane and hands
//! them here. Signals are matched by raw CAN identifier, decoded into typed
//! content and pushed into each consumer's bounded queue. The dispatch path
//! never blocks on a consumer: a slow consumer loses updates (counted and
//! logged), everyone else keeps receiving.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use eculink_core::{
    ByteOrder, CanMessageRef, CanSignalDecl, ElementId, TimestampedValue,
};

use crate::content_conv;
use crate::transport::BusFrame;

/// Consumer-side receiver for decoded values.
///
/// Frame dispatch calls implementations from a per-consumer drain task;
/// the data dealers call them directly from the cycle task. Either way an
/// implementation must enqueue and return, never block.
pub trait SignalSink: Send + Sync {
    /// A new decoded value for one of the consumer's registered elements.
    fn insert_new_value(&self, element: &ElementId, value: TimestampedValue);

    /// The element's signal did not fit the received frame.
    fn set_dlc_error(&self, element: &ElementId, dlc: u8);
}

/// Opaque handle identifying one registered consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(Uuid);

/// One signal a consumer wants decoded from the raw frame stream.
#[derive(Debug, Clone)]
pub struct SignalRegistration {
    pub element: ElementId,
    pub message: CanMessageRef,
    pub signal: CanSignalDecl,
    /// Companion multiplexer signal; required when `signal.mux_value` is
    /// set.
    pub mux: Option<CanSignalDecl>,
}

enum SinkUpdate {
    Value(ElementId, TimestampedValue),
    DlcError(ElementId, u8),
}

struct RegisteredSignal {
    consumer: ConsumerId,
    registration: SignalRegistration,
}

struct ConsumerQueue {
    tx: mpsc::Sender<SinkUpdate>,
    dropped: Arc<AtomicU64>,
}

/// Frame-to-consumer dispatch with per-consumer bounded queues.
pub struct SignalDispatch {
    /// Raw CAN identifier to registered signals.
    registry: RwLock<HashMap<u32, Vec<RegisteredSignal>>>,
    consumers: RwLock<HashMap<ConsumerId, ConsumerQueue>>,
    queue_depth: usize,
}

impl SignalDispatch {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Register a consumer with its signal list. A drain task forwards
    /// queued updates into the sink until the consumer is unregistered.
    pub fn register_consumer(
        &self,
        registrations: Vec<SignalRegistration>,
        sink: Arc<dyn SignalSink>,
    ) -> ConsumerId {
        let id = ConsumerId(Uuid::new_v4());
        let (tx, mut rx) = mpsc::channel::<SinkUpdate>(self.queue_depth);

        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                match update {
                    SinkUpdate::Value(element, value) => sink.insert_new_value(&element, value),
                    SinkUpdate::DlcError(element, dlc) => sink.set_dlc_error(&element, dlc),
                }
            }
        });

        let signal_count = registrations.len();
        {
            let mut registry = self.registry.write();
            for registration in registrations {
                registry
                    .entry(registration.message.can_id)
                    .or_default()
                    .push(RegisteredSignal {
                        consumer: id,
                        registration,
                    });
            }
        }
        self.consumers.write().insert(
            id,
            ConsumerQueue {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
        );

        debug!(consumer = %id.0, signals = signal_count, "Consumer registered");
        id
    }

    /// Remove a consumer and all its registrations. The drain task ends
    /// once the queued updates are delivered.
    pub fn unregister_consumer(&self, id: ConsumerId) -> bool {
        {
            let mut registry = self.registry.write();
            registry.retain(|_, entries| {
                entries.retain(|e| e.consumer != id);
                !entries.is_empty()
            });
        }
        let removed = self.consumers.write().remove(&id).is_some();
        if removed {
            debug!(consumer = %id.0, "Consumer unregistered");
        }
        removed
    }

    /// Updates lost to a full queue since registration.
    pub fn dropped_updates(&self, id: ConsumerId) -> Option<u64> {
        self.consumers
            .read()
            .get(&id)
            .map(|q| q.dropped.load(Ordering::Relaxed))
    }

    /// Match one incoming frame against the registry and deliver decodes.
    pub fn dispatch_frame(&self, frame: &BusFrame) {
        let registry = self.registry.read();
        let Some(entries) = registry.get(&frame.id) else {
            return;
        };
        let consumers = self.consumers.read();
        for entry in entries {
            let Some(queue) = consumers.get(&entry.consumer) else {
                continue;
            };
            self.dispatch_signal(&entry.registration, frame, queue);
        }
    }

    fn dispatch_signal(
        &self,
        registration: &SignalRegistration,
        frame: &BusFrame,
        queue: &ConsumerQueue,
    ) {
        // Identifier value alone is ambiguous between the standard and the
        // extended address space.
        if frame.extended != registration.message.extended {
            return;
        }
        let payload = frame.payload();

        // Multiplexed signals exist in a frame only when the companion
        // multiplexer carries their selector value.
        if let Some(selector) = registration.signal.mux_value {
            let Some(mux) = &registration.mux else {
                debug!(
                    element = %registration.element,
                    "Multiplexed signal registered without multiplexer descriptor"
                );
                return;
            };
            if mux.last_byte_excl() > payload.len() {
                self.push(queue, SinkUpdate::DlcError(registration.element, frame.dlc));
                return;
            }
            let mux_raw = extract_raw_bits(payload, mux);
            if mux_raw != u64::from(selector) {
                return;
            }
        }

        if registration.signal.last_byte_excl() > payload.len() {
            self.push(queue, SinkUpdate::DlcError(registration.element, frame.dlc));
            return;
        }

        let raw = extract_raw_bits(payload, &registration.signal);
        let value = match content_conv::value_from_raw_bits(
            registration.signal.value_type,
            raw,
            registration.signal.bit_length,
        ) {
            Ok(value) => value,
            Err(e) => {
                debug!(element = %registration.element, error = %e, "Signal decode failed");
                return;
            }
        };

        let timestamped = TimestampedValue::new(value, frame.timestamp_us / 1000);
        self.push(
            queue,
            SinkUpdate::Value(registration.element, timestamped),
        );
    }

    fn push(&self, queue: &ConsumerQueue, update: SinkUpdate) {
        if let Err(mpsc::error::TrySendError::Full(_)) = queue.tx.try_send(update) {
            let total = queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped = total, "Consumer queue full, update dropped");
        }
    }
}

/// Extract a signal's raw bit field from the frame payload.
///
/// Intel start bits name the LSB position counted through little-endian
/// byte order; Motorola start bits name the MSB position, walking down
/// within the start byte and then forward through the following bytes.
/// Callers must have checked [`CanSignalDecl::last_byte_excl`] against the
/// payload length.
fn extract_raw_bits(payload: &[u8], signal: &CanSignalDecl) -> u64 {
    match signal.byte_order {
        ByteOrder::Intel => {
            let mut raw = 0u64;
            for i in 0..signal.bit_length {
                let bit = signal.start_bit + i;
                let byte = usize::from(bit / 8);
                if payload[byte] & (1 << (bit % 8)) != 0 {
                    raw |= 1 << i;
                }
            }
            raw
        }
        ByteOrder::Motorola => {
            let mut raw = 0u64;
            let mut byte = usize::from(signal.start_bit / 8);
            let mut bit_in_byte = i32::from(signal.start_bit % 8);
            for _ in 0..signal.bit_length {
                raw <<= 1;
                if payload[byte] & (1 << bit_in_byte) != 0 {
                    raw |= 1;
                }
                bit_in_byte -= 1;
                if bit_in_byte < 0 {
                    bit_in_byte = 7;
                    byte += 1;
                }
            }
            raw
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eculink_core::{ElementValue, ValueType};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        values: Mutex<Vec<(ElementId, TimestampedValue)>>,
        dlc_errors: Mutex<Vec<(ElementId, u8)>>,
    }

    impl SignalSink for RecordingSink {
        fn insert_new_value(&self, element: &ElementId, value: TimestampedValue) {
            self.values.lock().push((*element, value));
        }

        fn set_dlc_error(&self, element: &ElementId, dlc: u8) {
            self.dlc_errors.lock().push((*element, dlc));
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn message(can_id: u32, dlc: u8) -> CanMessageRef {
        CanMessageRef {
            can_id,
            extended: false,
            dlc,
        }
    }

    fn intel_signal(start_bit: u16, bit_length: u16, value_type: ValueType) -> CanSignalDecl {
        CanSignalDecl {
            start_bit,
            bit_length,
            byte_order: ByteOrder::Intel,
            value_type,
            mux_value: None,
        }
    }

    #[test]
    fn intel_extraction_is_little_endian() {
        let payload = [0x34, 0x12, 0x00, 0x00];
        let raw = extract_raw_bits(&payload, &intel_signal(0, 16, ValueType::U16));
        assert_eq!(raw, 0x1234);
    }

    #[test]
    fn motorola_extraction_is_big_endian() {
        let payload = [0x12, 0x34];
        let signal = CanSignalDecl {
            start_bit: 7,
            bit_length: 16,
            byte_order: ByteOrder::Motorola,
            value_type: ValueType::U16,
            mux_value: None,
        };
        assert_eq!(extract_raw_bits(&payload, &signal), 0x1234);
    }

    #[tokio::test]
    async fn decoded_value_reaches_the_sink_with_ms_timestamp() {
        let dispatch = SignalDispatch::new(16);
        let sink = Arc::new(RecordingSink::default());
        let element = ElementId::new(0, 0, 0, 1);
        dispatch.register_consumer(
            vec![SignalRegistration {
                element,
                message: message(0x123, 8),
                signal: intel_signal(0, 16, ValueType::U16),
                mux: None,
            }],
            sink.clone(),
        );

        let frame = BusFrame::new(0x123, &[0x34, 0x12, 0, 0, 0, 0, 0, 0]).at(2500);
        dispatch.dispatch_frame(&frame);
        settle().await;

        let values = sink.values.lock();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].0, element);
        assert_eq!(values[0].1.value, ElementValue::U16(0x1234));
        assert_eq!(values[0].1.timestamp_ms, 2);
    }

    #[tokio::test]
    async fn short_frame_reports_dlc_error_instead_of_garbage() {
        let dispatch = SignalDispatch::new(16);
        let sink = Arc::new(RecordingSink::default());
        let element = ElementId::new(0, 0, 0, 2);
        dispatch.register_consumer(
            vec![SignalRegistration {
                element,
                message: message(0x200, 8),
                // bits 40..48 need byte 5
                signal: intel_signal(40, 8, ValueType::U8),
                mux: None,
            }],
            sink.clone(),
        );

        let frame = BusFrame::new(0x200, &[0, 0, 0, 0]);
        dispatch.dispatch_frame(&frame);
        settle().await;

        assert!(sink.values.lock().is_empty());
        assert_eq!(*sink.dlc_errors.lock(), vec![(element, 4)]);
    }

    #[tokio::test]
    async fn mux_selector_mismatch_is_silent_and_match_is_idempotent() {
        let dispatch = SignalDispatch::new(16);
        let sink = Arc::new(RecordingSink::default());
        let element = ElementId::new(0, 0, 1, 0);
        let mux = intel_signal(0, 8, ValueType::U8);
        dispatch.register_consumer(
            vec![SignalRegistration {
                element,
                message: message(0x300, 8),
                signal: CanSignalDecl {
                    mux_value: Some(2),
                    ..intel_signal(8, 8, ValueType::U8)
                },
                mux: Some(mux),
            }],
            sink.clone(),
        );

        // selector 1: signal absent, no error
        dispatch.dispatch_frame(&BusFrame::new(0x300, &[0x01, 0x55]));
        settle().await;
        assert!(sink.values.lock().is_empty());
        assert!(sink.dlc_errors.lock().is_empty());

        // selector 2 twice: same decode both times
        let frame = BusFrame::new(0x300, &[0x02, 0x55]).at(7000);
        dispatch.dispatch_frame(&frame);
        dispatch.dispatch_frame(&frame);
        settle().await;

        let values = sink.values.lock();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].1.value, ElementValue::U8(0x55));
        assert_eq!(values[0].1.value, values[1].1.value);
        assert_eq!(values[0].1.timestamp_ms, values[1].1.timestamp_ms);
    }

    #[tokio::test]
    async fn extended_flag_mismatch_skips_the_registration() {
        let dispatch = SignalDispatch::new(16);
        let sink = Arc::new(RecordingSink::default());
        dispatch.register_consumer(
            vec![SignalRegistration {
                element: ElementId::new(0, 0, 0, 0),
                message: message(0x100, 8),
                signal: intel_signal(0, 8, ValueType::U8),
                mux: None,
            }],
            sink.clone(),
        );

        dispatch.dispatch_frame(&BusFrame::new(0x100, &[0xAA]).extended(true));
        settle().await;
        assert!(sink.values.lock().is_empty());
    }

    #[tokio::test]
    async fn full_queue_drops_updates_without_stalling_dispatch() {
        let dispatch = SignalDispatch::new(2);
        let sink = Arc::new(RecordingSink::default());
        let id = dispatch.register_consumer(
            vec![SignalRegistration {
                element: ElementId::new(0, 0, 0, 3),
                message: message(0x400, 8),
                signal: intel_signal(0, 8, ValueType::U8),
                mux: None,
            }],
            sink.clone(),
        );

        // The drain task cannot run while this task holds the thread, so
        // everything past the queue depth must drop.
        let frame = BusFrame::new(0x400, &[0x11]);
        for _ in 0..5 {
            dispatch.dispatch_frame(&frame);
        }
        assert_eq!(dispatch.dropped_updates(id), Some(3));

        settle().await;
        assert_eq!(sink.values.lock().len(), 2);
    }

    #[tokio::test]
    async fn unregistered_consumer_receives_nothing() {
        let dispatch = SignalDispatch::new(16);
        let sink = Arc::new(RecordingSink::default());
        let id = dispatch.register_consumer(
            vec![SignalRegistration {
                element: ElementId::new(0, 0, 0, 4),
                message: message(0x500, 8),
                signal: intel_signal(0, 8, ValueType::U8),
                mux: None,
            }],
            sink.clone(),
        );

        assert!(dispatch.unregister_consumer(id));
        assert!(!dispatch.unregister_consumer(id));
        assert_eq!(dispatch.dropped_updates(id), None);

        dispatch.dispatch_frame(&BusFrame::new(0x500, &[0x01]));
        settle().await;
        assert!(sink.values.lock().is_empty());
    }
}
