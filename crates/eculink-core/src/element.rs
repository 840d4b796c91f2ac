//! Datapool element identity and typed value content

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Uniquely names one scalar or array element in a node's datapool.
///
/// The `node` field is the global node index from the system snapshot, not
/// the session-local active index. Used as a map key for rail assignments
/// and signal consumer registrations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ElementId {
    pub node: u32,
    pub data_pool: u32,
    pub list: u32,
    pub element: u32,
    /// Index into an array element; `None` addresses the whole element.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub array_index: Option<u16>,
}

impl ElementId {
    pub fn new(node: u32, data_pool: u32, list: u32, element: u32) -> Self {
        Self {
            node,
            data_pool,
            list,
            element,
            array_index: None,
        }
    }

    pub fn with_array_index(mut self, index: u16) -> Self {
        self.array_index = Some(index);
        self
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {} datapool {} list {} element {}",
            self.node, self.data_pool, self.list, self.element
        )?;
        if let Some(idx) = self.array_index {
            write!(f, "[{}]", idx)?;
        }
        Ok(())
    }
}

/// Declared type of a datapool element or CAN signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl ValueType {
    /// Storage size on the wire in bytes.
    pub fn byte_len(self) -> usize {
        match self {
            ValueType::U8 | ValueType::I8 => 1,
            ValueType::U16 | ValueType::I16 => 2,
            ValueType::U32 | ValueType::I32 | ValueType::F32 => 4,
            ValueType::U64 | ValueType::I64 | ValueType::F64 => 8,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ValueType::I8 | ValueType::I16 | ValueType::I32 | ValueType::I64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, ValueType::F32 | ValueType::F64)
    }
}

/// Type-preserving content container for one element value.
///
/// Decoded signal values and polled datapool reads keep their declared type
/// all the way to the consumer; `Aggregate` carries raw NVM/list images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ElementValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// Raw byte image of a list or array element.
    Aggregate(Vec<u8>),
}

/// Errors raised by content conversions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContentError {
    /// A change threshold occupied more than 32 bits.
    #[error("change threshold does not fit into 32 bits ({occupied} bits occupied)")]
    ThresholdTooWide { occupied: usize },

    /// Aggregate content where a scalar was required.
    #[error("aggregate content cannot be used where a scalar is required")]
    NotScalar,
}

impl ElementValue {
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            ElementValue::U8(_) => Some(ValueType::U8),
            ElementValue::U16(_) => Some(ValueType::U16),
            ElementValue::U32(_) => Some(ValueType::U32),
            ElementValue::U64(_) => Some(ValueType::U64),
            ElementValue::I8(_) => Some(ValueType::I8),
            ElementValue::I16(_) => Some(ValueType::I16),
            ElementValue::I32(_) => Some(ValueType::I32),
            ElementValue::I64(_) => Some(ValueType::I64),
            ElementValue::F32(_) => Some(ValueType::F32),
            ElementValue::F64(_) => Some(ValueType::F64),
            ElementValue::Aggregate(_) => None,
        }
    }

    /// Little-endian byte image of the value. Signed values keep their
    /// two's-complement pattern; floats their IEEE-754 pattern.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            ElementValue::U8(v) => v.to_le_bytes().to_vec(),
            ElementValue::U16(v) => v.to_le_bytes().to_vec(),
            ElementValue::U32(v) => v.to_le_bytes().to_vec(),
            ElementValue::U64(v) => v.to_le_bytes().to_vec(),
            ElementValue::I8(v) => v.to_le_bytes().to_vec(),
            ElementValue::I16(v) => v.to_le_bytes().to_vec(),
            ElementValue::I32(v) => v.to_le_bytes().to_vec(),
            ElementValue::I64(v) => v.to_le_bytes().to_vec(),
            ElementValue::F32(v) => v.to_le_bytes().to_vec(),
            ElementValue::F64(v) => v.to_le_bytes().to_vec(),
            ElementValue::Aggregate(v) => v.clone(),
        }
    }

    /// Expand a change threshold into the 4-byte little-endian form the
    /// change-driven registration service expects.
    ///
    /// Values whose byte image carries significant bits above bit 31 are
    /// rejected; the device field is 32 bits wide.
    pub fn to_change_threshold_le(&self) -> Result<[u8; 4], ContentError> {
        if matches!(self, ElementValue::Aggregate(_)) {
            return Err(ContentError::NotScalar);
        }
        let raw = self.to_le_bytes();
        if raw.iter().skip(4).any(|&b| b != 0) {
            return Err(ContentError::ThresholdTooWide {
                occupied: raw.len() * 8,
            });
        }
        let mut out = [0u8; 4];
        out[..raw.len().min(4)].copy_from_slice(&raw[..raw.len().min(4)]);
        Ok(out)
    }

    /// Widening view as u64; signed values are sign-extended, floats
    /// truncated. Aggregates yield `None`.
    pub fn as_u64_lossy(&self) -> Option<u64> {
        match *self {
            ElementValue::U8(v) => Some(v as u64),
            ElementValue::U16(v) => Some(v as u64),
            ElementValue::U32(v) => Some(v as u64),
            ElementValue::U64(v) => Some(v),
            ElementValue::I8(v) => Some(v as u64),
            ElementValue::I16(v) => Some(v as u64),
            ElementValue::I32(v) => Some(v as u64),
            ElementValue::I64(v) => Some(v as u64),
            ElementValue::F32(v) => Some(v as u64),
            ElementValue::F64(v) => Some(v as u64),
            ElementValue::Aggregate(_) => None,
        }
    }

    pub fn as_f64_lossy(&self) -> Option<f64> {
        match *self {
            ElementValue::U8(v) => Some(v as f64),
            ElementValue::U16(v) => Some(v as f64),
            ElementValue::U32(v) => Some(v as f64),
            ElementValue::U64(v) => Some(v as f64),
            ElementValue::I8(v) => Some(v as f64),
            ElementValue::I16(v) => Some(v as f64),
            ElementValue::I32(v) => Some(v as f64),
            ElementValue::I64(v) => Some(v as f64),
            ElementValue::F32(v) => Some(v as f64),
            ElementValue::F64(v) => Some(v),
            ElementValue::Aggregate(_) => None,
        }
    }
}

impl fmt::Display for ElementValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementValue::U8(v) => write!(f, "{}", v),
            ElementValue::U16(v) => write!(f, "{}", v),
            ElementValue::U32(v) => write!(f, "{}", v),
            ElementValue::U64(v) => write!(f, "{}", v),
            ElementValue::I8(v) => write!(f, "{}", v),
            ElementValue::I16(v) => write!(f, "{}", v),
            ElementValue::I32(v) => write!(f, "{}", v),
            ElementValue::I64(v) => write!(f, "{}", v),
            ElementValue::F32(v) => write!(f, "{}", v),
            ElementValue::F64(v) => write!(f, "{}", v),
            ElementValue::Aggregate(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// One decoded value with its acquisition time.
///
/// `timestamp_ms` is the transport timestamp converted to the consumer time
/// base (milliseconds since transport start); `received_at` is wall-clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedValue {
    pub value: ElementValue,
    pub timestamp_ms: u64,
    pub received_at: DateTime<Utc>,
}

impl TimestampedValue {
    pub fn new(value: ElementValue, timestamp_ms: u64) -> Self {
        Self {
            value,
            timestamp_ms,
            received_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_round_trips_for_32bit_values() {
        let cases: &[(ElementValue, u32)] = &[
            (ElementValue::U8(0x7F), 0x7F),
            (ElementValue::U16(0x1234), 0x1234),
            (ElementValue::U32(0xDEAD_BEEF), 0xDEAD_BEEF),
            (ElementValue::U64(0x0000_0000_0042_4242), 0x0042_4242),
            (ElementValue::I16(-2), 0x0000_FFFE),
        ];
        for (value, expected) in cases {
            let le = value.to_change_threshold_le().unwrap();
            assert_eq!(u32::from_le_bytes(le), *expected, "value {:?}", value);
        }
    }

    #[test]
    fn threshold_rejects_wide_values() {
        let too_wide = ElementValue::U64(0x1_0000_0000);
        assert_eq!(
            too_wide.to_change_threshold_le(),
            Err(ContentError::ThresholdTooWide { occupied: 64 })
        );
        // Negative i64 sign-extends through the upper bytes.
        assert!(ElementValue::I64(-1).to_change_threshold_le().is_err());
        assert!(ElementValue::F64(1.5).to_change_threshold_le().is_err());
    }

    #[test]
    fn threshold_rejects_aggregates() {
        let agg = ElementValue::Aggregate(vec![1, 2, 3]);
        assert_eq!(agg.to_change_threshold_le(), Err(ContentError::NotScalar));
    }

    #[test]
    fn f32_threshold_keeps_bit_pattern() {
        let value = ElementValue::F32(1.5);
        let le = value.to_change_threshold_le().unwrap();
        assert_eq!(f32::from_le_bytes(le), 1.5);
    }

    #[test]
    fn element_id_display_includes_array_index() {
        let id = ElementId::new(3, 0, 2, 7).with_array_index(4);
        assert_eq!(id.to_string(), "node 3 datapool 0 list 2 element 7[4]");
    }
}
