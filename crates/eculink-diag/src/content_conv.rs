//! Typed value conversion for element content
//!
//! Converts between typed element values and the raw big-endian images
//! carried in service payloads, and expands bit-level images coming off
//! CAN signals into typed values.

use anyhow::{bail, Result};
use eculink_core::{ElementValue, ValueType};

/// Encode a typed value into its big-endian wire image.
///
/// Aggregates pass through unchanged; they are already byte images.
pub fn value_to_wire_bytes(value: &ElementValue) -> Vec<u8> {
    match value {
        ElementValue::U8(v) => v.to_be_bytes().to_vec(),
        ElementValue::U16(v) => v.to_be_bytes().to_vec(),
        ElementValue::U32(v) => v.to_be_bytes().to_vec(),
        ElementValue::U64(v) => v.to_be_bytes().to_vec(),
        ElementValue::I8(v) => v.to_be_bytes().to_vec(),
        ElementValue::I16(v) => v.to_be_bytes().to_vec(),
        ElementValue::I32(v) => v.to_be_bytes().to_vec(),
        ElementValue::I64(v) => v.to_be_bytes().to_vec(),
        ElementValue::F32(v) => v.to_be_bytes().to_vec(),
        ElementValue::F64(v) => v.to_be_bytes().to_vec(),
        ElementValue::Aggregate(v) => v.clone(),
    }
}

/// Decode a big-endian wire image into a typed value.
///
/// The image length must match the declared type exactly; a node answering
/// with a different width indicates a definition mismatch.
pub fn value_from_wire_bytes(value_type: ValueType, raw: &[u8]) -> Result<ElementValue> {
    if raw.len() != value_type.byte_len() {
        bail!(
            "wire image is {} bytes, {:?} needs {}",
            raw.len(),
            value_type,
            value_type.byte_len()
        );
    }

    Ok(match value_type {
        ValueType::U8 => ElementValue::U8(raw[0]),
        ValueType::U16 => ElementValue::U16(u16::from_be_bytes([raw[0], raw[1]])),
        ValueType::U32 => {
            ElementValue::U32(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
        }
        ValueType::U64 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(raw);
            ElementValue::U64(u64::from_be_bytes(buf))
        }
        ValueType::I8 => ElementValue::I8(raw[0] as i8),
        ValueType::I16 => ElementValue::I16(i16::from_be_bytes([raw[0], raw[1]])),
        ValueType::I32 => {
            ElementValue::I32(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
        }
        ValueType::I64 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(raw);
            ElementValue::I64(i64::from_be_bytes(buf))
        }
        ValueType::F32 => {
            ElementValue::F32(f32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
        }
        ValueType::F64 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(raw);
            ElementValue::F64(f64::from_be_bytes(buf))
        }
    })
}

/// Expand LSB-aligned raw bits into a typed value.
///
/// `bit_length` is the signal width in the frame, which may be narrower
/// than the element type. Signed types sign-extend from the signal's top
/// bit; floats require their full IEEE width.
pub fn value_from_raw_bits(
    value_type: ValueType,
    raw: u64,
    bit_length: u16,
) -> Result<ElementValue> {
    if bit_length == 0 || bit_length > 64 {
        bail!("signal width {} bits is not decodable", bit_length);
    }
    if bit_length as usize > value_type.byte_len() * 8 {
        bail!(
            "signal width {} bits exceeds element type {:?}",
            bit_length,
            value_type
        );
    }

    if value_type.is_float() {
        return match value_type {
            ValueType::F32 if bit_length == 32 => {
                Ok(ElementValue::F32(f32::from_bits(raw as u32)))
            }
            ValueType::F64 if bit_length == 64 => Ok(ElementValue::F64(f64::from_bits(raw))),
            _ => bail!(
                "float element {:?} requires its full width, got {} bits",
                value_type,
                bit_length
            ),
        };
    }

    if value_type.is_signed() {
        let signed = sign_extend(raw, bit_length);
        return Ok(match value_type {
            ValueType::I8 => ElementValue::I8(signed as i8),
            ValueType::I16 => ElementValue::I16(signed as i16),
            ValueType::I32 => ElementValue::I32(signed as i32),
            ValueType::I64 => ElementValue::I64(signed),
            _ => unreachable!(),
        });
    }

    Ok(match value_type {
        ValueType::U8 => ElementValue::U8(raw as u8),
        ValueType::U16 => ElementValue::U16(raw as u16),
        ValueType::U32 => ElementValue::U32(raw as u32),
        ValueType::U64 => ElementValue::U64(raw),
        _ => unreachable!(),
    })
}

/// Two's-complement sign extension from an arbitrary bit width.
fn sign_extend(raw: u64, bit_length: u16) -> i64 {
    let shift = 64 - bit_length as u32;
    ((raw << shift) as i64) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip_preserves_type_and_value() {
        let cases = [
            ElementValue::U8(0xAB),
            ElementValue::U16(0x1234),
            ElementValue::U32(0xDEAD_BEEF),
            ElementValue::I16(-300),
            ElementValue::I64(i64::MIN),
            ElementValue::F32(-2.75),
            ElementValue::F64(1.0e-7),
        ];
        for value in cases {
            let vt = value.value_type().unwrap();
            let wire = value_to_wire_bytes(&value);
            assert_eq!(wire.len(), vt.byte_len());
            assert_eq!(value_from_wire_bytes(vt, &wire).unwrap(), value);
        }
    }

    #[test]
    fn wire_decode_rejects_wrong_length() {
        assert!(value_from_wire_bytes(ValueType::U16, &[0x01]).is_err());
        assert!(value_from_wire_bytes(ValueType::U8, &[0x01, 0x02]).is_err());
    }

    #[test]
    fn aggregate_passes_through_unchanged() {
        let agg = ElementValue::Aggregate(vec![1, 2, 3, 4, 5]);
        assert_eq!(value_to_wire_bytes(&agg), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn narrow_signed_signal_sign_extends() {
        // 12-bit signal: 0xFFF is -1, 0x800 is -2048
        assert_eq!(
            value_from_raw_bits(ValueType::I16, 0xFFF, 12).unwrap(),
            ElementValue::I16(-1)
        );
        assert_eq!(
            value_from_raw_bits(ValueType::I16, 0x800, 12).unwrap(),
            ElementValue::I16(-2048)
        );
        assert_eq!(
            value_from_raw_bits(ValueType::I16, 0x7FF, 12).unwrap(),
            ElementValue::I16(2047)
        );
    }

    #[test]
    fn unsigned_signal_stays_unsigned() {
        assert_eq!(
            value_from_raw_bits(ValueType::U16, 0xFFF, 12).unwrap(),
            ElementValue::U16(0xFFF)
        );
    }

    #[test]
    fn float_signal_requires_full_width() {
        let bits = 1.5f32.to_bits() as u64;
        assert_eq!(
            value_from_raw_bits(ValueType::F32, bits, 32).unwrap(),
            ElementValue::F32(1.5)
        );
        assert!(value_from_raw_bits(ValueType::F32, bits, 16).is_err());
    }

    #[test]
    fn signal_wider_than_type_rejected() {
        assert!(value_from_raw_bits(ValueType::U8, 0x1FF, 9).is_err());
    }
}
