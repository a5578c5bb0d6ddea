//! Minimal protobuf wire format
//!
//! Just enough of the encoding to read `tf.train.Example` payloads and to
//! write `Example` and TensorBoard `Event` messages: varints, fixed 32/64-bit
//! scalars and length-delimited fields. Groups are rejected.

use thiserror::Error;

/// Low-level wire decoding failure
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message truncated")]
    Truncated,

    #[error("varint longer than 10 bytes")]
    VarintOverflow,

    #[error("unsupported wire type {0}")]
    UnsupportedWireType(u8),

    #[error("field number 0 is invalid")]
    ZeroField,
}

pub type WireResult<T> = std::result::Result<T, WireError>;

/// Protobuf wire types used by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint,
    Fixed64,
    LengthDelimited,
    Fixed32,
}

impl WireType {
    fn from_bits(bits: u8) -> WireResult<Self> {
        match bits {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            5 => Ok(WireType::Fixed32),
            other => Err(WireError::UnsupportedWireType(other)),
        }
    }

    fn bits(self) -> u8 {
        match self {
            WireType::Varint => 0,
            WireType::Fixed64 => 1,
            WireType::LengthDelimited => 2,
            WireType::Fixed32 => 5,
        }
    }
}

/// A decoded field value borrowing from the message buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Varint(u64),
    Fixed64(u64),
    Bytes(&'a [u8]),
    Fixed32(u32),
}

/// Cursor over an encoded message
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn read_varint(&mut self) -> WireResult<u64> {
        let mut value = 0u64;
        for i in 0..10 {
            let byte = *self.buf.get(self.pos).ok_or(WireError::Truncated)?;
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(WireError::VarintOverflow)
    }

    fn take(&mut self, n: usize) -> WireResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(WireError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(WireError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    pub fn read_fixed32(&mut self) -> WireResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_fixed64(&mut self) -> WireResult<u64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_bytes(&mut self) -> WireResult<&'a [u8]> {
        let len = self.read_varint()? as usize;
        self.take(len)
    }

    /// Next `(field number, value)` pair, or `None` at the end of the buffer
    pub fn next_field(&mut self) -> WireResult<Option<(u32, FieldValue<'a>)>> {
        if self.is_empty() {
            return Ok(None);
        }
        let key = self.read_varint()?;
        let field = (key >> 3) as u32;
        if field == 0 {
            return Err(WireError::ZeroField);
        }
        let value = match WireType::from_bits((key & 0x7) as u8)? {
            WireType::Varint => FieldValue::Varint(self.read_varint()?),
            WireType::Fixed64 => FieldValue::Fixed64(self.read_fixed64()?),
            WireType::LengthDelimited => FieldValue::Bytes(self.read_bytes()?),
            WireType::Fixed32 => FieldValue::Fixed32(self.read_fixed32()?),
        };
        Ok(Some((field, value)))
    }
}

pub fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

pub fn put_key(out: &mut Vec<u8>, field: u32, wire_type: WireType) {
    put_varint(out, (u64::from(field) << 3) | u64::from(wire_type.bits()));
}

pub fn put_bytes_field(out: &mut Vec<u8>, field: u32, bytes: &[u8]) {
    put_key(out, field, WireType::LengthDelimited);
    put_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

pub fn put_varint_field(out: &mut Vec<u8>, field: u32, value: u64) {
    put_key(out, field, WireType::Varint);
    put_varint(out, value);
}

pub fn put_f32_field(out: &mut Vec<u8>, field: u32, value: f32) {
    put_key(out, field, WireType::Fixed32);
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn put_f64_field(out: &mut Vec<u8>, field: u32, value: f64) {
    put_key(out, field, WireType::Fixed64);
    out.extend_from_slice(&value.to_le_bytes());
}

/// Packed repeated float field
pub fn put_packed_f32_field(out: &mut Vec<u8>, field: u32, values: &[f32]) {
    put_key(out, field, WireType::LengthDelimited);
    put_varint(out, (values.len() * 4) as u64);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_encoding() {
        let mut out = Vec::new();
        put_varint(&mut out, 300);
        assert_eq!(out, vec![0xac, 0x02]);

        let mut reader = WireReader::new(&out);
        assert_eq!(reader.read_varint().unwrap(), 300);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_field_sequence() {
        let mut out = Vec::new();
        put_f64_field(&mut out, 1, 1.5);
        put_varint_field(&mut out, 2, 7);
        put_bytes_field(&mut out, 3, b"brain.Event:2");
        put_f32_field(&mut out, 4, 0.25);

        assert_eq!(out[0], 0x09);

        let mut reader = WireReader::new(&out);
        assert_eq!(
            reader.next_field().unwrap(),
            Some((1, FieldValue::Fixed64(1.5f64.to_bits())))
        );
        assert_eq!(reader.next_field().unwrap(), Some((2, FieldValue::Varint(7))));
        assert_eq!(
            reader.next_field().unwrap(),
            Some((3, FieldValue::Bytes(b"brain.Event:2")))
        );
        assert_eq!(
            reader.next_field().unwrap(),
            Some((4, FieldValue::Fixed32(0.25f32.to_bits())))
        );
        assert_eq!(reader.next_field().unwrap(), None);
    }

    #[test]
    fn test_truncated_length_delimited() {
        // field 1, length 5, only 2 bytes present
        let buf = [0x0a, 0x05, 0x01, 0x02];
        let mut reader = WireReader::new(&buf);
        assert_eq!(reader.next_field(), Err(WireError::Truncated));
    }

    #[test]
    fn test_group_wire_type_rejected() {
        // field 1, wire type 3 (start group)
        let buf = [0x0b];
        let mut reader = WireReader::new(&buf);
        assert_eq!(reader.next_field(), Err(WireError::UnsupportedWireType(3)));
    }
}
