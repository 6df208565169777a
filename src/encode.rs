//! Serialize records into the stream wire format.
//!
//! Payloads on the shared streams use the protobuf wire format: varint
//! scalars, little-endian fixed32 floats, and length-delimited strings,
//! packed arrays and submessages. Field values equal to their default are
//! omitted, as a protobuf writer would.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;

/// Wire type for varint-encoded scalars.
pub const WIRE_VARINT: u8 = 0;
/// Wire type for length-delimited fields.
pub const WIRE_LEN: u8 = 2;
/// Wire type for little-endian 32-bit fields.
pub const WIRE_FIXED32: u8 = 5;
/// Wire type for little-endian 64-bit fields.
pub const WIRE_FIXED64: u8 = 1;

/// Types that can render themselves as a wire message body.
pub trait ToWire {
    fn encode<B: BufMut>(&self, buffer: &mut B) -> Result<()>;

    /// Encode into a freshly allocated buffer.
    fn to_wire(&self) -> Bytes {
        let mut buf = BytesMut::new();
        // Encoding into memory cannot fail.
        self.encode(&mut buf).expect("wire encoding is infallible");
        buf.freeze()
    }
}

/// Encode an unsigned varint.
pub fn put_varint<B: BufMut>(buffer: &mut B, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buffer.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Encode a field tag: `(field_number << 3) | wire_type`.
pub fn put_tag<B: BufMut>(buffer: &mut B, field: u32, wire: u8) {
    put_varint(buffer, (u64::from(field) << 3) | u64::from(wire));
}

/// Encode a `uint32` field. Omitted when zero.
pub fn put_uint32<B: BufMut>(buffer: &mut B, field: u32, value: u32) {
    if value == 0 {
        return;
    }
    put_tag(buffer, field, WIRE_VARINT);
    put_varint(buffer, u64::from(value));
}

/// Encode an `int32` field. Negative values sign-extend to ten bytes,
/// exactly as protobuf `int32` does. Omitted when zero.
pub fn put_int32<B: BufMut>(buffer: &mut B, field: u32, value: i32) {
    if value == 0 {
        return;
    }
    put_tag(buffer, field, WIRE_VARINT);
    put_varint(buffer, i64::from(value) as u64);
}

/// Encode an `int64` field. Omitted when zero.
pub fn put_int64<B: BufMut>(buffer: &mut B, field: u32, value: i64) {
    if value == 0 {
        return;
    }
    put_tag(buffer, field, WIRE_VARINT);
    put_varint(buffer, value as u64);
}

/// Encode a `bool` field. Omitted when false.
pub fn put_bool<B: BufMut>(buffer: &mut B, field: u32, value: bool) {
    if !value {
        return;
    }
    put_tag(buffer, field, WIRE_VARINT);
    put_varint(buffer, 1);
}

/// Encode a `float` field as fixed32. Omitted when exactly zero.
pub fn put_float<B: BufMut>(buffer: &mut B, field: u32, value: f32) {
    if value == 0.0 {
        return;
    }
    put_tag(buffer, field, WIRE_FIXED32);
    buffer.put_f32_le(value);
}

/// Encode a string field. Omitted when empty.
pub fn put_string<B: BufMut>(buffer: &mut B, field: u32, value: &str) {
    if value.is_empty() {
        return;
    }
    put_tag(buffer, field, WIRE_LEN);
    put_varint(buffer, value.len() as u64);
    buffer.put_slice(value.as_bytes());
}

/// Encode a packed `repeated float` field. Omitted when empty.
///
/// An empty array and an absent field are indistinguishable on the wire;
/// record types that need the distinction wrap the array in a submessage.
pub fn put_packed_floats<B: BufMut>(buffer: &mut B, field: u32, values: &[f32]) {
    if values.is_empty() {
        return;
    }
    put_tag(buffer, field, WIRE_LEN);
    put_varint(buffer, (values.len() * 4) as u64);
    for v in values {
        buffer.put_f32_le(*v);
    }
}

/// Encode a submessage field. Always emitted, even when the body is empty,
/// so that repeated-message elements keep their positions.
pub fn put_message<B: BufMut, M: ToWire>(buffer: &mut B, field: u32, message: &M) -> Result<()> {
    let mut body = BytesMut::new();
    message.encode(&mut body)?;
    put_tag(buffer, field, WIRE_LEN);
    put_varint(buffer, body.len() as u64);
    buffer.put_slice(&body);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(buf: &BytesMut) -> Vec<u8> {
        buf.to_vec()
    }

    #[test]
    fn test_varint_single_byte() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 0);
        assert_eq!(hex(&buf), vec![0x00]);

        let mut buf = BytesMut::new();
        put_varint(&mut buf, 127);
        assert_eq!(hex(&buf), vec![0x7F]);
    }

    #[test]
    fn test_varint_multi_byte() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 300);
        assert_eq!(hex(&buf), vec![0xAC, 0x02]);
    }

    #[test]
    fn test_varint_max() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 10);
        assert_eq!(buf[9], 0x01);
    }

    #[test]
    fn test_tag_layout() {
        let mut buf = BytesMut::new();
        put_tag(&mut buf, 1, WIRE_LEN);
        assert_eq!(hex(&buf), vec![0x0A]);

        let mut buf = BytesMut::new();
        put_tag(&mut buf, 12, WIRE_VARINT);
        assert_eq!(hex(&buf), vec![0x60]);
    }

    #[test]
    fn test_int32_negative_sign_extends() {
        let mut buf = BytesMut::new();
        put_int32(&mut buf, 1, -1);
        // tag + ten bytes of sign extension
        assert_eq!(buf.len(), 11);
        assert_eq!(buf[1..], [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
    }

    #[test]
    fn test_defaults_are_omitted() {
        let mut buf = BytesMut::new();
        put_uint32(&mut buf, 1, 0);
        put_int64(&mut buf, 2, 0);
        put_bool(&mut buf, 3, false);
        put_float(&mut buf, 4, 0.0);
        put_string(&mut buf, 5, "");
        put_packed_floats(&mut buf, 6, &[]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_string_field() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, 5, "pool");
        assert_eq!(hex(&buf), vec![0x2A, 0x04, b'p', b'o', b'o', b'l']);
    }

    #[test]
    fn test_packed_floats_length() {
        let mut buf = BytesMut::new();
        put_packed_floats(&mut buf, 1, &[1.0, 2.0, 3.0]);
        // tag + length byte + 3 * 4 payload bytes
        assert_eq!(buf.len(), 2 + 12);
        assert_eq!(buf[1], 12);
    }

    #[test]
    fn test_float_little_endian() {
        let mut buf = BytesMut::new();
        put_float(&mut buf, 10, 1.0);
        assert_eq!(hex(&buf), vec![0x55, 0x00, 0x00, 0x80, 0x3F]);
    }
}
