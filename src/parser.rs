//! Deserialize records from the stream wire format.
//!
//! Counterpart of [`crate::encode`]: nom parsers over [`Bytes`] for varints,
//! tags, fixed32 floats and length-delimited fields. Message-level parsing
//! (matching field numbers to struct fields) lives with the record types in
//! [`crate::protocol`]; this module provides the primitives and the
//! unknown-field skipper that keeps old readers compatible with newer
//! writers.

use bytes::Bytes;
use nom::{bytes::complete::take, IResult};
use nombytes::NomBytes;

use crate::constants::MAX_WIRE_FIELD_SIZE;
use crate::encode::{WIRE_FIXED32, WIRE_FIXED64, WIRE_LEN, WIRE_VARINT};

/// Convert bytes to a validated UTF-8 string.
pub fn bytes_to_string(bytes: &Bytes) -> Result<String, nom::Err<nom::error::Error<NomBytes>>> {
    std::str::from_utf8(bytes)
        .map(|s| s.to_string())
        .map_err(|_| {
            nom::Err::Failure(nom::error::Error::new(
                NomBytes::from(bytes.as_ref()),
                nom::error::ErrorKind::Verify,
            ))
        })
}

/// Parse an unsigned varint. At most ten bytes are consumed.
pub fn parse_varint(s: NomBytes) -> IResult<NomBytes, u64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    let mut remaining = s;

    loop {
        let (s, byte) = take(1usize)(remaining)?;
        let b = byte.into_bytes()[0];
        remaining = s;

        result |= u64::from(b & 0x7F) << shift;

        if (b & 0x80) == 0 {
            break;
        }

        shift += 7;
        if shift >= 64 {
            return Err(nom::Err::Failure(nom::error::Error::new(
                remaining,
                nom::error::ErrorKind::TooLarge,
            )));
        }
    }

    Ok((remaining, result))
}

/// Parse a field tag into `(field_number, wire_type)`.
pub fn parse_tag(s: NomBytes) -> IResult<NomBytes, (u32, u8)> {
    let (s, raw) = parse_varint(s)?;
    let field = (raw >> 3) as u32;
    let wire = (raw & 0x07) as u8;
    if field == 0 {
        return Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::Verify,
        )));
    }
    Ok((s, (field, wire)))
}

/// Parse a length-delimited field body, bounded by [`MAX_WIRE_FIELD_SIZE`].
pub fn parse_len_bytes(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = parse_varint(s)?;
    if length as usize > MAX_WIRE_FIELD_SIZE {
        return Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::TooLarge,
        )));
    }
    let (s, body) = take(length as usize)(s)?;
    Ok((s, body.into_bytes()))
}

/// Parse a length-delimited UTF-8 string field.
pub fn parse_len_string(s: NomBytes) -> IResult<NomBytes, String> {
    let (s, body) = parse_len_bytes(s)?;
    let text = bytes_to_string(&body)?;
    Ok((s, text))
}

/// Parse a little-endian fixed32 float.
pub fn parse_fixed32(s: NomBytes) -> IResult<NomBytes, f32> {
    let (s, raw) = take(4usize)(s)?;
    let bytes: [u8; 4] = raw.into_bytes().as_ref().try_into().expect("took 4 bytes");
    Ok((s, f32::from_le_bytes(bytes)))
}

/// Decode a packed `repeated float` body. The length must be a multiple of
/// four; anything else means a corrupt payload.
pub fn parse_packed_floats(
    body: &Bytes,
) -> Result<Vec<f32>, nom::Err<nom::error::Error<NomBytes>>> {
    if body.len() % 4 != 0 {
        return Err(nom::Err::Failure(nom::error::Error::new(
            NomBytes::from(body.as_ref()),
            nom::error::ErrorKind::Verify,
        )));
    }
    Ok(body
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Skip over a field value of the given wire type.
///
/// Lets the parser tolerate fields added by newer writers: unknown field
/// numbers are skipped instead of failing the whole record.
pub fn skip_value(s: NomBytes, wire: u8) -> IResult<NomBytes, ()> {
    match wire {
        WIRE_VARINT => {
            let (s, _) = parse_varint(s)?;
            Ok((s, ()))
        }
        WIRE_FIXED64 => {
            let (s, _) = take(8usize)(s)?;
            Ok((s, ()))
        }
        WIRE_LEN => {
            let (s, _) = parse_len_bytes(s)?;
            Ok((s, ()))
        }
        WIRE_FIXED32 => {
            let (s, _) = take(4usize)(s)?;
            Ok((s, ()))
        }
        _ => Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::Verify,
        ))),
    }
}

/// Interpret a varint as protobuf `int64` (plain two's complement).
#[inline]
pub fn varint_to_i64(raw: u64) -> i64 {
    raw as i64
}

/// Interpret a varint as protobuf `int32`.
#[inline]
pub fn varint_to_i32(raw: u64) -> i32 {
    raw as i64 as i32
}
