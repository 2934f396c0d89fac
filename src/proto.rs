//! Key / value primitives of the proto encoding used by the envelope wire format.
//!
//! Every field is written as a varint key `field_id << 3 | wire_type`, followed by its value:
//!
//! ```ascii
//! wire type 0 (varint):            LEB128 varint; signed integers are zig-zag encoded first
//! wire type 1 (fixed 64 bit):      8 bytes little endian
//! wire type 2 (length delimited):  varint length, followed by that many bytes (bytes, strings,
//!                                   nested messages)
//! wire type 5 (fixed 32 bit):      4 bytes little endian
//! ```
//!
//! Signed integers are *always* zig-zag encoded (i.e. `sint32` semantics), and encoders write all
//!  fields, including those with default values. Decoders skip fields they do not know.

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::safe_converter::{PrecheckedCast, SafeCast};


#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum WireType {
    Varint = 0,
    Fixed64 = 1,
    LengthDelimited = 2,
    Fixed32 = 5,
}

pub fn zig_zag_32(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

pub fn un_zig_zag_32(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

pub fn put_key(buf: &mut impl BufMut, field_id: u32, wire_type: WireType) {
    let wire_type: u8 = wire_type.into();
    buf.put_u32_varint((field_id << 3) | wire_type as u32);
}

pub fn put_sint32_field(buf: &mut impl BufMut, field_id: u32, value: i32) {
    put_key(buf, field_id, WireType::Varint);
    buf.put_u64_varint(zig_zag_32(value).safe_cast());
}

pub fn put_uint32_field(buf: &mut impl BufMut, field_id: u32, value: u32) {
    put_key(buf, field_id, WireType::Varint);
    buf.put_u64_varint(value.safe_cast());
}

pub fn put_bytes_field(buf: &mut impl BufMut, field_id: u32, value: &[u8]) {
    put_key(buf, field_id, WireType::LengthDelimited);
    buf.put_u64_varint(value.len().prechecked_cast());
    buf.put_slice(value);
}

/// Nested messages are length delimited, so they are serialized to a scratch buffer first
pub fn put_message_field(buf: &mut impl BufMut, field_id: u32, ser: impl FnOnce(&mut BytesMut)) {
    let mut nested = BytesMut::new();
    ser(&mut nested);
    put_bytes_field(buf, field_id, &nested);
}


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FieldValue<'a> {
    Varint(u64),
    Fixed64(u64),
    LengthDelimited(&'a [u8]),
    Fixed32(u32),
}

impl FieldValue<'_> {
    /// interprets a varint field as a zig-zag encoded `int32`
    pub fn as_sint32(&self) -> anyhow::Result<i32> {
        Ok(un_zig_zag_32(self.as_uint32()?))
    }

    pub fn as_uint32(&self) -> anyhow::Result<u32> {
        match *self {
            // truncates out of range values like other proto decoders do for uint32
            FieldValue::Varint(v) => Ok(v as u32),
            other => bail!("expected a varint field, was {:?}", other),
        }
    }

    pub fn as_bytes(&self) -> anyhow::Result<&[u8]> {
        match *self {
            FieldValue::LengthDelimited(v) => Ok(v),
            other => bail!("expected a length delimited field, was {:?}", other),
        }
    }
}

/// Reads the next field from a buffer, advancing the buffer past it. Returns `None` once the
///  buffer is exhausted.
pub fn try_read_field<'a>(buf: &mut &'a [u8]) -> anyhow::Result<Option<(u32, FieldValue<'a>)>> {
    if !buf.has_remaining() {
        return Ok(None);
    }

    let key = buf.try_get_u64_varint()?;
    let field_id: u32 = match u32::try_from(key >> 3) {
        Ok(id) => id,
        Err(_) => bail!("field id out of range: {}", key >> 3),
    };
    let wire_type = WireType::try_from((key & 0x7) as u8)?;

    let value = match wire_type {
        WireType::Varint => FieldValue::Varint(buf.try_get_u64_varint()?),
        WireType::Fixed64 => {
            if buf.remaining() < std::mem::size_of::<u64>() {
                bail!("buffer underflow reading a fixed 64 bit field");
            }
            FieldValue::Fixed64(buf.get_u64_le())
        }
        WireType::LengthDelimited => {
            let len = buf.try_get_u64_varint()?;
            if len > buf.remaining() as u64 {
                bail!("length delimited field with length {} exceeds the remaining {} bytes", len, buf.remaining());
            }
            let remaining: &'a [u8] = *buf;
            let (value, rest) = remaining.split_at(len as usize);
            *buf = rest;
            FieldValue::LengthDelimited(value)
        }
        WireType::Fixed32 => {
            if buf.remaining() < std::mem::size_of::<u32>() {
                bail!("buffer underflow reading a fixed 32 bit field");
            }
            FieldValue::Fixed32(buf.get_u32_le())
        }
    };

    Ok(Some((field_id, value)))
}
