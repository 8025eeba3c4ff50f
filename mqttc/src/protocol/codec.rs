//! Primitive field codecs shared by every packet type.
//!
//! Readers leave the cursor where it was when they fail with
//! [`Error::Incomplete`], so the caller can retry after buffering more bytes.

use bytes::Bytes;

use super::{FixedHeader, PacketType};
use crate::buffer::Buffer;
use crate::error::{Error, Result};

/// Largest remaining length encodable in four varint bytes.
pub const MAX_VARIABLE_INT: u32 = 268_435_455;

fn put(buf: &mut Buffer, bytes: &[u8]) -> Result<()> {
    if buf.append(bytes) != bytes.len() {
        return Err(Error::OutOfMemory);
    }
    Ok(())
}

fn need(buf: &Buffer, n: usize) -> Result<()> {
    if buf.free_space() < n {
        return Err(Error::Incomplete {
            needed: n - buf.free_space(),
        });
    }
    Ok(())
}

/// Number of bytes `value` takes as a variable-length integer.
pub fn variable_int_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Writes a variable-length integer: 7 bits per byte, low group first.
pub fn write_variable_int(buf: &mut Buffer, mut value: u32) -> Result<()> {
    if value > MAX_VARIABLE_INT {
        return Err(Error::InvalidParameter(format!(
            "remaining length {} exceeds {}",
            value, MAX_VARIABLE_INT
        )));
    }
    let mut out = [0u8; 4];
    let mut n = 0;
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        out[n] = byte;
        n += 1;
        if value == 0 {
            break;
        }
    }
    put(buf, &out[..n])
}

/// Reads a variable-length integer.
///
/// Running out of bytes while the continuation bit is set is
/// [`Error::Incomplete`]; a fifth byte is malformed.
pub fn read_variable_int(buf: &mut Buffer) -> Result<u32> {
    let start = buf.position();
    let mut value: u32 = 0;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        if buf.copy_out(&mut byte) == 0 {
            buf.set_position(start);
            return Err(Error::Incomplete { needed: 1 });
        }
        value |= ((byte[0] & 0x7F) as u32) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 21 {
            buf.set_position(start);
            return Err(Error::MalformedPacket(
                "variable-length integer longer than 4 bytes".into(),
            ));
        }
    }
}

pub fn write_u8(buf: &mut Buffer, value: u8) -> Result<()> {
    put(buf, &[value])
}

pub fn read_u8(buf: &mut Buffer) -> Result<u8> {
    need(buf, 1)?;
    let mut byte = [0u8; 1];
    buf.copy_out(&mut byte);
    Ok(byte[0])
}

/// Writes a big-endian u16.
pub fn write_u16(buf: &mut Buffer, value: u16) -> Result<()> {
    put(buf, &value.to_be_bytes())
}

/// Reads a big-endian u16.
pub fn read_u16(buf: &mut Buffer) -> Result<u16> {
    need(buf, 2)?;
    let mut bytes = [0u8; 2];
    buf.copy_out(&mut bytes);
    Ok(u16::from_be_bytes(bytes))
}

/// Encoded size of a length-prefixed field.
pub fn binary_len(data: &[u8]) -> usize {
    2 + data.len()
}

/// Encoded size of a length-prefixed string; `None` encodes as empty.
pub fn string_len(s: Option<&str>) -> usize {
    binary_len(s.unwrap_or_default().as_bytes())
}

/// Writes a 2-byte length followed by the raw bytes.
pub fn write_binary(buf: &mut Buffer, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len()).map_err(|_| {
        Error::InvalidParameter(format!("field of {} bytes exceeds 65535", data.len()))
    })?;
    write_u16(buf, len)?;
    put(buf, data)
}

/// Reads a 2-byte length followed by that many bytes.
pub fn read_binary(buf: &mut Buffer) -> Result<Bytes> {
    let start = buf.position();
    let len = read_u16(buf)? as usize;
    if let Err(e) = need(buf, len) {
        buf.set_position(start);
        return Err(e);
    }
    read_bytes(buf, len)
}

/// Writes a length-prefixed string. `None` writes a zero-length string.
pub fn write_string(buf: &mut Buffer, s: Option<&str>) -> Result<()> {
    write_binary(buf, s.unwrap_or_default().as_bytes())
}

/// Reads a length-prefixed UTF-8 string.
pub fn read_string(buf: &mut Buffer) -> Result<String> {
    let start = buf.position();
    let bytes = read_binary(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| {
        buf.set_position(start);
        Error::MalformedPacket("string is not valid UTF-8".into())
    })
}

/// Reads exactly `n` raw bytes.
pub fn read_bytes(buf: &mut Buffer, n: usize) -> Result<Bytes> {
    need(buf, n)?;
    let bytes = Bytes::copy_from_slice(&buf.remaining()[..n]);
    buf.advance(n);
    Ok(bytes)
}

/// Writes the type/flags byte and the remaining length.
pub fn write_fixed_header(
    buf: &mut Buffer,
    packet_type: PacketType,
    flags: u8,
    remaining_length: usize,
) -> Result<()> {
    let remaining = u32::try_from(remaining_length).unwrap_or(u32::MAX);
    write_u8(buf, ((packet_type as u8) << 4) | (flags & 0x0F))?;
    write_variable_int(buf, remaining)
}

/// Reads the type/flags byte and the remaining length.
pub fn read_fixed_header(buf: &mut Buffer) -> Result<FixedHeader> {
    let start = buf.position();
    let first = read_u8(buf)?;
    let remaining_length = match read_variable_int(buf) {
        Ok(len) => len as usize,
        Err(e) => {
            buf.set_position(start);
            return Err(e);
        }
    };
    let packet_type = PacketType::from_u8(first >> 4).ok_or_else(|| {
        buf.set_position(start);
        Error::MalformedPacket(format!("unknown packet type {}", first >> 4))
    })?;
    Ok(FixedHeader {
        packet_type,
        flags: first & 0x0F,
        remaining_length,
    })
}
