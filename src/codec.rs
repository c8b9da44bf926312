//! Field encoding for record payloads.
//!
//! Records are a flat sequence of fields with no framing of their own: the
//! reader must consume them in the order and with the widths they were
//! written. Three encodings are supported:
//!
//! - fixed-width little-endian integers and floats,
//! - stop-bit varints (7 value bits per byte, high bit set when another byte
//!   follows, least-significant group first),
//! - length-prefixed text/bytes (varint length, then the raw bytes).
//!
//! Varints are unsigned. Signed values go through [`zigzag_encode`] /
//! [`zigzag_decode`] explicitly; the codec never does it implicitly.
//!
//! Neither cursor allocates. A failed write or read leaves the cursor where
//! it was.

use crate::{Error, Result};

/// Longest stop-bit encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Number of bytes `value` occupies as a stop-bit varint.
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    (bits + 6) / 7
}

/// Encodes `value` at the start of `buf`, returning the number of bytes used.
pub fn encode_varint(buf: &mut [u8], value: u64) -> Result<usize> {
    let len = varint_len(value);
    if buf.len() < len {
        return Err(Error::ReservationOverflow {
            requested: len,
            remaining: buf.len(),
        });
    }
    let mut value = value;
    let mut i = 0;
    while value >= 0x80 {
        buf[i] = (value as u8) | 0x80;
        value >>= 7;
        i += 1;
    }
    buf[i] = value as u8;
    Ok(len)
}

/// Decodes a varint from the start of `buf`, returning `(value, bytes_read)`.
///
/// A run that reaches the end of `buf` without a terminating byte is
/// `MalformedVarint`; a run still continuing after ten bytes is
/// `TruncatedInput`, as is a tenth byte carrying bits past 64.
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        let byte = *buf.get(i).ok_or(Error::MalformedVarint)?;
        let group = u64::from(byte & 0x7F);
        if i == MAX_VARINT_LEN - 1 && (byte & 0x80 != 0 || group > 1) {
            return Err(Error::TruncatedInput {
                needed: MAX_VARINT_LEN + 1,
                remaining: MAX_VARINT_LEN,
            });
        }
        value |= group << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(Error::TruncatedInput {
        needed: MAX_VARINT_LEN + 1,
        remaining: MAX_VARINT_LEN,
    })
}

pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Write cursor over a caller-supplied buffer.
#[derive(Debug)]
pub struct ByteWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ByteWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Resumes writing at `pos`; `pos` is clamped to the buffer length.
    pub fn with_position(buf: &'a mut [u8], pos: usize) -> Self {
        let pos = pos.min(buf.len());
        Self { buf, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Bytes written so far.
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    fn ensure(&self, len: usize) -> Result<()> {
        if len > self.remaining() {
            return Err(Error::ReservationOverflow {
                requested: len,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    /// Appends `bytes` verbatim, with no length prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure(bytes.len())?;
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<()> {
        self.put_raw(&[value])
    }

    pub fn put_i8(&mut self, value: i8) -> Result<()> {
        self.put_raw(&value.to_le_bytes())
    }

    pub fn put_bool(&mut self, value: bool) -> Result<()> {
        self.put_u8(u8::from(value))
    }

    pub fn put_u16(&mut self, value: u16) -> Result<()> {
        self.put_raw(&value.to_le_bytes())
    }

    pub fn put_i16(&mut self, value: i16) -> Result<()> {
        self.put_raw(&value.to_le_bytes())
    }

    pub fn put_u32(&mut self, value: u32) -> Result<()> {
        self.put_raw(&value.to_le_bytes())
    }

    pub fn put_i32(&mut self, value: i32) -> Result<()> {
        self.put_raw(&value.to_le_bytes())
    }

    pub fn put_u64(&mut self, value: u64) -> Result<()> {
        self.put_raw(&value.to_le_bytes())
    }

    pub fn put_i64(&mut self, value: i64) -> Result<()> {
        self.put_raw(&value.to_le_bytes())
    }

    pub fn put_f64(&mut self, value: f64) -> Result<()> {
        self.put_raw(&value.to_le_bytes())
    }

    pub fn put_varint(&mut self, value: u64) -> Result<()> {
        let len = encode_varint(&mut self.buf[self.pos..], value)?;
        self.pos += len;
        Ok(())
    }

    /// Length-prefixed byte string.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let len = bytes.len() as u64;
        self.ensure(varint_len(len) + bytes.len())?;
        self.put_varint(len)?;
        self.put_raw(bytes)
    }

    /// Length-prefixed UTF-8 text.
    pub fn put_str(&mut self, text: &str) -> Result<()> {
        self.put_bytes(text.as_bytes())
    }
}

/// Read cursor over an immutable buffer.
#[derive(Debug, Clone, Copy)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn with_position(buf: &'a [u8], pos: usize) -> Self {
        let pos = pos.min(buf.len());
        Self { buf, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Total readable length.
    pub fn limit(&self) -> usize {
        self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn get_raw(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::TruncatedInput {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn get_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.get_raw(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get_array::<1>()?[0])
    }

    pub fn get_i8(&mut self) -> Result<i8> {
        Ok(i8::from_le_bytes(self.get_array()?))
    }

    /// Any non-zero byte reads as `true`.
    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.get_array()?))
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.get_array()?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.get_array()?))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.get_array()?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.get_array()?))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.get_array()?))
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.get_array()?))
    }

    pub fn get_varint(&mut self) -> Result<u64> {
        let (value, len) = decode_varint(&self.buf[self.pos..])?;
        self.pos += len;
        Ok(value)
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        let len = self.get_varint()?;
        let len = match usize::try_from(len) {
            Ok(len) if len <= self.remaining() => len,
            _ => {
                let remaining = self.remaining();
                self.pos = start;
                return Err(Error::TruncatedInput {
                    needed: usize::try_from(len).unwrap_or(usize::MAX),
                    remaining,
                });
            }
        };
        self.get_raw(len)
    }

    pub fn get_str(&mut self) -> Result<&'a str> {
        let start = self.pos;
        let bytes = self.get_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| {
            self.pos = start;
            Error::Corrupt("text field is not valid utf-8")
        })
    }
}
