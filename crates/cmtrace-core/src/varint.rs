//! Variable-length integer codec used by the compact trace format.
//!
//! Values up to 28 bits are written as 1-4 bytes, least significant 7-bit
//! group first. Bit 7 marks the *last* byte of a value, which is the
//! inverse of the usual LEB128 continuation convention.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Maximum number of bytes a single value may occupy.
pub const MAX_ENCODED_LEN: usize = 4;

/// Largest value representable on the wire (28 bits).
pub const MAX_VALUE: u32 = (1 << 28) - 1;

const DATA_MASK: u8 = 0x7f;
const TERMINATOR: u8 = 0x80;

#[derive(Debug, Error)]
pub enum VarintError {
    #[error("value {value} exceeds the 28-bit wire limit")]
    TooLarge { value: u64 },
    #[error("unterminated integer: no terminator within 4 bytes")]
    Unterminated,
    #[error("unterminated integer: stream ended after {consumed} byte(s)")]
    Truncated { consumed: usize },
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Encode `value` into `buf`, returning the number of bytes used.
pub fn encode(value: u64, buf: &mut [u8; MAX_ENCODED_LEN]) -> Result<usize, VarintError> {
    if value > u64::from(MAX_VALUE) {
        return Err(VarintError::TooLarge { value });
    }

    let mut x = value;
    let mut len = 0;
    loop {
        let mut byte = (x as u8) & DATA_MASK;
        x >>= 7;
        if x == 0 {
            byte |= TERMINATOR;
        }
        buf[len] = byte;
        len += 1;
        if x == 0 {
            return Ok(len);
        }
    }
}

/// Number of bytes `value` occupies on the wire.
pub fn encoded_len(value: u64) -> Result<usize, VarintError> {
    let mut buf = [0u8; MAX_ENCODED_LEN];
    encode(value, &mut buf)
}

/// Encode `value` and write it to `out`.
pub fn write<W: Write + ?Sized>(out: &mut W, value: u64) -> Result<usize, VarintError> {
    let mut buf = [0u8; MAX_ENCODED_LEN];
    let len = encode(value, &mut buf)?;
    out.write_all(&buf[..len])?;
    Ok(len)
}

/// Read one value from `input`.
///
/// Returns `Ok(None)` when the stream is exhausted before the first byte,
/// which is the only clean way for a stream to end.
pub fn read<R: Read + ?Sized>(input: &mut R) -> Result<Option<(u32, usize)>, VarintError> {
    let mut value: u32 = 0;
    for consumed in 0..MAX_ENCODED_LEN {
        let Some(byte) = read_byte(input)? else {
            if consumed == 0 {
                return Ok(None);
            }
            return Err(VarintError::Truncated { consumed });
        };
        value |= u32::from(byte & DATA_MASK) << (7 * consumed);
        if byte & TERMINATOR != 0 {
            return Ok(Some((value, consumed + 1)));
        }
    }
    Err(VarintError::Unterminated)
}

/// Decode one value from the front of `bytes`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode(bytes: &[u8]) -> Result<Option<(u32, usize)>, VarintError> {
    let mut cursor = bytes;
    read(&mut cursor)
}

fn read_byte<R: Read + ?Sized>(input: &mut R) -> io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match input.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}
