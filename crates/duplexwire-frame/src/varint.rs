//! Variable-length unsigned integers used for every length on the wire.
//!
//! Seven value bits per byte, least-significant group first, high bit set on
//! every byte except the last. At most five bytes; values up to 2^31-1.

use bytes::BufMut;

use crate::error::{FrameError, Result};

/// Longest encoding of an accepted value.
pub const MAX_VARINT_LEN: usize = 5;

/// Largest value that may be encoded or decoded.
pub const MAX_VARINT_VALUE: u32 = i32::MAX as u32;

const CONTINUATION: u8 = 0x80;
const VALUE_MASK: u8 = 0x7F;
/// In the fifth byte only the low three bits may be set (31 bits total).
const LAST_BYTE_MAX: u8 = 0x07;

/// Number of bytes `value` occupies on the wire.
pub fn encoded_len(value: usize) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}

/// Encode `value` into `dst`.
///
/// Fails with [`FrameError::LengthOverflow`] for values above 2^31-1.
pub fn encode_varint(value: usize, dst: &mut impl BufMut) -> Result<()> {
    if value > MAX_VARINT_VALUE as usize {
        return Err(FrameError::LengthOverflow(value));
    }
    let mut remaining = value as u32;
    while remaining >= u32::from(CONTINUATION) {
        dst.put_u8((remaining as u8 & VALUE_MASK) | CONTINUATION);
        remaining >>= 7;
    }
    dst.put_u8(remaining as u8);
    Ok(())
}

/// Encode into a fixed stack buffer, returning it with the used length.
pub fn encode_varint_array(value: usize) -> Result<([u8; MAX_VARINT_LEN], usize)> {
    let mut out = [0u8; MAX_VARINT_LEN];
    let mut cursor = &mut out[..];
    encode_varint(value, &mut cursor)?;
    let used = MAX_VARINT_LEN - cursor.len();
    Ok((out, used))
}

/// Decode a varint from the front of `src`.
///
/// Returns `Ok(None)` when `src` ends before the varint terminates, and
/// `Ok(Some((value, consumed)))` otherwise. A fifth byte that still carries
/// the continuation bit, or that pushes the value past 2^31-1, is a protocol
/// violation.
pub fn decode_varint(src: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut value: u32 = 0;
    for index in 0..MAX_VARINT_LEN {
        let Some(&byte) = src.get(index) else {
            return Ok(None);
        };
        value |= u32::from(byte & VALUE_MASK) << (7 * index);
        if byte & CONTINUATION == 0 {
            if index == MAX_VARINT_LEN - 1 && byte > LAST_BYTE_MAX {
                return Err(FrameError::InvalidVarint("value exceeds 2^31-1"));
            }
            return Ok(Some((value, index + 1)));
        }
    }
    Err(FrameError::InvalidVarint("more than 5 bytes"))
}
