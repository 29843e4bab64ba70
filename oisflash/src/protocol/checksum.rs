//! Checksums used on the bootloader wire and over firmware images.

use crate::error::{Error, Result};

/// 8-bit XOR checksum of a bootloader sub-frame.
///
/// The first byte seeds the sum as-is and every following byte is XORed in,
/// so a one-byte frame checksums to itself. An empty input has no checksum.
pub fn xor_checksum(bytes: &[u8]) -> Result<u8> {
    let (first, rest) = bytes
        .split_first()
        .ok_or_else(|| Error::Protocol("checksum over empty frame".into()))?;
    Ok(rest
        .iter()
        .fold(*first, |acc, b| acc ^ b))
}

/// 16-bit additive checksum of a firmware image.
///
/// Sums little-endian 16-bit words with wrap-around. A trailing odd byte is
/// taken as a word with a zero high byte.
pub fn checksum16(data: &[u8]) -> u16 {
    data.chunks(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]))
        .fold(0u16, u16::wrapping_add)
}
