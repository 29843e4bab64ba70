//! STM32 system bootloader framing over I2C (AN4221).
//!
//! Every command opens with a two-byte command frame, the opcode followed by
//! its bitwise complement. Further sub-frames carry a trailing XOR checksum.
//!
//! ```text
//! command   +--------+---------+
//!           | opcode | !opcode |
//!           +--------+---------+
//! address   +-------------------+------+
//!           | address (u32, BE) | xor  |
//!           +-------------------+------+
//! read len  +-------+--------+
//!           |  n-1  | !(n-1) |
//!           +-------+--------+
//! write     +-------+----------------+------+
//!           |  n-1  | data (n bytes) | xor  |
//!           +-------+----------------+------+
//! erase     +------------------+------+   +---------------------+------+
//!           | count-1 (u16,BE) | xor  |   | page numbers (BE)   | xor  |
//!           +------------------+------+   +---------------------+------+
//! ```
//!
//! The target answers each frame with a single status byte: [`ACK`],
//! [`NACK`] or [`BUSY`].

use {
    crate::{
        error::{Error, Result},
        protocol::checksum::xor_checksum,
    },
    byteorder::{BigEndian, ByteOrder},
};

/// Positive acknowledgment.
pub const ACK: u8 = 0x79;

/// Negative acknowledgment.
pub const NACK: u8 = 0x1F;

/// The bootloader is still working on the previous frame.
pub const BUSY: u8 = 0x76;

/// Synchronization byte sent once after entering the bootloader.
pub const SYNC: u8 = 0xFF;

/// Largest payload of a single read or write command.
pub const MAX_PAYLOAD: usize = 256;

/// Page number that requests a mass erase.
pub const FULL_ERASE: u16 = 0xFFFF;

/// Bootloader command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Bootloader version and supported commands.
    Get = 0x00,
    /// Bootloader version.
    GetVersion = 0x01,
    /// Product id.
    GetId = 0x02,
    /// Read up to 256 bytes of memory.
    ReadMemory = 0x11,
    /// Jump to application code.
    Go = 0x21,
    /// Write up to 256 bytes of memory.
    WriteMemory = 0x31,
    /// Extended erase (two-byte page numbers).
    Erase = 0x44,
    /// Disable flash write protection.
    WriteUnprotect = 0x73,
    /// Disable flash read protection (triggers a mass erase).
    ReadUnprotect = 0x92,
}

impl Command {
    /// Bitwise complement sent after the opcode.
    pub fn complement(self) -> u8 {
        !(self as u8)
    }

    /// The two-byte command frame.
    pub fn frame(self) -> [u8; 2] {
        [self as u8, self.complement()]
    }

    /// Look up a command by opcode.
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            0x00 => Some(Self::Get),
            0x01 => Some(Self::GetVersion),
            0x02 => Some(Self::GetId),
            0x11 => Some(Self::ReadMemory),
            0x21 => Some(Self::Go),
            0x31 => Some(Self::WriteMemory),
            0x44 => Some(Self::Erase),
            0x73 => Some(Self::WriteUnprotect),
            0x92 => Some(Self::ReadUnprotect),
            _ => None,
        }
    }

    /// Short human-readable name, for logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::GetVersion => "GET_VERSION",
            Self::GetId => "GET_ID",
            Self::ReadMemory => "READ_MEMORY",
            Self::Go => "GO",
            Self::WriteMemory => "WRITE_MEMORY",
            Self::Erase => "ERASE",
            Self::WriteUnprotect => "WRITE_UNPROTECT",
            Self::ReadUnprotect => "READ_UNPROTECT",
        }
    }
}

/// The single synchronization frame. It has no complement and no ACK.
pub fn sync_frame() -> [u8; 1] {
    [SYNC]
}

/// Start address followed by its checksum.
pub fn address_frame(address: u32) -> Result<[u8; 5]> {
    let mut frame = [0u8; 5];
    BigEndian::write_u32(&mut frame[..4], address);
    frame[4] = xor_checksum(&frame[..4])?;
    Ok(frame)
}

fn check_payload_len(len: usize) -> Result<u8> {
    if len == 0 || len > MAX_PAYLOAD {
        return Err(Error::Protocol(format!(
            "payload length must be 1..={MAX_PAYLOAD}, got {len}"
        )));
    }
    #[allow(clippy::cast_possible_truncation)] // len - 1 <= 255
    Ok((len - 1) as u8)
}

/// Number of bytes to read, as `n-1` and its complement.
pub fn read_length_frame(len: usize) -> Result<[u8; 2]> {
    let n = check_payload_len(len)?;
    Ok([n, !n])
}

/// Length, payload and checksum of a write-memory command.
pub fn write_frame(data: &[u8]) -> Result<Vec<u8>> {
    let n = check_payload_len(data.len())?;
    let mut frame = Vec::with_capacity(data.len() + 2);
    frame.push(n);
    frame.extend_from_slice(data);
    let sum = xor_checksum(&frame)?;
    frame.push(sum);
    Ok(frame)
}

/// First erase parameter frame for a mass erase.
pub fn full_erase_frame() -> [u8; 3] {
    let [hi, lo] = FULL_ERASE.to_be_bytes();
    [hi, lo, hi ^ lo]
}

/// First erase parameter frame for a page erase: page count minus one.
pub fn erase_count_frame(count: u16) -> Result<[u8; 3]> {
    if count == 0 {
        return Err(Error::Protocol("page erase of zero pages".into()));
    }
    let [hi, lo] = (count - 1).to_be_bytes();
    Ok([hi, lo, hi ^ lo])
}

/// Second erase parameter frame: consecutive page numbers and checksum.
pub fn erase_pages_frame(start: u16, count: u16) -> Result<Vec<u8>> {
    if count == 0 || u32::from(start) + u32::from(count) > u32::from(FULL_ERASE) {
        return Err(Error::Protocol(format!(
            "invalid page range {start}+{count}"
        )));
    }
    let mut frame = vec![0u8; usize::from(count) * 2];
    for (i, slot) in frame
        .chunks_exact_mut(2)
        .enumerate()
    {
        #[allow(clippy::cast_possible_truncation)] // i < count
        BigEndian::write_u16(slot, start + i as u16);
    }
    let sum = xor_checksum(&frame)?;
    frame.push(sum);
    Ok(frame)
}

/// Decode the GET_ID payload `[n, id_hi, id_lo]` into the product id.
pub fn parse_product_id(payload: &[u8]) -> Result<u16> {
    match payload {
        [1, hi, lo, ..] => Ok(BigEndian::read_u16(&[*hi, *lo])),
        _ => Err(Error::Protocol(format!(
            "unexpected GET_ID payload {payload:02X?}"
        ))),
    }
}

/// Decoded GET response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootloaderInfo {
    /// Bootloader protocol version, `0x11` for v1.1.
    pub version: u8,
    /// Opcodes the bootloader accepts.
    pub commands: Vec<u8>,
}

impl BootloaderInfo {
    /// Decode the GET payload `[n, version, opcode...]` where `n` counts the
    /// bytes that follow, minus one.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (&n, rest) = payload
            .split_first()
            .ok_or_else(|| Error::Protocol("empty GET response".into()))?;
        let len = usize::from(n) + 1;
        if rest.len() < len {
            return Err(Error::Protocol(format!(
                "GET response truncated: expected {len} bytes, got {}",
                rest.len()
            )));
        }
        Ok(Self {
            version: rest[0],
            commands: rest[1..len].to_vec(),
        })
    }

    /// Whether `command` is in the supported list.
    pub fn supports(&self, command: Command) -> bool {
        self.commands
            .contains(&(command as u8))
    }
}
