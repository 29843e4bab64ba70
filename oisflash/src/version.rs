//! Eight-byte firmware version tags.
//!
//! A tag is four bytes of hardware identity followed by four bytes of vendor
//! revision, for example `1ADA0101`. Every byte must be an ASCII letter or
//! digit; a tag with anything else in it is treated as corrupt.

use {
    crate::error::VersionError,
    std::{fmt, str::FromStr},
};

/// Length of a version tag.
pub const VERSION_LEN: usize = 8;

/// Length of the hardware prefix that identifies compatible firmware.
pub const HW_PREFIX_LEN: usize = 4;

/// First version bytes used by development cores.
pub const DEV_CORES: &[u8] = b"ABEFIJMN";

/// Hardware prefix of the legacy line that must always move to the new rule
/// set.
pub const LEGACY_PREFIX: &[u8; HW_PREFIX_LEN] = b"1ADB";

/// Validated version tag.
///
/// Ordering is byte-wise, so a later vendor revision of the same hardware
/// compares greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionRecord([u8; VERSION_LEN]);

impl VersionRecord {
    /// Validate `bytes` as a tag.
    pub fn parse(bytes: &[u8]) -> Result<Self, VersionError> {
        let tag: [u8; VERSION_LEN] = bytes
            .try_into()
            .map_err(|_| VersionError::Length(bytes.len()))?;
        if let Some((index, &byte)) = tag
            .iter()
            .enumerate()
            .find(|(_, b)| !b.is_ascii_alphanumeric())
        {
            return Err(VersionError::NonAlphanumeric { index, byte });
        }
        Ok(Self(tag))
    }

    /// Raw tag bytes.
    pub fn as_bytes(&self) -> &[u8; VERSION_LEN] {
        &self.0
    }

    /// The hardware half of the tag.
    pub fn hw_prefix(&self) -> &[u8] {
        &self.0[..HW_PREFIX_LEN]
    }

    /// Whether both tags describe the same hardware.
    pub fn same_hw(&self, other: &Self) -> bool {
        self.hw_prefix() == other.hw_prefix()
    }

    /// Whether the tag belongs to a development core.
    pub fn is_dev_core(&self) -> bool {
        DEV_CORES.contains(&self.0[0])
    }
}

impl fmt::Display for VersionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            write!(f, "{}", char::from(b))?;
        }
        Ok(())
    }
}

impl FromStr for VersionRecord {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.as_bytes())
    }
}
