//! Wire-level protocol pieces.

pub mod checksum;
pub mod sysboot;

pub use checksum::{checksum16, xor_checksum};
pub use sysboot::{ACK, BUSY, BootloaderInfo, Command, NACK};
