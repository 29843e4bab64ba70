//! STM32G0 target used on the OIS module.

use super::memory_map::{FlashGeometry, PageDescriptor};

/// Product id reported by GET_ID.
pub const PRODUCT_ID: u16 = 0x460;

/// Flash page size in bytes.
pub const PAGE_SIZE: u32 = 2048;

/// 32 pages of 2 KiB.
pub const PAGES: [PageDescriptor; 2] = [PageDescriptor::new(PAGE_SIZE, 32), PageDescriptor::END];

/// Memory map of the 64 KiB part.
pub const GEOMETRY: FlashGeometry = FlashGeometry {
    flash_base: 0x0800_0000,
    sysboot_base: 0x1FFF_0000,
    option_byte_base: 0x1FFF_7800,
    pages: &PAGES,
};

/// Program time of one 256-byte write, in ms.
pub const PROGRAM_TIME_MS: u32 = 37;

/// Erase time of one page, in ms.
pub const PAGE_ERASE_TIME_MS: u32 = 36;

/// Mass erase time: 40 ms per page for 32 pages.
pub const FULL_ERASE_TIME_MS: u32 = 40 * 32;

/// Option-byte bit that must be clear for the application to boot from
/// main flash.
pub const OPTION_GUARD_BIT: u32 = 1 << 24;

/// First flash word of an erased part.
pub const ERASED_WORD: u32 = 0xFFFF_FFFF;
