//! Flash geometry and erase planning.
//!
//! The bootloader erases whole pages by number, while callers think in
//! address ranges. [`FlashGeometry::resolve`] converts one into the other,
//! refusing anything that does not start and end on a page boundary.

use {crate::error::AddressError, crate::protocol::sysboot::FULL_ERASE, std::fmt};

/// A run of equally sized flash pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDescriptor {
    /// Page size in bytes. Zero terminates the table.
    pub size: u32,
    /// Number of pages of this size.
    pub count: u32,
}

impl PageDescriptor {
    /// Table terminator.
    pub const END: Self = Self { size: 0, count: 0 };

    /// A run of `count` pages of `size` bytes.
    pub const fn new(size: u32, count: u32) -> Self {
        Self { size, count }
    }
}

/// Static description of a target's flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashGeometry {
    /// First byte of main flash.
    pub flash_base: u32,
    /// First byte of system memory (the ROM bootloader).
    pub sysboot_base: u32,
    /// First byte of the option bytes.
    pub option_byte_base: u32,
    /// Contiguous page runs from `flash_base`, ending with [`PageDescriptor::END`].
    pub pages: &'static [PageDescriptor],
}

/// Pages to erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseRange {
    /// Every page; sent as the mass-erase sentinel.
    Full {
        /// Number of pages the chip has.
        page_count: u32,
    },
    /// `count` consecutive pages starting at page `start`.
    Pages {
        /// First page number.
        start: u32,
        /// Number of pages.
        count: u32,
    },
}

impl EraseRange {
    /// Start page, or the mass-erase sentinel `0xFFFF`.
    pub fn start_page(&self) -> u32 {
        match self {
            Self::Full { .. } => u32::from(FULL_ERASE),
            Self::Pages { start, .. } => *start,
        }
    }

    /// Number of pages covered.
    pub fn page_count(&self) -> u32 {
        match self {
            Self::Full { page_count } => *page_count,
            Self::Pages { count, .. } => *count,
        }
    }

    /// Whether this is a mass erase.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full { .. })
    }
}

impl fmt::Display for EraseRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full { page_count } => write!(f, "full erase ({page_count} pages)"),
            Self::Pages { start, count } => write!(f, "pages {start}..{}", start + count),
        }
    }
}

impl FlashGeometry {
    fn runs(&self) -> impl Iterator<Item = &PageDescriptor> {
        self.pages
            .iter()
            .take_while(|d| d.size != 0)
    }

    /// Number of pages in main flash.
    pub fn total_pages(&self) -> u32 {
        self.runs()
            .map(|d| d.count)
            .sum()
    }

    /// Size of main flash in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.runs()
            .map(|d| u64::from(d.size) * u64::from(d.count))
            .sum()
    }

    /// Convert `[address, address + length)` into a page range.
    ///
    /// Both ends must fall exactly on page boundaries. A range covering the
    /// whole of flash becomes [`EraseRange::Full`].
    pub fn resolve(&self, address: u32, length: u32) -> Result<EraseRange, AddressError> {
        let unaligned = AddressError::Unaligned { address, length };
        if length == 0 {
            return Err(unaligned);
        }
        let end = u64::from(address) + u64::from(length);

        let mut offset = u64::from(self.flash_base);
        let mut page = 0u32;
        let mut start = None;
        let mut count = None;

        'walk: for run in self.runs() {
            for _ in 0..run.count {
                if start.is_none() && offset == u64::from(address) {
                    start = Some(page);
                }
                offset += u64::from(run.size);
                page += 1;
                if let Some(first) = start {
                    if offset == end {
                        count = Some(page - first);
                        break 'walk;
                    }
                    if offset > end {
                        break 'walk;
                    }
                }
            }
        }

        let (Some(start), Some(count)) = (start, count) else {
            return Err(unaligned);
        };
        if address == self.flash_base && count == self.total_pages() {
            return Ok(EraseRange::Full { page_count: count });
        }
        Ok(EraseRange::Pages { start, count })
    }
}
