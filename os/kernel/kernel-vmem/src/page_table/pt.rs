//! # Page Table (second level)
//!
//! - [`PtEntry`]: a table entry, always a 4 KiB leaf.
//! - [`PageTable`]: a 4 KiB-aligned array of 1024 entries.

use crate::PageFlags;
use crate::page_table::{PERM_MASK, PS_BIT, TableIndex};
use bitfield_struct::bitfield;
use kernel_addr::{PhysicalAddress, PhysicalPage, Size4K};

/// A second-level table entry mapping one 4 KiB page.
#[bitfield(u32)]
pub struct PtEntry {
    /// Present (bit 0).
    pub present: bool,
    /// Writable (bit 1).
    pub writable: bool,
    /// User (bit 2).
    pub user: bool,
    /// Write-through (bit 3).
    pub write_through: bool,
    /// Cache disable (bit 4).
    pub cache_disable: bool,
    /// Accessed (bit 5).
    pub accessed: bool,
    /// Dirty (bit 6).
    pub dirty: bool,
    /// PAT selector (bit 7; the PS position is repurposed in 4 KiB leaves).
    pub pat: bool,
    /// Global (bit 8).
    pub global: bool,
    /// OS-available (bits 9..11).
    #[bits(3)]
    pub os_available: u8,
    /// Physical frame base, bits 31..12.
    #[bits(20)]
    phys_addr_31_12: u32,
}

impl PtEntry {
    /// A zero (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// The mapped frame and the entry itself, or `None` if not present.
    #[inline]
    #[must_use]
    pub const fn page_4k(self) -> Option<(PhysicalPage<Size4K>, Self)> {
        if !self.present() {
            return None;
        }
        let base = PhysicalAddress::new(self.phys_addr_31_12() << 12);
        Some((PhysicalPage::from_addr(base), self))
    }

    /// A present leaf mapping `page` with `perm` bits.
    ///
    /// The PS position carries PAT semantics here, so a stray `LARGE` flag is
    /// stripped rather than written.
    #[inline]
    #[must_use]
    pub const fn leaf_with(perm: PageFlags, page: PhysicalPage<Size4K>) -> Self {
        Self::from_bits(
            (perm.bits() & PERM_MASK & !PS_BIT)
                | crate::page_table::PRESENT_BIT
                | page.base().as_u32(),
        )
    }
}

/// A second-level page table: 1024 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PtEntry; 1024],
}

impl PageTable {
    /// Read the entry at `i`. Plain load, no TLB implications.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PtEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing active
    /// mappings.
    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PtEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Mutable access to the slot at `i`.
    #[inline]
    #[must_use]
    pub fn entry_mut(&mut self, i: TableIndex) -> &mut PtEntry {
        &mut self.entries[i.as_usize()]
    }

    /// Clear every entry.
    #[inline]
    pub fn zero(&mut self) {
        self.entries = [PtEntry::zero(); 1024];
    }
}
