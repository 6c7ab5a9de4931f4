//! # Page Directory (first level)
//!
//! This module models the upper translation level:
//!
//! - [`PdEntry`]: a directory entry that is either a pointer to a second-level
//!   table (`PS=0`) or a terminal 4 MiB leaf (`PS=1`).
//! - [`Pde`] / [`Pde4M`]: the two bit layouts behind those roles.
//! - [`PdEntryKind`]: decoded view of a present entry.
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 entries.
//!
//! ## Semantics
//!
//! The `PS` bit selects the role of an entry:
//! - `PS=0`: entry points to a second-level page table, 4 KiB-aligned.
//! - `PS=1`: entry is a 4 MiB leaf mapping; the base must be 4 MiB-aligned.
//!
//! ## Invariants & Notes
//!
//! - A present non-leaf entry *owns* one reference to its child table frame.
//! - Raw constructors don't validate consistency; callers must ensure
//!   correctness.
//! - TLB maintenance is the caller's responsibility after mutating active
//!   mappings.

use crate::PageFlags;
use crate::page_table::{DirIndex, PERM_MASK, PRESENT_BIT, PS_BIT};
use bitfield_struct::bitfield;
use kernel_addr::{PhysicalAddress, PhysicalPage, Size4K, Size4M};

/// Non-leaf directory entry: pointer to a second-level table (`PS = 0`).
#[bitfield(u32)]
pub struct Pde {
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
    /// Dirty (bit 6): ignored in non-leaf entries.
    #[bits(1)]
    __d_ignored: u8,
    /// PS (bit 7): must be 0 in non-leaf entries.
    #[bits(1)]
    __ps_must_be_0: u8,
    /// Global (bit 8): ignored in non-leaf entries.
    #[bits(1)]
    __g_ignored: u8,
    /// OS-available (bits 9..11).
    #[bits(3)]
    pub os_available: u8,
    /// Second-level table physical address, bits 31..12 (4 KiB-aligned).
    #[bits(20)]
    phys_addr_31_12: u32,
}

impl Pde {
    /// Get the second-level table base.
    #[inline]
    #[must_use]
    pub const fn table_page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(self.phys_addr_31_12() << 12))
    }
}

/// Leaf directory entry: maps a single 4 MiB page (`PS = 1`).
///
/// The PAT selector moves to bit 12 in this form; bits 13..21 are
/// reserved-zero and the base address uses bits 31..22.
#[bitfield(u32)]
pub struct Pde4M {
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
    /// Dirty (bit 6): set by the CPU on first write to the 4 MiB page.
    pub dirty: bool,
    /// Page size (bit 7): must be 1 for a 4 MiB leaf.
    #[bits(default = true)]
    pub(crate) page_size: bool,
    /// Global (bit 8): TLB entry survives CR3 reload.
    pub global: bool,
    /// OS-available (bits 9..11).
    #[bits(3)]
    pub os_available: u8,
    /// PAT selector for large mappings (bit 12).
    pub pat_large: bool,
    /// Reserved (bits 13..21): must be 0.
    #[bits(9)]
    __res13_21: u16,
    /// Physical address bits 31..22 (4 MiB-aligned base).
    #[bits(10)]
    phys_addr_31_22: u16,
}

impl Pde4M {
    /// Get the 4 MiB page base.
    #[inline]
    #[must_use]
    pub const fn physical_page(self) -> PhysicalPage<Size4M> {
        PhysicalPage::from_addr(PhysicalAddress::new((self.phys_addr_31_22() as u32) << 22))
    }
}

/// Borrowed view into a directory entry, chosen by the PS bit.
pub enum PdView {
    /// Non-leaf form (PS=0).
    Table(Pde),
    /// 4 MiB leaf form (PS=1).
    Leaf4M(Pde4M),
}

/// Decoded kind of a *present* directory entry.
pub enum PdEntryKind {
    /// Non-leaf (`PS=0`): the 4 KiB-aligned second-level table base.
    NextTable(PhysicalPage<Size4K>, Pde),
    /// Leaf (`PS=1`): the 4 MiB-aligned large-page base.
    Leaf4MiB(PhysicalPage<Size4M>, Pde4M),
}

/// A raw directory slot; overlay the typed forms via [`PdEntry::view`] or
/// [`PdEntry::kind`].
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PdEntry(u32);

impl PdEntry {
    /// A zero (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn present(self) -> bool {
        self.0 & PRESENT_BIT != 0
    }

    /// Present with the PS bit set.
    #[inline]
    #[must_use]
    pub const fn is_large(self) -> bool {
        self.present() && self.0 & PS_BIT != 0
    }

    /// Typed read-only view chosen by the PS bit.
    #[inline]
    #[must_use]
    pub const fn view(self) -> PdView {
        if self.0 & PS_BIT != 0 {
            PdView::Leaf4M(Pde4M::from_bits(self.0))
        } else {
            PdView::Table(Pde::from_bits(self.0))
        }
    }

    /// Decode the entry into its semantic kind, or `None` if not present.
    #[inline]
    #[must_use]
    pub const fn kind(self) -> Option<PdEntryKind> {
        if !self.present() {
            return None;
        }
        Some(match self.view() {
            PdView::Table(e) => PdEntryKind::NextTable(e.table_page(), e),
            PdView::Leaf4M(e) => PdEntryKind::Leaf4MiB(e.physical_page(), e),
        })
    }

    /// A present non-leaf entry pointing at `table` with `perm` bits.
    ///
    /// Forces `PS=0`; the table base must be 4 KiB-aligned.
    #[inline]
    #[must_use]
    pub const fn table_with(perm: PageFlags, table: PhysicalPage<Size4K>) -> Self {
        Self((perm.bits() & PERM_MASK & !PS_BIT) | PRESENT_BIT | table.base().as_u32())
    }

    /// A present 4 MiB leaf mapping `page` with `perm` bits.
    #[inline]
    #[must_use]
    pub const fn large_with(perm: PageFlags, page: PhysicalPage<Size4M>) -> Self {
        Self((perm.bits() & PERM_MASK) | PRESENT_BIT | PS_BIT | page.base().as_u32())
    }
}

impl core::fmt::Debug for PdEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PdEntry(0x{:08X})", self.0)
    }
}

/// The page directory: 1024 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; 1024],
}

impl PageDirectory {
    /// Read the entry at `i`. Plain load, no TLB implications.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: DirIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing active
    /// mappings.
    #[inline]
    pub const fn set(&mut self, i: DirIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Mutable access to the slot at `i`.
    #[inline]
    #[must_use]
    pub fn entry_mut(&mut self, i: DirIndex) -> &mut PdEntry {
        &mut self.entries[i.as_usize()]
    }

    /// Clear every entry.
    #[inline]
    pub fn zero(&mut self) {
        self.entries = [PdEntry::zero(); 1024];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_vs_large_leaf() {
        let table = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x0030_0000));
        let e_tbl = PdEntry::table_with(PageFlags::WRITABLE | PageFlags::USER, table);
        match e_tbl.kind().unwrap() {
            PdEntryKind::NextTable(p, f) => {
                assert_eq!(p.base().as_u32(), 0x0030_0000);
                assert!(f.writable() && f.user());
                assert_eq!(f.into_bits() & PS_BIT, 0, "must be PS=0");
            }
            PdEntryKind::Leaf4MiB(..) => panic!("expected next table"),
        }

        let big = PhysicalPage::<Size4M>::from_addr(PhysicalAddress::new(0x0040_0000));
        let e_4m = PdEntry::large_with(PageFlags::WRITABLE | PageFlags::LARGE, big);
        match e_4m.kind().unwrap() {
            PdEntryKind::Leaf4MiB(p, f) => {
                assert_eq!(p.base().as_u32(), 0x0040_0000);
                assert!(f.page_size());
                assert!(f.writable());
            }
            PdEntryKind::NextTable(..) => panic!("expected 4 MiB leaf"),
        }
    }

    #[test]
    fn table_with_strips_ps() {
        let table = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x1000));
        let e = PdEntry::table_with(PageFlags::LARGE | PageFlags::WRITABLE, table);
        assert!(!e.is_large());
    }

    #[test]
    fn architectural_bit_positions() {
        let big = PhysicalPage::<Size4M>::from_addr(PhysicalAddress::new(0x0080_0000));
        let e = PdEntry::large_with(
            PageFlags::WRITABLE | PageFlags::USER | PageFlags::GLOBAL,
            big,
        );
        let bits = e.into_bits();
        assert_eq!(bits & 0x1, 0x1, "present at bit 0");
        assert_eq!(bits & 0x2, 0x2, "writable at bit 1");
        assert_eq!(bits & 0x4, 0x4, "user at bit 2");
        assert_eq!(bits & 0x80, 0x80, "PS at bit 7");
        assert_eq!(bits & 0x100, 0x100, "global at bit 8");
        assert_eq!(bits & 0xFFC0_0000, 0x0080_0000, "base at bits 31..22");
    }

    #[test]
    fn zero_entry_has_no_kind() {
        assert!(PdEntry::zero().kind().is_none());
        assert!(!PdEntry::zero().present());
    }
}
