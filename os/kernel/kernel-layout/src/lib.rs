//! # Memory Layout
//!
//! The virtual memory map and the physical-memory bounds the rest of the
//! memory subsystem builds against.
//!
//! ```text
//! 4 GiB ─────────────────────► +------------------------------+
//!                              |   remapped physical memory   |  kernel RW
//! KERNBASE ──────────────────► +------------------------------+
//!                              |   page tables as memory      |  kernel RW
//! VPT, KSTACKTOP* ───────────► +------------------------------+
//!                              |        kernel stack          |  kernel RW
//!                              | - - - - - - - - - - - - - - -|
//!                              |     unbacked (guard gap)     |
//! ULIM ──────────────────────► +------------------------------+
//!                              |   page tables as memory      |  user R
//! UVPT ──────────────────────► +------------------------------+
//!                              |     frame database window    |  user R
//! UPAGES ────────────────────► +------------------------------+
//!                              |    process table window      |  user R
//! UENVS, UTOP ───────────────► +------------------------------+
//!                              |                              |
//!                              |      user address space      |  user RW
//!                              |                              |
//! 0 ─────────────────────────► +------------------------------+
//! ```
//!
//! (*) the kernel stack grows down from [`KSTACKTOP`], which coincides with
//! [`VPT`]; only [`KSTKSIZE`] bytes are backed, the rest of its directory
//! span faults on access. The [`VPT`] window itself spans `[VPT, KERNBASE)`.
//!
//! [`ULIM`] is the user/kernel split: user-mode code may not touch anything
//! at or above it, and everything user-visible above [`UTOP`] is read-only.

#![cfg_attr(not(any(test, doctest)), no_std)]

use kernel_addr::{PageSize, PhysicalAddress, Size4K, Size4M, align_down};

/// Bytes in one base page.
pub const PGSIZE: u32 = Size4K::SIZE;

/// Bytes of virtual address space one directory entry spans
/// (and the size of one large page).
pub const PTSIZE: u32 = Size4M::SIZE;

/// Entries in a page directory.
pub const NPDENTRIES: usize = 1024;

/// Entries in a second-level page table.
pub const NPTENTRIES: usize = 1024;

/// All physical memory is remapped here, read-write for the kernel.
pub const KERNBASE: u32 = 0xC000_0000;

/// Kernel-read-write self-referential directory mapping: the page tables of
/// the current address space, visible as ordinary memory.
pub const VPT: u32 = KERNBASE - PTSIZE;

/// Top of the kernel stack.
pub const KSTACKTOP: u32 = VPT;

/// Bytes of backed kernel stack below [`KSTACKTOP`].
pub const KSTKSIZE: u32 = 8 * PGSIZE;

/// The user/kernel split: no user access at or above this address.
pub const ULIM: u32 = KSTACKTOP - PTSIZE;

/// User-read-only self-referential directory mapping.
pub const UVPT: u32 = ULIM - PTSIZE;

/// User-read-only window onto the frame database array.
pub const UPAGES: u32 = UVPT - PTSIZE;

/// User-read-only window onto the process table.
pub const UENVS: u32 = UPAGES - PTSIZE;

/// Top of the user-writable address range.
pub const UTOP: u32 = UENVS;

/// Start of the legacy device/BIOS hole in physical memory.
pub const IOPHYSMEM: u32 = 0x000A_0000;

/// End of the hole; extended memory begins here.
pub const EXTPHYSMEM: u32 = 0x0010_0000;

const _: () = {
    assert!(KERNBASE % PTSIZE == 0);
    assert!(VPT % PTSIZE == 0 && UVPT % PTSIZE == 0);
    assert!(UPAGES % PTSIZE == 0 && UENVS % PTSIZE == 0);
    assert!(KSTKSIZE % PGSIZE == 0 && KSTKSIZE <= PTSIZE);
    assert!(VPT + PTSIZE == KERNBASE);
    assert!(ULIM == KSTACKTOP - PTSIZE);
    assert!(UTOP == UENVS);
    assert!(IOPHYSMEM < EXTPHYSMEM);
};

/// Physical memory as reported by the boot-time hardware probe.
///
/// The probe itself (CMOS, BIOS maps, whatever the platform offers) lives
/// with the boot code; this type only carries its result: the byte counts of
/// base memory and of extended memory above the [`EXTPHYSMEM`] hole.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DetectedMemory {
    base: u32,
    extended: u32,
}

impl DetectedMemory {
    /// Record a probe result. Both counts are rounded down to whole pages.
    #[inline]
    #[must_use]
    pub const fn new(base_bytes: u32, extended_bytes: u32) -> Self {
        Self {
            base: align_down(base_bytes, PGSIZE),
            extended: align_down(extended_bytes, PGSIZE),
        }
    }

    /// Bytes of base memory.
    #[inline]
    #[must_use]
    pub const fn base_bytes(self) -> u32 {
        self.base
    }

    /// Bytes of extended memory.
    #[inline]
    #[must_use]
    pub const fn extended_bytes(self) -> u32 {
        self.extended
    }

    /// One past the highest usable physical address.
    ///
    /// With extended memory present the machine is usable up to
    /// `EXTPHYSMEM + extended`; otherwise only base memory exists.
    #[inline]
    #[must_use]
    pub const fn max_phys(self) -> PhysicalAddress {
        if self.extended > 0 {
            PhysicalAddress::new(EXTPHYSMEM + self.extended)
        } else {
            PhysicalAddress::new(self.base)
        }
    }

    /// Number of physical page frames below [`Self::max_phys`].
    #[inline]
    #[must_use]
    pub const fn page_count(self) -> usize {
        (self.max_phys().as_u32() / PGSIZE) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_ordering() {
        assert!(UENVS < UPAGES && UPAGES < UVPT && UVPT < ULIM);
        assert!(ULIM < KSTACKTOP && KSTACKTOP < KERNBASE);
        assert_eq!(UTOP, UENVS);
        assert_eq!(KSTACKTOP, VPT);
    }

    #[test]
    fn detected_memory_with_extended() {
        let mem = DetectedMemory::new(640 * 1024, 63 * 1024 * 1024);
        assert_eq!(mem.max_phys().as_u32(), EXTPHYSMEM + 63 * 1024 * 1024);
        assert_eq!(mem.page_count(), (mem.max_phys().as_u32() / PGSIZE) as usize);
    }

    #[test]
    fn detected_memory_base_only() {
        let mem = DetectedMemory::new(640 * 1024, 0);
        assert_eq!(mem.max_phys().as_u32(), 640 * 1024);
        assert_eq!(mem.page_count(), 160);
    }

    #[test]
    fn detected_memory_rounds_down() {
        let mem = DetectedMemory::new(640 * 1024 + 123, 0);
        assert_eq!(mem.base_bytes(), 640 * 1024);
    }
}
