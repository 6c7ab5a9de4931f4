//! # Virtual Memory Support
//!
//! Two-level paging for a 32-bit protected-mode kernel.
//!
//! ## What you get
//! - An [`address space`](address_space) rooted at a page directory, with the
//!   walk/insert/remove/lookup operations every higher layer builds on.
//! - Typed [`page_table`] entry and table structures matching the MMU's
//!   entry formats bit for bit.
//! - [`PageFlags`] for the permission bits callers pass around.
//! - Allocator/mapper seams ([`TableAlloc`], [`FrameTable`], [`PhysMapper`])
//!   so the same walker serves boot-time and steady-state allocation.
//! - The [`user_access`] validator that syscall argument checking runs
//!   through.
//!
//! ## Virtual Address → Physical Address Walk
//!
//! Each 32-bit virtual address is divided into three fields:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  DIR  | TABLE | Offset |
//! ```
//!
//! The CPU uses the two index fields to walk two levels of tables, each
//! containing 1024 entries of 4 bytes:
//!
//! ```text
//!  Directory  →  Table  →  Physical Page
//!     │            │
//!     │            └─────► PTE (Page Table Entry)      → maps 4 KiB page
//!     └──────────────────► PDE (Page Directory Entry)  → PS=1 → 4 MiB page
//! ```
//!
//! A directory entry either points to a second-level table (`PS=0`) or, with
//! the page-size extension, directly maps a 4 MiB large page (`PS=1`). A
//! table entry always maps one 4 KiB page.
//!
//! ## Concurrency
//!
//! All operations here take `&mut` access to the allocation state and assume
//! a single active address space; a preemptive multi-core port must wrap the
//! frame table and each directory root in a lock and broadcast TLB
//! invalidations instead of relying on [`tlb::invalidate`] alone.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod page_table;
pub mod tlb;
pub mod user_access;

pub use crate::address_space::{AddressSpace, CreateMode, EntrySlot, MapError};
pub use crate::page_table::pd::{PageDirectory, Pde, Pde4M, PdEntry, PdEntryKind, PdView};
pub use crate::page_table::pt::{PageTable, PtEntry};
pub use crate::page_table::{DirIndex, PERM_MASK, PRESENT_BIT, PS_BIT, TableIndex, split_indices};
pub use crate::user_access::{AccessError, Process};

use kernel_addr::{PhysicalAddress, PhysicalPage, Size4K};

bitflags::bitflags! {
    /// Page table entry permission and attribute bits.
    ///
    /// These occupy the low bits of both directory and table entries, at the
    /// positions the MMU mandates. The same mask type serves as the `perm`
    /// argument of the mapping operations and as the aggregate result of a
    /// permission query.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PageFlags: u32 {
        /// Entry is valid; cleared entries fault on access.
        const PRESENT       = 1 << 0;

        /// Writes allowed. If cleared the mapping is read-only (supervisor
        /// writes too, when CR0.WP is on).
        const WRITABLE      = 1 << 1;

        /// User-mode access allowed. If cleared, supervisor only.
        const USER          = 1 << 2;

        /// Write-through caching for this mapping.
        const WRITE_THROUGH = 1 << 3;

        /// Caching disabled; used for MMIO regions.
        const CACHE_DISABLE = 1 << 4;

        /// Set by the processor on first access.
        const ACCESSED      = 1 << 5;

        /// Set by the processor on first write (leaf entries only).
        const DIRTY         = 1 << 6;

        /// Large-page leaf. Valid in directory entries only; selects a 4 MiB
        /// mapping instead of a pointer to a second-level table.
        const LARGE         = 1 << 7;

        /// TLB entry survives address-space switches (when CR4.PGE is on).
        const GLOBAL        = 1 << 8;
    }
}

/// Allocation strategy for page-table frames.
///
/// The walker materializes missing second-level tables through this seam, so
/// the same walking code runs before the frame database exists (backed by the
/// linear bootstrap allocator, which never fails recoverably) and after
/// (backed by the frame database, which reports exhaustion as `None`).
///
/// Returned frames must be 4 KiB aligned. The walker zero-fills them.
pub trait TableAlloc {
    /// Allocate one page-table frame, or `None` on exhaustion.
    fn alloc_table(&mut self) -> Option<PhysicalPage<Size4K>>;
}

/// The frame-database seam the mapping operations charge references through.
///
/// Only the owner of the physical frame metadata implements this; mapping
/// code never touches refcounts directly, so the free-list invariant stays in
/// one place.
pub trait FrameTable: TableAlloc {
    /// Add one reference to `frame`.
    fn incref(&mut self, frame: PhysicalPage<Size4K>);

    /// Drop one reference to `frame`, returning it to the free pool when the
    /// count reaches zero.
    fn decref(&mut self, frame: PhysicalPage<Size4K>);
}

/// Converts physical addresses to usable pointers in the current virtual
/// address space (e.g., through the kernel's physical-memory window).
///
/// # Safety
/// - The implementation must ensure `pa` is mapped writable in the current
///   page tables for the returned `&mut T` to be valid.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable pointer in the
    /// current address space.
    ///
    /// # Safety
    /// See the trait-level contract.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Simulated physical memory and allocators shared by the tests in this
    //! crate.

    use crate::{FrameTable, PhysMapper, TableAlloc};
    use kernel_addr::{PhysicalAddress, PhysicalPage, Size4K};
    use std::collections::BTreeMap;

    /// A 4 KiB-aligned raw frame used as "physical RAM" backing in tests.
    #[repr(align(4096))]
    pub struct Aligned4K(#[allow(dead_code)] pub [u8; 4096]);

    /// In-memory "RAM": physical addresses are byte offsets from 0, and the
    /// mapper casts the owning frame to the requested type. Only for tests;
    /// real mappers honor the kernel's physical-memory window.
    pub struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        pub fn with_frames(n: usize) -> Self {
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                v.push(Aligned4K([0u8; 4096]));
            }
            Self { frames: v }
        }

        fn frame_mut_ptr(&self, idx: usize) -> *mut u8 {
            &self.frames[idx] as *const Aligned4K as *mut u8
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = (pa.as_u32() >> 12) as usize;
            let off = (pa.as_u32() & 0xFFF) as usize;
            unsafe { &mut *(self.frame_mut_ptr(idx).add(off) as *mut T) }
        }
    }

    /// A trivial bump allocator: hands out the next 4 KiB frame, no reuse.
    pub struct BumpAlloc {
        next: u32,
        end: u32,
    }

    impl BumpAlloc {
        pub fn new(start: u32, end: u32) -> Self {
            Self { next: start, end }
        }
    }

    impl TableAlloc for BumpAlloc {
        fn alloc_table(&mut self) -> Option<PhysicalPage<Size4K>> {
            if self.next + 4096 > self.end {
                return None;
            }
            let p = self.next;
            self.next += 4096;
            Some(PhysicalPage::from_addr(PhysicalAddress::new(p)))
        }
    }

    /// A refcount-tracking frame provider for exercising the mapping
    /// operations without the real frame database.
    pub struct TestFrames {
        bump: BumpAlloc,
        refs: BTreeMap<u32, u32>,
        freed: Vec<u32>,
        exhausted: bool,
    }

    impl TestFrames {
        pub fn new(start: u32, end: u32) -> Self {
            Self {
                bump: BumpAlloc::new(start, end),
                refs: BTreeMap::new(),
                freed: Vec::new(),
                exhausted: false,
            }
        }

        /// Make further table allocations fail, as an exhausted pool would.
        pub fn exhaust(&mut self) {
            self.exhausted = true;
        }

        pub fn refcount(&self, frame: PhysicalPage<Size4K>) -> u32 {
            self.refs.get(&frame.base().as_u32()).copied().unwrap_or(0)
        }

        pub fn was_freed(&self, frame: PhysicalPage<Size4K>) -> bool {
            self.freed.contains(&frame.base().as_u32())
        }
    }

    impl TableAlloc for TestFrames {
        fn alloc_table(&mut self) -> Option<PhysicalPage<Size4K>> {
            if self.exhausted {
                return None;
            }
            let frame = self.bump.alloc_table()?;
            self.refs.insert(frame.base().as_u32(), 1);
            Some(frame)
        }
    }

    impl FrameTable for TestFrames {
        fn incref(&mut self, frame: PhysicalPage<Size4K>) {
            *self.refs.entry(frame.base().as_u32()).or_insert(0) += 1;
        }

        fn decref(&mut self, frame: PhysicalPage<Size4K>) {
            let count = self
                .refs
                .get_mut(&frame.base().as_u32())
                .expect("decref of untracked frame");
            *count -= 1;
            if *count == 0 {
                self.freed.push(frame.base().as_u32());
            }
        }
    }
}
