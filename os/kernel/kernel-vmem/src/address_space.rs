//! # Address Space (two-level, directory-rooted)
//!
//! Strongly-typed helpers to build and manipulate a **single** virtual
//! address space (a tree rooted at one page directory). This complements the
//! typed paging layers ([`PageDirectory`], [`PageTable`]).
//!
//! ## Highlights
//!
//! - [`AddressSpace::walk`] locates or creates the leaf slot for an address,
//!   with a tri-state [`CreateMode`] covering both table-backed and
//!   large-page mappings.
//! - [`AddressSpace::insert`] / [`AddressSpace::remove`] /
//!   [`AddressSpace::lookup`] are the steady-state mapping operations, with
//!   reference counting charged through the [`FrameTable`] seam.
//! - [`AddressSpace::map_range`] tiles a region, for bring-up use.
//! - [`AddressSpace::query`] translates VA→PA (handles 4 MiB leaves with
//!   offset); [`AddressSpace::perms`] aggregates the two-level permissions.
//!
//! ## Design
//!
//! - One walker serves both allocation regimes: missing second-level tables
//!   are materialized through [`TableAlloc`], which the bootstrap allocator
//!   and the frame database both implement. Walk depth is fixed, so every
//!   operation here is O(1).
//! - Non-leaf directory entries are created writable and user-visible;
//!   protection is enforced at the second level, and the user bit is what
//!   lets the user-read-only self-referential window expose table pages.
//! - A large mapping charges one reference, held by its first constituent
//!   4 KiB frame, and is mapped and removed as a single unit.
//!
//! ## Safety
//!
//! - Mutating active mappings requires TLB maintenance; `remove` invalidates
//!   the address it clears, everything else is the caller's responsibility.
//! - The provided [`PhysMapper`] must yield writable references to table
//!   frames.

use crate::page_table::pd::{PdEntry, PdEntryKind, PdView, PageDirectory};
use crate::page_table::pt::{PageTable, PtEntry};
use crate::page_table::{DirIndex, PERM_MASK, PRESENT_BIT, PS_BIT, split_indices};
use crate::{FrameTable, PageFlags, PhysMapper, TableAlloc, tlb};
use kernel_addr::{PageSize, PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress};
use log::warn;

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m M,
}

/// Walker create mode: what to do when the second-level table for an address
/// does not exist yet.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CreateMode {
    /// Do not create anything; report the address as unmapped.
    None,
    /// Materialize a second-level table through the allocator.
    Table,
    /// Claim the directory slot itself as a 4 MiB leaf.
    Large,
}

/// The leaf slot a walk resolves to.
pub enum EntrySlot<'t> {
    /// A second-level slot mapping a 4 KiB page.
    Table(&'t mut PtEntry),
    /// A directory slot holding (or claimed for) a 4 MiB leaf.
    Directory(&'t mut PdEntry),
}

/// Failure modes of the mapping operations.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// No frame was available for a second-level table.
    #[error("out of physical frames for a second-level table")]
    OutOfMemory,
    /// A large-page mapping would displace a live second-level table.
    #[error("a second-level table occupies the large-page slot")]
    Occupied,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Wrap an existing directory root.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalPage<Size4K>) -> Self {
        Self { root, mapper }
    }

    /// The directory frame backing this address space.
    #[inline]
    #[must_use]
    pub const fn root_page(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    /// Borrow the page directory as a typed table.
    #[inline]
    pub(crate) fn directory_mut(&self) -> &'m mut PageDirectory {
        // SAFETY: the root designates a live directory frame; the mapper
        // contract guarantees a writable view.
        unsafe { self.mapper.phys_to_mut(self.root.base()) }
    }

    /// Borrow a second-level table in `frame` as a typed table.
    #[inline]
    fn table_mut(&self, frame: PhysicalPage<Size4K>) -> &'m mut PageTable {
        // SAFETY: `frame` designates a live table frame owned by a directory
        // entry of this address space.
        unsafe { self.mapper.phys_to_mut(frame.base()) }
    }

    /// Locate (or create) the leaf slot for `va`.
    ///
    /// - A present directory entry with the large-page bit resolves to the
    ///   directory slot itself, in every mode.
    /// - A present non-leaf entry resolves to the indexed second-level slot.
    /// - An absent entry resolves per `mode`: [`CreateMode::None`] returns
    ///   `None`; [`CreateMode::Large`] claims the directory slot (the address
    ///   must be 4 MiB-aligned, anything else is a kernel bug and panics);
    ///   [`CreateMode::Table`] materializes a zeroed second-level table and
    ///   returns `None` only when `alloc` is exhausted.
    pub fn walk<A: TableAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        mode: CreateMode,
    ) -> Option<EntrySlot<'m>> {
        let (dx, tx) = split_indices(va);
        let dir = self.directory_mut();
        let pde = dir.get(dx);

        if pde.present() {
            return match pde.view() {
                PdView::Leaf4M(_) => Some(EntrySlot::Directory(dir.entry_mut(dx))),
                PdView::Table(e) => {
                    let table = self.table_mut(e.table_page());
                    Some(EntrySlot::Table(table.entry_mut(tx)))
                }
            };
        }

        match mode {
            CreateMode::None => None,
            CreateMode::Large => {
                assert!(
                    va.is_aligned::<Size4M>(),
                    "large-page walk at unaligned address {va}"
                );
                dir.set(dx, PdEntry::from_bits(PRESENT_BIT | PS_BIT));
                Some(EntrySlot::Directory(dir.entry_mut(dx)))
            }
            CreateMode::Table => {
                let frame = alloc.alloc_table()?;
                let table = self.table_mut(frame);
                table.zero();
                dir.set(
                    dx,
                    PdEntry::table_with(PageFlags::WRITABLE | PageFlags::USER, frame),
                );
                Some(EntrySlot::Table(table.entry_mut(tx)))
            }
        }
    }

    /// Map `frame` at `va` with `perm | PRESENT`.
    ///
    /// A preexisting mapping at `va` is removed first; the new frame's
    /// reference is taken before that happens, so remapping the same frame at
    /// the same address never drops its count to zero. Fails without side
    /// effects when a second-level table cannot be allocated.
    pub fn insert<F: FrameTable>(
        &self,
        frames: &mut F,
        frame: PhysicalPage<Size4K>,
        va: VirtualAddress,
        perm: PageFlags,
    ) -> Result<(), MapError> {
        let (dx, _) = split_indices(va);

        if self.directory_mut().get(dx).is_large() {
            // The whole large region goes away; stage its replacement table
            // first so exhaustion reports before anything is torn down.
            let table = frames.alloc_table().ok_or(MapError::OutOfMemory)?;
            frames.incref(frame);
            self.remove(frames, va);
            self.link_table(dx, table);
            self.set_leaf(va, frame, perm);
            return Ok(());
        }

        if self.walk(frames, va, CreateMode::Table).is_none() {
            return Err(MapError::OutOfMemory);
        }
        frames.incref(frame);
        self.remove(frames, va);
        self.set_leaf(va, frame, perm);
        Ok(())
    }

    /// Map the 4 MiB page `frame` at `va` with `perm | PRESENT | LARGE`,
    /// as a single unit.
    ///
    /// `va` must be 4 MiB-aligned (a kernel bug otherwise; panics). An
    /// existing large mapping at the slot is replaced; a live second-level
    /// table is not displaced ([`MapError::Occupied`]). The region charges
    /// one reference, held by its first constituent 4 KiB frame.
    pub fn insert_large<F: FrameTable>(
        &self,
        frames: &mut F,
        frame: PhysicalPage<Size4M>,
        va: VirtualAddress,
        perm: PageFlags,
    ) -> Result<(), MapError> {
        assert!(
            va.is_aligned::<Size4M>(),
            "large-page mapping at unaligned address {va}"
        );
        let (dx, _) = split_indices(va);
        let pde = self.directory_mut().get(dx);
        if pde.present() && !pde.is_large() {
            return Err(MapError::Occupied);
        }
        frames.incref(PhysicalPage::<Size4K>::from_addr(frame.base()));
        if pde.present() {
            self.remove(frames, va);
        }
        self.directory_mut().set(dx, PdEntry::large_with(perm, frame));
        Ok(())
    }

    /// Unmap whatever is mapped at `va`; a no-op when nothing is.
    ///
    /// Clears the leaf slot (the whole directory slot for a large mapping),
    /// invalidates the cached translation, and releases the mapped frame's
    /// reference, freeing it at zero.
    pub fn remove<F: FrameTable>(&self, frames: &mut F, va: VirtualAddress) {
        let (dx, tx) = split_indices(va);
        let dir = self.directory_mut();
        match dir.get(dx).kind() {
            None => {}
            Some(PdEntryKind::Leaf4MiB(page, _)) => {
                dir.set(dx, PdEntry::zero());
                tlb::invalidate(va);
                frames.decref(PhysicalPage::<Size4K>::from_addr(page.base()));
            }
            Some(PdEntryKind::NextTable(table, _)) => {
                let table = self.table_mut(table);
                let Some((page, _)) = table.get(tx).page_4k() else {
                    return;
                };
                table.set(tx, PtEntry::zero());
                tlb::invalidate(va);
                frames.decref(page);
            }
        }
    }

    /// The frame mapped at `va`, or `None`.
    ///
    /// For a large mapping this is the first constituent 4 KiB frame (the
    /// one holding the region's reference). The slot itself is not exposed;
    /// raw slot access would let callers bypass the refcount bookkeeping.
    #[must_use]
    pub fn lookup(&self, va: VirtualAddress) -> Option<PhysicalPage<Size4K>> {
        let (dx, tx) = split_indices(va);
        match self.directory_mut().get(dx).kind()? {
            PdEntryKind::Leaf4MiB(page, _) => {
                Some(PhysicalPage::<Size4K>::from_addr(page.base()))
            }
            PdEntryKind::NextTable(table, _) => {
                self.table_mut(table).get(tx).page_4k().map(|(p, _)| p)
            }
        }
    }

    /// Translate `va` to a physical address if mapped, adding the in-page
    /// offset (4 KiB or 4 MiB as the mapping dictates).
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (dx, tx) = split_indices(va);
        match self.directory_mut().get(dx).kind()? {
            PdEntryKind::Leaf4MiB(page, _) => Some(page.join(va.offset::<Size4M>())),
            PdEntryKind::NextTable(table, _) => {
                let (page, _) = self.table_mut(table).get(tx).page_4k()?;
                Some(page.join(va.offset::<Size4K>()))
            }
        }
    }

    /// Aggregate permissions for `va` across both levels (the intersection
    /// the MMU enforces), or `PageFlags::empty()` when unmapped.
    #[must_use]
    pub fn perms(&self, va: VirtualAddress) -> PageFlags {
        let (dx, tx) = split_indices(va);
        match self.directory_mut().get(dx).kind() {
            None => PageFlags::empty(),
            Some(PdEntryKind::Leaf4MiB(_, leaf)) => {
                PageFlags::from_bits_truncate(leaf.into_bits() & PERM_MASK)
            }
            Some(PdEntryKind::NextTable(table, pde)) => {
                let pte = self.table_mut(table).get(tx);
                if !pte.present() {
                    return PageFlags::empty();
                }
                PageFlags::from_bits_truncate(pde.into_bits() & pte.into_bits() & PERM_MASK)
            }
        }
    }

    /// Tile `[va, va+size)` onto `[pa, pa+size)` with `flags | PRESENT`.
    ///
    /// Steps by 4 MiB when `flags` contains [`PageFlags::LARGE`] (both bases
    /// must then be 4 MiB-aligned; anything else is a kernel bug and panics).
    /// Otherwise steps by 4 KiB; an unaligned base is tolerated with a
    /// warning, the mapping extended to cover the overhang.
    pub fn map_range<A: TableAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        size: u32,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let mut va = va;
        let mut pa = pa;
        let mut size = size;

        if flags.contains(PageFlags::LARGE) {
            assert!(
                va.is_aligned::<Size4M>() && pa.is_aligned::<Size4M>(),
                "large-page range at unaligned address {va} -> {pa}"
            );
            let mut done = 0u64;
            while done < u64::from(size) {
                let v = VirtualAddress::new(va.as_u32().wrapping_add(done as u32));
                let p = PhysicalPage::<Size4M>::from_addr(PhysicalAddress::new(
                    pa.as_u32().wrapping_add(done as u32),
                ));
                match self.walk(alloc, v, CreateMode::Large) {
                    Some(EntrySlot::Directory(slot)) => *slot = PdEntry::large_with(flags, p),
                    Some(EntrySlot::Table(_)) => {
                        panic!("large-page range overlaps a second-level table at {v}")
                    }
                    None => return Err(MapError::OutOfMemory),
                }
                done += u64::from(Size4M::SIZE);
            }
            return Ok(());
        }

        let off = va.offset::<Size4K>().as_u32();
        if off != 0 {
            warn!("mapping range at unaligned base {va}; extending by {off} bytes");
            size = size.saturating_add(off);
            va = va.align_down::<Size4K>();
            pa = pa.align_down::<Size4K>();
        }
        let mut done = 0u64;
        while done < u64::from(size) {
            let v = VirtualAddress::new(va.as_u32().wrapping_add(done as u32));
            let p = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(
                pa.as_u32().wrapping_add(done as u32),
            ));
            match self.walk(alloc, v, CreateMode::Table) {
                Some(EntrySlot::Table(slot)) => *slot = PtEntry::leaf_with(flags, p),
                Some(EntrySlot::Directory(_)) => {
                    panic!("range overlaps a large mapping at {v}")
                }
                None => return Err(MapError::OutOfMemory),
            }
            done += u64::from(Size4K::SIZE);
        }
        Ok(())
    }

    /// Zero-fill `table` and link it into the directory slot `dx`.
    fn link_table(&self, dx: DirIndex, table: PhysicalPage<Size4K>) {
        self.table_mut(table).zero();
        self.directory_mut().set(
            dx,
            PdEntry::table_with(PageFlags::WRITABLE | PageFlags::USER, table),
        );
    }

    /// Write the 4 KiB leaf for `va`; its second-level table must exist.
    fn set_leaf(&self, va: VirtualAddress, frame: PhysicalPage<Size4K>, perm: PageFlags) {
        let (dx, tx) = split_indices(va);
        match self.directory_mut().get(dx).kind() {
            Some(PdEntryKind::NextTable(table, _)) => {
                self.table_mut(table).set(tx, PtEntry::leaf_with(perm, frame));
            }
            _ => panic!("second-level table missing for leaf write at {va}"),
        }
    }
}
