//! Construction of the kernel's own address space.
//!
//! Runs once during bring-up, entirely on the bootstrap allocator, and ends
//! with the frame database live and the bootstrap allocator consumed. The
//! resulting directory only populates the kernel part of the address space
//! (everything at and above [`UTOP`](kernel_layout::UTOP)); the user part
//! belongs to the process manager, which can share the upper mappings as a
//! template for per-process roots.

use crate::boot::BootAlloc;
use crate::frames::{FrameDb, FrameInfo};
use kernel_addr::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, align_up};
use kernel_layout::{
    DetectedMemory, KERNBASE, KSTACKTOP, KSTKSIZE, PGSIZE, PTSIZE, UENVS, UPAGES, UVPT, VPT,
};
use kernel_vmem::{AddressSpace, DirIndex, MapError, PageDirectory, PageFlags, PdEntry, PhysMapper};
use log::{info, warn};

/// A physical region carved during bring-up.
#[derive(Copy, Clone, Debug)]
pub struct PhysExtent {
    /// First byte of the region.
    pub base: PhysicalAddress,
    /// Length in bytes (page-rounded).
    pub len: u32,
}

/// What construction hands back: the directory root and the carved regions.
pub struct KernelSpace {
    /// The kernel page directory's frame.
    pub root: PhysicalPage<Size4K>,
    /// Backing store of the frame-metadata array (mapped user-RO at
    /// [`UPAGES`]).
    pub frame_table: PhysExtent,
    /// Backing store of the process table (mapped user-RO at [`UENVS`]; the
    /// process manager owns the element layout).
    pub process_table: PhysExtent,
    /// Backing store of the kernel stack (mapped below [`KSTACKTOP`]).
    pub stack: PhysExtent,
}

/// Build the kernel's two-level address space and initialize the frame
/// database.
///
/// Mappings installed, in order:
/// 1. Self-referential windows: the directory maps itself at [`VPT`]
///    (kernel RW) and [`UVPT`] (user RO), exposing the page tables as
///    ordinary memory.
/// 2. The kernel stack: [`KSTKSIZE`] backed bytes below [`KSTACKTOP`]; the
///    rest of that directory span stays unbacked so stack overruns fault.
/// 3. All detected physical memory at [`KERNBASE`], kernel RW, using 4 MiB
///    pages when `pse` says the CPU has them.
/// 4. The frame-metadata array, carved here and mapped user-RO at
///    [`UPAGES`].
/// 5. The process table (`process_table_bytes` bytes, element layout is the
///    process manager's business), mapped user-RO at [`UENVS`].
///
/// Each user-RO window spans at most one directory entry ([`PTSIZE`]);
/// larger arrays are truncated in the window (with a warning), not in
/// memory.
///
/// `boot` is consumed: after this function only the returned [`FrameDb`]
/// can hand out physical memory.
///
/// # Errors
/// Propagates [`MapError`] from range mapping; with the bootstrap allocator
/// backing the walker this only fires if the allocator's own fatal limit
/// check were bypassed.
pub fn build_kernel_space<'m, M: PhysMapper>(
    mapper: &'m M,
    mem: DetectedMemory,
    mut boot: BootAlloc,
    process_table_bytes: u32,
    pse: bool,
) -> Result<(KernelSpace, FrameDb<'m>), MapError> {
    let maxpa = mem.max_phys();
    info!(
        "physical memory: {}K available, base = {}K, extended = {}K",
        maxpa.as_u32() / 1024,
        mem.base_bytes() / 1024,
        mem.extended_bytes() / 1024
    );

    let root = PhysicalPage::new_aligned(boot.alloc(PGSIZE, PGSIZE));
    {
        // SAFETY: freshly allocated frame, about to become the directory.
        let dir: &mut PageDirectory = unsafe { mapper.phys_to_mut(root.base()) };
        dir.zero();
        dir.set(
            DirIndex::from(VirtualAddress::new(VPT)),
            PdEntry::table_with(PageFlags::WRITABLE, root),
        );
        dir.set(
            DirIndex::from(VirtualAddress::new(UVPT)),
            PdEntry::table_with(PageFlags::USER, root),
        );
    }
    let aspace = AddressSpace::from_root(mapper, root);

    let stack = PhysExtent {
        base: boot.alloc(KSTKSIZE, PGSIZE),
        len: KSTKSIZE,
    };
    aspace.map_range(
        &mut boot,
        VirtualAddress::new(KSTACKTOP - KSTKSIZE),
        KSTKSIZE,
        stack.base,
        PageFlags::WRITABLE,
    )?;

    let window_flags = if pse {
        info!("PSE capability detected");
        PageFlags::WRITABLE | PageFlags::LARGE
    } else {
        PageFlags::WRITABLE
    };
    aspace.map_range(
        &mut boot,
        VirtualAddress::new(KERNBASE),
        maxpa.as_u32(),
        PhysicalAddress::zero(),
        window_flags,
    )?;

    let npage = mem.page_count();
    let frame_table = carve_zeroed(
        mapper,
        &mut boot,
        (npage * size_of::<FrameInfo>()) as u32,
    );
    map_window(&aspace, &mut boot, VirtualAddress::new(UPAGES), frame_table, "frame table")?;

    let process_table = carve_zeroed(mapper, &mut boot, process_table_bytes);
    map_window(
        &aspace,
        &mut boot,
        VirtualAddress::new(UENVS),
        process_table,
        "process table",
    )?;

    let boot_end = boot.cursor();
    // SAFETY: the carved region is zeroed, exclusively owned, and sized for
    // exactly `npage` entries.
    let first: &'m mut FrameInfo = unsafe { mapper.phys_to_mut(frame_table.base) };
    let frames =
        unsafe { core::slice::from_raw_parts_mut(core::ptr::from_mut(first), npage) };
    let db = FrameDb::init(frames, boot_end);

    Ok((
        KernelSpace {
            root,
            frame_table,
            process_table,
            stack,
        },
        db,
    ))
}

/// Allocate a page-rounded, zero-filled region from the bootstrap allocator.
fn carve_zeroed<M: PhysMapper>(mapper: &M, boot: &mut BootAlloc, bytes: u32) -> PhysExtent {
    let len = align_up(bytes, PGSIZE);
    let base = boot.alloc(len, PGSIZE);
    if len > 0 {
        // SAFETY: the region was just carved and belongs to nobody else.
        let ptr: &mut u8 = unsafe { mapper.phys_to_mut(base) };
        unsafe { core::ptr::write_bytes(core::ptr::from_mut(ptr), 0, len as usize) };
    }
    PhysExtent { base, len }
}

/// Map a carved region user-read-only at `va`, clamped to one directory span.
fn map_window<M: PhysMapper>(
    aspace: &AddressSpace<'_, M>,
    boot: &mut BootAlloc,
    va: VirtualAddress,
    region: PhysExtent,
    what: &str,
) -> Result<(), MapError> {
    let mut window = region.len;
    if window > PTSIZE {
        warn!("{what} exceeds its window; only the first {PTSIZE:#x} bytes are user-visible");
        window = PTSIZE;
    }
    aspace.map_range(boot, va, window, region.base, PageFlags::USER)
}
