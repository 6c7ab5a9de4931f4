//! The frame database: per-frame reference counts and the free list.
//!
//! One [`FrameInfo`] per physical 4 KiB frame, stored in an array the
//! address-space constructor carves out of physical memory (and maps
//! user-read-only, so processes can observe frame state). Frames with
//! refcount zero sit on an intrusive free list threaded through the array;
//! everything else is owned by whoever holds its references: leaf mappings,
//! or the directory entry of a page-table frame.
//!
//! After [`FrameDb::init`] these four operations — [`alloc`](FrameDb::alloc),
//! [`free`](FrameDb::free), [`incref`](FrameDb::incref),
//! [`decref`](FrameDb::decref) — are the only legal way to allocate or
//! release physical memory; the bootstrap allocator is gone by then.

use kernel_addr::{PageNumber, PhysicalAddress, PhysicalPage, Size4K};
use kernel_layout::{EXTPHYSMEM, IOPHYSMEM, PGSIZE};
use kernel_vmem::{FrameTable, TableAlloc};
use log::info;

/// Link value meaning "not on the free list".
const NO_FRAME: u32 = u32::MAX;

/// Per-frame metadata: reference count and free-list link.
///
/// Invariant: `refcount == 0` exactly when the frame is on the free list.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct FrameInfo {
    refcount: u32,
    next_free: u32,
}

impl FrameInfo {
    const RESERVED: Self = Self {
        refcount: 1,
        next_free: NO_FRAME,
    };

    /// Live references to this frame.
    #[inline]
    #[must_use]
    pub const fn refcount(&self) -> u32 {
        self.refcount
    }
}

/// Why a frame could not be handed out.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum FrameDbError {
    /// Every usable frame is referenced.
    #[error("physical frame pool exhausted")]
    OutOfFrames,
}

/// Owner of all physical-frame metadata.
///
/// Holds the metadata array exclusively; neither raw indices nor entry
/// pointers leak out, so the free-list invariant cannot be broken from
/// outside.
pub struct FrameDb<'a> {
    frames: &'a mut [FrameInfo],
    free_head: u32,
    free_count: usize,
}

impl<'a> FrameDb<'a> {
    /// Partition physical memory and build the free list.
    ///
    /// `frames` covers every detected frame, index = frame number.
    /// Permanently reserved (refcount 1, never allocatable): frame 0 (the
    /// real-mode IDT and BIOS data live there), the `[IOPHYSMEM,
    /// EXTPHYSMEM)` device hole, and everything the bootstrap phase consumed
    /// below `boot_end`. The rest goes on the free list, newest-freed-first.
    pub fn init(frames: &'a mut [FrameInfo], boot_end: PhysicalAddress) -> Self {
        let npage = frames.len();
        let io = ((IOPHYSMEM / PGSIZE) as usize).min(npage);
        let ext = ((EXTPHYSMEM / PGSIZE) as usize).min(npage);
        let consumed = PageNumber::containing_ceil(boot_end)
            .as_usize()
            .clamp(ext, npage);

        let mut db = Self {
            frames,
            free_head: NO_FRAME,
            free_count: 0,
        };

        if npage > 0 {
            db.frames[0] = FrameInfo::RESERVED;
        }
        for i in 1..io {
            db.push_free(i);
        }
        for i in io..consumed {
            db.frames[i] = FrameInfo::RESERVED;
        }
        for i in consumed..npage {
            db.push_free(i);
        }

        info!(
            "frame database: {npage} frames, {} free, {} reserved",
            db.free_count,
            npage - db.free_count
        );
        db
    }

    /// Take a frame off the free list.
    ///
    /// The returned frame has refcount 0; the caller decides what owns it
    /// (and does **not** get its contents zeroed). Exhaustion is an ordinary
    /// error every caller must handle.
    pub fn alloc(&mut self) -> Result<PhysicalPage<Size4K>, FrameDbError> {
        if self.free_head == NO_FRAME {
            return Err(FrameDbError::OutOfFrames);
        }
        let i = self.free_head as usize;
        self.free_head = self.frames[i].next_free;
        self.frames[i] = FrameInfo {
            refcount: 0,
            next_free: NO_FRAME,
        };
        self.free_count -= 1;
        Ok(PageNumber::new(i as u32).page())
    }

    /// Return `frame` to the free list.
    ///
    /// # Panics
    /// When the frame still has references; calling `free` on a referenced
    /// frame is a kernel bug, not a runtime condition.
    pub fn free(&mut self, frame: PhysicalPage<Size4K>) {
        let i = self.index(frame);
        assert!(
            self.frames[i].refcount == 0,
            "freeing frame {frame} with refcount {}",
            self.frames[i].refcount
        );
        self.push_free(i);
    }

    /// Add one reference to `frame`.
    pub fn incref(&mut self, frame: PhysicalPage<Size4K>) {
        self.add_ref(frame);
    }

    /// Drop one reference; the frame is freed when the count reaches zero.
    ///
    /// # Panics
    /// When the count is already zero (a kernel bug).
    pub fn decref(&mut self, frame: PhysicalPage<Size4K>) {
        self.drop_ref(frame);
    }

    fn add_ref(&mut self, frame: PhysicalPage<Size4K>) {
        let i = self.index(frame);
        self.frames[i].refcount += 1;
    }

    fn drop_ref(&mut self, frame: PhysicalPage<Size4K>) {
        let i = self.index(frame);
        assert!(
            self.frames[i].refcount > 0,
            "refcount underflow on frame {frame}"
        );
        self.frames[i].refcount -= 1;
        if self.frames[i].refcount == 0 {
            self.push_free(i);
        }
    }

    /// Live references to `frame`.
    #[must_use]
    pub fn refcount(&self, frame: PhysicalPage<Size4K>) -> u32 {
        self.frames[self.index(frame)].refcount
    }

    /// Number of frames covered by the database.
    #[must_use]
    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    /// Frames currently on the free list.
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    fn push_free(&mut self, i: usize) {
        self.frames[i] = FrameInfo {
            refcount: 0,
            next_free: self.free_head,
        };
        self.free_head = i as u32;
        self.free_count += 1;
    }

    fn index(&self, frame: PhysicalPage<Size4K>) -> usize {
        let i = frame.number().as_usize();
        assert!(i < self.frames.len(), "frame {frame} outside detected memory");
        i
    }

    /// Walk the free list, yielding frame numbers. Test support.
    #[cfg(test)]
    fn free_list(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = self.free_head;
        while cur != NO_FRAME {
            out.push(cur as usize);
            cur = self.frames[cur as usize].next_free;
        }
        out
    }
}

impl TableAlloc for FrameDb<'_> {
    /// Allocate a page-table frame, owned by the directory entry that will
    /// point at it (refcount 1).
    fn alloc_table(&mut self) -> Option<PhysicalPage<Size4K>> {
        let frame = self.alloc().ok()?;
        self.add_ref(frame);
        Some(frame)
    }
}

impl FrameTable for FrameDb<'_> {
    fn incref(&mut self, frame: PhysicalPage<Size4K>) {
        self.add_ref(frame);
    }

    fn decref(&mut self, frame: PhysicalPage<Size4K>) {
        self.drop_ref(frame);
    }
}
