//! Linear boot-time allocator.
//!
//! Hands out physical memory before the frame database exists; used to build
//! the first page tables and the frame-metadata array itself. Strictly
//! linear: a cursor moves forward, nothing is ever returned.

use kernel_addr::{PhysicalAddress, PhysicalPage, Size4K, align_up};
use kernel_layout::PGSIZE;
use kernel_vmem::TableAlloc;

/// The bootstrap allocator: one cursor into unused physical memory.
///
/// Running past the detected end of physical memory is a fatal bring-up
/// error, not a recoverable condition. The allocator is consumed by
/// [`build_kernel_space`](crate::kspace::build_kernel_space), which retires
/// it before the frame database takes over.
pub struct BootAlloc {
    cursor: u32,
    limit: u32,
}

impl BootAlloc {
    /// Start allocating at `first_free` (typically the end of the kernel
    /// image), bounded by the detected physical-memory size.
    #[inline]
    #[must_use]
    pub const fn new(first_free: PhysicalAddress, limit: PhysicalAddress) -> Self {
        Self {
            cursor: first_free.as_u32(),
            limit: limit.as_u32(),
        }
    }

    /// Allocate `size` bytes aligned to `align` (a power of two).
    ///
    /// Returns the pre-advance cursor position. The memory is
    /// **uninitialized**; callers that need zeroes write them.
    ///
    /// # Panics
    /// When the request would pass the end of detected physical memory.
    pub fn alloc(&mut self, size: u32, align: u32) -> PhysicalAddress {
        debug_assert!(align.is_power_of_two());
        let base = align_up(self.cursor, align);
        match base.checked_add(size) {
            Some(end) if end <= self.limit => {
                self.cursor = end;
                PhysicalAddress::new(base)
            }
            _ => panic!(
                "bootstrap allocator exhausted: {size:#x} bytes over {:#x}..{:#x}",
                base, self.limit
            ),
        }
    }

    /// First physical address not yet handed out.
    #[inline]
    #[must_use]
    pub const fn cursor(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.cursor)
    }
}

impl TableAlloc for BootAlloc {
    fn alloc_table(&mut self) -> Option<PhysicalPage<Size4K>> {
        Some(PhysicalPage::new_aligned(self.alloc(PGSIZE, PGSIZE)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_linearly_with_alignment() {
        let mut boot = BootAlloc::new(PhysicalAddress::new(0x10_0010), PhysicalAddress::new(0x20_0000));
        let a = boot.alloc(16, 4096);
        assert_eq!(a.as_u32(), 0x10_1000);
        let b = boot.alloc(4096, 4096);
        assert_eq!(b.as_u32(), 0x10_2000);
        assert_eq!(boot.cursor().as_u32(), 0x10_3000);
    }

    #[test]
    fn byte_granular_requests_pack() {
        let mut boot = BootAlloc::new(PhysicalAddress::new(0x10_0000), PhysicalAddress::new(0x20_0000));
        let a = boot.alloc(24, 4);
        let b = boot.alloc(24, 4);
        assert_eq!(b.as_u32(), a.as_u32() + 24);
    }

    #[test]
    fn exact_fit_is_allowed() {
        let mut boot = BootAlloc::new(PhysicalAddress::new(0x10_0000), PhysicalAddress::new(0x10_1000));
        let a = boot.alloc(4096, 4096);
        assert_eq!(a.as_u32(), 0x10_0000);
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn running_past_detected_memory_panics() {
        let mut boot = BootAlloc::new(PhysicalAddress::new(0x10_0000), PhysicalAddress::new(0x10_1000));
        let _ = boot.alloc(8192, 4096);
    }

    #[test]
    fn serves_page_table_frames() {
        let mut boot = BootAlloc::new(PhysicalAddress::new(0x10_0000), PhysicalAddress::new(0x20_0000));
        let frame = boot.alloc_table().unwrap();
        assert!(frame.base().is_aligned::<Size4K>());
    }
}
