//! Physical-to-virtual translation through the kernel's physical-memory
//! window.
//!
//! Code can only dereference virtual addresses, so manipulating page tables
//! and other physical structures needs a way to "see" a physical address
//! from the current address space. The kernel maps all physical memory at
//! [`KERNBASE`], which makes the translation a fixed offset; tests and the
//! UEFI-style identity-mapped environments substitute their own
//! [`PhysMapper`].

use kernel_addr::PhysicalAddress;
use kernel_layout::KERNBASE;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for the kernel proper: `va = KERNBASE + pa`.
///
/// Valid only once the kernel address space (with its physical-memory window)
/// is active, and only for addresses below the detected memory limit.
pub struct KernelBaseMapper;

impl PhysMapper for KernelBaseMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = (KERNBASE + pa.as_u32()) as usize as *mut T;
        // SAFETY: the caller guarantees `pa` lies in the window mapped at
        // KERNBASE and holds a valid `T`.
        unsafe { &mut *va }
    }
}
