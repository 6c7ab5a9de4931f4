//! TLB maintenance.
//!
//! The design assumes a single active address space, so invalidation is a
//! plain `invlpg` on the local CPU. A preemptive multi-core port replaces
//! this with a cross-core shootdown.

use kernel_addr::VirtualAddress;

/// Drop any cached translation for `va` on this CPU.
///
/// Compiles to `invlpg` on the paging target; elsewhere (host-side tests)
/// there is no TLB to maintain and this is a no-op.
#[inline]
pub fn invalidate(va: VirtualAddress) {
    #[cfg(all(target_arch = "x86", not(test)))]
    // SAFETY: invlpg only drops a cached translation; it cannot fault.
    unsafe {
        core::arch::asm!(
            "invlpg [{}]",
            in(reg) va.as_u32(),
            options(nostack, preserves_flags)
        );
    }
    #[cfg(not(all(target_arch = "x86", not(test))))]
    let _ = va;
}
