//! # User Access Validation
//!
//! Syscall argument checking: may this process touch that memory range?
//!
//! A user access to a page is legal when the address lies below the
//! user/kernel split ([`ULIM`](kernel_layout::ULIM)) *and* the two-level
//! permissions at that address cover everything the access needs. [`check`]
//! reports the verdict; [`enforce`] is the enforcement wrapper that demands
//! user visibility on top and terminates the offending process.
//!
//! Termination goes through the [`Process`] trait, the seam to the process
//! manager that owns teardown.

use crate::{AddressSpace, PageFlags, PhysMapper};
use kernel_addr::{PageSize, Size4K, VirtualAddress};
use kernel_layout::ULIM;
use log::error;

/// A failed access check, carrying the first offending address.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum AccessError {
    /// The range touches memory the process may not access this way.
    #[error("illegal user access at {va}")]
    Fault {
        /// First address in the range that fails the check.
        va: VirtualAddress,
    },
}

/// The slice of the process manager this module needs: an identity for the
/// log line, and teardown.
pub trait Process {
    /// Stable identifier, for diagnostics.
    fn id(&self) -> u32;

    /// Tear the process down. Unrecoverable for the process, not for the
    /// kernel; may not return to the caller's context in a real kernel.
    fn terminate(&mut self);
}

/// Check that `[va, va + len)` is accessible with `perm | PRESENT` under
/// `aspace`.
///
/// `perm` will normally contain [`PageFlags::USER`], but this is not
/// required ([`enforce`] adds it). Every page touching the range is tested:
/// it must lie below `ULIM` and its aggregate two-level permissions must
/// contain the required bits. On failure the first offending address is
/// reported: `va` itself if the first page fails, the failing page's base
/// otherwise. An empty range is trivially legal.
pub fn check<M: PhysMapper>(
    aspace: &AddressSpace<'_, M>,
    va: VirtualAddress,
    len: u32,
    perm: PageFlags,
) -> Result<(), AccessError> {
    if len == 0 {
        return Ok(());
    }
    let required = perm | PageFlags::PRESENT;
    let end = u64::from(va.as_u32()) + u64::from(len);

    let mut addr = u64::from(va.as_u32());
    while addr < end {
        // `addr` is exact for the first page, a page base afterwards; either
        // way it is the first address of the range within this page.
        if addr >= u64::from(ULIM) {
            return Err(AccessError::Fault {
                va: VirtualAddress::new(addr as u32),
            });
        }
        let here = VirtualAddress::new(addr as u32);
        if !aspace.perms(here).contains(required) {
            return Err(AccessError::Fault { va: here });
        }
        addr = (addr & !u64::from(Size4K::SIZE - 1)) + u64::from(Size4K::SIZE);
    }
    Ok(())
}

/// Check like [`check`], with [`PageFlags::USER`] added to the requirement;
/// on failure, log the offending address and terminate the process.
///
/// The kernel itself continues: a validation failure is fatal only to the
/// process that presented the bad range.
pub fn enforce<M: PhysMapper, P: Process>(
    aspace: &AddressSpace<'_, M>,
    process: &mut P,
    va: VirtualAddress,
    len: u32,
    perm: PageFlags,
) {
    if let Err(AccessError::Fault { va: bad }) = check(aspace, va, len, perm | PageFlags::USER) {
        error!(
            "[{:08x}] user memory check failed at {bad} (range {va}+{len:#x})",
            process.id()
        );
        process.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestFrames, TestPhys};
    use crate::TableAlloc;
    use kernel_addr::{PhysicalAddress, PhysicalPage};

    struct TestProc {
        id: u32,
        alive: bool,
    }

    impl Process for TestProc {
        fn id(&self) -> u32 {
            self.id
        }
        fn terminate(&mut self) {
            self.alive = false;
        }
    }

    fn user_space(phys: &TestPhys) -> (AddressSpace<'_, TestPhys>, TestFrames) {
        let mut frames = TestFrames::new(0x1000, 64 << 12);
        let root = frames.alloc_table().unwrap();
        let dir: &mut crate::PageDirectory = unsafe { phys.phys_to_mut(root.base()) };
        dir.zero();
        let aspace = AddressSpace::from_root(phys, root);

        // Two user pages at 0x1000, the first writable, plus one
        // kernel-only page at 0x4000.
        let user_rw = PhysicalPage::from_addr(PhysicalAddress::new(0x0002_0000));
        let user_ro = PhysicalPage::from_addr(PhysicalAddress::new(0x0002_1000));
        let kernel = PhysicalPage::from_addr(PhysicalAddress::new(0x0002_2000));
        aspace
            .insert(
                &mut frames,
                user_rw,
                VirtualAddress::new(0x1000),
                PageFlags::USER | PageFlags::WRITABLE,
            )
            .unwrap();
        aspace
            .insert(&mut frames, user_ro, VirtualAddress::new(0x2000), PageFlags::USER)
            .unwrap();
        aspace
            .insert(
                &mut frames,
                kernel,
                VirtualAddress::new(0x4000),
                PageFlags::WRITABLE,
            )
            .unwrap();
        (aspace, frames)
    }

    #[test]
    fn legal_reads_and_writes_pass() {
        let phys = TestPhys::with_frames(64);
        let (aspace, _frames) = user_space(&phys);

        assert_eq!(
            check(&aspace, VirtualAddress::new(0x1000), 0x2000, PageFlags::USER),
            Ok(())
        );
        assert_eq!(
            check(
                &aspace,
                VirtualAddress::new(0x1010),
                0x100,
                PageFlags::USER | PageFlags::WRITABLE
            ),
            Ok(())
        );
    }

    #[test]
    fn missing_permission_reports_first_bad_page() {
        let phys = TestPhys::with_frames(64);
        let (aspace, _frames) = user_space(&phys);

        // Write across both pages: the second is read-only.
        assert_eq!(
            check(
                &aspace,
                VirtualAddress::new(0x1800),
                0x1000,
                PageFlags::USER | PageFlags::WRITABLE
            ),
            Err(AccessError::Fault {
                va: VirtualAddress::new(0x2000)
            })
        );
    }

    #[test]
    fn first_page_failure_reports_exact_address() {
        let phys = TestPhys::with_frames(64);
        let (aspace, _frames) = user_space(&phys);

        // Kernel-only page: the user bit is missing.
        assert_eq!(
            check(&aspace, VirtualAddress::new(0x4123), 8, PageFlags::USER),
            Err(AccessError::Fault {
                va: VirtualAddress::new(0x4123)
            })
        );
    }

    #[test]
    fn unmapped_page_fails() {
        let phys = TestPhys::with_frames(64);
        let (aspace, _frames) = user_space(&phys);

        assert!(check(&aspace, VirtualAddress::new(0x8000), 1, PageFlags::empty()).is_err());
    }

    #[test]
    fn ranges_at_or_above_the_split_always_fail() {
        let phys = TestPhys::with_frames(64);
        let (aspace, _frames) = user_space(&phys);

        assert_eq!(
            check(&aspace, VirtualAddress::new(ULIM), 4, PageFlags::empty()),
            Err(AccessError::Fault {
                va: VirtualAddress::new(ULIM)
            })
        );
        assert!(
            check(
                &aspace,
                VirtualAddress::new(0xF000_0000),
                4,
                PageFlags::empty()
            )
            .is_err()
        );
    }

    #[test]
    fn range_straddling_the_split_fails_at_the_split() {
        let phys = TestPhys::with_frames(64);
        let (aspace, mut frames) = user_space(&phys);

        // Back the last user page so only the split itself can fail.
        let frame = PhysicalPage::from_addr(PhysicalAddress::new(0x0002_3000));
        aspace
            .insert(
                &mut frames,
                frame,
                VirtualAddress::new(ULIM - 0x1000),
                PageFlags::USER,
            )
            .unwrap();

        assert_eq!(
            check(
                &aspace,
                VirtualAddress::new(ULIM - 0x10),
                0x20,
                PageFlags::empty()
            ),
            Err(AccessError::Fault {
                va: VirtualAddress::new(ULIM)
            })
        );
        // Stopping one byte short of the split is fine.
        assert_eq!(
            check(
                &aspace,
                VirtualAddress::new(ULIM - 0x10),
                0x10,
                PageFlags::empty()
            ),
            Ok(())
        );
    }

    #[test]
    fn empty_range_is_legal() {
        let phys = TestPhys::with_frames(64);
        let (aspace, _frames) = user_space(&phys);
        assert_eq!(
            check(&aspace, VirtualAddress::new(0xFFFF_FFFF), 0, PageFlags::empty()),
            Ok(())
        );
    }

    #[test]
    fn enforce_terminates_only_on_violation() {
        let phys = TestPhys::with_frames(64);
        let (aspace, _frames) = user_space(&phys);
        let mut proc = TestProc { id: 0x1001, alive: true };

        enforce(
            &aspace,
            &mut proc,
            VirtualAddress::new(0x1000),
            0x1000,
            PageFlags::WRITABLE,
        );
        assert!(proc.alive);

        enforce(
            &aspace,
            &mut proc,
            VirtualAddress::new(0x4000),
            4,
            PageFlags::empty(),
        );
        assert!(!proc.alive);
    }
}
