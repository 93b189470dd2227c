//! Page-fault policy
//!
//! The fault handler proper is interrupt plumbing; the decision of what a
//! fault means lives here so it can be tested. A not-present fault from
//! user mode inside the faulting process's stack or heap span is satisfied
//! by lazily mapping a fresh zeroed frame; any other user fault terminates
//! the process; a kernel fault is fatal.

use bitflags::bitflags;

use super::{VirtualAddress, PAGE_SIZE};

bitflags! {
    /// x86 page-fault error-code bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultBits: u32 {
        /// Set: protection violation; clear: page not present
        const PROTECTION = 1 << 0;
        /// Set: the access was a write
        const WRITE      = 1 << 1;
        /// Set: the access came from user mode
        const USER       = 1 << 2;
        const RESERVED   = 1 << 3;
        const FETCH      = 1 << 4;
    }
}

/// The user-growable spans of the faulting process
#[derive(Debug, Clone, Copy)]
pub struct UserSpans {
    pub stack_base: u32,
    pub stack_size: u32,
    pub heap_base: u32,
    pub heap_size: u32,
}

impl UserSpans {
    fn contains(&self, addr: u32) -> bool {
        let in_stack =
            addr >= self.stack_base && addr < self.stack_base.saturating_add(self.stack_size);
        let in_heap =
            addr >= self.heap_base && addr < self.heap_base.saturating_add(self.heap_size);
        in_stack || in_heap
    }
}

/// What the handler should do about a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// Map a fresh zeroed user frame at this page
    MapFresh { page: VirtualAddress },
    /// Report the fault to the process and terminate it
    Terminate,
    /// Kernel-mode fault: unrecoverable
    Panic,
}

/// Classify a fault. `spans` is `None` for processes without a user space
/// (kernel threads).
pub fn resolve_fault(
    addr: VirtualAddress,
    bits: FaultBits,
    spans: Option<&UserSpans>,
) -> FaultResolution {
    if !bits.contains(FaultBits::USER) {
        return FaultResolution::Panic;
    }
    if bits.contains(FaultBits::PROTECTION) {
        // The page is present; the access itself was illegal.
        return FaultResolution::Terminate;
    }
    match spans {
        Some(spans) if spans.contains(addr.as_u32()) => FaultResolution::MapFresh {
            page: VirtualAddress::new(addr.as_u32() & !(PAGE_SIZE as u32 - 1)),
        },
        _ => FaultResolution::Terminate,
    }
}

/// Interrupt-side entry: classify the fault against the current process
/// and carry out the resolution.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn handle(fault_addr: u32, error_code: u32) {
    use super::paging::{IdentityFrames, PteFlags};
    use super::PhysicalAddress;
    use crate::sched::kernel_state::KERNEL;

    let addr = VirtualAddress::new(fault_addr);
    let bits = FaultBits::from_bits_truncate(error_code);

    let resolution = {
        let kernel = KERNEL.lock();
        let spans = kernel
            .scheduler
            .current()
            .and_then(|pid| kernel.table.get(pid))
            .and_then(|p| p.user.as_ref())
            .map(|u| u.spans());
        resolve_fault(addr, bits, spans.as_ref())
    };

    match resolution {
        FaultResolution::MapFresh { page } => {
            let mut frames = IdentityFrames;
            let outcome = super::frame_allocator::allocate_frame(PhysicalAddress::new(0))
                .and_then(|frame| {
                    // SAFETY: fresh frame, identity mapped in kernel space.
                    unsafe {
                        core::ptr::write_bytes(
                            frame.as_addr().as_u32() as *mut u8,
                            0,
                            super::FRAME_SIZE,
                        );
                    }
                    let mut kernel = KERNEL.lock();
                    let pid = kernel.scheduler.current().expect("fault without current");
                    let dir = kernel
                        .table
                        .get_mut(pid)
                        .and_then(|p| p.page_directory.as_mut())
                        .expect("user fault without a directory");
                    dir.map(
                        page,
                        frame.as_addr(),
                        PteFlags::WRITABLE | PteFlags::USER,
                        &mut frames,
                    )
                });
            match outcome {
                Ok(()) => log::trace!("page fault: mapped fresh frame at {:#x}", page.as_u32()),
                Err(err) => {
                    log::error!("page fault: lazy mapping failed: {}", err);
                    crate::sched::kernel_state::exit_current(-1);
                }
            }
        }
        FaultResolution::Terminate => {
            log::warn!(
                "page fault: process faulted at {:#x} (error {:#x}), terminating",
                fault_addr,
                error_code
            );
            crate::sched::kernel_state::exit_current(-1);
        }
        FaultResolution::Panic => {
            panic!(
                "kernel page fault at {:#x} (error {:#x})",
                fault_addr, error_code
            );
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    const SPANS: UserSpans = UserSpans {
        stack_base: 0x0700_0000,
        stack_size: 0x4_0000,
        heap_base: 0x0900_0000,
        heap_size: 0x10_0000,
    };

    #[test]
    fn kernel_fault_is_fatal() {
        assert_eq!(
            resolve_fault(VirtualAddress::new(0xdead_b000), FaultBits::WRITE, Some(&SPANS)),
            FaultResolution::Panic
        );
    }

    #[test]
    fn user_stack_growth_maps_fresh_frame() {
        let r = resolve_fault(
            VirtualAddress::new(0x0700_1234),
            FaultBits::USER | FaultBits::WRITE,
            Some(&SPANS),
        );
        assert_eq!(
            r,
            FaultResolution::MapFresh {
                page: VirtualAddress::new(0x0700_1000)
            }
        );
    }

    #[test]
    fn user_heap_growth_maps_fresh_frame() {
        let r = resolve_fault(
            VirtualAddress::new(0x0900_0000),
            FaultBits::USER,
            Some(&SPANS),
        );
        assert!(matches!(r, FaultResolution::MapFresh { .. }));
    }

    #[test]
    fn stray_user_fault_terminates() {
        assert_eq!(
            resolve_fault(VirtualAddress::new(0x1234_5678), FaultBits::USER, Some(&SPANS)),
            FaultResolution::Terminate
        );
        // Protection violations are never lazily satisfied.
        assert_eq!(
            resolve_fault(
                VirtualAddress::new(0x0700_1000),
                FaultBits::USER | FaultBits::PROTECTION | FaultBits::WRITE,
                Some(&SPANS)
            ),
            FaultResolution::Terminate
        );
    }

    #[test]
    fn kernel_thread_user_fault_terminates() {
        assert_eq!(
            resolve_fault(VirtualAddress::new(0x0700_1000), FaultBits::USER, None),
            FaultResolution::Terminate
        );
    }
}
