//! Global scheduler state and the context-switch executor
//!
//! The passive scheduler and the process table live together behind one
//! lock; the bare-metal entry points here mask interrupts, take the lock,
//! run the state machine, *release the lock*, and only then perform the
//! context switch the state machine asked for — the incoming process may
//! want the lock immediately.

use lazy_static::lazy_static;
use spin::Mutex;

use super::scheduler::Scheduler;
use crate::process::ProcessTable;

/// Time slice handed to each process
pub const SLICE_MS: u64 = 10;

pub struct KernelState {
    pub scheduler: Scheduler,
    pub table: ProcessTable,
}

/// Split borrow helper so scheduler methods can take the table while both
/// live behind the same lock.
pub struct KernelStateParts<'a> {
    pub scheduler: &'a mut Scheduler,
    pub table: &'a mut ProcessTable,
}

impl KernelState {
    pub fn new() -> Self {
        Self {
            scheduler: Scheduler::new(SLICE_MS),
            table: ProcessTable::new(),
        }
    }

    pub fn parts(&mut self) -> KernelStateParts<'_> {
        KernelStateParts {
            scheduler: &mut self.scheduler,
            table: &mut self.table,
        }
    }
}

impl Default for KernelState {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    /// The kernel-wide scheduler + process table
    pub static ref KERNEL: Mutex<KernelState> = Mutex::new(KernelState::new());
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod machine {
    use super::*;
    use crate::arch::x86::context;
    use crate::process::{BlockReason, Pid};
    use crate::sched::scheduler::SwitchPlan;
    use crate::sched::timer;
    use crate::sync::InterruptGuard;

    /// Save slot for switches whose outgoing side has no process (the very
    /// first dispatch).
    static BOOT_CONTEXT: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(0);

    /// Carry out a switch decision. Interrupts must be masked; the KERNEL
    /// lock must already be released. The PCB pointers stay valid because
    /// nothing can run between here and the switch itself.
    fn run_plan(plan: SwitchPlan) {
        let (save_slot, load_esp, load_dir) = {
            let mut kernel = KERNEL.lock();
            let save_slot = match plan.from {
                Some(pid) => kernel
                    .table
                    .get_mut(pid)
                    .map(|p| core::ptr::addr_of_mut!(p.context.esp))
                    .unwrap_or(BOOT_CONTEXT.as_ptr()),
                None => BOOT_CONTEXT.as_ptr(),
            };
            let incoming = kernel.table.get(plan.to).expect("switch target vanished");
            (save_slot, incoming.context.esp, incoming.page_directory)
        };

        if let Some(dir) = load_dir {
            dir.activate();
        }
        // SAFETY: both stack pointers were produced by this module or by
        // `prepare_initial_stack`; interrupts are masked so the PCBs
        // cannot move underneath us.
        unsafe { context::context_switch(save_slot, load_esp) };
    }

    /// Spawn a kernel thread: a process running `entry` on a fresh kernel
    /// stack in kernel space.
    pub fn spawn_kernel_thread(
        name: &str,
        priority: crate::process::Priority,
        entry: extern "C" fn() -> !,
    ) -> crate::error::KernelResult<Pid> {
        use crate::mm::{frame_allocator, PhysicalAddress};

        const STACK_BYTES: usize = 16 * 1024;
        let stack = frame_allocator::allocate_contiguous(STACK_BYTES, PhysicalAddress::new(0))?;
        let stack_top = stack.as_addr().as_u32() + STACK_BYTES as u32;

        let _guard = InterruptGuard::acquire();
        let mut kernel = KERNEL.lock();
        let parent = kernel.scheduler.current();
        let pid = kernel.table.create(name, priority, parent);
        if let Some(proc) = kernel.table.get_mut(pid) {
            proc.kernel_stack_top = Some(stack_top);
            proc.context.esp = context::prepare_initial_stack(stack_top, entry);
        }
        let KernelStateParts { scheduler, table } = kernel.parts();
        scheduler.enqueue(table, pid);
        Ok(pid)
    }

    /// Timer-interrupt entry: advance the clocks, let the scheduler wake
    /// sleepers and rotate the current process.
    pub fn tick(elapsed_ms: u64) {
        timer::advance(elapsed_ms);
        let _guard = InterruptGuard::acquire();
        let plan = {
            let mut kernel = KERNEL.lock();
            let KernelStateParts { scheduler, table } = kernel.parts();
            scheduler.tick(table, elapsed_ms)
        };
        if let Some(plan) = plan {
            run_plan(plan);
        }
    }

    /// Voluntarily yield the CPU.
    pub fn yield_now() {
        let _guard = InterruptGuard::acquire();
        let plan = {
            let mut kernel = KERNEL.lock();
            let KernelStateParts { scheduler, table } = kernel.parts();
            scheduler.yield_now(table)
        };
        if let Some(plan) = plan {
            run_plan(plan);
        }
    }

    /// Sleep for at least `ms` milliseconds.
    pub fn sleep(ms: u64) {
        let _guard = InterruptGuard::acquire();
        let plan = {
            let mut kernel = KERNEL.lock();
            let KernelStateParts { scheduler, table } = kernel.parts();
            scheduler.sleep(table, ms)
        };
        if let Some(plan) = plan {
            run_plan(plan);
        }
    }

    /// Block the current process; some other process must `unblock` it.
    pub fn block(reason: BlockReason) {
        let _guard = InterruptGuard::acquire();
        let plan = {
            let mut kernel = KERNEL.lock();
            let KernelStateParts { scheduler, table } = kernel.parts();
            scheduler.block_current(table, reason)
        };
        if let Some(plan) = plan {
            run_plan(plan);
        }
    }

    /// Make a blocked process runnable.
    pub fn unblock(pid: Pid) {
        let _guard = InterruptGuard::acquire();
        let mut kernel = KERNEL.lock();
        let KernelStateParts { scheduler, table } = kernel.parts();
        scheduler.unblock(table, pid);
    }

    /// Terminate the current process. Its user address space is released
    /// right away (after hopping back to the kernel directory); the
    /// kernel stack lives until the parent reaps. Control never returns —
    /// the switch target inherits the CPU and this stack is never used
    /// again.
    pub fn exit_current(code: i32) -> ! {
        let _guard = InterruptGuard::acquire();

        let user_dir = {
            let mut kernel = KERNEL.lock();
            kernel
                .scheduler
                .current()
                .and_then(|pid| kernel.table.get_mut(pid))
                .and_then(|p| p.page_directory.take())
        };
        if let Some(dir) = user_dir {
            let (kernel_dir, kernel_pdes) = crate::mm::kernel_directory();
            kernel_dir.activate();
            dir.release_user(kernel_pdes, &mut crate::mm::paging::IdentityFrames);
        }

        let plan = {
            let mut kernel = KERNEL.lock();
            let KernelStateParts { scheduler, table } = kernel.parts();
            scheduler.exit_current(table, code, crate::process::INIT_PID)
        };
        if let Some(plan) = plan {
            run_plan(plan);
        }
        // No switch target: nothing runnable remains. Halt forever.
        loop {
            crate::intrinsics::halt();
        }
    }

    /// Wait until a child terminates and reap it, releasing the child's
    /// kernel stack. Returns `None` when there are no children at all.
    pub fn wait_for_child() -> Option<(Pid, i32)> {
        use crate::mm::{frame_allocator, PhysicalAddress};
        use crate::process::ProcessState;
        use crate::sched::scheduler::WaitOutcome;

        loop {
            let outcome = {
                let _guard = InterruptGuard::acquire();
                let mut kernel = KERNEL.lock();
                let current = kernel.scheduler.current().expect("wait without a process");
                // Capture the terminated child's kernel stack before the
                // reap drops its control block.
                let doomed_stack = kernel
                    .table
                    .children_of(current)
                    .into_iter()
                    .find(|&child| {
                        kernel
                            .table
                            .get(child)
                            .is_some_and(|p| p.state == ProcessState::Terminated)
                    })
                    .and_then(|child| kernel.table.get(child).and_then(|p| p.kernel_stack_top));
                let KernelStateParts { scheduler, table } = kernel.parts();
                let outcome = scheduler.wait(table, current);
                if let (WaitOutcome::Reaped(..), Some(stack_top)) = (&outcome, doomed_stack) {
                    const STACK_BYTES: u32 = 16 * 1024;
                    frame_allocator::FRAME_ALLOCATOR.lock().free_contiguous(
                        PhysicalAddress::new(stack_top - STACK_BYTES).as_frame(),
                        STACK_BYTES as usize,
                    );
                }
                outcome
            };
            match outcome {
                WaitOutcome::Reaped(pid, code) => return Some((pid, code)),
                WaitOutcome::NoChildren => return None,
                WaitOutcome::WouldBlock => block(BlockReason::Wait),
            }
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use machine::{
    block, exit_current, sleep, spawn_kernel_thread, tick, unblock, wait_for_child, yield_now,
};
