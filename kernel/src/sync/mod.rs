//! Synchronization primitives
//!
//! Two families: the interrupt-mask critical section used by the low
//! layers (frame bitmap, heap, scheduler queues), and the blocking
//! mutex/semaphore built on top of scheduler block/unblock for process
//! context.

pub mod mutex;
pub mod semaphore;

pub use mutex::KMutex;
pub use semaphore::KSemaphore;

/// RAII interrupt-mask critical section.
///
/// Nested acquisition is fine: each guard restores the interrupt-enable
/// state it observed. On the host (unit tests) this is a no-op; test code
/// is single-threaded per case.
pub struct InterruptGuard {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    was_enabled: bool,
}

impl InterruptGuard {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    pub fn acquire() -> Self {
        let was_enabled = crate::intrinsics::interrupts_enabled();
        if was_enabled {
            // SAFETY: masking interrupts is always sound; the guard
            // restores the previous state on drop.
            unsafe { crate::intrinsics::disable_interrupts() };
        }
        Self { was_enabled }
    }

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    pub fn acquire() -> Self {
        Self {}
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        if self.was_enabled {
            // SAFETY: restoring the interrupt flag we observed at acquire.
            unsafe { crate::intrinsics::enable_interrupts() };
        }
    }
}
