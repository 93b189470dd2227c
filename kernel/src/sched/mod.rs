//! Pre-emptive multitasking
//!
//! One logical CPU runs one process at a time. Preemption happens on the
//! timer tick or when the running process voluntarily suspends (yield,
//! sleep, blocking I/O or IPC). The scheduler itself is a passive state
//! machine over the process table: it decides, the bare-metal layer masks
//! interrupts around it and performs the context switch it asks for.

pub mod kernel_state;
pub mod scheduler;
pub mod timer;

pub use kernel_state::{KernelState, KERNEL};
pub use scheduler::{Scheduler, SwitchPlan, WaitOutcome};
