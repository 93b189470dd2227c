//! Process management
//!
//! The process table is the single owner of every process control block;
//! everything else (scheduler queues, wait queues, parent links) refers to
//! processes by pid and looks them up here.

pub mod exec;
pub mod pcb;
pub mod table;

pub use pcb::{BlockReason, Priority, Process, ProcessState, SavedContext, UserSpace};
pub use table::ProcessTable;

/// Process identifier. Unique and monotonic for the lifetime of the
/// kernel; pid 1 is init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The pid every orphan is reparented to
pub const INIT_PID: Pid = Pid(1);
