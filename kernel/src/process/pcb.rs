//! Process control block

use alloc::string::String;
use alloc::vec::Vec;

use super::Pid;
use crate::fs::FileDescriptor;
use crate::mm::page_fault::UserSpans;
use crate::mm::PageDirectory;

/// Scheduling priority levels, highest first
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    /// Kernel housekeeping
    Kernel = 0,
    /// Driver service processes
    Driver = 1,
    /// User programs
    #[default]
    User = 2,
    /// The idle stub only
    Idle = 3,
}

impl Priority {
    pub const COUNT: usize = 4;

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Lifecycle state of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Runnable, sitting in a ready queue
    Ready,
    /// The one process the CPU is executing
    Running,
    /// Off the queues until an event wakes it
    Blocked,
    /// Exited, waiting for the parent to reap it
    Terminated,
}

/// Why a blocked process is blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Sleep,
    Mutex,
    Semaphore,
    Io,
    /// Waiting for a child to terminate
    Wait,
}

/// Register snapshot captured by the context switch.
///
/// The switch routine saves the callee-save registers and the return
/// address on the outgoing kernel stack and records the resulting stack
/// pointer here; restoring is the mirror image. The page-directory load is
/// separate and conditional.
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedContext {
    pub esp: u32,
}

/// The user-mode half of an exec'd process
#[derive(Debug, Clone)]
pub struct UserSpace {
    pub heap_base: u32,
    pub heap_size: u32,
    pub stack_base: u32,
    pub stack_size: u32,
    pub executable: String,
    pub argv: Vec<String>,
    pub envp: Vec<String>,
}

impl UserSpace {
    /// The spans the page-fault handler may lazily populate.
    pub fn spans(&self) -> UserSpans {
        UserSpans {
            stack_base: self.stack_base,
            stack_size: self.stack_size,
            heap_base: self.heap_base,
            heap_size: self.heap_size,
        }
    }
}

/// Process control block. Owned exclusively by the process table.
pub struct Process {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub name: String,
    pub state: ProcessState,
    pub block_reason: Option<BlockReason>,
    pub priority: Priority,
    /// Private address space; `None` for kernel threads running on the
    /// kernel directory.
    pub page_directory: Option<PageDirectory>,
    /// Top of the kernel-mode stack (bare-metal only)
    pub kernel_stack_top: Option<u32>,
    pub context: SavedContext,
    pub user: Option<UserSpace>,
    /// Working directory, as a descriptor and as the path it resolved from
    pub cwd: Option<FileDescriptor>,
    pub cwd_path: String,
    pub tty: u8,
    /// Uptime milliseconds at which a sleeping process becomes runnable
    pub wake_time_ms: u64,
    pub exit_code: i32,
}

impl Process {
    pub fn new(pid: Pid, name: &str, priority: Priority, parent: Option<Pid>) -> Self {
        Self {
            pid,
            parent,
            name: String::from(name),
            state: ProcessState::Ready,
            block_reason: None,
            priority,
            page_directory: None,
            kernel_stack_top: None,
            context: SavedContext::default(),
            user: None,
            cwd: None,
            cwd_path: String::from("/"),
            tty: 0,
            wake_time_ms: 0,
            exit_code: 0,
        }
    }
}
