//! Process table
//!
//! Sole owner of every live (and not-yet-reaped) process control block,
//! keyed by pid. Pids are handed out monotonically starting at 1, so the
//! first process created is init.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::pcb::{Priority, Process};
use super::Pid;

pub struct ProcessTable {
    procs: BTreeMap<u32, Process>,
    next_pid: u32,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            procs: BTreeMap::new(),
            next_pid: 1,
        }
    }

    /// Create a process in `Ready` state. The caller decides whether it
    /// goes onto a run queue.
    pub fn create(&mut self, name: &str, priority: Priority, parent: Option<Pid>) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        let mut proc = Process::new(pid, name, priority, parent);
        // Children start in their parent's working directory.
        if let Some(parent) = parent.and_then(|p| self.get(p)) {
            proc.cwd = parent.cwd.clone();
            proc.cwd_path = parent.cwd_path.clone();
            proc.tty = parent.tty;
        }
        log::debug!("process {} \"{}\" created (parent {:?})", pid, name, parent);
        self.procs.insert(pid.0, proc);
        pid
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(&pid.0)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.get_mut(&pid.0)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.procs.contains_key(&pid.0)
    }

    /// Remove a process outright (reaping). The PCB is returned so the
    /// caller can release its resources.
    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        self.procs.remove(&pid.0)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.procs.keys().map(|&k| Pid(k)).collect()
    }

    pub fn children_of(&self, parent: Pid) -> Vec<Pid> {
        self.procs
            .values()
            .filter(|p| p.parent == Some(parent))
            .map(|p| p.pid)
            .collect()
    }

    /// Hand every child of `of` over to `to`. Used when a parent exits
    /// before its children.
    pub fn reparent_children(&mut self, of: Pid, to: Pid) {
        for proc in self.procs.values_mut() {
            if proc.parent == Some(of) {
                proc.parent = Some(to);
            }
        }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
