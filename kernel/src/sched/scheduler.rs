//! Scheduler state machine
//!
//! One FIFO ready queue per priority level; selection scans the highest
//! level first and pops the head. The tick handler wakes expired sleepers
//! before it considers preempting the running process, so a process whose
//! timer fired in the same tick competes for the CPU immediately.
//!
//! Every transition takes the process table by reference and returns the
//! context switch it wants (if any) as a [`SwitchPlan`]; the caller owns
//! interrupts and the actual switch. The running process is *never* in a
//! ready queue; a dispatch is only performed once the caller has moved the
//! current process out of `Running`.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::process::{BlockReason, Pid, Priority, ProcessState, ProcessTable};

/// A context switch the caller should carry out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchPlan {
    /// Where to save the outgoing context (`None` at first dispatch)
    pub from: Option<Pid>,
    /// Whose context to load
    pub to: Pid,
}

/// Outcome of a `wait` attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A terminated child was reaped; its pid and exit code
    Reaped(Pid, i32),
    /// Children exist but none has terminated; block with reason `Wait`
    WouldBlock,
    /// Nothing to wait for
    NoChildren,
}

pub struct Scheduler {
    ready: [VecDeque<Pid>; Priority::COUNT],
    current: Option<Pid>,
    idle: Option<Pid>,
    clock_ms: u64,
    slice_ms: u64,
    slice_used_ms: u64,
}

impl Scheduler {
    pub fn new(slice_ms: u64) -> Self {
        Self {
            ready: [const { VecDeque::new() }; Priority::COUNT],
            current: None,
            idle: None,
            clock_ms: 0,
            slice_ms,
            slice_used_ms: 0,
        }
    }

    /// Register the idle stub. It is dispatched only when every queue is
    /// empty and never sits in a queue itself.
    pub fn set_idle(&mut self, pid: Pid) {
        self.idle = Some(pid);
    }

    /// Adopt an already-executing flow of control (the boot path) as the
    /// current process. Used exactly once, before the first dispatch.
    pub fn adopt_current(&mut self, table: &mut ProcessTable, pid: Pid) {
        debug_assert!(self.current.is_none(), "adopting over a live process");
        if let Some(proc) = table.get_mut(pid) {
            proc.state = ProcessState::Running;
        }
        self.current = Some(pid);
        self.slice_used_ms = 0;
    }

    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    pub fn clock_ms(&self) -> u64 {
        self.clock_ms
    }

    /// Make a process runnable at the tail of its priority queue.
    pub fn enqueue(&mut self, table: &mut ProcessTable, pid: Pid) {
        if Some(pid) == self.idle {
            return;
        }
        let Some(proc) = table.get_mut(pid) else {
            return;
        };
        proc.state = ProcessState::Ready;
        proc.block_reason = None;
        let level = proc.priority.index();
        debug_assert!(!self.ready[level].contains(&pid), "pid {} queued twice", pid);
        self.ready[level].push_back(pid);
    }

    /// Select and start the next process. Returns `None` when the current
    /// process should simply keep running (it is still `Running`, or it
    /// was re-selected after a round-robin rotation).
    pub fn dispatch(&mut self, table: &mut ProcessTable) -> Option<SwitchPlan> {
        let prev = self.current;
        let prev_running = prev
            .and_then(|p| table.get(p))
            .is_some_and(|p| p.state == ProcessState::Running);
        if prev_running {
            // Voluntary operations move the current process out of
            // `Running` before dispatching; nothing to do here.
            return None;
        }

        let next = match self.pop_next() {
            Some(pid) => pid,
            None => match self.idle {
                Some(idle) => idle,
                None => {
                    self.current = None;
                    return None;
                }
            },
        };

        if let Some(proc) = table.get_mut(next) {
            proc.state = ProcessState::Running;
            proc.block_reason = None;
        }
        self.current = Some(next);
        self.slice_used_ms = 0;
        if prev == Some(next) {
            return None;
        }
        log::trace!("dispatch: {:?} -> {}", prev, next);
        Some(SwitchPlan { from: prev, to: next })
    }

    /// Timer tick: advance the clock, wake due sleepers, then preempt the
    /// current process if its time slice is spent.
    pub fn tick(&mut self, table: &mut ProcessTable, elapsed_ms: u64) -> Option<SwitchPlan> {
        self.clock_ms += elapsed_ms;

        // Sleep wake-ups are processed before preemption of the current.
        let due: Vec<Pid> = table
            .pids()
            .into_iter()
            .filter(|&pid| {
                table.get(pid).is_some_and(|p| {
                    p.state == ProcessState::Blocked
                        && p.block_reason == Some(BlockReason::Sleep)
                        && p.wake_time_ms <= self.clock_ms
                })
            })
            .collect();
        for pid in due {
            self.enqueue(table, pid);
        }

        self.slice_used_ms += elapsed_ms;

        if self.current.is_none() {
            return self.dispatch(table);
        }
        if self.current == self.idle {
            // Leave the idle stub as soon as anything is runnable.
            let idle = self.current?;
            if self.ready.iter().any(|q| !q.is_empty()) {
                if let Some(proc) = table.get_mut(idle) {
                    proc.state = ProcessState::Ready;
                }
                return self.dispatch(table);
            }
            return None;
        }

        if self.slice_used_ms < self.slice_ms {
            return None;
        }

        // Slice expired: rotate the current process to the tail of its own
        // level and re-select. If nothing else is runnable at its level or
        // above, dispatch re-picks it and no switch happens.
        let current = self.current?;
        if let Some(proc) = table.get_mut(current) {
            proc.state = ProcessState::Ready;
        }
        self.enqueue(table, current);
        self.dispatch(table)
    }

    /// Voluntarily give up the CPU, staying runnable.
    pub fn yield_now(&mut self, table: &mut ProcessTable) -> Option<SwitchPlan> {
        let current = self.current?;
        if let Some(proc) = table.get_mut(current) {
            proc.state = ProcessState::Ready;
        }
        self.enqueue(table, current);
        self.dispatch(table)
    }

    /// Sleep for at least `ms` milliseconds.
    pub fn sleep(&mut self, table: &mut ProcessTable, ms: u64) -> Option<SwitchPlan> {
        let current = self.current?;
        if let Some(proc) = table.get_mut(current) {
            proc.state = ProcessState::Blocked;
            proc.block_reason = Some(BlockReason::Sleep);
            proc.wake_time_ms = self.clock_ms + ms;
        }
        self.dispatch(table)
    }

    /// Block the current process with the given reason.
    pub fn block_current(
        &mut self,
        table: &mut ProcessTable,
        reason: BlockReason,
    ) -> Option<SwitchPlan> {
        let current = self.current?;
        if let Some(proc) = table.get_mut(current) {
            proc.state = ProcessState::Blocked;
            proc.block_reason = Some(reason);
        }
        self.dispatch(table)
    }

    /// Make a blocked process runnable again. Observed by the very next
    /// scheduler call; does not preempt the running process by itself.
    pub fn unblock(&mut self, table: &mut ProcessTable, pid: Pid) {
        let is_blocked = table
            .get(pid)
            .is_some_and(|p| p.state == ProcessState::Blocked);
        if is_blocked {
            self.enqueue(table, pid);
        }
    }

    /// Terminate the current process. Children are orphaned to `init`; a
    /// parent blocked in `wait` is woken so it can reap.
    pub fn exit_current(
        &mut self,
        table: &mut ProcessTable,
        code: i32,
        init: Pid,
    ) -> Option<SwitchPlan> {
        let current = self.current?;
        let parent = {
            let Some(proc) = table.get_mut(current) else {
                return None;
            };
            proc.state = ProcessState::Terminated;
            proc.exit_code = code;
            proc.parent
        };
        log::debug!("process {} exited with code {}", current, code);
        table.reparent_children(current, init);
        if let Some(parent) = parent {
            let waiting = table.get(parent).is_some_and(|p| {
                p.state == ProcessState::Blocked && p.block_reason == Some(BlockReason::Wait)
            });
            if waiting {
                self.enqueue(table, parent);
            }
        }
        self.dispatch(table)
    }

    /// Try to reap a terminated child of `parent`.
    pub fn wait(&mut self, table: &mut ProcessTable, parent: Pid) -> WaitOutcome {
        let children = table.children_of(parent);
        if children.is_empty() {
            return WaitOutcome::NoChildren;
        }
        for child in children {
            let terminated = table
                .get(child)
                .is_some_and(|p| p.state == ProcessState::Terminated);
            if terminated {
                let proc = table.remove(child).expect("child vanished during wait");
                return WaitOutcome::Reaped(child, proc.exit_code);
            }
        }
        WaitOutcome::WouldBlock
    }

    fn pop_next(&mut self) -> Option<Pid> {
        for queue in self.ready.iter_mut() {
            if let Some(pid) = queue.pop_front() {
                return Some(pid);
            }
        }
        None
    }
}
