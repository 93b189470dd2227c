//! Blocking mutex
//!
//! Ownership is handed directly from the unlocking process to the head of
//! the wait queue — a waiter that blocked first gets the mutex next, and a
//! late arrival can never barge in between.

use alloc::collections::VecDeque;

use crate::error::KernelError;
use crate::process::{BlockReason, Pid, ProcessTable};
use crate::sched::{Scheduler, SwitchPlan};

pub struct KMutex {
    holder: Option<Pid>,
    waiters: VecDeque<Pid>,
}

impl KMutex {
    pub const fn new() -> Self {
        Self {
            holder: None,
            waiters: VecDeque::new(),
        }
    }

    pub fn holder(&self) -> Option<Pid> {
        self.holder
    }

    pub fn is_locked(&self) -> bool {
        self.holder.is_some()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Acquire for the current process, or block with reason `Mutex`.
    /// Re-locking by the holder is refused rather than deadlocking.
    pub fn lock(
        &mut self,
        sched: &mut Scheduler,
        table: &mut ProcessTable,
    ) -> Result<Option<SwitchPlan>, KernelError> {
        let current = sched.current().ok_or(KernelError::BadValue)?;
        match self.holder {
            None => {
                self.holder = Some(current);
                Ok(None)
            }
            Some(holder) if holder == current => Err(KernelError::BadArgument),
            Some(_) => {
                self.waiters.push_back(current);
                Ok(sched.block_current(table, BlockReason::Mutex))
            }
        }
    }

    /// Release; only the holder may unlock. Ownership transfers to the
    /// first waiter, which becomes runnable.
    pub fn unlock(
        &mut self,
        sched: &mut Scheduler,
        table: &mut ProcessTable,
    ) -> Result<(), KernelError> {
        let current = sched.current().ok_or(KernelError::BadValue)?;
        if self.holder != Some(current) {
            return Err(KernelError::BadArgument);
        }
        match self.waiters.pop_front() {
            Some(next) => {
                self.holder = Some(next);
                sched.unblock(table, next);
            }
            None => self.holder = None,
        }
        Ok(())
    }
}

impl Default for KMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::process::Priority;

    fn setup_three() -> (Scheduler, ProcessTable, Pid, Pid, Pid) {
        let mut table = ProcessTable::new();
        let init = table.create("init", Priority::Kernel, None);
        let mut sched = Scheduler::new(10);
        let idle = table.create("idle", Priority::Idle, None);
        sched.set_idle(idle);
        let a = table.create("a", Priority::User, Some(init));
        let b = table.create("b", Priority::User, Some(init));
        let c = table.create("c", Priority::User, Some(init));
        for pid in [a, b, c] {
            sched.enqueue(&mut table, pid);
        }
        sched.dispatch(&mut table);
        (sched, table, a, b, c)
    }

    #[test]
    fn uncontended_lock_does_not_block() {
        let (mut sched, mut table, a, _, _) = setup_three();
        let mut m = KMutex::new();
        assert_eq!(m.lock(&mut sched, &mut table).unwrap(), None);
        assert_eq!(m.holder(), Some(a));
        assert_eq!(sched.current(), Some(a));
    }

    #[test]
    fn ownership_transfers_in_block_order() {
        let (mut sched, mut table, a, b, c) = setup_three();
        let mut m = KMutex::new();

        m.lock(&mut sched, &mut table).unwrap(); // a holds
        sched.yield_now(&mut table); // b runs
        let plan = m.lock(&mut sched, &mut table).unwrap().unwrap(); // b blocks
        assert_eq!(plan.to, c);
        m.lock(&mut sched, &mut table).unwrap(); // c blocks too; a runs
        assert_eq!(sched.current(), Some(a));
        assert_eq!(m.waiter_count(), 2);

        // a unlocks: b (first blocked) owns the mutex immediately, even
        // though c is also waiting and a is still running.
        m.unlock(&mut sched, &mut table).unwrap();
        assert_eq!(m.holder(), Some(b));
        assert_eq!(m.waiter_count(), 1);

        // b runs, unlocks: c inherits.
        sched.yield_now(&mut table);
        assert_eq!(sched.current(), Some(b));
        m.unlock(&mut sched, &mut table).unwrap();
        assert_eq!(m.holder(), Some(c));
    }

    #[test]
    fn only_the_holder_may_unlock() {
        let (mut sched, mut table, _, _, _) = setup_three();
        let mut m = KMutex::new();
        m.lock(&mut sched, &mut table).unwrap(); // a holds
        sched.yield_now(&mut table); // b runs
        assert_eq!(
            m.unlock(&mut sched, &mut table),
            Err(KernelError::BadArgument)
        );
    }

    #[test]
    fn relock_by_holder_is_refused() {
        let (mut sched, mut table, _, _, _) = setup_three();
        let mut m = KMutex::new();
        m.lock(&mut sched, &mut table).unwrap();
        assert_eq!(
            m.lock(&mut sched, &mut table),
            Err(KernelError::BadArgument)
        );
    }
}
