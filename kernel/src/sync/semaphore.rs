//! Counting semaphore
//!
//! `down` never decrements on the blocking path and `up` never increments
//! while waiters exist — the permit goes straight to the head waiter. So
//! at all times `count - waiters` equals the initial value plus the net of
//! all up/down calls.

use alloc::collections::VecDeque;

use crate::error::KernelError;
use crate::process::{BlockReason, Pid, ProcessTable};
use crate::sched::{Scheduler, SwitchPlan};

pub struct KSemaphore {
    count: u32,
    waiters: VecDeque<Pid>,
}

impl KSemaphore {
    pub const fn new(initial: u32) -> Self {
        Self {
            count: initial,
            waiters: VecDeque::new(),
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Take a permit, blocking with reason `Semaphore` when none is
    /// available.
    pub fn down(
        &mut self,
        sched: &mut Scheduler,
        table: &mut ProcessTable,
    ) -> Result<Option<SwitchPlan>, KernelError> {
        let current = sched.current().ok_or(KernelError::BadValue)?;
        if self.count > 0 {
            self.count -= 1;
            return Ok(None);
        }
        self.waiters.push_back(current);
        Ok(sched.block_current(table, BlockReason::Semaphore))
    }

    /// Release a permit: hand it to the head waiter if there is one,
    /// otherwise bump the count.
    pub fn up(&mut self, sched: &mut Scheduler, table: &mut ProcessTable) {
        match self.waiters.pop_front() {
            Some(next) => sched.unblock(table, next),
            None => self.count += 1,
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::process::{Priority, ProcessState};

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
    fn down_consumes_permits_then_blocks() {
        let (mut sched, mut table, a, b, _) = setup_three();
        let mut sem = KSemaphore::new(1);

        assert_eq!(sem.down(&mut sched, &mut table).unwrap(), None);
        assert_eq!(sem.count(), 0);

        sched.yield_now(&mut table); // b runs
        let plan = sem.down(&mut sched, &mut table).unwrap().unwrap();
        assert_ne!(plan.to, b);
        assert_eq!(table.get(b).unwrap().state, ProcessState::Blocked);
        // Blocking did not decrement.
        assert_eq!(sem.count(), 0);
        assert_eq!(sem.waiter_count(), 1);

        // a (running later) releases: b gets the permit directly.
        sched.yield_now(&mut table);
        while sched.current() != Some(a) {
            sched.yield_now(&mut table);
        }
        sem.up(&mut sched, &mut table);
        assert_eq!(sem.count(), 0); // not incremented, transferred
        assert_eq!(sem.waiter_count(), 0);
        assert_eq!(table.get(b).unwrap().state, ProcessState::Ready);
    }

    #[test]
    fn up_without_waiters_increments() {
        let (mut sched, mut table, _, _, _) = setup_three();
        let mut sem = KSemaphore::new(0);
        sem.up(&mut sched, &mut table);
        sem.up(&mut sched, &mut table);
        assert_eq!(sem.count(), 2);
    }

    #[test]
    fn accounting_invariant_holds() {
        // count - waiters == initial + ups - downs, across every path.
        let (mut sched, mut table, _, _, _) = setup_three();
        let initial = 2i64;
        let mut sem = KSemaphore::new(initial as u32);
        let mut net = 0i64;

        let mut check = |sem: &KSemaphore, net: i64| {
            assert_eq!(
                sem.count() as i64 - sem.waiter_count() as i64,
                initial + net
            );
        };

        for _ in 0..2 {
            sem.down(&mut sched, &mut table).unwrap();
            net -= 1;
            check(&sem, net);
        }
        // Third down blocks the current process.
        sem.down(&mut sched, &mut table).unwrap();
        net -= 1;
        check(&sem, net);

        for _ in 0..3 {
            sem.up(&mut sched, &mut table);
            net += 1;
            check(&sem, net);
        }
    }
}
