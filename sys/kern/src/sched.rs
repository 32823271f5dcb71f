// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Priority scheduler.
//!
//! Run-to-completion across `MAX_PRIORITIES` levels, each an independent
//! FIFO; dispatch always takes the head of the highest non-empty level,
//! located in O(1) through the priority bitmap. Within a level there is
//! no time-slicing and no aging: a task runs until its next kernel entry,
//! and a task that yields goes to the tail of its own level.
//!
//! The scheduler is invoked at exactly three points: return-from-syscall,
//! return-from-IRQ, and Yield (which is just a syscall that does nothing
//! before rescheduling). None of its own operations can fail in a
//! recoverable way -- an inconsistent queue, an out-of-range priority, or
//! an empty ready set is a kernel bug and panics.

use abi::{BlockReason, EventId, TaskState, Tid, MAX_PRIORITIES, MAX_TASKS};
use kerncore::{Link, PriorityMask, Queue};

use crate::idle::IdleAccount;
use crate::task::TaskTable;

const PRIO_WORDS: usize = (MAX_PRIORITIES + 31) / 32;

pub struct Scheduler {
    /// One FIFO per priority level, 0 first.
    ready: [Queue; MAX_PRIORITIES],
    ready_links: [Link; MAX_TASKS],
    /// Bit `p` set iff `ready[p]` is non-empty.
    ready_mask: PriorityMask<PRIO_WORDS>,
    /// All blocked tasks, any reason, in blocking order.
    blocked: Queue,
    blocked_links: [Link; MAX_TASKS],
    /// The Active task. Linked into no queue; `None` between taking the
    /// outgoing task and dispatching its successor.
    current: Option<Tid>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            ready: [Queue::new(); MAX_PRIORITIES],
            ready_links: [Link::DETACHED; MAX_TASKS],
            ready_mask: PriorityMask::new(),
            blocked: Queue::new(),
            blocked_links: [Link::DETACHED; MAX_TASKS],
            current: None,
        }
    }

    pub fn current(&self) -> Option<Tid> {
        self.current
    }

    /// Admits a newly created task: it starts Ready at the tail of its
    /// level.
    pub fn add(&mut self, tasks: &mut TaskTable, tid: Tid) {
        self.enqueue_ready(tasks, tid);
        klog_debug!(
            "added task {} (priority {}) to scheduler",
            tid.0,
            tasks.task(tid).priority().0
        );
    }

    /// Unlinks a task from whatever the scheduler knows about it, ahead
    /// of destruction. If it was the Active task, `current` is cleared so
    /// the next `schedule` call picks a successor.
    pub fn remove(&mut self, tasks: &mut TaskTable, tid: Tid) {
        let i = tid.index();
        match tasks.task(tid).state() {
            TaskState::Ready => {
                let level = tasks.task(tid).priority().level();
                self.ready[level].remove(&mut self.ready_links, i);
                if self.ready[level].is_empty() {
                    self.ready_mask.clear(level);
                }
            }
            TaskState::Blocked(_) => {
                self.blocked.remove(&mut self.blocked_links, i);
            }
            TaskState::Active | TaskState::Terminated => (),
        }
        if self.current == Some(tid) {
            self.current = None;
        }
    }

    /// Moves a task out of the run set. Legal only on the Active task or
    /// a Ready one; the reason determines who may later unblock it.
    pub fn block(&mut self, tasks: &mut TaskTable, tid: Tid, reason: BlockReason) {
        let i = tid.index();
        let state = tasks.task(tid).state();
        uassert!(state.is_runnable());

        if state == TaskState::Ready {
            let level = tasks.task(tid).priority().level();
            self.ready[level].remove(&mut self.ready_links, i);
            if self.ready[level].is_empty() {
                self.ready_mask.clear(level);
            }
        }
        if self.current == Some(tid) {
            self.current = None;
        }

        tasks.task_mut(tid).set_state(TaskState::Blocked(reason));
        self.blocked.push_back(&mut self.blocked_links, i);
        klog_debug!("blocked task {} ({})", tid.0, reason.name());
    }

    /// Returns a Blocked task to the Ready set, at the tail of its level.
    pub fn unblock(&mut self, tasks: &mut TaskTable, tid: Tid) {
        let i = tid.index();
        uassert!(matches!(tasks.task(tid).state(), TaskState::Blocked(_)));

        self.blocked.remove(&mut self.blocked_links, i);
        let task = tasks.task_mut(tid);
        task.set_wait_for(None);
        task.set_event(None);
        self.enqueue_ready(tasks, tid);
        klog_debug!("unblocked task {}", tid.0);
    }

    /// Inserts a task at the tail of its priority queue and marks it
    /// Ready. Idempotent: calling it on a task that is already linked is
    /// a no-op, so callers don't have to care whether a wakeup raced a
    /// re-enqueue.
    pub fn enqueue_ready(&mut self, tasks: &mut TaskTable, tid: Tid) {
        let i = tid.index();
        if self.ready_links[i].is_linked() {
            klog_debug!("task {} already in ready queue, skipping", tid.0);
            return;
        }
        let level = tasks.task(tid).priority().level();
        self.ready[level].push_back(&mut self.ready_links, i);
        self.ready_mask.set(level);
        tasks.task_mut(tid).set_state(TaskState::Ready);
    }

    /// Dequeues the head of the highest-priority non-empty level.
    /// Returns `None` only when no task is ready, which a correctly
    /// configured system prevents by keeping an idle task at the lowest
    /// level.
    pub fn pick_next(&mut self, tasks: &TaskTable) -> Option<Tid> {
        let level = self.ready_mask.first_set()?;
        let i = self.ready[level].pop_front(&mut self.ready_links);
        // The bitmap said this level was non-empty.
        uassert!(i.is_some());
        let i = i.unwrap_or(0);
        if self.ready[level].is_empty() {
            self.ready_mask.clear(level);
        }
        let tid = Tid::from_index(i);
        uassert!(tasks.task(tid).priority().level() == level);
        Some(tid)
    }

    /// The scheduler's main entry: re-enqueues the outgoing Active task
    /// if it is still runnable, picks the next task, marks it Active, and
    /// returns it for the arch layer to restore.
    ///
    /// There is exactly one re-enqueue path here; the outgoing task is
    /// handled once, before `pick_next`.
    pub fn schedule(&mut self, tasks: &mut TaskTable, idle: &mut IdleAccount) -> Tid {
        if let Some(prev) = self.current.take() {
            if idle.is_idle_task(prev) {
                idle.stop_accounting(crate::time::now());
            }
            if tasks.task(prev).state().is_runnable() {
                self.enqueue_ready(tasks, prev);
            }
        }

        let next = match self.pick_next(tasks) {
            Some(t) => t,
            None => panic!("scheduler found no ready task"),
        };

        if idle.is_idle_task(next) {
            idle.start_accounting(crate::time::now());
        }

        tasks.task_mut(next).set_state(TaskState::Active);
        self.current = Some(next);
        klog_debug!(
            "scheduling task {} (priority {})",
            next.0,
            tasks.task(next).priority().0
        );
        next
    }

    /// Wakes every task blocked in `WaitTid` on `exited`, with result 0.
    /// Called before the exiting/killed task disappears, so all waiters
    /// are Ready by the time it is gone from the run set.
    pub fn wake_exit_waiters(&mut self, tasks: &mut TaskTable, exited: Tid) {
        let mut cur = self.blocked.head();
        while let Some(i) = cur {
            cur = Queue::next_after(&self.blocked_links, i);
            let tid = Tid::from_index(i);
            let task = tasks.task(tid);
            if task.state() == TaskState::Blocked(BlockReason::WaitTid)
                && task.wait_for() == Some(exited)
            {
                tasks.task_mut(tid).set_syscall_result(0);
                self.unblock(tasks, tid);
            }
        }
    }

    /// Delivers event `event` with `payload` to every matching waiter:
    /// writes the payload into the waiter's result register and unblocks
    /// it. Returns the number of tasks woken. All-or-nothing with respect
    /// to the delivering IRQ; a waiter that registers afterwards waits
    /// for the next occurrence.
    pub fn deliver_event(
        &mut self,
        tasks: &mut TaskTable,
        event: EventId,
        payload: u64,
    ) -> usize {
        let mut woken = 0;
        let mut cur = self.blocked.head();
        while let Some(i) = cur {
            cur = Queue::next_after(&self.blocked_links, i);
            let tid = Tid::from_index(i);
            let task = tasks.task(tid);
            if task.state() == TaskState::Blocked(BlockReason::AwaitEvent)
                && task.event() == Some(event)
            {
                tasks.task_mut(tid).set_syscall_result(payload as i64);
                self.unblock(tasks, tid);
                woken += 1;
            }
        }
        klog_debug!("event {} woke {} task(s)", event.name(), woken);
        woken
    }

    /// Asserts the scheduler/task-table consistency properties that must
    /// hold after every kernel entry-exit.
    #[cfg(test)]
    pub fn check_invariants(&self, tasks: &TaskTable) {
        // Bitmap bit p set iff ready_queues[p] non-empty.
        for p in 0..MAX_PRIORITIES {
            assert_eq!(
                self.ready_mask.is_set(p),
                !self.ready[p].is_empty(),
                "priority bitmap out of sync at level {p}"
            );
        }

        let mut accounted = 0;
        for task in tasks.iter_live() {
            let i = task.tid().index();
            match task.state() {
                TaskState::Ready => {
                    assert!(self.ready_links[i].is_linked());
                    assert!(!self.blocked_links[i].is_linked());
                }
                TaskState::Blocked(_) => {
                    assert!(self.blocked_links[i].is_linked());
                    assert!(!self.ready_links[i].is_linked());
                }
                TaskState::Active => {
                    // The Active task is in neither queue.
                    assert!(!self.ready_links[i].is_linked());
                    assert!(!self.blocked_links[i].is_linked());
                    assert_eq!(self.current, Some(task.tid()));
                }
                TaskState::Terminated => {
                    panic!("live slot {i} marked Terminated")
                }
            }
            accounted += 1;
        }

        // Conservation: every live task is in exactly one place.
        let queued: usize = (0..MAX_PRIORITIES)
            .map(|p| self.ready[p].len(&self.ready_links))
            .sum::<usize>()
            + self.blocked.len(&self.blocked_links)
            + usize::from(self.current.is_some());
        assert_eq!(queued, accounted, "task accounting mismatch");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
