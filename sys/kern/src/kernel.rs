// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel-state container.
//!
//! Everything the kernel mutates lives in one [`Kernel`] value: the task
//! table, the scheduler, the IPC sender queues, the IRQ dispatch table,
//! the idle accountant, and the tick counter. Handlers receive it
//! explicitly; the single boot-time instance sits behind the controlled
//! static in `startup` and is only touched from trap context, where IRQs
//! are masked. There are no locks because there is nothing to race with.

use abi::Tid;

use crate::idle::IdleAccount;
use crate::ipc::SenderQueues;
use crate::irq::IrqTable;
use crate::sched::Scheduler;
use crate::task::TaskTable;

pub struct Kernel {
    pub tasks: TaskTable,
    pub sched: Scheduler,
    pub senders: SenderQueues,
    pub idle: IdleAccount,
    pub irqs: IrqTable,
    /// Monotonic count of timer-tick IRQs; doubles as the TimerTick
    /// event payload.
    pub ticks: u64,
}

impl Kernel {
    pub fn new() -> Self {
        Kernel {
            tasks: TaskTable::new(),
            sched: Scheduler::new(),
            senders: SenderQueues::new(),
            idle: IdleAccount::default(),
            irqs: IrqTable::new(),
            ticks: 0,
        }
    }

    /// Runs the scheduler over this kernel's state and returns the task
    /// to restore.
    pub fn schedule(&mut self) -> Tid {
        self.sched.schedule(&mut self.tasks, &mut self.idle)
    }

    /// Full destruction path shared by Exit and Kill: wakes WaitTid
    /// waiters with result 0, unlinks the victim everywhere (scheduler
    /// queues and IPC sender queues), and releases its slot.
    pub fn destroy_task(&mut self, victim: Tid) {
        self.sched.wake_exit_waiters(&mut self.tasks, victim);
        self.sched.remove(&mut self.tasks, victim);
        self.senders.purge(victim);
        self.tasks.destroy(victim);
    }

    #[cfg(test)]
    pub fn check_invariants(&self) {
        self.sched.check_invariants(&self.tasks);
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}
