// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! AwaitEvent: user-space subscription to interrupt-derived events.
//!
//! A task calls `AwaitEvent(e)` and parks until an IRQ handler declares
//! that `e` happened, at which point every waiter on `e` receives the
//! handler's 64-bit payload as its syscall result. One wakeup per call;
//! a task that wants the next occurrence has to come back and wait
//! again. The IRQ handler acknowledges the hardware source *before*
//! delivering, so a level-triggered line can't re-storm the same event.

use core::convert::TryFrom;

use abi::{BlockReason, EventId, Tid};

use crate::err::SyscallError;
use crate::kernel::Kernel;
use crate::syscalls::SyscallReturn;

/// `AwaitEvent(event_id)`. An invalid id is an immediate error; a valid
/// one always blocks.
pub fn await_event(
    k: &mut Kernel,
    caller: Tid,
    raw_id: u64,
) -> Result<SyscallReturn, SyscallError> {
    let event = EventId::try_from(raw_id).map_err(|()| {
        klog_error!("task {}: invalid event id {}", caller.0, raw_id);
        SyscallError::BadEvent
    })?;

    k.tasks.task_mut(caller).set_event(Some(event));
    k.sched.block(&mut k.tasks, caller, BlockReason::AwaitEvent);
    Ok(SyscallReturn::Deferred)
}

/// Declares that `event` occurred with `payload`. Called from IRQ
/// handlers after they have acknowledged their hardware source. Returns
/// the number of tasks woken.
pub fn deliver(k: &mut Kernel, event: EventId, payload: u64) -> usize {
    k.sched.deliver_event(&mut k.tasks, event, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ArchState;
    use abi::{Priority, TaskState};

    fn spawn(k: &mut Kernel, priority: u8) -> Tid {
        let tid = k.tasks.create(None, Priority(priority), 0x1000).unwrap();
        k.sched.add(&mut k.tasks, tid);
        tid
    }

    #[test]
    fn invalid_event_id_fails_without_blocking() {
        let mut k = Kernel::new();
        let t = spawn(&mut k, 3);
        assert_eq!(
            await_event(&mut k, t, 0),
            Err(SyscallError::BadEvent)
        );
        assert_eq!(
            await_event(&mut k, t, 99),
            Err(SyscallError::BadEvent)
        );
        assert_eq!(k.tasks.task(t).state(), TaskState::Ready);
    }

    #[test]
    fn fan_out_wakes_every_waiter_exactly_once() {
        let mut k = Kernel::new();
        let waiters: Vec<Tid> = (0..4).map(|_| spawn(&mut k, 3)).collect();

        for &t in &waiters {
            await_event(&mut k, t, EventId::TimerTick as u64).unwrap();
            assert_eq!(
                k.tasks.task(t).state(),
                TaskState::Blocked(BlockReason::AwaitEvent)
            );
        }

        assert_eq!(deliver(&mut k, EventId::TimerTick, 42), 4);
        for &t in &waiters {
            assert_eq!(k.tasks.task(t).state(), TaskState::Ready);
            assert_eq!(k.tasks.task(t).save().arg(0), 42);
        }

        // No further wakeups until somebody waits again.
        assert_eq!(deliver(&mut k, EventId::TimerTick, 43), 0);

        // A late registrant waits for the *next* occurrence.
        let late = waiters[0];
        await_event(&mut k, late, EventId::TimerTick as u64).unwrap();
        assert_eq!(deliver(&mut k, EventId::TimerTick, 44), 1);
        assert_eq!(k.tasks.task(late).save().arg(0), 44);
    }
}
