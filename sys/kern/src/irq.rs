// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IRQ dispatch.
//!
//! The interrupt controller (a GICv2, programmed in `arch`) hands us an
//! interrupt number; this module owns the table mapping numbers to
//! kernel-side handlers. Driver-facing contract: `register` + `enable` +
//! `set_type`, dispatch runs the handler with the kernel state, and the
//! entry path signals end-of-interrupt after the handler returns.
//!
//! Handlers acknowledge their own hardware source before raising events,
//! so a level-triggered line can't retrigger a delivery storm.

use abi::EventId;

use crate::kernel::Kernel;
use crate::time::TICK_INTERVAL_US;

/// Highest IRQ number the dispatch table covers. The GIC can route up to
/// 1024, but everything this kernel services (system timer, UARTs) sits
/// well below this.
pub const MAX_IRQS: usize = 256;

/// IRQ line of system timer compare channel 1 on the board.
pub const IRQ_SYSTEM_TIMER_1: u32 = 97;

pub type IrqHandler = fn(&mut Kernel, u32);

pub struct IrqTable {
    handlers: [Option<IrqHandler>; MAX_IRQS],
}

impl IrqTable {
    pub fn new() -> Self {
        IrqTable {
            handlers: [None; MAX_IRQS],
        }
    }

    /// Registers `handler` for `irq`. Refuses out-of-range numbers and
    /// double registration; both indicate a confused driver setup.
    pub fn register(&mut self, irq: u32, handler: IrqHandler) -> Result<(), ()> {
        let slot = self.handlers.get_mut(irq as usize).ok_or(())?;
        if slot.is_some() {
            return Err(());
        }
        *slot = Some(handler);
        Ok(())
    }

    pub fn unregister(&mut self, irq: u32) {
        if let Some(slot) = self.handlers.get_mut(irq as usize) {
            *slot = None;
        }
    }

    fn lookup(&self, irq: u32) -> Option<IrqHandler> {
        *self.handlers.get(irq as usize)?
    }
}

impl Default for IrqTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point from the IRQ exception path: acknowledge, dispatch,
/// signal end-of-interrupt. An unregistered IRQ is logged and completed
/// so the line doesn't wedge the controller.
pub fn handle_irq(k: &mut Kernel) {
    let Some(irq) = crate::arch::irq_acknowledge() else {
        klog_debug!("spurious interrupt received");
        return;
    };

    match k.irqs.lookup(irq) {
        Some(handler) => handler(k, irq),
        None => klog_error!("IRQ {} has no registered handler", irq),
    }

    crate::arch::irq_end(irq);
}

/// Installs and arms the periodic timer tick. Called once at startup.
pub fn setup_timer_tick(k: &mut Kernel) {
    if k.irqs.register(IRQ_SYSTEM_TIMER_1, timer_tick_handler).is_err() {
        klog_error!("failed to register timer tick handler");
        return;
    }
    crate::arch::irq_set_type(IRQ_SYSTEM_TIMER_1, crate::arch::IrqTrigger::Level);
    crate::arch::irq_enable(IRQ_SYSTEM_TIMER_1);
    crate::arch::timer_arm(TICK_INTERVAL_US);
    klog_info!(
        "timer tick configured for {}ms intervals (IRQ {})",
        TICK_INTERVAL_US / 1000,
        IRQ_SYSTEM_TIMER_1
    );
}

/// The timer tick: acknowledge the compare match, re-arm the next tick,
/// then fan the event out with the tick count as payload.
fn timer_tick_handler(k: &mut Kernel, _irq: u32) {
    k.ticks += 1;
    crate::arch::timer_ack();
    crate::arch::timer_arm(TICK_INTERVAL_US);
    crate::event::deliver(k, EventId::TimerTick, k.ticks);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ArchState;

    fn nop_handler(_k: &mut Kernel, _irq: u32) {}

    #[test]
    fn register_rejects_out_of_range_and_duplicates() {
        let mut table = IrqTable::new();
        assert!(table.register(97, nop_handler).is_ok());
        assert!(table.register(97, nop_handler).is_err());
        assert!(table.register(MAX_IRQS as u32, nop_handler).is_err());
        table.unregister(97);
        assert!(table.register(97, nop_handler).is_ok());
    }

    #[test]
    fn tick_handler_counts_and_delivers() {
        use abi::{BlockReason, Priority, TaskState};

        let mut k = Kernel::new();
        let t = k.tasks.create(None, Priority(1), 0x1000).unwrap();
        k.sched.add(&mut k.tasks, t);
        k.tasks
            .task_mut(t)
            .set_event(Some(EventId::TimerTick));
        k.sched
            .block(&mut k.tasks, t, BlockReason::AwaitEvent);

        timer_tick_handler(&mut k, IRQ_SYSTEM_TIMER_1);
        assert_eq!(k.ticks, 1);
        assert_eq!(k.tasks.task(t).state(), TaskState::Ready);
        assert_eq!(k.tasks.task(t).save().arg(0), 1);

        timer_tick_handler(&mut k, IRQ_SYSTEM_TIMER_1);
        assert_eq!(k.ticks, 2);
    }
}
