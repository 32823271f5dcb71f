// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host stand-in for the architecture layer.
//!
//! The saved "registers" are a real little register file so tests can
//! plant syscall arguments and read results back the way the trap path
//! would; the clock is a settable atomic so timing-sensitive code (idle
//! accounting) can be driven deterministically.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::time::Timestamp;

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

/// Stand-in for the saved user frame: x0..x7 plus the syscall number
/// slot standing in for x8.
#[derive(Debug, Default)]
pub struct SavedState {
    regs: [u64; 9],
}

impl SavedState {
    /// Plants argument register `n`, as user code would before trapping.
    pub fn set_arg(&mut self, n: usize, v: u64) {
        self.regs[n] = v;
    }

    /// Plants the syscall number.
    pub fn set_descriptor(&mut self, v: u64) {
        self.regs[8] = v;
    }
}

impl crate::task::ArchState for SavedState {
    fn arg(&self, n: usize) -> u64 {
        self.regs[n]
    }

    fn syscall_descriptor(&self) -> u64 {
        self.regs[8]
    }

    fn set_result(&mut self, v: u64) {
        self.regs[0] = v;
    }
}

/// Console sink; goes to test stderr.
pub struct Console;

impl core::fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        eprint!("{s}");
        Ok(())
    }
}

static TEST_CLOCK: AtomicU64 = AtomicU64::new(0);

pub fn now() -> Timestamp {
    Timestamp::from(TEST_CLOCK.load(Ordering::Relaxed))
}

/// Advances the fake clock; tests only.
pub fn set_now(us: u64) {
    TEST_CLOCK.store(us, Ordering::Relaxed);
}

/// A plausible-looking slab base. Nothing dereferences task stacks on
/// the host.
pub fn stack_slab_base() -> usize {
    0x4000_0000
}

pub fn reinitialize(task: &mut crate::task::Task) {
    *task.save_mut() = SavedState::default();
}

pub fn start_first_task(_ctx: *const SavedState) -> ! {
    panic!("entering userland");
}

pub fn reset() -> ! {
    panic!("SYSTEM RESET");
}

#[derive(Copy, Clone, Debug)]
pub enum IrqTrigger {
    Level,
    Edge,
}

pub fn irq_acknowledge() -> Option<u32> {
    None
}

pub fn irq_end(_irq: u32) {}

pub fn irq_enable(_irq: u32) {}

pub fn irq_disable(_irq: u32) {}

pub fn irq_set_type(_irq: u32, _trigger: IrqTrigger) {}

pub fn timer_arm(_us: u32) {}

pub fn timer_ack() {}

pub fn init_board() {}

pub fn dump_panic_context(_sink: &mut dyn core::fmt::Write) {}
