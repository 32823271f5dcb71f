// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.

use abi::Priority;

use crate::kernel::Kernel;

/// The single kernel-state instance. Populated once by [`start_kernel`];
/// reached afterwards only through [`with_kernel`], only from trap
/// context, where interrupts are masked and nothing can reenter.
static mut KERNEL: Option<Kernel> = None;

/// Runs `body` against the kernel state.
///
/// # Panics
///
/// If the kernel has not been started. A trap arriving before
/// `start_kernel` finished would indicate wildly broken bring-up.
pub fn with_kernel<R>(body: impl FnOnce(&mut Kernel) -> R) -> R {
    // Safety: single-core, non-reentrant kernel; every caller runs with
    // interrupts masked, so this reference is exclusive for its
    // lifetime.
    let k = unsafe { (*core::ptr::addr_of_mut!(KERNEL)).as_mut() };
    match k {
        Some(k) => body(k),
        None => panic!("kernel state accessed before start_kernel"),
    }
}

/// The main kernel entry point.
///
/// The platform boot shim calls this with the entry point and priority
/// of the first user task (conventionally the init task, which then
/// creates everything else, including the mandatory lowest-priority idle
/// task).
///
/// # Safety
///
/// This can be called exactly once per boot, on the boot core, with the
/// MMU/caches in whatever state the rest of the system expects user
/// tasks to run under.
pub unsafe fn start_kernel(
    first_task: usize,
    first_priority: Priority,
) -> ! {
    klog_info!("starting: tables");
    let mut k = Kernel::new();

    klog_info!("starting: interrupts");
    crate::arch::init_board();
    crate::irq::setup_timer_tick(&mut k);

    let first = match k.tasks.create(None, first_priority, first_task) {
        Ok(tid) => tid,
        Err(e) => panic!("cannot create first task: {e:?}"),
    };
    k.sched.add(&mut k.tasks, first);

    // Safety: single assignment before any trap can observe it.
    unsafe {
        *core::ptr::addr_of_mut!(KERNEL) = Some(k);
    }

    klog_info!("starting: first task");
    let ctx = with_kernel(|k| {
        let first = k.schedule();
        k.tasks.task(first).save() as *const crate::arch::SavedState
    });
    crate::arch::start_first_task(ctx)
}
