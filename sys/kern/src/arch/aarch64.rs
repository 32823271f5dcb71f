// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv8-A at EL1, Raspberry Pi-class boards.
//!
//! # Entry strategy
//!
//! The vector table routes every exception we care about -- SVC and
//! aborts from EL0, and IRQs taken while EL0 runs -- into a common
//! sequence: push the full user register frame onto the kernel stack,
//! hand a pointer to it to a Rust entry function, and restore whatever
//! frame that function hands back. The entry functions copy the stacked
//! frame into the Active task's record (the saved registers always live
//! with the task), run the syscall or IRQ machinery, and return the
//! *next* task's context -- which may belong to a different task than
//! the one that trapped. The assembly tail re-points SP_EL0, ELR_EL1,
//! SPSR_EL1 and TPIDR_EL0 from that context and `eret`s to EL0.
//!
//! IRQs are masked for the whole time we're at EL1 (the exception entry
//! sets PSTATE.I and we never clear it in the kernel), so the kernel is
//! non-reentrant by construction; the restored SPSR unmasks them again
//! for user code.
//!
//! # Peripherals
//!
//! Three MMIO blocks, all at fixed board addresses: the GICv2
//! distributor/CPU interface for interrupt routing, the free-running
//! 1 MHz system timer (64-bit counter read as a high/low pair with wrap
//! detection, compare channel 1 for the periodic tick), and the PL011
//! console UART used blocking-only, for panic output and the console
//! klog destination.

use core::arch::{asm, global_asm};
use core::sync::atomic::{AtomicPtr, Ordering};

use aarch64_cpu::registers::{Readable, Writeable, ESR_EL1, FAR_EL1, VBAR_EL1};

use crate::task::ArchState;
use crate::time::Timestamp;

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

/// Full EL0 register frame saved across kernel entries.
///
/// The layout is load-bearing: the assembly below stores and loads by
/// fixed offsets. Keep the fields in this order.
#[repr(C)]
#[derive(Debug)]
pub struct SavedState {
    /// x0-x30. x0 doubles as the syscall result register; x8 carries
    /// the syscall number.
    x: [u64; 31],
    /// SP_EL0.
    sp: u64,
    /// ELR_EL1: where `eret` resumes the task.
    elr: u64,
    /// SPSR_EL1.
    spsr: u64,
    /// TPIDR_EL0.
    tpidr: u64,
    _pad: u64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<SavedState>(), 288);

impl Default for SavedState {
    fn default() -> Self {
        SavedState {
            x: [0; 31],
            sp: 0,
            elr: 0,
            spsr: 0,
            tpidr: 0,
            _pad: 0,
        }
    }
}

impl ArchState for SavedState {
    fn arg(&self, n: usize) -> u64 {
        self.x[n]
    }

    fn syscall_descriptor(&self) -> u64 {
        self.x[8]
    }

    fn set_result(&mut self, v: u64) {
        self.x[0] = v;
    }
}

/// Address of the current task record, maintained at every context
/// switch. The panic path reads this *raw* -- it may fire while the
/// kernel state is mid-mutation, and dumping must not re-enter the
/// `with_kernel` accessor.
#[no_mangle]
static CURRENT_TASK_PTR: AtomicPtr<crate::task::Task> =
    AtomicPtr::new(core::ptr::null_mut());

global_asm! {"
    .macro ventry label
    .align 7
    b \\label
    .endm

    .section .text.vectors
    .align 11
    .globl exception_vectors
    exception_vectors:
        // Current EL with SP_EL0: nothing should arrive here.
        ventry vec_unhandled    // sync
        ventry vec_unhandled    // irq
        ventry vec_unhandled    // fiq
        ventry vec_unhandled    // serror

        // Current EL with SP_ELx: a fault in the kernel itself.
        ventry vec_kernel_fault // sync
        ventry vec_unhandled    // irq (masked while in the kernel)
        ventry vec_unhandled    // fiq
        ventry vec_unhandled    // serror

        // Lower EL, AArch64: the interesting ones.
        ventry el0_sync         // sync (SVC, aborts)
        ventry el0_irq          // irq
        ventry vec_unhandled    // fiq
        ventry vec_unhandled    // serror

        // Lower EL, AArch32: unsupported.
        ventry vec_unhandled
        ventry vec_unhandled
        ventry vec_unhandled
        ventry vec_unhandled

    .section .text

    // Push the full EL0 frame (SavedState layout) onto the kernel
    // stack, leaving a pointer to it in x0. GPRs go first so the
    // system-register reads below are free to use scratch registers.
    .macro save_el0_frame
        sub sp, sp, #288
        stp x0, x1, [sp, #0]
        stp x2, x3, [sp, #16]
        stp x4, x5, [sp, #32]
        stp x6, x7, [sp, #48]
        stp x8, x9, [sp, #64]
        stp x10, x11, [sp, #80]
        stp x12, x13, [sp, #96]
        stp x14, x15, [sp, #112]
        stp x16, x17, [sp, #128]
        stp x18, x19, [sp, #144]
        stp x20, x21, [sp, #160]
        stp x22, x23, [sp, #176]
        stp x24, x25, [sp, #192]
        stp x26, x27, [sp, #208]
        stp x28, x29, [sp, #224]
        mrs x9, sp_el0
        stp x30, x9, [sp, #240]
        mrs x10, elr_el1
        mrs x11, spsr_el1
        stp x10, x11, [sp, #256]
        mrs x12, tpidr_el0
        str x12, [sp, #272]
        mov x0, sp
    .endm

    el0_sync:
        save_el0_frame
        bl el0_sync_entry
        add sp, sp, #288
        b restore_context_and_eret

    el0_irq:
        save_el0_frame
        bl el0_irq_entry
        add sp, sp, #288
        b restore_context_and_eret

    // x0 = pointer to the SavedState to resume. x0/x1 restore last
    // because x0 is the base register for everything else.
    .globl restore_context_and_eret
    restore_context_and_eret:
        ldp x9, x10, [x0, #248]
        msr sp_el0, x9
        msr elr_el1, x10
        ldp x11, x12, [x0, #264]
        msr spsr_el1, x11
        msr tpidr_el0, x12
        ldr x30, [x0, #240]
        ldp x28, x29, [x0, #224]
        ldp x26, x27, [x0, #208]
        ldp x24, x25, [x0, #192]
        ldp x22, x23, [x0, #176]
        ldp x20, x21, [x0, #160]
        ldp x18, x19, [x0, #144]
        ldp x16, x17, [x0, #128]
        ldp x14, x15, [x0, #112]
        ldp x12, x13, [x0, #96]
        ldp x10, x11, [x0, #80]
        ldp x8, x9, [x0, #64]
        ldp x6, x7, [x0, #48]
        ldp x4, x5, [x0, #32]
        ldp x2, x3, [x0, #16]
        ldp x0, x1, [x0, #0]
        eret

    vec_unhandled:
        mrs x0, esr_el1
        mrs x1, elr_el1
        bl unhandled_vector
        b .

    vec_kernel_fault:
        mrs x0, esr_el1
        mrs x1, elr_el1
        bl kernel_fault
        b .
    ",
}

/// Copies the stacked frame into the Active task and hands back the
/// frame to restore, which is how context switches actually happen.
fn enter_kernel(
    frame: *mut SavedState,
    body: impl FnOnce(&mut crate::kernel::Kernel, abi::Tid),
) -> *const SavedState {
    crate::startup::with_kernel(|k| {
        let Some(cur) = k.sched.current() else {
            panic!("trap taken before the first task was dispatched");
        };

        // Safety: the assembly entry just built this frame on the
        // kernel stack and nothing else aliases it.
        *k.tasks.task_mut(cur).save_mut() = unsafe { core::ptr::read(frame) };

        body(k, cur);

        let next = k.schedule();
        let task = k.tasks.task_mut(next);
        CURRENT_TASK_PTR.store(task as *mut _, Ordering::Relaxed);
        task.save() as *const SavedState
    })
}

/// Rust side of the EL0 synchronous-exception path.
///
/// # Safety
///
/// Called only from the vector stubs above with a frame they built.
#[no_mangle]
unsafe extern "C" fn el0_sync_entry(
    frame: *mut SavedState,
) -> *const SavedState {
    enter_kernel(frame, |k, cur| {
        let esr = ESR_EL1.get();
        let ec = (esr >> 26) & 0x3f;
        match ec {
            // SVC from AArch64.
            0x15 => crate::syscalls::handle(k, cur),
            // Instruction / data abort from EL0.
            0x20 | 0x24 => {
                let far = FAR_EL1.get();
                let elr = k.tasks.task(cur).save().elr;
                crate::fail::die(format_args!(
                    "{} from task {}: FAR={:#x} ELR={:#x} ESR={:#x} ({})",
                    if ec == 0x20 {
                        "Instruction abort"
                    } else {
                        "Data abort"
                    },
                    cur.0,
                    far,
                    elr,
                    esr,
                    fault_status_name(esr & 0x3f),
                ));
            }
            _ => crate::fail::die(format_args!(
                "unhandled sync exception from EL0: EC={:#x} ESR={:#x} ({})",
                ec,
                esr,
                exception_class_name(ec),
            )),
        }
    })
}

/// Rust side of the EL0 IRQ path.
///
/// # Safety
///
/// Called only from the vector stubs above with a frame they built.
#[no_mangle]
unsafe extern "C" fn el0_irq_entry(
    frame: *mut SavedState,
) -> *const SavedState {
    enter_kernel(frame, |k, _cur| {
        crate::irq::handle_irq(k);
    })
}

#[no_mangle]
extern "C" fn unhandled_vector(esr: u64, elr: u64) -> ! {
    crate::fail::die(format_args!(
        "exception on an unexpected vector: ESR={:#x} ELR={:#x} ({})",
        esr,
        elr,
        exception_class_name((esr >> 26) & 0x3f),
    ))
}

#[no_mangle]
extern "C" fn kernel_fault(esr: u64, elr: u64) -> ! {
    crate::fail::die(format_args!(
        "fault in kernel mode: ESR={:#x} ELR={:#x} FAR={:#x} ({})",
        esr,
        elr,
        FAR_EL1.get(),
        exception_class_name((esr >> 26) & 0x3f),
    ))
}

fn exception_class_name(ec: u64) -> &'static str {
    match ec {
        0x00 => "UNKNOWN",
        0x01 => "WFI/WFE",
        0x0E => "ILLEGAL EXECUTION",
        0x15 => "SVC (A64)",
        0x18 => "MSR/MRS/SYS",
        0x20 => "INSTRUCTION ABORT (lower EL)",
        0x21 => "INSTRUCTION ABORT (same EL)",
        0x22 => "PC ALIGNMENT",
        0x24 => "DATA ABORT (lower EL)",
        0x25 => "DATA ABORT (same EL)",
        0x26 => "SP ALIGNMENT",
        0x2C => "FP EXCEPTION (A64)",
        0x2F => "SERROR",
        0x30 => "BREAKPOINT (lower EL)",
        0x3C => "BRK (A64)",
        _ => "UNRECOGNIZED",
    }
}

fn fault_status_name(fsc: u64) -> &'static str {
    match fsc {
        0x04..=0x07 => "translation fault",
        0x09..=0x0B => "access flag fault",
        0x0D..=0x0F => "permission fault",
        0x10 => "external abort",
        0x21 => "alignment fault",
        _ => "other fault",
    }
}

// --- System timer ---------------------------------------------------
//
// BCM2711 free-running 1 MHz timer: CLO/CHI counter halves plus four
// compare channels; we use channel 1 for the kernel tick.

const SYSTEM_TIMER_BASE: usize = 0xFE00_3000;
const ST_CS: usize = 0x00;
const ST_CLO: usize = 0x04;
const ST_CHI: usize = 0x08;
const ST_C1: usize = 0x10;

fn st_read(offset: usize) -> u32 {
    // Safety: fixed board MMIO address.
    unsafe { core::ptr::read_volatile((SYSTEM_TIMER_BASE + offset) as *const u32) }
}

fn st_write(offset: usize, v: u32) {
    // Safety: fixed board MMIO address.
    unsafe {
        core::ptr::write_volatile((SYSTEM_TIMER_BASE + offset) as *mut u32, v)
    }
}

/// Reads the 64-bit microsecond counter as a high/low pair. If the low
/// half wrapped between the two reads, the high half is re-read.
pub fn now() -> Timestamp {
    let mut hi = st_read(ST_CHI);
    let lo = st_read(ST_CLO);
    if st_read(ST_CLO) < lo {
        hi = st_read(ST_CHI);
    }
    Timestamp::from([lo, hi])
}

/// Arms compare channel 1 to fire `us` microseconds from now.
pub fn timer_arm(us: u32) {
    st_write(ST_C1, st_read(ST_CLO).wrapping_add(us));
}

/// Acknowledges the channel-1 compare match.
pub fn timer_ack() {
    st_write(ST_CS, 1 << 1);
}

// --- GICv2 ----------------------------------------------------------

const GIC_BASE: usize = 0xFF84_0000;
const GICD_BASE: usize = GIC_BASE + 0x1000;
const GICC_BASE: usize = GIC_BASE + 0x2000;

const GICD_CTLR: usize = 0x000;
const GICD_ISENABLER: usize = 0x100;
const GICD_ICENABLER: usize = 0x180;
const GICD_IPRIORITYR: usize = 0x400;
const GICD_ITARGETSR: usize = 0x800;
const GICD_ICFGR: usize = 0xC00;

const GICC_CTLR: usize = 0x000;
const GICC_PMR: usize = 0x004;
const GICC_IAR: usize = 0x00C;
const GICC_EOIR: usize = 0x010;

const GIC_SPURIOUS_INTID: u32 = 1023;

fn gicd_read(offset: usize) -> u32 {
    // Safety: fixed board MMIO address.
    unsafe { core::ptr::read_volatile((GICD_BASE + offset) as *const u32) }
}

fn gicd_write(offset: usize, v: u32) {
    // Safety: fixed board MMIO address.
    unsafe { core::ptr::write_volatile((GICD_BASE + offset) as *mut u32, v) }
}

fn gicc_read(offset: usize) -> u32 {
    // Safety: fixed board MMIO address.
    unsafe { core::ptr::read_volatile((GICC_BASE + offset) as *const u32) }
}

fn gicc_write(offset: usize, v: u32) {
    // Safety: fixed board MMIO address.
    unsafe { core::ptr::write_volatile((GICC_BASE + offset) as *mut u32, v) }
}

fn gic_init() {
    // Distributor and CPU interface on; accept all priorities.
    gicd_write(GICD_CTLR, 1);
    gicc_write(GICC_PMR, 0xFF);
    gicc_write(GICC_CTLR, 1);
}

#[derive(Copy, Clone, Debug)]
pub enum IrqTrigger {
    Level,
    Edge,
}

pub fn irq_enable(irq: u32) {
    // Default priority, routed to core 0 (the only core we run). Both
    // register files are byte-accessible, one byte per interrupt.
    let prio = (GICD_BASE + GICD_IPRIORITYR + irq as usize) as *mut u8;
    let target = (GICD_BASE + GICD_ITARGETSR + irq as usize) as *mut u8;
    // Safety: fixed board MMIO addresses.
    unsafe {
        core::ptr::write_volatile(prio, 0xA0);
        core::ptr::write_volatile(target, 0x01);
    }
    gicd_write(
        GICD_ISENABLER + 4 * (irq as usize / 32),
        1 << (irq % 32),
    );
}

pub fn irq_disable(irq: u32) {
    gicd_write(
        GICD_ICENABLER + 4 * (irq as usize / 32),
        1 << (irq % 32),
    );
}

pub fn irq_set_type(irq: u32, trigger: IrqTrigger) {
    let shift = 2 * (irq as usize % 16);
    let offset = GICD_ICFGR + 4 * (irq as usize / 16);
    let bits = match trigger {
        IrqTrigger::Level => 0b00,
        IrqTrigger::Edge => 0b10,
    };
    let v = gicd_read(offset) & !(0b11 << shift) | (bits << shift);
    gicd_write(offset, v);
}

/// Acknowledges the highest-priority pending interrupt. `None` for the
/// spurious sentinel.
pub fn irq_acknowledge() -> Option<u32> {
    let irq = gicc_read(GICC_IAR) & 0x3FF;
    if irq == GIC_SPURIOUS_INTID {
        None
    } else {
        Some(irq)
    }
}

/// Signals end-of-interrupt.
pub fn irq_end(irq: u32) {
    gicc_write(GICC_EOIR, irq);
}

// --- Console UART ---------------------------------------------------
//
// PL011 at the board's UART0 address, already clocked and enabled by
// firmware. Blocking writes only; this is the panic/console path, not a
// driver.

const UART0_BASE: usize = 0xFE20_1000;
const UART_DR: usize = 0x00;
const UART_FR: usize = 0x18;
const UART_FR_TXFF: u32 = 1 << 5;

fn console_putc(b: u8) {
    // Safety: fixed board MMIO addresses.
    unsafe {
        while core::ptr::read_volatile((UART0_BASE + UART_FR) as *const u32)
            & UART_FR_TXFF
            != 0
        {}
        core::ptr::write_volatile((UART0_BASE + UART_DR) as *mut u32, b as u32);
    }
}

/// Blocking console sink.
pub struct Console;

impl core::fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for b in s.bytes() {
            if b == b'\n' {
                console_putc(b'\r');
            }
            console_putc(b);
        }
        Ok(())
    }
}

// --- Task bring-up and teardown -------------------------------------

extern "C" {
    /// Base of the contiguous per-task stack slab; provided by the
    /// linker script.
    static __user_stacks_start: u8;
}

pub fn stack_slab_base() -> usize {
    // Safety: taking the address of a linker symbol.
    unsafe { core::ptr::addr_of!(__user_stacks_start) as usize }
}

/// Rebuilds `task`'s register frame so that restoring it lands at the
/// entry point, at EL0 with interrupts enabled, SP at the top of the
/// task's (zeroed) stack.
pub fn reinitialize(task: &mut crate::task::Task) {
    let base = task.stack_base();
    let size = task.stack_size();
    // Safety: the stack slot was just allocated to this task alone.
    unsafe {
        core::ptr::write_bytes(base as *mut u8, 0, size);
    }

    let save = task.save_mut();
    *save = SavedState::default();
    // AAPCS64 wants 16-byte stack alignment at every public interface.
    save.sp = ((base + size) & !15) as u64;
    save.elr = task.entry_point() as u64;
    // EL0t, DAIF clear: user code runs with interrupts on.
    save.spsr = 0;
}

/// Hands the CPU to the first task. Never returns; from here on the
/// kernel only runs inside trap handlers.
pub fn start_first_task(ctx: *const SavedState) -> ! {
    // Safety: ctx points into the task table, which outlives this call;
    // restore_context_and_eret consumes it and drops to EL0.
    unsafe {
        asm!(
            "mov x0, {ctx}",
            "b restore_context_and_eret",
            ctx = in(reg) ctx,
            options(noreturn),
        )
    }
}

/// Installs the vector table and brings up the interrupt controller.
pub fn init_board() {
    extern "C" {
        fn exception_vectors();
    }
    VBAR_EL1.set(exception_vectors as usize as u64);
    gic_init();
    klog_info!("vectors and GIC initialized");
}

// --- Reset and panic dumps ------------------------------------------

const PM_BASE: usize = 0xFE10_0000;
const PM_RSTC: usize = 0x1C;
const PM_WDOG: usize = 0x24;
const PM_PASSWORD: u32 = 0x5A00_0000;
const PM_RSTC_FULL_RESET: u32 = 0x20;

/// Full-chip reset through the PM watchdog.
pub fn reset() -> ! {
    // Safety: fixed board MMIO addresses.
    unsafe {
        core::ptr::write_volatile(
            (PM_BASE + PM_WDOG) as *mut u32,
            PM_PASSWORD | 10,
        );
        core::ptr::write_volatile(
            (PM_BASE + PM_RSTC) as *mut u32,
            PM_PASSWORD | PM_RSTC_FULL_RESET,
        );
    }
    loop {
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

/// Dumps everything a post-mortem wants: the failing task's saved
/// registers, a bounded frame-pointer backtrace of the kernel, and
/// memory windows around the task's PC and SP.
///
/// Reads memory raw and unchecked; at this point making it to the end
/// of the dump is best-effort.
pub fn dump_panic_context(sink: &mut dyn core::fmt::Write) {
    let task = CURRENT_TASK_PTR.load(Ordering::Relaxed);
    if !task.is_null() {
        // Safety: the pointer was stored from the task table, which is
        // never deallocated; we are the only context running.
        let save = unsafe { (*task).save() };
        let _ = writeln!(sink, "task registers:");
        for pair in (0..30).step_by(2) {
            let _ = writeln!(
                sink,
                "x{:<2} = {:#018x}  x{:<2} = {:#018x}",
                pair,
                save.x[pair],
                pair + 1,
                save.x[pair + 1],
            );
        }
        let _ = writeln!(sink, "x30 = {:#018x}", save.x[30]);
        let _ = writeln!(
            sink,
            "sp = {:#x} elr = {:#x} spsr = {:#x} tpidr = {:#x}",
            save.sp, save.elr, save.spsr, save.tpidr,
        );
        dump_around(sink, save.elr, "ELR");
        dump_around(sink, save.sp, "SP");
    }
    backtrace(sink);
}

/// Walks the kernel's frame-pointer chain, bounded in depth.
fn backtrace(sink: &mut dyn core::fmt::Write) {
    const MAX_DEPTH: usize = 16;
    let mut fp: u64;
    // Safety: reading our own frame pointer.
    unsafe {
        asm!("mov {}, x29", out(reg) fp);
    }
    let _ = writeln!(sink, "backtrace:");
    let mut depth = 0;
    while fp != 0 && depth < MAX_DEPTH {
        // Safety: frame records are (previous fp, lr) pairs; a corrupt
        // chain can fault, which we accept while already dying.
        let lr = unsafe { core::ptr::read((fp + 8) as *const u64) };
        let _ = writeln!(sink, "#{depth}: {lr:#x}");
        fp = unsafe { core::ptr::read(fp as *const u64) };
        depth += 1;
    }
}

/// Dumps a 256-byte window around `addr`, eight words per line.
fn dump_around(sink: &mut dyn core::fmt::Write, addr: u64, label: &str) {
    let _ = writeln!(sink, "memory around {label} ({addr:#x}):");
    let start = addr.saturating_sub(128) & !31;
    let mut p = start;
    while p < start + 256 {
        let _ = write!(sink, "{p:#010x}:");
        for i in 0..8 {
            // Safety: raw best-effort read while dying.
            let w = unsafe { core::ptr::read((p + i * 4) as *const u32) };
            let _ = write!(sink, " {w:08x}");
        }
        let _ = writeln!(sink);
        p += 32;
    }
}
