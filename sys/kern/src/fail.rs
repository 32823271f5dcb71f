// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Terminal failure path.
//!
//! Every violated kernel invariant, user-space abort, and explicit Panic
//! syscall funnels into [`die`], which records the failure where tooling
//! can find it and then gets as much diagnostic state out the console as
//! it can before spinning:
//!
//! - `kern::fail::KERNEL_HAS_FAILED` is a `bool`, cleared before entry to
//!   kernel main and set once [`die`] runs. Any other value means the
//!   kernel either never booted or corrupted memory on the way down.
//! - `kern::fail::KERNEL_EPITAPH` is a byte array holding as much of the
//!   failure reason (UTF-8, NUL-padded) as fits.
//!
//! After recording, [`die`] redirects the kernel log to the console,
//! flushes everything unread, and asks the arch layer to dump the saved
//! registers, a bounded backtrace, and memory windows around PC/SP/ELR.

use core::fmt::Display;

#[cfg(target_os = "none")]
use core::fmt::Write;

/// Flag that gets set by all failure reporting functions, giving tools a
/// one-stop-shop for doing kernel triage.
#[cfg(target_os = "none")]
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

#[cfg(target_os = "none")]
const EPITAPH_LEN: usize = 128;

/// The "epitaph" buffer records up to `EPITAPH_LEN` bytes of description
/// of the event that caused the kernel to fail, padded with NULs.
#[cfg(target_os = "none")]
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

/// Marks the kernel failed and takes ownership of the epitaph buffer.
/// Yields `None` if the kernel was already down, i.e. we panicked while
/// panicking, in which case there is nothing left worth recording.
#[cfg(target_os = "none")]
fn claim_epitaph() -> Option<&'static mut [u8; EPITAPH_LEN]> {
    // Safety: this flag is touched only here, with interrupts masked and
    // no second core to race with.
    let already_failed = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if already_failed {
        return None;
    }
    // Safety: the flag swap above admits exactly one caller, ever, so
    // handing out the buffer cannot alias.
    Some(unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) })
}

/// Terminal failure. Records the reason, dumps diagnostics, spins.
#[cfg(target_os = "none")]
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[cfg(target_os = "none")]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let Some(epitaph) = claim_epitaph() else {
        // Recursive panic. We can't very well panic in response to this
        // since it'll just make the problem worse.
        loop {
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        }
    };

    // Stage the message through a fixed-capacity string; anything past
    // the epitaph's capacity is dropped on the floor.
    let mut text: heapless::String<EPITAPH_LEN> = heapless::String::new();
    write!(text, "{msg}").ok();
    epitaph[..text.len()].copy_from_slice(text.as_bytes());

    // From here on, log output goes straight out the wire; nobody is
    // coming back to read the ring.
    let mut console = crate::arch::Console;
    crate::klog::with_klog(|k| {
        k.set_destinations(crate::klog::Dest::CONSOLE);
        k.flush_unread(&mut console);
    });
    let _ = writeln!(console, "\r\nKERNEL PANIC: {msg}");

    crate::arch::dump_panic_context(&mut console);

    loop {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

/// Host stand-in: becomes an ordinary test panic so `#[should_panic]`
/// tests can exercise the fatal paths.
#[cfg(not(target_os = "none"))]
pub fn die(msg: impl Display) -> ! {
    panic!("{msg}");
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
