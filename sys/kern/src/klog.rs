// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel logger.
//!
//! Records carry a level and a timestamp and go to one or both of two
//! destinations: straight out the console UART (blocking) or into a
//! fixed-capacity in-memory ring. Normal operation logs to memory only;
//! user space drains the ring through `GetUnreadKlogs`, and the panic
//! path flips the destination to the console and flushes everything
//! that's still unread.
//!
//! Logging is best-effort everywhere: a full ring overwrites the oldest
//! record, an oversized message is truncated, and no caller ever sees a
//! logging failure.

use core::fmt::{self, Write};

use heapless::String;

pub use abi::KlogDest as Dest;
pub use abi::KlogLevel as Level;

/// Capacity of one record's formatted text.
pub const MESSAGE_CAP: usize = 128;

/// Number of records the ring retains.
pub const RING_ENTRIES: usize = 64;

macro_rules! klog_record {
    ($lvl:expr, $($t:tt)*) => {
        $crate::klog::record($lvl, format_args!($($t)*))
    };
}

macro_rules! klog_error {
    ($($t:tt)*) => { klog_record!($crate::klog::Level::Error, $($t)*) };
}

macro_rules! klog_warning {
    ($($t:tt)*) => { klog_record!($crate::klog::Level::Warning, $($t)*) };
}

macro_rules! klog_info {
    ($($t:tt)*) => { klog_record!($crate::klog::Level::Info, $($t)*) };
}

macro_rules! klog_debug {
    ($($t:tt)*) => { klog_record!($crate::klog::Level::Debug, $($t)*) };
}

/// One record in the ring.
#[derive(Clone, Debug)]
pub struct Entry {
    pub timestamp_us: u64,
    pub level: Level,
    pub text: String<MESSAGE_CAP>,
}

impl Entry {
    const EMPTY: Entry = Entry {
        timestamp_us: 0,
        level: Level::Debug,
        text: String::new(),
    };
}

/// The ring proper. Pure data structure; the global instance and the
/// console plumbing live in the free functions below.
pub struct Ring {
    entries: [Entry; RING_ENTRIES],
    /// Next slot to write.
    next: usize,
    /// Number of slots holding valid records.
    stored: usize,
    /// Of `stored`, how many have not been drained yet. The oldest
    /// `unread` records are the unread ones; overwriting an unread slot
    /// loses that record, which is the documented best-effort behavior.
    unread: usize,
    dest: Dest,
    threshold: Level,
}

impl Ring {
    pub const fn new() -> Self {
        Ring {
            entries: [Entry::EMPTY; RING_ENTRIES],
            next: 0,
            stored: 0,
            unread: 0,
            dest: Dest::MEMORY,
            threshold: if cfg!(feature = "klog-debug") {
                Level::Debug
            } else {
                Level::Info
            },
        }
    }

    pub fn destinations(&self) -> Dest {
        self.dest
    }

    pub fn set_destinations(&mut self, dest: Dest) {
        self.dest = dest;
    }

    /// Checks the runtime level filter.
    pub fn enabled(&self, level: Level) -> bool {
        level as u8 <= self.threshold as u8
    }

    /// Formats and stores a record, truncating to `MESSAGE_CAP`.
    pub fn push(
        &mut self,
        timestamp_us: u64,
        level: Level,
        args: fmt::Arguments<'_>,
    ) {
        let entry = &mut self.entries[self.next];
        entry.timestamp_us = timestamp_us;
        entry.level = level;
        entry.text.clear();
        // A full String returns Err; the prefix that fit is what we keep.
        let _ = entry.text.write_fmt(args);

        self.next = (self.next + 1) % RING_ENTRIES;
        if self.stored < RING_ENTRIES {
            self.stored += 1;
        }
        if self.unread < RING_ENTRIES {
            self.unread += 1;
        }
    }

    pub fn unread_count(&self) -> usize {
        self.unread
    }

    /// Index of the oldest unread slot.
    fn oldest_unread(&self) -> usize {
        (self.next + RING_ENTRIES - self.unread) % RING_ENTRIES
    }

    /// Formats unread records into `out`, oldest first, one line per
    /// record. Stops at the first record that does not fit whole.
    /// Returns `(bytes_written, entries_written)` and marks exactly the
    /// written records as read.
    pub fn drain_formatted(&mut self, out: &mut [u8]) -> (usize, usize) {
        let mut written = 0;
        let mut count = 0;
        while self.unread > 0 {
            let idx = self.oldest_unread();
            let entry = &self.entries[idx];
            let mut line: String<{ MESSAGE_CAP + 32 }> = String::new();
            // An Err here means the line buffer filled; emit the prefix.
            let _ = write!(
                line,
                "[{:6}.{:06}] {:5} {}\n",
                entry.timestamp_us / 1_000_000,
                entry.timestamp_us % 1_000_000,
                entry.level.label(),
                entry.text
            );
            let bytes = line.as_bytes();
            if written + bytes.len() > out.len() {
                break;
            }
            out[written..written + bytes.len()].copy_from_slice(bytes);
            written += bytes.len();
            count += 1;
            self.unread -= 1;
        }
        (written, count)
    }

    /// Writes every unread record to `sink` and marks them read. Used by
    /// the panic path with the console as the sink.
    pub fn flush_unread(&mut self, sink: &mut dyn fmt::Write) {
        while self.unread > 0 {
            let idx = self.oldest_unread();
            let entry = &self.entries[idx];
            let _ = writeln!(
                sink,
                "[{:6}.{:06}] {:5} {}",
                entry.timestamp_us / 1_000_000,
                entry.timestamp_us % 1_000_000,
                entry.level.label(),
                entry.text
            );
            self.unread -= 1;
        }
    }
}

impl Default for Ring {
    fn default() -> Self {
        Self::new()
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        // Single-threaded access discipline: the kernel only logs from
        // trap context with IRQs masked, so a plain static is fine.
        static mut KLOG: Ring = Ring::new();

        /// Runs `body` against the global ring.
        pub fn with_klog<R>(body: impl FnOnce(&mut Ring) -> R) -> R {
            // Safety: single-threaded kernel, non-reentrant by
            // construction (see module docs).
            body(unsafe { &mut *core::ptr::addr_of_mut!(KLOG) })
        }
    } else {
        // Host tests run in parallel threads; give them a real lock.
        static KLOG: std::sync::Mutex<Ring> = std::sync::Mutex::new(Ring::new());

        pub fn with_klog<R>(body: impl FnOnce(&mut Ring) -> R) -> R {
            body(&mut KLOG.lock().unwrap())
        }
    }
}

/// Appends a record to the configured destinations. This is the target of
/// the `klog_*!` macros; call those instead.
pub fn record(level: Level, args: fmt::Arguments<'_>) {
    let now = u64::from(crate::time::now());
    with_klog(|k| {
        if !k.enabled(level) {
            return;
        }
        if k.destinations().contains(Dest::CONSOLE) {
            let mut console = crate::arch::Console;
            let _ = write!(
                console,
                "[{:6}.{:06}] {:5} ",
                now / 1_000_000,
                now % 1_000_000,
                level.label()
            );
            let _ = console.write_fmt(args);
            let _ = console.write_str("\r\n");
        }
        if k.destinations().contains(Dest::MEMORY) {
            k.push(now, level, args);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_str(ring: &mut Ring, s: &str) {
        ring.push(42, Level::Info, format_args!("{s}"));
    }

    #[test]
    fn push_and_drain_in_order() {
        let mut ring = Ring::new();
        push_str(&mut ring, "first");
        push_str(&mut ring, "second");
        assert_eq!(ring.unread_count(), 2);

        let mut buf = [0u8; 256];
        let (bytes, entries) = ring.drain_formatted(&mut buf);
        assert_eq!(entries, 2);
        let text = core::str::from_utf8(&buf[..bytes]).unwrap();
        let first = text.find("first").unwrap();
        let second = text.find("second").unwrap();
        assert!(first < second);
        assert_eq!(ring.unread_count(), 0);
    }

    #[test]
    fn drain_stops_at_buffer_boundary() {
        let mut ring = Ring::new();
        push_str(&mut ring, "aaaaaaaaaaaaaaaaaaaa");
        push_str(&mut ring, "bbbbbbbbbbbbbbbbbbbb");

        // Room for roughly one formatted line only.
        let mut buf = [0u8; 48];
        let (bytes, entries) = ring.drain_formatted(&mut buf);
        assert_eq!(entries, 1);
        assert!(bytes <= buf.len());
        assert_eq!(ring.unread_count(), 1);

        let mut buf2 = [0u8; 256];
        let (_, entries2) = ring.drain_formatted(&mut buf2);
        assert_eq!(entries2, 1);
    }

    #[test]
    fn overwrite_keeps_newest() {
        let mut ring = Ring::new();
        for i in 0..RING_ENTRIES + 5 {
            ring.push(0, Level::Info, format_args!("msg{i}"));
        }
        // Unread saturates at capacity; the oldest five were lost.
        assert_eq!(ring.unread_count(), RING_ENTRIES);
        let mut buf = vec![0u8; 64 * RING_ENTRIES];
        let (bytes, entries) = ring.drain_formatted(&mut buf);
        let text = core::str::from_utf8(&buf[..bytes]).unwrap();
        assert_eq!(entries, RING_ENTRIES);
        assert!(!text.contains("msg4\n"));
        assert!(text.contains("msg5\n"));
        assert!(text.contains(&format!("msg{}\n", RING_ENTRIES + 4)));
    }

    #[test]
    fn oversized_message_is_truncated_not_dropped() {
        let mut ring = Ring::new();
        let long = "x".repeat(MESSAGE_CAP * 2);
        ring.push(0, Level::Error, format_args!("{long}"));
        assert_eq!(ring.entries[0].text.len(), MESSAGE_CAP);
    }

    #[test]
    fn level_filter() {
        let ring = Ring::new();
        assert!(ring.enabled(Level::Error));
        assert!(ring.enabled(Level::Info));
        assert_eq!(ring.enabled(Level::Debug), cfg!(feature = "klog-debug"));
    }

    #[test]
    fn flush_unread_empties_ring() {
        let mut ring = Ring::new();
        push_str(&mut ring, "going down");
        let mut out = std::string::String::new();
        ring.flush_unread(&mut out);
        assert!(out.contains("going down"));
        assert_eq!(ring.unread_count(), 0);
    }
}
