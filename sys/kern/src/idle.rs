// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Idle CPU accounting.
//!
//! One task is designated the idle task (registered once through
//! `SetupIdleTask`); the scheduler tells us when it starts and stops
//! running. We accumulate idle microseconds into a sliding measurement
//! window and recompute the rolling percentage whenever a window
//! elapses. The numbers land in a user-shared [`IdleStats`] struct so
//! the display task can render them without a syscall.
//!
//! All entry points run from the scheduler, single-threadedly, so the
//! shared struct needs no locking.

use abi::{IdleStats, Tid, IDLE_STATS_WINDOW_MS};

use crate::time::Timestamp;
use crate::umem::USlice;

#[derive(Default)]
pub struct IdleAccount {
    idle_task: Option<Tid>,
    stats: Option<USlice<IdleStats>>,
    running: bool,
}

impl IdleAccount {
    pub fn is_idle_task(&self, tid: Tid) -> bool {
        self.idle_task == Some(tid)
    }

    /// Registers `tid` as the idle task with `stats` as the shared
    /// output area, and initializes the stats for a fresh boot.
    pub fn setup(&mut self, tid: Tid, stats: USlice<IdleStats>) {
        self.idle_task = Some(tid);
        self.stats = if stats.is_empty() { None } else { Some(stats) };
        self.update(
            |s, _| {
                *s = IdleStats {
                    measurement_window_us: IDLE_STATS_WINDOW_MS * 1000,
                    display_enabled: 1,
                    ..IdleStats::default()
                };
            },
            Timestamp::from(0),
        );
    }

    /// Scheduler hook: the idle task is being dispatched.
    pub fn start_accounting(&mut self, now: Timestamp) {
        if self.running {
            return;
        }
        self.running = true;
        self.update(|s, _| s.last_idle_start_time = u64::from(now), now);
    }

    /// Scheduler hook: the idle task is being descheduled.
    pub fn stop_accounting(&mut self, now: Timestamp) {
        if !self.running {
            return;
        }
        self.running = false;
        self.update(
            |s, now_us| {
                s.idle_time_in_window +=
                    now_us.saturating_sub(s.last_idle_start_time)
            },
            now,
        );
        self.update_percentage(now);
    }

    fn update_percentage(&mut self, now: Timestamp) {
        self.update(
            |s, now_us| {
                if s.is_measuring == 0 {
                    s.last_measurement_time = now_us;
                    s.idle_time_in_window = 0;
                    s.is_measuring = 1;
                    return;
                }
                let elapsed = now_us.saturating_sub(s.last_measurement_time);
                if elapsed >= s.measurement_window_us && elapsed > 0 {
                    s.idle_percentage =
                        ((s.idle_time_in_window * 100) / elapsed) as u32;
                    s.last_measurement_time = now_us;
                    s.idle_time_in_window = 0;
                }
            },
            now,
        );
    }

    /// Flips the display flag; returns the new value (1/0), or an error
    /// marker if stats were never registered.
    pub fn toggle_display(&mut self) -> Option<i64> {
        if self.stats.is_none() {
            return None;
        }
        let mut result = 0;
        let now = crate::time::now();
        self.update(
            |s, _| {
                s.display_enabled = u8::from(s.display_enabled == 0);
                result = i64::from(s.display_enabled);
            },
            now,
        );
        Some(result)
    }

    fn update(
        &mut self,
        body: impl FnOnce(&mut IdleStats, u64),
        now: Timestamp,
    ) {
        if let Some(slice) = &mut self.stats {
            // Safety: the stats area was registered by the idle task as
            // shared output, and idle accounting runs only from the
            // scheduler, so nothing else writes it concurrently.
            let s = unsafe { &mut slice.assume_writable()[0] };
            body(s, u64::from(now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_slice(cell: &mut IdleStats) -> USlice<IdleStats> {
        USlice::from_raw(cell as *mut IdleStats as usize, 1).unwrap()
    }

    #[test]
    fn setup_primes_the_window() {
        let mut cell = IdleStats::default();
        let mut acct = IdleAccount::default();
        acct.setup(Tid(3), stats_slice(&mut cell));

        assert!(acct.is_idle_task(Tid(3)));
        assert!(!acct.is_idle_task(Tid(4)));
        assert_eq!(cell.measurement_window_us, 1_000_000);
        assert_eq!(cell.display_enabled, 1);
        assert_eq!(cell.idle_percentage, 0);
    }

    #[test]
    fn percentage_rolls_over_after_a_full_window() {
        let mut cell = IdleStats::default();
        let mut acct = IdleAccount::default();
        acct.setup(Tid(3), stats_slice(&mut cell));

        // First stop opens the measurement window.
        acct.start_accounting(Timestamp::from(0));
        acct.stop_accounting(Timestamp::from(0));
        assert_eq!(cell.is_measuring, 1);

        // Idle for 250ms of the next full second.
        acct.start_accounting(Timestamp::from(100_000));
        acct.stop_accounting(Timestamp::from(350_000));
        // Window not yet elapsed; percentage unchanged.
        assert_eq!(cell.idle_percentage, 0);

        acct.start_accounting(Timestamp::from(900_000));
        acct.stop_accounting(Timestamp::from(1_100_000));
        // 250_000 + 200_000 idle over ~1.1s elapsed = ~40%.
        assert!(cell.idle_percentage >= 40 && cell.idle_percentage <= 42);
        // Window reset.
        assert_eq!(cell.idle_time_in_window, 0);
    }

    #[test]
    fn double_start_and_stop_are_harmless() {
        let mut cell = IdleStats::default();
        let mut acct = IdleAccount::default();
        acct.setup(Tid(2), stats_slice(&mut cell));

        acct.start_accounting(Timestamp::from(10));
        acct.start_accounting(Timestamp::from(20));
        assert_eq!(cell.last_idle_start_time, 10);
        acct.stop_accounting(Timestamp::from(30));
        acct.stop_accounting(Timestamp::from(40));
        // Second stop is a no-op; only 20us accumulated... and then
        // cleared when the first window opened.
        assert_eq!(cell.is_measuring, 1);
    }

    #[test]
    fn toggle_display_flips_and_reports() {
        let mut acct = IdleAccount::default();
        assert_eq!(acct.toggle_display(), None);

        let mut cell = IdleStats::default();
        acct.setup(Tid(2), stats_slice(&mut cell));
        assert_eq!(acct.toggle_display(), Some(0));
        assert_eq!(cell.display_enabled, 0);
        assert_eq!(acct.toggle_display(), Some(1));
        assert_eq!(cell.display_enabled, 1);
    }
}
