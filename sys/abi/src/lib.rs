// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel and applications.

#![no_std]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of task slots in the task table. Slot 0 is reserved so that a
/// TID of zero can mean "no task" (e.g. the first task's parent).
pub const MAX_TASKS: usize = 64;

/// Number of scheduler priority levels. Priority 0 is the most important.
pub const MAX_PRIORITIES: usize = 32;

/// Size of each task's stack, carved out of the contiguous stack slab at
/// a fixed per-slot offset.
pub const TASK_STACK_SIZE: usize = 64 * 1024;

/// Length of the idle-accounting measurement window, in milliseconds.
pub const IDLE_STATS_WINDOW_MS: u64 = 1000;

/// Names a task.
///
/// A `Tid` is a positive integer that doubles as the task's slot index in
/// the task table. Zero is reserved and never names a live task; it shows
/// up on the wire as "no parent" from `MyParentTid`. Freed TIDs are
/// reused, but only after the previous occupant has been fully destroyed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct Tid(pub u16);

impl Tid {
    /// Fabricates a `Tid` from a table slot index.
    ///
    /// Slot 0 is reserved; asking for it is a caller bug.
    pub fn from_index(index: usize) -> Self {
        assert!(index != 0 && index < MAX_TASKS);
        Tid(index as u16)
    }

    /// Returns the table slot this TID names.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Checks whether this value could ever name a task: nonzero and in
    /// range. Says nothing about whether the slot is currently live.
    pub fn is_plausible(self) -> bool {
        self.0 != 0 && self.index() < MAX_TASKS
    }
}

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so priority 0 is dispatched first.
///
/// This type *deliberately* does not implement `PartialOrd`/`Ord`, to
/// keep us from confusing ourselves on whether `>` means numerically
/// greater / less important, or more important / numerically smaller.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }

    /// Checks whether this is a legal priority level.
    pub fn is_valid(self) -> bool {
        usize::from(self.0) < MAX_PRIORITIES
    }

    /// Returns the ready-queue level for this priority.
    pub fn level(self) -> usize {
        usize::from(self.0)
    }
}

/// Task lifecycle state, used to make scheduling decisions.
///
/// The `Blocked` variant carries the reason, which determines who may
/// later unblock the task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    /// Linked into its priority's ready queue, waiting for dispatch.
    Ready,
    /// Currently running (or about to run); linked into no queue.
    Active,
    /// On the blocked list for the given reason.
    Blocked(BlockReason),
    /// Slot is dead; may be reallocated.
    Terminated,
}

impl TaskState {
    /// Checks whether a task in this state is waiting in `Receive` and
    /// can accept a directly-delivered message.
    pub fn can_receive(&self) -> bool {
        matches!(self, TaskState::Blocked(BlockReason::IpcReceive))
    }

    /// Checks whether a task in this state is waiting for a `Reply`.
    pub fn is_reply_blocked(&self) -> bool {
        matches!(self, TaskState::Blocked(BlockReason::IpcReply))
    }

    /// Checks whether the task holds a slot in the run set (ready or
    /// active) as opposed to being blocked or dead.
    pub fn is_runnable(&self) -> bool {
        matches!(self, TaskState::Ready | TaskState::Active)
    }
}

impl Default for TaskState {
    fn default() -> Self {
        TaskState::Terminated
    }
}

/// Why a blocked task is blocked.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlockReason {
    /// Waiting for a timer (kept for parity with the block-reason set in
    /// the wire protocol; no current syscall produces it).
    Timer,
    /// `Receive` with an empty sender queue.
    IpcReceive,
    /// `Send` delivered or queued; waiting for the receiver's `Reply`.
    IpcReply,
    /// `WaitTid` on a live task.
    WaitTid,
    /// `AwaitEvent` on a valid event id.
    AwaitEvent,
}

impl BlockReason {
    pub fn name(self) -> &'static str {
        match self {
            BlockReason::Timer => "TIMER",
            BlockReason::IpcReceive => "IPC_RECEIVE",
            BlockReason::IpcReply => "IPC_REPLY",
            BlockReason::WaitTid => "WAIT_TID",
            BlockReason::AwaitEvent => "AWAIT_EVENT",
        }
    }
}

/// Enumeration of syscall numbers.
///
/// The numbering is dense from 1 and part of the user ABI; the dispatcher
/// rejects anything it can't convert.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u64)]
pub enum Sysnum {
    Create = 1,
    MyTid = 2,
    MyParentTid = 3,
    Yield = 4,
    Exit = 5,
    Send = 6,
    Receive = 7,
    Reply = 8,
    Klog = 9,
    Panic = 10,
    WaitTid = 11,
    AwaitEvent = 12,
    SetupIdleTask = 13,
    GetUnreadKlogs = 14,
    GetTaskInfo = 15,
    ReceiveNonBlock = 16,
    Reboot = 17,
    Kill = 18,
    ToggleIdleDisplay = 19,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't currently depend on
/// `num-traits` and this seems okay.
impl core::convert::TryFrom<u64> for Sysnum {
    type Error = ();

    fn try_from(x: u64) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::Create),
            2 => Ok(Self::MyTid),
            3 => Ok(Self::MyParentTid),
            4 => Ok(Self::Yield),
            5 => Ok(Self::Exit),
            6 => Ok(Self::Send),
            7 => Ok(Self::Receive),
            8 => Ok(Self::Reply),
            9 => Ok(Self::Klog),
            10 => Ok(Self::Panic),
            11 => Ok(Self::WaitTid),
            12 => Ok(Self::AwaitEvent),
            13 => Ok(Self::SetupIdleTask),
            14 => Ok(Self::GetUnreadKlogs),
            15 => Ok(Self::GetTaskInfo),
            16 => Ok(Self::ReceiveNonBlock),
            17 => Ok(Self::Reboot),
            18 => Ok(Self::Kill),
            19 => Ok(Self::ToggleIdleDisplay),
            _ => Err(()),
        }
    }
}

/// IRQ-derived events a task can wait for with `AwaitEvent`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u64)]
pub enum EventId {
    /// Periodic system-timer tick; payload is the monotonic tick count.
    TimerTick = 1,
    /// Console/peripheral UART receive; payload identifies the line.
    UartRx = 2,
    /// UART transmit ready.
    UartTx = 3,
    /// UART modem status change (CTS edges).
    UartModem = 4,
}

impl EventId {
    pub fn name(self) -> &'static str {
        match self {
            EventId::TimerTick => "TIMER_TICK",
            EventId::UartRx => "UART_RX",
            EventId::UartTx => "UART_TX",
            EventId::UartModem => "UART_MS",
        }
    }
}

impl core::convert::TryFrom<u64> for EventId {
    type Error = ();

    fn try_from(x: u64) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::TimerTick),
            2 => Ok(Self::UartRx),
            3 => Ok(Self::UartTx),
            4 => Ok(Self::UartModem),
            _ => Err(()),
        }
    }
}

/// Kernel log severity. Lower numbers are more severe.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum KlogLevel {
    Panic = 1,
    Error = 2,
    Warning = 3,
    Info = 4,
    Debug = 5,
}

impl KlogLevel {
    pub fn label(self) -> &'static str {
        match self {
            KlogLevel::Panic => "PANIC",
            KlogLevel::Error => "ERROR",
            KlogLevel::Warning => "WARN",
            KlogLevel::Info => "INFO",
            KlogLevel::Debug => "DEBUG",
        }
    }
}

impl core::convert::TryFrom<u64> for KlogLevel {
    type Error = ();

    fn try_from(x: u64) -> Result<Self, ()> {
        match x {
            1 => Ok(Self::Panic),
            2 => Ok(Self::Error),
            3 => Ok(Self::Warning),
            4 => Ok(Self::Info),
            5 => Ok(Self::Debug),
            _ => Err(()),
        }
    }
}

bitflags::bitflags! {
    /// Where kernel log records go. Both bits may be set.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct KlogDest: u32 {
        /// Write records straight to the console UART, blocking.
        const CONSOLE = 1 << 0;
        /// Append records to the in-memory ring buffer.
        const MEMORY = 1 << 1;
    }
}

/// Idle-accounting state shared between the kernel and the task that
/// displays it.
///
/// The kernel writes this through a task-supplied pointer registered via
/// `SetupIdleTask`; no locking is required because idle start/stop happen
/// only inside the scheduler, which runs single-threadedly. The flag
/// fields are bytes rather than `bool` so every bit pattern is valid and
/// the struct can be (re)validated as plain bytes.
#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct IdleStats {
    /// Monotonic microsecond timestamp at which the idle task last
    /// started running.
    pub last_idle_start_time: u64,
    /// Timestamp at which the current measurement window opened.
    pub last_measurement_time: u64,
    /// Accumulated idle time inside the current window, in microseconds.
    pub idle_time_in_window: u64,
    /// Window length in microseconds.
    pub measurement_window_us: u64,
    /// Rolling idle percentage from the most recent completed window.
    pub idle_percentage: u32,
    /// Nonzero once the first window has opened.
    pub is_measuring: u8,
    /// Nonzero if the owning task should render the percentage.
    pub display_enabled: u8,
    pub _pad: [u8; 2],
}
