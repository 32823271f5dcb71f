// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! User tasks see exactly one error surface: small negative integers in
//! the syscall result register. Everything the kernel can't express that
//! way -- violated invariants, inconsistent queues, an empty ready set --
//! is a kernel bug and panics instead of returning.

/// An error committed by user code when invoking a syscall.
///
/// Each variant knows its wire code; the dispatcher folds the code into
/// the caller's saved result register. Several variants share a code
/// (deliberately -- the per-syscall tables disambiguate), so the enum
/// rather than the raw integer is what handler code traffics in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyscallError {
    /// Create: priority out of range.
    InvalidPriority,
    /// Create: no free task slot.
    NoFreeSlot,
    /// Send/Reply/WaitTid/Kill: TID does not name a live task.
    BadTid,
    /// Reply: target is not blocked waiting for a reply.
    NotReplyBlocked,
    /// ReceiveNonBlock: sender queue is empty.
    NoSender,
    /// WaitTid: a task cannot wait for itself.
    SelfWait,
    /// Kill: a task cannot kill itself.
    SelfKill,
    /// AwaitEvent: event id out of range.
    BadEvent,
    /// Malformed slice argument (wraps the address space or is
    /// misaligned for its type), or ToggleIdleDisplay before any stats
    /// were registered.
    BadArgument,
    /// GetTaskInfo: output did not fit the caller's buffer.
    FormatOverflow,
    /// Syscall number not in the dispatch table.
    BadSyscallNumber,
}

impl SyscallError {
    /// The value user code observes in the result register.
    pub fn code(self) -> i64 {
        match self {
            SyscallError::InvalidPriority => -1,
            SyscallError::NoFreeSlot => -2,
            SyscallError::BadTid => -1,
            SyscallError::NotReplyBlocked => -2,
            SyscallError::NoSender => -1,
            SyscallError::SelfWait => -2,
            SyscallError::SelfKill => -2,
            SyscallError::BadEvent => -1,
            SyscallError::BadArgument => -1,
            SyscallError::FormatOverflow => -2,
            SyscallError::BadSyscallNumber => -1,
        }
    }
}
