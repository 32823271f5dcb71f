// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.

use core::fmt::Write;

use abi::{
    BlockReason, EventId, Priority, TaskState, Tid, MAX_TASKS,
    TASK_STACK_SIZE,
};

use crate::err::SyscallError;
use crate::umem::USlice;

/// Internal representation of a task.
///
/// The fields of this struct are private to this module so that we can
/// maintain some task invariants, chiefly that state transitions go
/// through [`Task::set_state`] and that the IPC scratch slots are only
/// meaningful while the task is blocked for the matching reason.
pub struct Task {
    /// Saved machine state of the user program.
    save: crate::arch::SavedState,
    /// This task's name; equal to its slot index while live.
    tid: Tid,
    /// TID of the task that created this one. `None` for the first task.
    /// Set at Create and never mutated, which is what makes the Kill
    /// child-walk cycle-free.
    parent: Option<Tid>,
    /// Scheduling priority, fixed at creation.
    priority: Priority,
    state: TaskState,
    /// Target of an in-progress WaitTid.
    wait_for: Option<Tid>,
    /// Event an AwaitEvent caller is parked on.
    event: Option<EventId>,
    /// IPC scratch slots; see [`IpcSlots`].
    ipc: IpcSlots,
    stack_base: usize,
    stack_size: usize,
    entry_point: usize,
}

/// Per-task IPC scratch state.
///
/// Ownership rule: a blocked task owns its slots until it is unblocked;
/// the unblocker reads them under the guarantee that the blocked task is
/// not running. The kernel clears slots when their phase completes.
#[derive(Debug)]
pub struct IpcSlots {
    /// Outgoing message, valid from Send until a receiver consumes it.
    pub send: USlice<u8>,
    /// Where the eventual Reply lands, valid from Send until Reply.
    pub reply_buf: USlice<u8>,
    /// Receive buffer, valid while blocked in Receive.
    pub recv_buf: USlice<u8>,
    /// The sender-TID out-pointer the receiver is waiting to have
    /// filled. Held as four raw bytes so no alignment demand leaks into
    /// an operation the syscall table gives no error surface.
    pub recv_tid_out: USlice<u8>,
}

impl IpcSlots {
    fn clear_send(&mut self) {
        self.send = USlice::empty();
        self.reply_buf = USlice::empty();
    }

    fn clear_recv(&mut self) {
        self.recv_buf = USlice::empty();
        self.recv_tid_out = USlice::empty();
    }
}

impl Default for IpcSlots {
    fn default() -> Self {
        IpcSlots {
            send: USlice::empty(),
            reply_buf: USlice::empty(),
            recv_buf: USlice::empty(),
            recv_tid_out: USlice::empty(),
        }
    }
}

impl Task {
    fn vacant(index: usize) -> Self {
        Task {
            save: Default::default(),
            tid: Tid(index as u16),
            parent: None,
            priority: Priority(0),
            state: TaskState::Terminated,
            wait_for: None,
            event: None,
            ipc: IpcSlots::default(),
            stack_base: 0,
            stack_size: 0,
            entry_point: 0,
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn parent(&self) -> Option<Tid> {
        self.parent
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Alters this task's lifecycle state.
    ///
    /// This is a dumb setter; the scheduler is responsible for keeping
    /// queue membership consistent with the state it sets.
    pub fn set_state(&mut self, state: TaskState) {
        klog_debug!(
            "task {} state change: {:?} -> {:?}",
            self.tid.0,
            self.state,
            state
        );
        self.state = state;
    }

    pub fn wait_for(&self) -> Option<Tid> {
        self.wait_for
    }

    pub fn set_wait_for(&mut self, t: Option<Tid>) {
        self.wait_for = t;
    }

    pub fn event(&self) -> Option<EventId> {
        self.event
    }

    pub fn set_event(&mut self, e: Option<EventId>) {
        self.event = e;
    }

    pub fn ipc(&self) -> &IpcSlots {
        &self.ipc
    }

    pub fn ipc_mut(&mut self) -> &mut IpcSlots {
        &mut self.ipc
    }

    pub fn stack_base(&self) -> usize {
        self.stack_base
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn entry_point(&self) -> usize {
        self.entry_point
    }

    /// Returns a reference to the saved machine state for the task.
    pub fn save(&self) -> &crate::arch::SavedState {
        &self.save
    }

    /// Returns a mutable reference to the saved machine state for the
    /// task.
    pub fn save_mut(&mut self) -> &mut crate::arch::SavedState {
        &mut self.save
    }

    /// Writes the syscall result register in the saved frame. For a
    /// blocked task this is how the unblocker delivers the return value
    /// the task will observe when its context is restored.
    pub fn set_syscall_result(&mut self, v: i64) {
        self.save.set_result(v as u64);
    }
}

/// Interface that must be implemented by the `arch::SavedState` type.
/// This gives architecture-independent access to the saved frame for the
/// rest of the kernel. The syscall convention: number in the descriptor
/// register, up to six arguments, one result slot.
pub trait ArchState: Default {
    /// Reads syscall argument register `n` (0..=5).
    fn arg(&self, n: usize) -> u64;

    /// Reads the syscall number register.
    fn syscall_descriptor(&self) -> u64;

    /// Writes the syscall result register.
    fn set_result(&mut self, v: u64);
}

/// Fixed task table plus the TID and stack-slot allocators.
///
/// TIDs are slot indices; slot 0 is reserved so 0 can mean "no task."
/// A slot's TID and its stack carve-out allocate and free together.
pub struct TaskTable {
    tasks: [Task; MAX_TASKS],
    used: [bool; MAX_TASKS],
    stack_used: [bool; MAX_TASKS],
}

impl TaskTable {
    pub fn new() -> Self {
        TaskTable {
            tasks: core::array::from_fn(Task::vacant),
            used: [false; MAX_TASKS],
            stack_used: [false; MAX_TASKS],
        }
    }

    /// Looks up a live task.
    pub fn get(&self, tid: Tid) -> Option<&Task> {
        if tid.is_plausible() && self.used[tid.index()] {
            Some(&self.tasks[tid.index()])
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut Task> {
        if tid.is_plausible() && self.used[tid.index()] {
            Some(&mut self.tasks[tid.index()])
        } else {
            None
        }
    }

    /// Checks whether `tid` names a live task.
    pub fn is_live(&self, tid: Tid) -> bool {
        tid.is_plausible() && self.used[tid.index()]
    }

    /// Allocates a slot and builds a task in it, ready to be handed to
    /// the scheduler. The initial register frame is set up so that
    /// returning to user mode lands at `entry_point` with SP at the top
    /// of the task's stack.
    pub fn create(
        &mut self,
        parent: Option<Tid>,
        priority: Priority,
        entry_point: usize,
    ) -> Result<Tid, SyscallError> {
        uassert!(priority.is_valid());

        // TIDs allocate linearly from 1 up; freed slots are reused.
        let index = (1..MAX_TASKS)
            .find(|&i| !self.used[i])
            .ok_or(SyscallError::NoFreeSlot)?;

        self.used[index] = true;
        // The stack slot travels with the TID slot. Finding it taken
        // while the TID was free means a destroy went missing.
        uassert!(!self.stack_used[index]);
        self.stack_used[index] = true;

        let stack_base =
            crate::arch::stack_slab_base() + index * TASK_STACK_SIZE;

        let task = &mut self.tasks[index];
        *task = Task {
            save: Default::default(),
            tid: Tid::from_index(index),
            parent,
            priority,
            state: TaskState::Ready,
            wait_for: None,
            event: None,
            ipc: IpcSlots::default(),
            stack_base,
            stack_size: TASK_STACK_SIZE,
            entry_point,
        };
        crate::arch::reinitialize(task);

        klog_debug!(
            "created task {} (priority {}) entry {:#x}",
            index,
            priority.0,
            entry_point
        );
        Ok(task.tid)
    }

    /// Releases a slot after the scheduler has unlinked the task. The
    /// TID may be handed out again by the next `create`.
    pub fn destroy(&mut self, tid: Tid) {
        uassert!(self.is_live(tid));
        let index = tid.index();
        uassert!(self.stack_used[index]);
        self.used[index] = false;
        self.stack_used[index] = false;

        let task = &mut self.tasks[index];
        task.state = TaskState::Terminated;
        task.parent = None;
        task.wait_for = None;
        task.event = None;
        task.ipc = IpcSlots::default();

        klog_debug!("destroyed task {}", index);
    }

    pub fn live_count(&self) -> usize {
        self.used.iter().filter(|&&u| u).count()
    }

    /// Iterates live tasks in slot order.
    pub fn iter_live(&self) -> impl Iterator<Item = &Task> {
        self.tasks
            .iter()
            .zip(self.used.iter())
            .filter_map(|(t, &u)| if u { Some(t) } else { None })
    }

    /// Direct access for the scheduler and IPC engine, which operate on
    /// indices they have already validated.
    pub fn task(&self, tid: Tid) -> &Task {
        uassert!(self.is_live(tid));
        &self.tasks[tid.index()]
    }

    pub fn task_mut(&mut self, tid: Tid) -> &mut Task {
        uassert!(self.is_live(tid));
        &mut self.tasks[tid.index()]
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

/// IPC completion helpers. These are the two "finish" halves of the
/// rendezvous: the unblocker writes the result and clears the scratch
/// slots of the task it is waking.
impl Task {
    /// Completes this task's Send: its reply has arrived (or its receiver
    /// has consumed the message and replied). `reply_source_len` is the
    /// *source* length of the reply so truncation is detectable.
    pub fn finish_send(&mut self, reply_source_len: usize) {
        self.ipc.clear_send();
        self.set_syscall_result(reply_source_len as i64);
    }

    /// Completes this task's blocked Receive: a message has been copied
    /// into its buffer. `msg_source_len` is the *source* length of the
    /// message.
    pub fn finish_receive(&mut self, msg_source_len: usize) {
        self.ipc.clear_recv();
        self.set_syscall_result(msg_source_len as i64);
    }
}

/// Formats the task table into `buf` for `GetTaskInfo`: best-effort,
/// truncates by failing, returns bytes written.
pub fn format_task_info(
    tasks: &TaskTable,
    current: Option<Tid>,
    buf: &mut [u8],
) -> Result<usize, SyscallError> {
    let mut w = TruncatingWriter { buf, written: 0 };

    let r = write!(
        w,
        "=== TASK TABLE DUMP ===\nCurrent Task: {}\n",
        current.map(|t| i64::from(t.0)).unwrap_or(-1)
    );
    if r.is_err() {
        return Err(SyscallError::FormatOverflow);
    }

    for task in tasks.iter_live() {
        let r = match task.state() {
            TaskState::Blocked(BlockReason::AwaitEvent) => write!(
                w,
                "Task {}: state=BLOCKED, priority={}, entry_point={:#x}, parent_tid={}, block_reason=AWAIT_EVENT, awaiting_event={}\n",
                task.tid().0,
                task.priority().0,
                task.entry_point(),
                task.parent().map(|t| t.0).unwrap_or(0),
                task.event().map(|e| e.name()).unwrap_or("NONE"),
            ),
            TaskState::Blocked(BlockReason::WaitTid) => write!(
                w,
                "Task {}: state=BLOCKED, priority={}, entry_point={:#x}, parent_tid={}, block_reason=WAIT_TID, wait_tid={}\n",
                task.tid().0,
                task.priority().0,
                task.entry_point(),
                task.parent().map(|t| t.0).unwrap_or(0),
                task.wait_for().map(|t| t.0).unwrap_or(0),
            ),
            TaskState::Blocked(reason) => write!(
                w,
                "Task {}: state=BLOCKED, priority={}, entry_point={:#x}, parent_tid={}, block_reason={}\n",
                task.tid().0,
                task.priority().0,
                task.entry_point(),
                task.parent().map(|t| t.0).unwrap_or(0),
                reason.name(),
            ),
            state => write!(
                w,
                "Task {}: state={:?}, priority={}, entry_point={:#x}, parent_tid={}\n",
                task.tid().0,
                state,
                task.priority().0,
                task.entry_point(),
                task.parent().map(|t| t.0).unwrap_or(0),
            ),
        };
        if r.is_err() {
            return Err(SyscallError::FormatOverflow);
        }
    }

    Ok(w.written)
}

/// `fmt::Write` over a byte buffer that reports failure instead of
/// silently truncating, so the formatter above can bail like the
/// original's `snprintf` overflow check.
struct TruncatingWriter<'a> {
    buf: &'a mut [u8],
    written: usize,
}

impl Write for TruncatingWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        if self.written + bytes.len() > self.buf.len() {
            return Err(core::fmt::Error);
        }
        self.buf[self.written..self.written + bytes.len()]
            .copy_from_slice(bytes);
        self.written += bytes.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tids_allocate_linearly_from_one() {
        let mut table = TaskTable::new();
        let a = table.create(None, Priority(1), 0x1000).unwrap();
        let b = table.create(Some(a), Priority(1), 0x2000).unwrap();
        assert_eq!(a, Tid(1));
        assert_eq!(b, Tid(2));
        assert_eq!(table.task(b).parent(), Some(a));
    }

    #[test]
    fn freed_tid_is_reused() {
        let mut table = TaskTable::new();
        let a = table.create(None, Priority(1), 0x1000).unwrap();
        let _b = table.create(None, Priority(1), 0x2000).unwrap();
        table.destroy(a);
        assert!(!table.is_live(a));
        let c = table.create(None, Priority(2), 0x3000).unwrap();
        assert_eq!(c, a, "lowest free slot should be reused");
    }

    #[test]
    fn stack_slot_tracks_tid_slot() {
        let mut table = TaskTable::new();
        let a = table.create(None, Priority(1), 0x1000).unwrap();
        assert!(table.stack_used[a.index()]);
        assert_eq!(
            table.task(a).stack_base(),
            crate::arch::stack_slab_base() + a.index() * TASK_STACK_SIZE
        );
        table.destroy(a);
        assert!(!table.stack_used[a.index()]);
    }

    #[test]
    fn table_exhaustion_is_reported() {
        let mut table = TaskTable::new();
        for _ in 1..MAX_TASKS {
            table.create(None, Priority(0), 0x1000).unwrap();
        }
        assert_eq!(
            table.create(None, Priority(0), 0x1000),
            Err(SyscallError::NoFreeSlot)
        );
    }

    #[test]
    fn lookup_rejects_dead_and_reserved_tids() {
        let mut table = TaskTable::new();
        assert!(table.get(Tid(0)).is_none());
        assert!(table.get(Tid(5)).is_none());
        let a = table.create(None, Priority(1), 0x1000).unwrap();
        assert!(table.get(a).is_some());
        table.destroy(a);
        assert!(table.get(a).is_none());
    }

    #[test]
    fn task_info_truncates_by_failing() {
        let mut table = TaskTable::new();
        table.create(None, Priority(3), 0x1000).unwrap();

        let mut big = [0u8; 1024];
        let n = format_task_info(&table, Some(Tid(1)), &mut big).unwrap();
        let text = core::str::from_utf8(&big[..n]).unwrap();
        assert!(text.contains("TASK TABLE DUMP"));
        assert!(text.contains("Task 1:"));

        let mut tiny = [0u8; 8];
        assert_eq!(
            format_task_info(&table, None, &mut tiny),
            Err(SyscallError::FormatOverflow)
        );
    }
}
