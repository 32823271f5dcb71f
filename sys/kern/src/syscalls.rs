// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall implementation.
//!
//! The arch trap path saves the caller's frame into its task record and
//! calls [`handle`]. Decoding turns the saved argument registers into a
//! [`SyscallRequest`] -- one variant per syscall, typed arguments -- and
//! the dispatcher matches it exhaustively, so adding a syscall without
//! handling it doesn't compile.
//!
//! Handlers return `Result<SyscallReturn, SyscallError>`. The split in
//! [`SyscallReturn`] is load-bearing: `Value` is written into the
//! caller's saved result register immediately, while `Deferred` means
//! the caller blocked (or exited) and whoever unblocks it writes the
//! result then. Blocking syscalls must never write the result register
//! at call time.
//!
//! After `handle` returns, the entry path always runs the scheduler, so
//! every syscall is a potential rotation point within the caller's
//! priority level.

use core::convert::TryFrom;

use abi::{KlogLevel, Priority, Sysnum, Tid, MAX_TASKS};

use crate::err::SyscallError;
use crate::kernel::Kernel;
use crate::task::ArchState;
use crate::umem::{self, USlice};

/// Outcome of a syscall handler.
#[derive(Debug, Eq, PartialEq)]
pub enum SyscallReturn {
    /// Result available now; the dispatcher writes it into the caller's
    /// saved frame.
    Value(i64),
    /// No result now: the caller blocked, exited, or (for Yield) simply
    /// has nothing to observe. The result register is left untouched.
    Deferred,
}

/// A trapped syscall, decoded.
#[derive(Debug)]
pub enum SyscallRequest {
    Create { priority: u64, entry_point: usize },
    MyTid,
    MyParentTid,
    Yield,
    Exit,
    Send { tid: Tid, msg: USlice<u8>, reply: USlice<u8> },
    Receive { tid_out: USlice<u8>, buf: USlice<u8> },
    ReceiveNonBlock { tid_out: USlice<u8>, buf: USlice<u8> },
    Reply { tid: Tid, msg: USlice<u8> },
    Klog { level: u64, msg_ptr: usize },
    Panic { msg_ptr: usize },
    WaitTid { tid: Tid },
    AwaitEvent { event: u64 },
    SetupIdleTask { stats_ptr: usize },
    GetUnreadKlogs { buf: USlice<u8>, count_out: USlice<u8> },
    GetTaskInfo { buf: USlice<u8> },
    Reboot,
    Kill { tid: Tid, kill_children: bool },
    ToggleIdleDisplay,
}

/// Maps a raw TID argument to a `Tid`, folding anything out of range
/// onto the reserved never-live slot 0 so handlers uniformly report
/// `BadTid`.
fn decode_tid(raw: u64) -> Tid {
    if raw == 0 || raw >= MAX_TASKS as u64 {
        Tid(0)
    } else {
        Tid(raw as u16)
    }
}

/// Byte-slice argument: base in one register, length in the next.
fn byte_slice(base: u64, len: u64) -> Result<USlice<u8>, SyscallError> {
    USlice::from_raw(base as usize, len as usize)
        .map_err(|()| SyscallError::BadArgument)
}

/// Out-pointer argument for a 32-bit value, as four raw bytes. A null
/// pointer decodes to an empty slice, which the writers skip.
fn out_u32(base: u64) -> Result<USlice<u8>, SyscallError> {
    if base == 0 {
        Ok(USlice::empty())
    } else {
        byte_slice(base, 4)
    }
}

impl SyscallRequest {
    /// Decodes the saved frame's syscall number and argument registers.
    pub fn decode(
        save: &crate::arch::SavedState,
    ) -> Result<Self, SyscallError> {
        let nr = save.syscall_descriptor();
        let sysnum = Sysnum::try_from(nr).map_err(|()| {
            klog_error!("unknown syscall number {:#x}", nr);
            SyscallError::BadSyscallNumber
        })?;

        Ok(match sysnum {
            Sysnum::Create => SyscallRequest::Create {
                priority: save.arg(0),
                entry_point: save.arg(1) as usize,
            },
            Sysnum::MyTid => SyscallRequest::MyTid,
            Sysnum::MyParentTid => SyscallRequest::MyParentTid,
            Sysnum::Yield => SyscallRequest::Yield,
            Sysnum::Exit => SyscallRequest::Exit,
            Sysnum::Send => SyscallRequest::Send {
                tid: decode_tid(save.arg(0)),
                msg: byte_slice(save.arg(1), save.arg(2))?,
                reply: byte_slice(save.arg(3), save.arg(4))?,
            },
            Sysnum::Receive => SyscallRequest::Receive {
                tid_out: out_u32(save.arg(0))?,
                buf: byte_slice(save.arg(1), save.arg(2))?,
            },
            Sysnum::ReceiveNonBlock => SyscallRequest::ReceiveNonBlock {
                tid_out: out_u32(save.arg(0))?,
                buf: byte_slice(save.arg(1), save.arg(2))?,
            },
            Sysnum::Reply => SyscallRequest::Reply {
                tid: decode_tid(save.arg(0)),
                msg: byte_slice(save.arg(1), save.arg(2))?,
            },
            Sysnum::Klog => SyscallRequest::Klog {
                level: save.arg(0),
                msg_ptr: save.arg(1) as usize,
            },
            Sysnum::Panic => SyscallRequest::Panic {
                msg_ptr: save.arg(0) as usize,
            },
            Sysnum::WaitTid => SyscallRequest::WaitTid {
                tid: decode_tid(save.arg(0)),
            },
            Sysnum::AwaitEvent => SyscallRequest::AwaitEvent {
                event: save.arg(0),
            },
            Sysnum::SetupIdleTask => SyscallRequest::SetupIdleTask {
                stats_ptr: save.arg(0) as usize,
            },
            Sysnum::GetUnreadKlogs => SyscallRequest::GetUnreadKlogs {
                buf: byte_slice(save.arg(0), save.arg(1))?,
                count_out: out_u32(save.arg(2))?,
            },
            Sysnum::GetTaskInfo => SyscallRequest::GetTaskInfo {
                buf: byte_slice(save.arg(0), save.arg(1))?,
            },
            Sysnum::Reboot => SyscallRequest::Reboot,
            Sysnum::Kill => SyscallRequest::Kill {
                tid: decode_tid(save.arg(0)),
                kill_children: save.arg(1) != 0,
            },
            Sysnum::ToggleIdleDisplay => SyscallRequest::ToggleIdleDisplay,
        })
    }
}

/// Entry point from the arch trap path, after the caller's registers
/// have been saved into its task record. Decodes, dispatches, and folds
/// the outcome into the caller's saved result register. The caller of
/// this function is responsible for running the scheduler afterwards.
pub fn handle(k: &mut Kernel, caller: Tid) {
    let outcome = SyscallRequest::decode(k.tasks.task(caller).save())
        .and_then(|req| dispatch(k, caller, req));

    // Kill with kill_children can take the caller down with the target's
    // subtree, so re-check liveness before touching its frame.
    match outcome {
        Ok(SyscallReturn::Value(v)) => {
            if k.tasks.is_live(caller) {
                k.tasks.task_mut(caller).set_syscall_result(v);
            }
        }
        Ok(SyscallReturn::Deferred) => (),
        Err(e) => {
            if k.tasks.is_live(caller) {
                k.tasks.task_mut(caller).set_syscall_result(e.code());
            }
        }
    }
}

fn dispatch(
    k: &mut Kernel,
    caller: Tid,
    req: SyscallRequest,
) -> Result<SyscallReturn, SyscallError> {
    use SyscallRequest as Req;
    use SyscallReturn::{Deferred, Value};

    match req {
        Req::Create {
            priority,
            entry_point,
        } => {
            if priority > u64::from(u8::MAX)
                || !Priority(priority as u8).is_valid()
            {
                klog_error!(
                    "[t:{}] create: invalid priority {}",
                    caller.0,
                    priority
                );
                return Err(SyscallError::InvalidPriority);
            }
            let tid = k.tasks.create(
                Some(caller),
                Priority(priority as u8),
                entry_point,
            )?;
            k.sched.add(&mut k.tasks, tid);
            Ok(Value(i64::from(tid.0)))
        }

        Req::MyTid => Ok(Value(i64::from(caller.0))),

        Req::MyParentTid => {
            let parent = k.tasks.task(caller).parent();
            Ok(Value(parent.map(|t| i64::from(t.0)).unwrap_or(0)))
        }

        Req::Yield => {
            klog_debug!("[t:{}] yield", caller.0);
            // Nothing to do: the post-syscall schedule pass rotates the
            // caller to the tail of its level. x0 is preserved.
            Ok(Deferred)
        }

        Req::Exit => {
            klog_debug!("[t:{}] exit", caller.0);
            k.destroy_task(caller);
            Ok(Deferred)
        }

        Req::Send { tid, msg, reply } => {
            crate::ipc::send(k, caller, tid, msg, reply)
        }

        Req::Receive { tid_out, buf } => {
            crate::ipc::receive(k, caller, tid_out, buf, false)
        }

        Req::ReceiveNonBlock { tid_out, buf } => {
            crate::ipc::receive(k, caller, tid_out, buf, true)
        }

        Req::Reply { tid, msg } => crate::ipc::reply(k, caller, tid, msg),

        Req::Klog { level, msg_ptr } => {
            let level = KlogLevel::try_from(level).unwrap_or_else(|()| {
                klog_warning!(
                    "[t:{}] klog with bad level {}, using INFO",
                    caller.0,
                    level
                );
                KlogLevel::Info
            });
            let mut buf = [0u8; 256];
            // Safety: user-supplied pointer; a bad one aborts, which is
            // the documented contract for user memory.
            let msg = unsafe { umem::read_cstr_bounded(msg_ptr, &mut buf) };
            klog_record!(level, "[t:{}] {}", caller.0, msg);
            Ok(Value(0))
        }

        Req::Panic { msg_ptr } => {
            let mut buf = [0u8; 256];
            // Safety: as for Klog.
            let msg = unsafe { umem::read_cstr_bounded(msg_ptr, &mut buf) };
            klog_error!("[t:{}] user panic triggered: {}", caller.0, msg);
            crate::fail::die(format_args!(
                "User-triggered panic: {msg}"
            ));
        }

        Req::WaitTid { tid } => {
            if tid == caller {
                klog_error!("[t:{}] wait_tid: cannot wait for self", caller.0);
                return Err(SyscallError::SelfWait);
            }
            if !k.tasks.is_live(tid) {
                return Err(SyscallError::BadTid);
            }
            k.tasks.task_mut(caller).set_wait_for(Some(tid));
            k.sched
                .block(&mut k.tasks, caller, abi::BlockReason::WaitTid);
            Ok(Deferred)
        }

        Req::AwaitEvent { event } => {
            crate::event::await_event(k, caller, event)
        }

        Req::SetupIdleTask { stats_ptr } => {
            let len = usize::from(stats_ptr != 0);
            let stats = USlice::from_raw(stats_ptr, len)
                .map_err(|()| SyscallError::BadArgument)?;
            k.idle.setup(caller, stats);
            Ok(Value(0))
        }

        Req::GetUnreadKlogs { buf, count_out } => {
            // Best-effort contract: a short or zero-length buffer just
            // receives fewer (or no) bytes.
            let mut buf = buf;
            // Safety: caller-owned output area; caller is Active.
            let out = unsafe { buf.assume_writable() };
            let (bytes, entries) =
                crate::klog::with_klog(|ring| ring.drain_formatted(out));
            let count_bytes = (entries as u32).to_le_bytes();
            if let Ok(src) =
                USlice::from_raw(count_bytes.as_ptr() as usize, 4)
            {
                let mut count_out = count_out;
                // Safety: 4-byte caller-owned out slot.
                unsafe {
                    umem::copy_truncated(&src, &mut count_out);
                }
            }
            Ok(Value(bytes as i64))
        }

        Req::GetTaskInfo { buf } => {
            let mut buf = buf;
            // Safety: caller-owned output area; caller is Active.
            let out = unsafe { buf.assume_writable() };
            let bytes = crate::task::format_task_info(
                &k.tasks,
                k.sched.current(),
                out,
            )?;
            Ok(Value(bytes as i64))
        }

        Req::Reboot => {
            klog_info!("[t:{}] system reboot requested", caller.0);
            crate::arch::reset();
        }

        Req::Kill { tid, kill_children } => {
            if tid == caller {
                klog_error!("[t:{}] kill: cannot kill self", caller.0);
                return Err(SyscallError::SelfKill);
            }
            if !k.tasks.is_live(tid) {
                return Err(SyscallError::BadTid);
            }
            if kill_children {
                kill_descendants(k, tid, 0);
            }
            // The caller may have been inside the target's subtree.
            if k.tasks.is_live(tid) {
                k.destroy_task(tid);
            }
            Ok(Value(0))
        }

        Req::ToggleIdleDisplay => match k.idle.toggle_display() {
            Some(v) => Ok(Value(v)),
            None => {
                klog_error!("toggle_idle_display: stats not initialized");
                Err(SyscallError::BadArgument)
            }
        },
    }
}

/// Destroys every live descendant of `parent`, depth-first. Parent TIDs
/// are assigned at Create and never change, so the parent graph is a
/// forest; the depth bound just turns a violated assumption into a
/// clean panic instead of runaway recursion.
fn kill_descendants(k: &mut Kernel, parent: Tid, depth: usize) {
    uassert!(depth < MAX_TASKS);
    for i in 1..MAX_TASKS {
        let tid = Tid::from_index(i);
        if k.tasks.is_live(tid) && k.tasks.task(tid).parent() == Some(parent)
        {
            kill_descendants(k, tid, depth + 1);
            k.destroy_task(tid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{BlockReason, EventId, TaskState};

    /// Drives the kernel the way the trap path does: plant the syscall
    /// number and arguments in the current task's saved frame, handle,
    /// then reschedule. Returns the task that would be restored.
    struct Rig {
        k: Kernel,
    }

    impl Rig {
        fn new() -> Self {
            Rig { k: Kernel::new() }
        }

        fn spawn(&mut self, priority: u8) -> Tid {
            let tid = self
                .k
                .tasks
                .create(None, Priority(priority), 0x1000)
                .unwrap();
            self.k.sched.add(&mut self.k.tasks, tid);
            tid
        }

        fn boot(&mut self) -> Tid {
            let t = self.k.schedule();
            self.k.check_invariants();
            t
        }

        /// Syscall from the current task, then schedule. Returns the new
        /// current task.
        fn trap(&mut self, nr: Sysnum, args: &[u64]) -> Tid {
            let caller = self.k.sched.current().expect("no current task");
            {
                let save = self.k.tasks.task_mut(caller).save_mut();
                save.set_descriptor(nr as u64);
                for (i, &a) in args.iter().enumerate() {
                    save.set_arg(i, a);
                }
            }
            handle(&mut self.k, caller);
            let next = self.k.schedule();
            self.k.check_invariants();
            next
        }

        fn result_of(&self, tid: Tid) -> i64 {
            self.k.tasks.task(tid).save().arg(0) as i64
        }

        fn state_of(&self, tid: Tid) -> TaskState {
            self.k.tasks.task(tid).state()
        }
    }

    #[test]
    fn fifo_within_priority_across_syscalls() {
        // Scenario: three tasks at priority 5 created in order A, B, C,
        // each doing MyTid(); Yield(); forever. Picks must go A, B, C,
        // then A again.
        let mut rig = Rig::new();
        let a = rig.spawn(5);
        let b = rig.spawn(5);
        let c = rig.spawn(5);

        assert_eq!(rig.boot(), a);
        assert_eq!(rig.trap(Sysnum::MyTid, &[]), b);
        assert_eq!(rig.result_of(a), i64::from(a.0));
        assert_eq!(rig.trap(Sysnum::MyTid, &[]), c);
        assert_eq!(rig.trap(Sysnum::Yield, &[]), a);
    }

    #[test]
    fn priority_preemption_via_ipc() {
        // Scenario: H at priority 0 receives; L at priority 5 sends.
        // After Send, H is Active and L is reply-blocked; the receive
        // observed 1 byte and L's TID. Reply("yyyy") readies L with
        // result 4.
        let mut rig = Rig::new();
        let h = rig.spawn(0);
        let l = rig.spawn(5);

        assert_eq!(rig.boot(), h);

        let mut hbuf = [0u8; 16];
        let mut h_tid_cell = [0u8; 4];
        let next = rig.trap(
            Sysnum::Receive,
            &[
                h_tid_cell.as_mut_ptr() as u64,
                hbuf.as_mut_ptr() as u64,
                hbuf.len() as u64,
            ],
        );
        assert_eq!(next, l, "H blocks in receive, L runs");

        let msg = *b"x";
        let mut l_reply = [0u8; 4];
        let next = rig.trap(
            Sysnum::Send,
            &[
                u64::from(h.0),
                msg.as_ptr() as u64,
                1,
                l_reply.as_mut_ptr() as u64,
                l_reply.len() as u64,
            ],
        );
        assert_eq!(next, h, "delivery readies H, which outranks L");
        assert_eq!(rig.state_of(h), TaskState::Active);
        assert_eq!(
            rig.state_of(l),
            TaskState::Blocked(BlockReason::IpcReply)
        );
        assert_eq!(rig.result_of(h), 1);
        assert_eq!(u32::from_le_bytes(h_tid_cell), u32::from(l.0));
        assert_eq!(hbuf[0], b'x');

        let rep = *b"yyyy";
        let next = rig.trap(
            Sysnum::Reply,
            &[u64::from(l.0), rep.as_ptr() as u64, rep.len() as u64],
        );
        assert_eq!(next, h, "H stays on top after replying");
        assert_eq!(rig.result_of(h), 4, "reply returns bytes copied");
        assert_eq!(rig.state_of(l), TaskState::Ready);
        assert_eq!(rig.result_of(l), 4, "sender sees reply source length");
        assert_eq!(&l_reply, b"yyyy");
    }

    #[test]
    fn sender_queue_order_across_syscalls() {
        // Scenario: S1, S2, S3 send to R before it receives; three
        // consecutive receives yield the senders in arrival order.
        let mut rig = Rig::new();
        let s1 = rig.spawn(1);
        let s2 = rig.spawn(1);
        let s3 = rig.spawn(1);
        let r = rig.spawn(9);

        assert_eq!(rig.boot(), s1);
        let msg = *b"m";
        let mut rep = [0u8; 1];
        for _ in 0..3 {
            // Each sender blocks; the next one runs.
            rig.trap(
                Sysnum::Send,
                &[
                    u64::from(r.0),
                    msg.as_ptr() as u64,
                    1,
                    rep.as_mut_ptr() as u64,
                    1,
                ],
            );
        }
        assert_eq!(rig.k.sched.current(), Some(r));

        let mut buf = [0u8; 4];
        let mut tid_cell = [0u8; 4];
        for expect in [s1, s2, s3] {
            rig.trap(
                Sysnum::Receive,
                &[
                    tid_cell.as_mut_ptr() as u64,
                    buf.as_mut_ptr() as u64,
                    buf.len() as u64,
                ],
            );
            assert_eq!(u32::from_le_bytes(tid_cell), u32::from(expect.0));
            assert_eq!(rig.result_of(r), 1);
        }
    }

    #[test]
    fn wait_tid_all_wake_on_exit() {
        // Scenario: W1 and W2 wait on C; C exits; both are Ready with
        // result 0 before C is gone from the run set.
        let mut rig = Rig::new();
        let w1 = rig.spawn(2);
        let w2 = rig.spawn(2);
        let c = rig.spawn(4);

        assert_eq!(rig.boot(), w1);
        rig.trap(Sysnum::WaitTid, &[u64::from(c.0)]);
        rig.trap(Sysnum::WaitTid, &[u64::from(c.0)]);
        assert_eq!(rig.k.sched.current(), Some(c));

        // Poison the result registers so 0 is provably written.
        rig.k.tasks.task_mut(w1).set_syscall_result(-77);
        rig.k.tasks.task_mut(w2).set_syscall_result(-77);

        let next = rig.trap(Sysnum::Exit, &[]);
        assert!(!rig.k.tasks.is_live(c));
        assert_eq!(rig.state_of(next), TaskState::Active);
        for w in [w1, w2] {
            assert_eq!(rig.result_of(w), 0);
        }
    }

    #[test]
    fn await_event_fan_out_via_syscall() {
        // Scenario: E1..E4 await TIMER_TICK; the tick fires with payload
        // 42; all four wake with 42 and nobody wakes again until the
        // next tick.
        let mut rig = Rig::new();
        let tasks: Vec<Tid> = (0..4).map(|_| rig.spawn(3)).collect();
        let idle = rig.spawn(9);

        assert_eq!(rig.boot(), tasks[0]);
        for _ in 0..4 {
            rig.trap(Sysnum::AwaitEvent, &[EventId::TimerTick as u64]);
        }
        assert_eq!(rig.k.sched.current(), Some(idle));

        let woken =
            crate::event::deliver(&mut rig.k, EventId::TimerTick, 42);
        assert_eq!(woken, 4);
        for &t in &tasks {
            assert_eq!(rig.state_of(t), TaskState::Ready);
            assert_eq!(rig.result_of(t), 42);
        }
        assert_eq!(
            crate::event::deliver(&mut rig.k, EventId::TimerTick, 43),
            0
        );
    }

    #[test]
    fn create_returns_tid_and_errors() {
        let mut rig = Rig::new();
        let root = rig.spawn(0);
        assert_eq!(rig.boot(), root);

        rig.trap(Sysnum::Create, &[3, 0x4000]);
        let child = Tid(rig.result_of(root) as u16);
        assert!(child.0 >= 1);
        assert_eq!(rig.k.tasks.task(child).parent(), Some(root));

        rig.trap(Sysnum::Create, &[u64::from(u8::MAX) + 7, 0x4000]);
        assert_eq!(rig.result_of(root), -1, "invalid priority");

        // Exhaust the table.
        while rig.k.tasks.live_count() < MAX_TASKS - 1 {
            rig.trap(Sysnum::Create, &[8, 0x4000]);
        }
        rig.trap(Sysnum::Create, &[8, 0x4000]);
        assert_eq!(rig.result_of(root), -2, "no free slot");
    }

    #[test]
    fn my_tid_and_parent_tid() {
        let mut rig = Rig::new();
        let root = rig.spawn(0);
        assert_eq!(rig.boot(), root);

        rig.trap(Sysnum::MyTid, &[]);
        assert_eq!(rig.result_of(root), i64::from(root.0));

        rig.trap(Sysnum::MyParentTid, &[]);
        assert_eq!(rig.result_of(root), 0, "first task has no parent");
    }

    #[test]
    fn wait_tid_errors() {
        let mut rig = Rig::new();
        let t = rig.spawn(0);
        let _other = rig.spawn(5);
        assert_eq!(rig.boot(), t);

        rig.trap(Sysnum::WaitTid, &[u64::from(t.0)]);
        assert_eq!(rig.result_of(t), -2, "self-wait");

        rig.trap(Sysnum::WaitTid, &[55]);
        assert_eq!(rig.result_of(t), -1, "dead tid");

        rig.trap(Sysnum::WaitTid, &[0]);
        assert_eq!(rig.result_of(t), -1, "reserved tid");
    }

    #[test]
    fn kill_with_children_reaps_the_subtree() {
        let mut rig = Rig::new();
        let root = rig.spawn(0);
        assert_eq!(rig.boot(), root);

        // root -> parent -> (kid1, kid2 -> grandkid)
        rig.trap(Sysnum::Create, &[4, 0x4000]);
        let parent = Tid(rig.result_of(root) as u16);

        // Children of `parent` must be created by `parent`; fake it by
        // scheduling it and letting it call Create.
        rig.trap(Sysnum::Yield, &[]); // root rotates, but root is alone at 0
        assert_eq!(rig.k.sched.current(), Some(root));

        // Create the subtree directly through the table to control
        // parentage without writing a user program.
        let kid1 = rig
            .k
            .tasks
            .create(Some(parent), Priority(5), 0x5000)
            .unwrap();
        rig.k.sched.add(&mut rig.k.tasks, kid1);
        let kid2 = rig
            .k
            .tasks
            .create(Some(parent), Priority(5), 0x5000)
            .unwrap();
        rig.k.sched.add(&mut rig.k.tasks, kid2);
        let grandkid = rig
            .k
            .tasks
            .create(Some(kid2), Priority(6), 0x6000)
            .unwrap();
        rig.k.sched.add(&mut rig.k.tasks, grandkid);

        rig.trap(Sysnum::Kill, &[u64::from(parent.0), 1]);
        assert_eq!(rig.result_of(root), 0);
        for t in [parent, kid1, kid2, grandkid] {
            assert!(!rig.k.tasks.is_live(t), "task {} survived", t.0);
        }
        rig.k.check_invariants();
    }

    #[test]
    fn kill_errors_and_waiter_wakeup() {
        let mut rig = Rig::new();
        let killer = rig.spawn(0);
        let victim = rig.spawn(5);
        let waiter = rig.spawn(3);
        assert_eq!(rig.boot(), killer);

        rig.trap(Sysnum::Kill, &[u64::from(killer.0), 0]);
        assert_eq!(rig.result_of(killer), -2, "self-kill");
        rig.trap(Sysnum::Kill, &[44, 0]);
        assert_eq!(rig.result_of(killer), -1, "dead tid");

        // Park the waiter on the victim, then kill the victim.
        rig.k.tasks.task_mut(waiter).set_wait_for(Some(victim));
        rig.k
            .sched
            .block(&mut rig.k.tasks, waiter, BlockReason::WaitTid);
        rig.trap(Sysnum::Kill, &[u64::from(victim.0), 0]);
        assert_eq!(rig.result_of(killer), 0);
        assert!(!rig.k.tasks.is_live(victim));
        assert_eq!(rig.state_of(waiter), TaskState::Ready);
        assert_eq!(rig.result_of(waiter), 0);
    }

    #[test]
    fn unknown_syscall_number_reports_error() {
        let mut rig = Rig::new();
        let t = rig.spawn(0);
        assert_eq!(rig.boot(), t);
        rig.trap(Sysnum::MyTid, &[]); // prove dispatch works first
        {
            let save = rig.k.tasks.task_mut(t).save_mut();
            save.set_descriptor(0xDEAD);
        }
        handle(&mut rig.k, t);
        assert_eq!(rig.result_of(t), -1);
    }

    #[test]
    fn klog_syscall_feeds_get_unread_klogs() {
        let mut rig = Rig::new();
        let t = rig.spawn(0);
        assert_eq!(rig.boot(), t);

        // Flush anything other tests left in the shared ring.
        let mut scratch = vec![0u8; 64 * 1024];
        crate::klog::with_klog(|ring| ring.drain_formatted(&mut scratch));

        let msg = b"marker-7c4f from userland\0";
        rig.trap(Sysnum::Klog, &[
            KlogLevel::Info as u64,
            msg.as_ptr() as u64,
        ]);
        assert_eq!(rig.result_of(t), 0);

        let mut out = [0u8; 512];
        let mut count_cell = [0u8; 4];
        rig.trap(Sysnum::GetUnreadKlogs, &[
            out.as_mut_ptr() as u64,
            out.len() as u64,
            count_cell.as_mut_ptr() as u64,
        ]);
        let bytes = rig.result_of(t);
        assert!(bytes > 0);
        let text = core::str::from_utf8(&out[..bytes as usize]).unwrap();
        assert!(text.contains("marker-7c4f"), "got: {text}");
        assert!(u32::from_le_bytes(count_cell) >= 1);
    }

    #[test]
    fn get_unread_klogs_with_empty_buffer_writes_nothing() {
        let mut rig = Rig::new();
        let t = rig.spawn(0);
        assert_eq!(rig.boot(), t);

        // Best-effort contract: nothing to reject, zero bytes written,
        // even with a null count out-pointer.
        rig.trap(Sysnum::GetUnreadKlogs, &[0, 0, 0]);
        assert_eq!(rig.result_of(t), 0);
    }

    #[test]
    fn get_task_info_reports_live_tasks() {
        let mut rig = Rig::new();
        let t = rig.spawn(0);
        let other = rig.spawn(7);
        assert_eq!(rig.boot(), t);

        let mut out = [0u8; 2048];
        rig.trap(Sysnum::GetTaskInfo, &[
            out.as_mut_ptr() as u64,
            out.len() as u64,
        ]);
        let bytes = rig.result_of(t);
        assert!(bytes > 0);
        let text = core::str::from_utf8(&out[..bytes as usize]).unwrap();
        assert!(text.contains(&format!("Current Task: {}", t.0)));
        assert!(text.contains(&format!("Task {}:", other.0)));

        // A buffer too small for the dump is an error, not garbage.
        let mut tiny = [0u8; 4];
        rig.trap(Sysnum::GetTaskInfo, &[tiny.as_mut_ptr() as u64, 4]);
        assert_eq!(rig.result_of(t), -2);
    }

    #[test]
    #[should_panic(expected = "User-triggered panic: goodbye")]
    fn panic_syscall_is_terminal() {
        let mut rig = Rig::new();
        let t = rig.spawn(0);
        assert_eq!(rig.boot(), t);
        let msg = b"goodbye\0";
        {
            let save = rig.k.tasks.task_mut(t).save_mut();
            save.set_descriptor(Sysnum::Panic as u64);
            save.set_arg(0, msg.as_ptr() as u64);
        }
        handle(&mut rig.k, t);
    }

    #[test]
    #[should_panic(expected = "SYSTEM RESET")]
    fn reboot_never_returns() {
        let mut rig = Rig::new();
        let t = rig.spawn(0);
        assert_eq!(rig.boot(), t);
        {
            let save = rig.k.tasks.task_mut(t).save_mut();
            save.set_descriptor(Sysnum::Reboot as u64);
        }
        handle(&mut rig.k, t);
    }

    #[test]
    fn idle_task_registration_and_toggle() {
        let mut rig = Rig::new();
        let worker = rig.spawn(0);
        let idle = rig.spawn(9);
        assert_eq!(rig.boot(), worker);

        // Toggling before setup fails.
        rig.trap(Sysnum::ToggleIdleDisplay, &[]);
        assert_eq!(rig.result_of(worker), -1);

        // The idle task registers itself once it runs.
        let mut stats = abi::IdleStats::default();
        rig.trap(Sysnum::Yield, &[]);
        assert_eq!(rig.k.sched.current(), Some(worker));
        rig.k
            .sched
            .block(&mut rig.k.tasks, worker, BlockReason::WaitTid);
        assert_eq!(rig.k.schedule(), idle);
        rig.trap(Sysnum::SetupIdleTask, &[
            &mut stats as *mut abi::IdleStats as u64,
        ]);
        assert_eq!(rig.result_of(idle), 0);
        assert!(rig.k.idle.is_idle_task(idle));
        assert_eq!(stats.display_enabled, 1);

        rig.trap(Sysnum::ToggleIdleDisplay, &[]);
        assert_eq!(rig.result_of(idle), 0);
        assert_eq!(stats.display_enabled, 0);
    }
}
