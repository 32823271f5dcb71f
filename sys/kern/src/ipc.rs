// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Send / Receive / Reply rendezvous.
//!
//! A classical synchronous three-phase exchange: the sender blocks until
//! the receiver has both consumed the message and produced a reply; the
//! receiver blocks only if no sender is queued. Each receiver carries a
//! strict-FIFO queue of waiting senders, so `Receive` always consumes the
//! oldest pending sender.
//!
//! Copies truncate to `min(source, destination)` bytes. The value
//! *returned* is asymmetric on purpose: the message/reply consumer
//! observes the source length (so truncation is detectable), while
//! `Reply` itself returns the copied length. Blocking calls never write
//! their result register at call time; whoever unblocks the task does.

use abi::{BlockReason, Tid, MAX_TASKS};
use kerncore::{Link, Queue};

use crate::err::SyscallError;
use crate::kernel::Kernel;
use crate::syscalls::SyscallReturn;
use crate::umem::{self, USlice};

/// Per-receiver queues of blocked senders.
///
/// One link per task slot (a task can be queued on at most one receiver
/// at a time -- it is blocked while queued), plus a back-reference to the
/// receiver so destruction can unlink without searching.
pub struct SenderQueues {
    queues: [Queue; MAX_TASKS],
    links: [Link; MAX_TASKS],
    queued_on: [Option<Tid>; MAX_TASKS],
}

impl SenderQueues {
    pub fn new() -> Self {
        SenderQueues {
            queues: [Queue::new(); MAX_TASKS],
            links: [Link::DETACHED; MAX_TASKS],
            queued_on: [None; MAX_TASKS],
        }
    }

    fn enqueue(&mut self, receiver: Tid, sender: Tid) {
        self.queues[receiver.index()]
            .push_back(&mut self.links, sender.index());
        self.queued_on[sender.index()] = Some(receiver);
    }

    fn dequeue(&mut self, receiver: Tid) -> Option<Tid> {
        let i = self.queues[receiver.index()].pop_front(&mut self.links)?;
        self.queued_on[i] = None;
        Some(Tid::from_index(i))
    }

    pub fn has_waiting(&self, receiver: Tid) -> bool {
        !self.queues[receiver.index()].is_empty()
    }

    /// Erases every trace of `victim` ahead of destruction: unlinks it
    /// from any receiver's queue it is waiting on, and empties its own
    /// queue so a reused slot doesn't inherit stale senders. Senders
    /// stranded this way stay reply-blocked; the kernel has nobody to
    /// answer for the dead receiver.
    pub fn purge(&mut self, victim: Tid) {
        let i = victim.index();
        if let Some(receiver) = self.queued_on[i].take() {
            self.queues[receiver.index()].remove(&mut self.links, i);
        }
        while self.dequeue(victim).is_some() {}
    }
}

impl Default for SenderQueues {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes the sender's TID through the receiver's out-pointer, as four
/// little-endian bytes so the pointer carries no alignment obligation.
///
/// # Safety
///
/// The out-slice must refer to real memory owned by a blocked task (or
/// the Active caller).
unsafe fn write_tid_out(out: &mut USlice<u8>, sender: Tid) {
    let bytes = u32::from(sender.0).to_le_bytes();
    let src = USlice::from_raw(bytes.as_ptr() as usize, bytes.len());
    // Safety: `bytes` is a live local; destination per our contract.
    if let Ok(src) = src {
        unsafe {
            umem::copy_truncated(&src, out);
        }
    }
}

/// `Send(tid, msg, msg_len, reply_buf, reply_len)`.
///
/// The caller always ends this call blocked waiting for the reply; the
/// only question is whether the message moves now (receiver already
/// parked in Receive) or later (caller joins the sender queue).
pub fn send(
    k: &mut Kernel,
    caller: Tid,
    dest: Tid,
    msg: USlice<u8>,
    reply_buf: USlice<u8>,
) -> Result<SyscallReturn, SyscallError> {
    if !k.tasks.is_live(dest) {
        return Err(SyscallError::BadTid);
    }

    // Stash the transfer description where the receiver/replier will
    // look for it. The caller is about to block, which is what makes
    // these slots safe to read from the other side.
    let msg_len = msg.len();
    {
        let ipc = k.tasks.task_mut(caller).ipc_mut();
        ipc.send = msg.clone();
        ipc.reply_buf = reply_buf;
    }

    if k.tasks.task(dest).state().can_receive() {
        klog_debug!(
            "send {}->{}: receiver waiting, delivering directly",
            caller.0,
            dest.0
        );
        let mut recv_buf = k.tasks.task(dest).ipc().recv_buf.clone();
        let mut tid_out = k.tasks.task(dest).ipc().recv_tid_out.clone();
        // Safety: the receiver is blocked in Receive and owns these
        // buffers until we unblock it below; the sender is the Active
        // task. At most one copy runs on each buffer.
        unsafe {
            umem::copy_truncated(&msg, &mut recv_buf);
            write_tid_out(&mut tid_out, caller);
        }
        // The receiver learns the *source* length so it can detect
        // truncation.
        k.tasks.task_mut(dest).finish_receive(msg_len);
        k.sched.unblock(&mut k.tasks, dest);
    } else {
        klog_debug!(
            "send {}->{}: receiver not ready, queuing sender",
            caller.0,
            dest.0
        );
        k.senders.enqueue(dest, caller);
    }

    k.sched.block(&mut k.tasks, caller, BlockReason::IpcReply);
    Ok(SyscallReturn::Deferred)
}

/// `Receive(&tid, buf, buf_len)` and its non-blocking variant.
pub fn receive(
    k: &mut Kernel,
    caller: Tid,
    tid_out: USlice<u8>,
    buf: USlice<u8>,
    nonblock: bool,
) -> Result<SyscallReturn, SyscallError> {
    if let Some(sender) = k.senders.dequeue(caller) {
        klog_debug!(
            "receive {}: consuming sender {}",
            caller.0,
            sender.0
        );
        let src = k.tasks.task(sender).ipc().send.clone();
        let mut buf = buf;
        let mut tid_out = tid_out;
        // Safety: the sender is reply-blocked and owns its message
        // buffer; the receiver is the Active caller.
        unsafe {
            umem::copy_truncated(&src, &mut buf);
            write_tid_out(&mut tid_out, sender);
        }
        // Sender stays blocked; its Send completes at Reply time.
        return Ok(SyscallReturn::Value(src.len() as i64));
    }

    if nonblock {
        return Err(SyscallError::NoSender);
    }

    klog_debug!("receive {}: no sender, blocking", caller.0);
    {
        let ipc = k.tasks.task_mut(caller).ipc_mut();
        ipc.recv_buf = buf;
        ipc.recv_tid_out = tid_out;
    }
    k.sched.block(&mut k.tasks, caller, BlockReason::IpcReceive);
    Ok(SyscallReturn::Deferred)
}

/// `Reply(tid, reply, reply_len)`.
///
/// Unblocks the named sender with the reply. Returns the number of bytes
/// actually copied to the replier; the woken sender observes the reply's
/// *source* length. Both sides can therefore detect truncation.
pub fn reply(
    k: &mut Kernel,
    caller: Tid,
    dest: Tid,
    rep: USlice<u8>,
) -> Result<SyscallReturn, SyscallError> {
    if !k.tasks.is_live(dest) {
        return Err(SyscallError::BadTid);
    }
    if !k.tasks.task(dest).state().is_reply_blocked() {
        klog_error!(
            "reply {}->{}: target is not blocked on IPC",
            caller.0,
            dest.0
        );
        return Err(SyscallError::NotReplyBlocked);
    }

    let mut reply_buf = k.tasks.task(dest).ipc().reply_buf.clone();
    // Safety: the sender is reply-blocked and owns its reply buffer; the
    // replier is the Active caller.
    let copied = unsafe { umem::copy_truncated(&rep, &mut reply_buf) };

    k.tasks.task_mut(dest).finish_send(rep.len());
    k.sched.unblock(&mut k.tasks, dest);
    Ok(SyscallReturn::Value(copied as i64))
}
