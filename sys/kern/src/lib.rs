// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Marshal kernel.
//!
//! This is the application-independent portion of the operating system: a
//! small message-passing kernel for a single-core ARMv8-A board. The
//! kernel owns the task table, the priority scheduler, the synchronous
//! Send/Receive/Reply rendezvous, and interrupt-derived event delivery;
//! everything else (drivers, servers, the shell) runs as user tasks it is
//! agnostic to.
//!
//! # Design principles
//!
//! 1. Static configuration. All kernel state is reserved at compile time;
//!    there is no allocator anywhere in this crate.
//! 2. The kernel never runs "on its own task." It is entered at traps,
//!    does its work, and returns into some user task's context.
//! 3. A strong preference for safe code where reasonable. The unsafe
//!    parts are fenced into `arch` and `umem`.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    algorithms.
//!
//! Code outside the `arch` module is portable; in particular the whole
//! kernel builds and tests on the host against `arch::fake`.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod klog;
#[macro_use]
pub mod arch;

pub mod err;
pub mod event;
pub mod fail;
pub mod idle;
pub mod ipc;
pub mod irq;
pub mod kernel;
pub mod sched;
pub mod startup;
pub mod syscalls;
pub mod task;
pub mod time;
pub mod umem;
