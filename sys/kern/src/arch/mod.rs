// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right
//! here in the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the
//! same set of names. There are two: `aarch64` for the real board, and
//! `fake` everywhere else, which stands in for the trap/restore layer so
//! the rest of the kernel is testable on the host.

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "none", target_arch = "aarch64"))] {
        #[macro_use]
        pub mod aarch64;
        pub use aarch64::*;
    } else {
        #[macro_use]
        pub mod fake;
        pub use fake::*;
    }
}
