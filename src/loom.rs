// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Indirection over `std`/`loom` primitives so the lock-free algorithms in this
//! crate can be exhaustively model-checked under `loom` while compiling to
//! plain `std::sync::atomic` in normal builds.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::sync;
        pub(crate) use loom::thread;
        pub(crate) use loom::model;
    } else {
        #[cfg(test)]
        pub(crate) fn model<R>(f: impl FnOnce() -> R) -> R {
            f()
        }

        pub(crate) mod sync {
            pub use std::sync::*;
        }

        pub(crate) mod thread {
            pub use std::thread::*;
        }
    }
}
