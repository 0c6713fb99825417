// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A lock-free task graph executor for real-time interactive engines.
//!
//! Producer threads construct [`task::Task`]s with prerequisite [`event::GraphEvent`]s and a
//! [`scheduler::Destination`]; the process-wide [`scheduler::Scheduler`] routes each task, once
//! its prerequisites resolve, to a named thread's private queue or to a priority-banded worker
//! pool. [`parallel_for::parallel_for`] builds on top of both to partition a range of work across
//! the same worker pools. See the component modules for the concurrency protocol each layer
//! relies on.

pub mod builder;
pub mod containers;
pub mod error;
pub mod event;
mod link;
mod loom;
pub mod parallel_for;
pub mod scheduler;
pub mod tagged_ptr;
pub mod task;
mod util;

pub use builder::{GraphTask, SubsequentsMode, TaskBuilder, TaskHandle};
pub use error::{Closed, TimedOut};
pub use event::GraphEvent;
pub use parallel_for::{parallel_for, parallel_for_with_prework};
pub use scheduler::{Destination, NamedQueue, Scheduler, SchedulerConfig, TaskPriority, ThreadBand, ThreadId};
pub use task::Task;

/// Shared scheduler startup used by unit tests scattered across this crate's modules. A process
/// may only call [`Scheduler::startup`] once, so every `#[cfg(test)]` module reaches for this
/// instead of starting its own.
#[cfg(test)]
pub(crate) mod test_support {
    use crate::scheduler::{NamedThreadDescriptor, Scheduler, SchedulerConfig};
    use std::sync::OnceLock;

    static SCHEDULER: OnceLock<&'static Scheduler> = OnceLock::new();

    pub(crate) fn scheduler() -> &'static Scheduler {
        *SCHEDULER.get_or_init(|| {
            Scheduler::startup(SchedulerConfig {
                num_total_threads: 6,
                enable_high_priority_pool: true,
                enable_background_pool: true,
                named_threads: vec![
                    NamedThreadDescriptor { name: "game" },
                    NamedThreadDescriptor { name: "render" },
                ],
                wait_short_circuit_threshold: 8,
            })
        })
    }
}
