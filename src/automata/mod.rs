//! Task orchestration engine.
//!
//! A [`TaskManager`] drives a node population through a [`Plan`]: it spawns
//! one task per (node set, step) pair, consumes the partial outcomes tasks
//! push onto its queue, and decides per sub-set whether to advance, retry,
//! fall back to another variant, or settle the nodes as OK, KO or
//! breakpointed. A [`NestedTask`] wraps a whole manager run as a task, so
//! phases can themselves be managers over finer-grained steps.
//!
//! [`Plan`]: crate::plan::Plan

mod factory;
mod hooks;
mod manager;
mod nested;
mod step_task;
mod task;

use std::time::Duration;

use strum::{AsRefStr, Display};

use crate::nodeset::NodeSet;

pub use factory::{StepTaskFactory, TaskFactory};
pub use hooks::{NoopHooks, Transition, TransitionHooks};
pub use manager::TaskManager;
pub use nested::NestedTask;
pub use step_task::StepTask;
pub use task::{QueueEvent, Task, TaskCore, TaskId, TaskRef, TaskSpec};

/// Outcome class carried by queue events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Status {
    Ok,
    Ko,
    Breakpoint,
}

/// Timing knobs of the controller loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Upper bound on how long the controller sleeps between checks for
    /// finished or timed-out tasks.
    pub poll_interval: Duration,
    /// How long a cancelled task thread is awaited before it is detached.
    pub kill_grace: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Final partition of a manager's nodes.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub ok: NodeSet,
    pub ko: NodeSet,
    pub brk: NodeSet,
}

impl RunOutcome {
    /// "N succeeded, M failed, K breakpointed".
    pub fn summary(&self) -> String {
        format!(
            "{} succeeded, {} failed, {} breakpointed",
            self.ok.len(),
            self.ko.len(),
            self.brk.len()
        )
    }

    /// Hostname and last recorded error of every failed node.
    pub fn failures(&self) -> Vec<(String, Option<String>)> {
        self.ko
            .iter()
            .map(|n| (n.hostname().to_string(), n.status().last_error))
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.ko.is_empty() && self.brk.is_empty()
    }

    /// Number of nodes across the three sets.
    pub fn total(&self) -> usize {
        self.ok.len() + self.ko.len() + self.brk.len()
    }
}
