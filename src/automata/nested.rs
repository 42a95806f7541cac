//! Composition adapter: a whole manager run acting as one task.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use super::{Status, Task, TaskCore, TaskManager, TaskSpec, Transition, TransitionHooks};
use crate::nodeset::NodeSet;
use crate::plan::Plan;

/// Task running an inner [`TaskManager`] over its node set.
///
/// Terminal transitions of raisable inner steps are raised to the outer
/// manager as they happen. Everything else is raised in one batch once the
/// inner manager has finished.
pub struct NestedTask {
    core: Arc<TaskCore>,
    inner: TaskManager,
}

impl NestedTask {
    pub fn new(spec: &TaskSpec, plan: Arc<Plan>) -> Self {
        let core = Arc::new(TaskCore::new(spec));
        let raising = Arc::new(RaisingHooks {
            core: Arc::clone(&core),
            delegate: Arc::clone(&spec.hooks),
        });
        let inner = TaskManager::new(
            format!("{}/{}", spec.manager, spec.step.name),
            plan,
            spec.nodes.clone(),
            Arc::clone(&spec.factory),
        )
        .with_hooks(raising)
        .with_child_hooks(Arc::clone(&spec.hooks))
        .with_options(spec.options)
        .with_depth(spec.depth + 1);

        Self { core, inner }
    }
}

impl Task for NestedTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn run(&self) -> Result<()> {
        let outcome = self.inner.start()?;
        if self.core.is_cancelled() {
            return Ok(());
        }
        debug!(
            manager = %self.inner.name(),
            "nested run finished: {}",
            outcome.summary()
        );
        // Nodes already raised are skipped by raise_nodes.
        self.core.raise_nodes(&outcome.ko, Status::Ko);
        self.core.raise_nodes(&outcome.brk, Status::Breakpoint);
        self.core.raise_nodes(&outcome.ok, Status::Ok);
        Ok(())
    }

    fn kill(&self) {
        self.core.cancel();
        self.inner.kill();
    }
}

/// Forwards inner transitions to the outer hooks and raises terminal
/// outcomes of raisable steps onto the outer queue.
struct RaisingHooks {
    core: Arc<TaskCore>,
    delegate: Arc<dyn TransitionHooks>,
}

impl RaisingHooks {
    fn raise(&self, t: &Transition<'_>, status: Status) {
        if t.step.raisable && !self.core.is_cancelled() {
            self.core.raise_nodes(t.nodes, status);
        }
    }
}

impl TransitionHooks for RaisingHooks {
    fn on_start(&self, t: &Transition<'_>) {
        self.delegate.on_start(t);
    }

    fn on_success(&self, t: &Transition<'_>) {
        self.delegate.on_success(t);
    }

    fn on_retry(&self, t: &Transition<'_>) {
        self.delegate.on_retry(t);
    }

    fn on_timeout(&self, t: &Transition<'_>) {
        self.delegate.on_timeout(t);
    }

    fn on_split(&self, t: &Transition<'_>, previous_group: u64) {
        self.delegate.on_split(t, previous_group);
    }

    fn on_break(&self, t: &Transition<'_>) {
        self.delegate.on_break(t);
        self.raise(t, Status::Breakpoint);
    }

    fn on_fail(&self, t: &Transition<'_>) {
        self.delegate.on_fail(t);
        self.raise(t, Status::Ko);
    }

    fn on_done(&self, t: &Transition<'_>) {
        self.delegate.on_done(t);
        self.raise(t, Status::Ok);
    }

    fn on_kill(&self, manager: &str, depth: usize, nodes: &NodeSet) {
        self.delegate.on_kill(manager, depth, nodes);
    }
}
