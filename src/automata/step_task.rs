//! Leaf task running one catalogue step.

use anyhow::Result;
use tracing::debug;

use super::{Status, Task, TaskCore, TaskSpec};
use crate::step::{Step, StepContext, StepOutcome};

/// Task executing a single [`Step`] against its node set.
pub struct StepTask {
    core: TaskCore,
    step: Box<dyn Step>,
}

impl StepTask {
    pub fn new(spec: &TaskSpec, step: Box<dyn Step>) -> Self {
        Self {
            core: TaskCore::new(spec),
            step,
        }
    }

    /// Raises the step's outcome, restricted to the nodes still owned.
    ///
    /// KO wins over OK and breakpoint for a node listed several times;
    /// owned nodes the step did not mention are KO.
    fn settle(&self, outcome: StepOutcome) {
        let remaining = self.core.nodes();
        let ko = outcome.ko_nodes().intersect(&remaining);
        let brk = outcome.breakpoint_nodes().intersect(&remaining).diff(&ko);
        let ok = outcome.ok_nodes().intersect(&remaining).diff(&ko).diff(&brk);

        let contested = outcome.ok_nodes().intersect(outcome.ko_nodes());
        if !contested.is_empty() {
            debug!(
                step = %self.core.name(),
                nodes = %contested,
                "nodes reported both OK and KO, keeping KO"
            );
        }

        let mut unreported = remaining.diff(&ko);
        unreported.remove_all(&brk);
        unreported.remove_all(&ok);

        self.core.raise_nodes(&ok, Status::Ok);
        self.core.raise_nodes(&ko, Status::Ko);
        self.core.raise_nodes(&brk, Status::Breakpoint);
        if !unreported.is_empty() {
            unreported.record_error(&format!(
                "step '{}' reported no outcome for this node",
                self.core.name()
            ));
            self.core.raise_nodes(&unreported, Status::Ko);
        }
    }
}

impl Task for StepTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn run(&self) -> Result<()> {
        let ctx = StepContext::new(&self.core, self.core.nodes());
        let outcome = self.step.run(&ctx)?;
        if self.core.is_cancelled() {
            // The manager settles the nodes of a killed task.
            return Ok(());
        }
        self.settle(outcome);
        Ok(())
    }

    fn kill(&self) {
        self.core.cancel();
        self.step.kill();
    }
}
