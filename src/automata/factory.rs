//! Task construction: the extension point deciding what runs for a step.

use std::sync::Arc;

use anyhow::Result;

use super::{NestedTask, StepTask, Task, TaskSpec};
use crate::error::DeployError;
use crate::plan::Plan;
use crate::step::StepRegistry;

/// Builds the concrete task for a step position.
pub trait TaskFactory: Send + Sync {
    /// Rejects plans this factory cannot run. Called by
    /// [`TaskManager::start`](super::TaskManager::start) before any node is
    /// dispatched.
    fn validate(&self, _plan: &Plan) -> Result<(), DeployError> {
        Ok(())
    }

    fn create_task(&self, spec: TaskSpec) -> Result<Arc<dyn Task>>;
}

/// Default factory: nested steps become [`NestedTask`]s, other steps are
/// instantiated from the registry and wrapped in a [`StepTask`].
#[derive(Debug, Clone)]
pub struct StepTaskFactory {
    registry: Arc<StepRegistry>,
}

impl StepTaskFactory {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }
}

impl TaskFactory for StepTaskFactory {
    fn validate(&self, plan: &Plan) -> Result<(), DeployError> {
        plan.check_catalogue(&self.registry)
    }

    fn create_task(&self, spec: TaskSpec) -> Result<Arc<dyn Task>> {
        if let Some(nested) = &spec.step.nested {
            return Ok(Arc::new(NestedTask::new(&spec, Arc::clone(nested))));
        }
        let step = self.registry.instantiate(&spec.step.kind, &spec.step.params)?;
        Ok(Arc::new(StepTask::new(&spec, step)))
    }
}
