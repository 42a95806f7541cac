//! Deployment driver: one task manager per cluster, all in parallel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{info, warn};
use uuid::Uuid;

use crate::automata::{
    EngineOptions, RunOutcome, StepTaskFactory, TaskFactory, TaskManager, TransitionHooks,
};
use crate::config::DeployConfig;
use crate::error::DeployError;
use crate::lock_unpoisoned;
use crate::node::NodeArena;
use crate::nodeset::NodeSet;
use crate::plan::Plan;
use crate::sink::{NodeStateStore, ProgressSink, ReportingHooks, TracingSink, TracingStateStore};
use crate::step::StepRegistry;

/// Merged result of every cluster's run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentReport {
    pub id: Uuid,
    pub ok: Vec<String>,
    /// Failed hostnames with their last recorded error.
    pub ko: Vec<(String, Option<String>)>,
    pub brk: Vec<String>,
}

impl DeploymentReport {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            ok: Vec::new(),
            ko: Vec::new(),
            brk: Vec::new(),
        }
    }

    fn merge(&mut self, outcome: &RunOutcome) {
        self.ok.extend(outcome.ok.hostnames());
        self.ko.extend(outcome.failures());
        self.brk.extend(outcome.brk.hostnames());
    }

    fn sort(&mut self) {
        self.ok.sort();
        self.ko.sort();
        self.brk.sort();
    }

    /// "N succeeded, M failed, K breakpointed".
    pub fn summary(&self) -> String {
        format!(
            "{} succeeded, {} failed, {} breakpointed",
            self.ok.len(),
            self.ko.len(),
            self.brk.len()
        )
    }

    pub fn is_success(&self) -> bool {
        self.ko.is_empty() && self.brk.is_empty()
    }

    pub fn total(&self) -> usize {
        self.ok.len() + self.ko.len() + self.brk.len()
    }
}

/// A validated deployment ready to run once.
pub struct Deployment {
    id: Uuid,
    plan: Arc<Plan>,
    arena: Arc<NodeArena>,
    factory: Arc<dyn TaskFactory>,
    sink: Arc<dyn ProgressSink>,
    store: Arc<dyn NodeStateStore>,
    environment: Option<String>,
    options: EngineOptions,
    managers: Mutex<Vec<Arc<TaskManager>>>,
    aborted: AtomicBool,
}

impl Deployment {
    pub fn new(plan: Plan, arena: NodeArena, factory: Arc<dyn TaskFactory>) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan: Arc::new(plan),
            arena: Arc::new(arena),
            factory,
            sink: Arc::new(TracingSink),
            store: Arc::new(TracingStateStore),
            environment: None,
            options: EngineOptions::default(),
            managers: Mutex::new(Vec::new()),
            aborted: AtomicBool::new(false),
        }
    }

    /// Builds a deployment from a loaded file, validating it against
    /// `registry`.
    pub fn from_config(
        config: &DeployConfig,
        registry: Arc<StepRegistry>,
    ) -> Result<Self, DeployError> {
        let options = config.engine_options()?;
        let arena = config.arena()?;
        let plan = config.plan(&registry)?;
        let factory = Arc::new(StepTaskFactory::new(registry));
        Ok(Self::new(plan, arena, factory)
            .with_options(options)
            .with_environment(config.environment.clone()))
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn NodeStateStore>) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn with_environment(mut self, environment: Option<String>) -> Self {
        self.environment = environment;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn arena(&self) -> &Arc<NodeArena> {
        &self.arena
    }

    /// Runs every cluster to completion and merges their outcomes.
    pub fn run(&self) -> Result<DeploymentReport, DeployError> {
        self.factory.validate(&self.plan)?;

        let clusters = NodeSet::all(Arc::clone(&self.arena)).group_by_cluster();
        info!(
            deployment = %self.id,
            nodes = self.arena.len(),
            clusters = clusters.len(),
            "starting deployment"
        );

        let hooks: Arc<dyn TransitionHooks> = Arc::new(ReportingHooks::new(
            Arc::clone(&self.sink),
            Arc::clone(&self.store),
            self.environment.clone(),
        ));
        let managers: Vec<Arc<TaskManager>> = clusters
            .into_iter()
            .map(|(cluster, nodes)| {
                let factory = Arc::clone(&self.factory);
                Arc::new(
                    TaskManager::new(cluster, Arc::clone(&self.plan), nodes, factory)
                        .with_hooks(Arc::clone(&hooks))
                        .with_options(self.options),
                )
            })
            .collect();

        *lock_unpoisoned(&self.managers) = managers.clone();
        if self.aborted.load(Ordering::SeqCst) {
            for manager in &managers {
                manager.kill();
            }
        }

        let results: Vec<Result<RunOutcome, DeployError>> = thread::scope(|s| {
            let handles: Vec<_> = managers
                .iter()
                .map(|manager| s.spawn(move || manager.start()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|payload| std::panic::resume_unwind(payload)))
                .collect()
        });

        let mut report = DeploymentReport::new(self.id);
        for result in results {
            report.merge(&result?);
        }
        report.sort();

        if report.is_success() {
            info!(deployment = %self.id, "deployment finished: {}", report.summary());
        } else {
            warn!(deployment = %self.id, "deployment finished: {}", report.summary());
        }
        Ok(report)
    }

    /// Kills every cluster manager. Callable from any thread, before or
    /// during [`run`](Self::run).
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        let managers = lock_unpoisoned(&self.managers).clone();
        warn!(deployment = %self.id, managers = managers.len(), "aborting deployment");
        for manager in managers {
            manager.kill();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn test_clusters_run_and_merge() {
        let config = parse_config(
            r#"
nodes:
  - {hostname: a1, cluster: alpha}
  - {hostname: b1, cluster: beta}
  - {hostname: b2, cluster: beta}
phases: [noop]
"#,
        )
        .unwrap();
        let deployment =
            Deployment::from_config(&config, Arc::new(StepRegistry::with_builtins())).unwrap();
        let report = deployment.run().unwrap();

        assert_eq!(report.id, deployment.id());
        assert_eq!(report.ok, vec!["a1", "b1", "b2"]);
        assert!(report.is_success());
        assert_eq!(report.summary(), "3 succeeded, 0 failed, 0 breakpointed");
        let b2 = deployment.arena().lookup("b2").unwrap();
        assert_eq!(deployment.arena().get(b2).unwrap().status().state, "deployed");
    }

    #[test]
    fn test_abort_before_run_fails_every_node() {
        let config = parse_config(
            r#"
nodes: [{hostname: n1}, {hostname: n2}]
phases: [noop]
"#,
        )
        .unwrap();
        let deployment =
            Deployment::from_config(&config, Arc::new(StepRegistry::with_builtins())).unwrap();
        deployment.abort();
        let report = deployment.run().unwrap();

        assert!(deployment.is_aborted());
        assert_eq!(report.ko.len(), 2);
        assert_eq!(report.ko[0].1.as_deref(), Some("deployment aborted"));
    }
}
