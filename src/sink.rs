//! Progress reporting and node state persistence.
//!
//! The engine never formats or stores anything itself: [`ReportingHooks`]
//! turns manager transitions into [`LogRecord`]s and [`MetricRecord`]s for a
//! [`ProgressSink`], and pushes lifecycle tags of the outermost manager's
//! terminal transitions to a [`NodeStateStore`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use strum::{AsRefStr, Display};
use tracing::{Level, debug, error, info, trace, warn};

use crate::automata::{Transition, TransitionHooks};
use crate::nodeset::NodeSet;
use crate::plan::Position;

/// Human-oriented progress message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
    /// Group id of the node set concerned.
    pub nodeset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Duration(Duration),
    /// Attempt number about to run (1 for the first retry).
    Retries(u32),
}

/// Structured measurement attached to a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricRecord {
    pub step: String,
    pub kind: MetricKind,
    pub hostnames: Vec<String>,
}

/// Receives progress records. Implementations must not block for long:
/// they are called from manager controller threads.
pub trait ProgressSink: Send + Sync {
    fn log(&self, record: &LogRecord);
    fn metric(&self, record: &MetricRecord);
}

/// Lifecycle tags persisted for nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum NodeState {
    Deploying,
    Deployed,
    DeployFailed,
    Breakpointed,
    Aborted,
}

/// External collaborator recording node lifecycle changes.
pub trait NodeStateStore: Send + Sync {
    fn set_state(&self, hostname: &str, state: NodeState, environment: Option<&str>) -> Result<()>;
}

/// Sink writing every record through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn log(&self, record: &LogRecord) {
        let nodeset = record.nodeset;
        match record.level {
            Level::ERROR => error!(nodeset, "{}", record.message),
            Level::WARN => warn!(nodeset, "{}", record.message),
            Level::INFO => info!(nodeset, "{}", record.message),
            Level::DEBUG => debug!(nodeset, "{}", record.message),
            Level::TRACE => trace!(nodeset, "{}", record.message),
        }
    }

    fn metric(&self, record: &MetricRecord) {
        let hosts = record.hostnames.join(",");
        match record.kind {
            MetricKind::Duration(d) => {
                debug!(
                    step = %record.step,
                    duration_ms = d.as_millis() as u64,
                    hosts = %hosts,
                    "metric"
                );
            }
            MetricKind::Retries(n) => {
                debug!(step = %record.step, retries = n, hosts = %hosts, "metric");
            }
        }
    }
}

/// Store that only logs the transitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStateStore;

impl NodeStateStore for TracingStateStore {
    fn set_state(&self, hostname: &str, state: NodeState, environment: Option<&str>) -> Result<()> {
        debug!(
            hostname,
            state = state.as_ref(),
            environment = environment.unwrap_or("-"),
            "node state changed"
        );
        Ok(())
    }
}

/// Hooks feeding a [`ProgressSink`] and a [`NodeStateStore`].
///
/// Node states are only persisted for depth-0 transitions; nested managers
/// report progress but their terminal transitions are intermediate from the
/// deployment's point of view.
pub struct ReportingHooks {
    sink: Arc<dyn ProgressSink>,
    store: Arc<dyn NodeStateStore>,
    environment: Option<String>,
}

impl ReportingHooks {
    pub fn new(
        sink: Arc<dyn ProgressSink>,
        store: Arc<dyn NodeStateStore>,
        environment: Option<String>,
    ) -> Self {
        Self {
            sink,
            store,
            environment,
        }
    }

    fn log(&self, level: Level, t: &Transition<'_>, message: String) {
        self.sink.log(&LogRecord {
            level,
            message: format!("[{}] {}", t.manager, message),
            nodeset: t.nodes.id(),
        });
    }

    fn metric(&self, t: &Transition<'_>, kind: MetricKind) {
        self.sink.metric(&MetricRecord {
            step: t.step.name.clone(),
            kind,
            hostnames: t.nodes.hostnames(),
        });
    }

    fn persist(&self, nodes: &NodeSet, state: NodeState) {
        nodes.set_state(state.as_ref());
        for node in nodes.iter() {
            // Best effort: scheduling never waits on the store.
            if let Err(e) = self
                .store
                .set_state(node.hostname(), state, self.environment.as_deref())
            {
                warn!(
                    hostname = node.hostname(),
                    state = state.as_ref(),
                    "failed to persist node state: {:#}",
                    e
                );
            }
        }
    }
}

impl TransitionHooks for ReportingHooks {
    fn on_start(&self, t: &Transition<'_>) {
        self.log(
            Level::INFO,
            t,
            format!(
                "step '{}' started on {} (attempt {})",
                t.step.name,
                t.nodes,
                t.attempt + 1
            ),
        );
        if t.depth == 0 && t.position == Position::START && t.attempt == 0 {
            self.persist(t.nodes, NodeState::Deploying);
        }
    }

    fn on_success(&self, t: &Transition<'_>) {
        self.log(Level::DEBUG, t, format!("step '{}' succeeded on {}", t.step.name, t.nodes));
        if let Some(elapsed) = t.elapsed {
            self.metric(t, MetricKind::Duration(elapsed));
        }
    }

    fn on_retry(&self, t: &Transition<'_>) {
        let message = if t.attempt == 0 {
            format!("falling back to step '{}' for {}", t.step.name, t.nodes)
        } else {
            format!(
                "retrying step '{}' for {} ({}/{})",
                t.step.name, t.nodes, t.attempt, t.step.retries
            )
        };
        self.log(Level::WARN, t, message);
        self.metric(t, MetricKind::Retries(t.attempt));
    }

    fn on_timeout(&self, t: &Transition<'_>) {
        self.log(Level::WARN, t, format!("step '{}' timed out on {}", t.step.name, t.nodes));
        if let Some(elapsed) = t.elapsed {
            self.metric(t, MetricKind::Duration(elapsed));
        }
    }

    fn on_split(&self, t: &Transition<'_>, previous_group: u64) {
        self.log(
            Level::DEBUG,
            t,
            format!("{} split off group {} after step '{}'", t.nodes, previous_group, t.step.name),
        );
    }

    fn on_break(&self, t: &Transition<'_>) {
        self.log(Level::INFO, t, format!("breakpoint at step '{}' for {}", t.step.name, t.nodes));
        if t.depth == 0 {
            self.persist(t.nodes, NodeState::Breakpointed);
        }
    }

    fn on_fail(&self, t: &Transition<'_>) {
        self.log(Level::ERROR, t, format!("step '{}' failed for {}", t.step.name, t.nodes));
        if t.depth == 0 {
            self.persist(t.nodes, NodeState::DeployFailed);
        }
    }

    fn on_done(&self, t: &Transition<'_>) {
        self.log(Level::INFO, t, format!("{} completed every phase", t.nodes));
        if let Some(elapsed) = t.elapsed {
            self.metric(t, MetricKind::Duration(elapsed));
        }
        if t.depth == 0 {
            self.persist(t.nodes, NodeState::Deployed);
        }
    }

    fn on_kill(&self, manager: &str, depth: usize, nodes: &NodeSet) {
        self.sink.log(&LogRecord {
            level: Level::WARN,
            message: format!("[{}] aborted, {} marked as failed", manager, nodes),
            nodeset: nodes.id(),
        });
        if depth == 0 {
            self.persist(nodes, NodeState::Aborted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeArena;
    use crate::plan::StepConfig;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        logs: Mutex<Vec<LogRecord>>,
        metrics: Mutex<Vec<MetricRecord>>,
        states: Mutex<Vec<(String, NodeState, Option<String>)>>,
    }

    impl ProgressSink for Recorder {
        fn log(&self, record: &LogRecord) {
            self.logs.lock().unwrap().push(record.clone());
        }

        fn metric(&self, record: &MetricRecord) {
            self.metrics.lock().unwrap().push(record.clone());
        }
    }

    impl NodeStateStore for Recorder {
        fn set_state(
            &self,
            hostname: &str,
            state: NodeState,
            environment: Option<&str>,
        ) -> Result<()> {
            self.states.lock().unwrap().push((
                hostname.to_string(),
                state,
                environment.map(str::to_string),
            ));
            Ok(())
        }
    }

    fn hooks(recorder: &Arc<Recorder>) -> ReportingHooks {
        ReportingHooks::new(
            Arc::clone(recorder) as Arc<dyn ProgressSink>,
            Arc::clone(recorder) as Arc<dyn NodeStateStore>,
            Some("debian12".to_string()),
        )
    }

    fn nodes() -> NodeSet {
        let arena = NodeArena::from_nodes([("n1", "c"), ("n2", "c")]).unwrap();
        NodeSet::all(Arc::new(arena))
    }

    #[test]
    fn test_node_state_tags() {
        assert_eq!(NodeState::DeployFailed.as_ref(), "deploy_failed");
        assert_eq!(NodeState::Deployed.to_string(), "deployed");
    }

    #[test]
    fn test_done_persists_at_top_level_only() {
        let recorder = Arc::new(Recorder::default());
        let hooks = hooks(&recorder);
        let nodes = nodes();
        let step = StepConfig::new("reboot");
        let mut t = Transition {
            manager: "c",
            depth: 1,
            step: &step,
            position: Position::START,
            attempt: 0,
            nodes: &nodes,
            elapsed: Some(Duration::from_millis(30)),
        };

        hooks.on_done(&t);
        assert!(recorder.states.lock().unwrap().is_empty());

        t.depth = 0;
        hooks.on_done(&t);
        let states = recorder.states.lock().unwrap();
        assert_eq!(states.len(), 2);
        let expected = ("n1".to_string(), NodeState::Deployed, Some("debian12".to_string()));
        assert_eq!(states[0], expected);
        assert_eq!(nodes.get("n2").unwrap().status().state, "deployed");

        let metrics = recorder.metrics.lock().unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].kind, MetricKind::Duration(Duration::from_millis(30)));
        assert_eq!(metrics[0].hostnames, vec!["n1", "n2"]);
    }

    #[test]
    fn test_retry_emits_retry_metric_and_warning() {
        let recorder = Arc::new(Recorder::default());
        let hooks = hooks(&recorder);
        let nodes = nodes();
        let step = StepConfig::new("format").with_retries(2);
        let t = Transition {
            manager: "c",
            depth: 0,
            step: &step,
            position: Position::START,
            attempt: 1,
            nodes: &nodes,
            elapsed: None,
        };

        hooks.on_retry(&t);
        let logs = recorder.logs.lock().unwrap();
        assert_eq!(logs[0].level, Level::WARN);
        assert_eq!(logs[0].nodeset, nodes.id());
        assert!(logs[0].message.contains("retrying step 'format'"));
        assert_eq!(recorder.metrics.lock().unwrap()[0].kind, MetricKind::Retries(1));
    }

    #[test]
    fn test_kill_marks_nodes_aborted() {
        let recorder = Arc::new(Recorder::default());
        let hooks = hooks(&recorder);
        let nodes = nodes();

        hooks.on_kill("c", 0, &nodes);
        let states = recorder.states.lock().unwrap();
        assert!(states.iter().all(|(_, s, _)| *s == NodeState::Aborted));
        assert_eq!(nodes.get("n1").unwrap().status().state, "aborted");
    }
}
