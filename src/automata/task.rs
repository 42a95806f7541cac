//! Task capability and the node bookkeeping shared by every task kind.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use tracing::debug;

use super::{EngineOptions, Status, TaskFactory, TransitionHooks};
use crate::lock_unpoisoned;
use crate::nodeset::NodeSet;
use crate::plan::{Position, StepConfig};
use crate::step::Cancellation;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique task identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// The parts of a task a manager needs to interpret one of its events.
#[derive(Debug, Clone)]
pub struct TaskRef {
    pub id: TaskId,
    pub step: String,
    pub position: Position,
    /// Zero-based attempt number (retries already used).
    pub attempt: u32,
    /// Group id of the node set the task was created for.
    pub group: u64,
    /// When the task was created.
    pub started: Instant,
}

/// Progress report pushed by a task onto its manager's queue.
#[derive(Debug, Clone)]
pub struct QueueEvent {
    pub task: TaskRef,
    pub status: Status,
    pub nodes: NodeSet,
}

/// Everything a [`TaskFactory`] needs to build a task.
#[derive(Clone)]
pub struct TaskSpec {
    /// Name of the creating manager, used for thread names and logs.
    pub manager: String,
    /// Nesting depth of the creating manager (0 for the outermost).
    pub depth: usize,
    pub step: Arc<StepConfig>,
    pub position: Position,
    pub attempt: u32,
    pub nodes: NodeSet,
    pub queue: Sender<QueueEvent>,
    /// Factory of the creating manager, reused by nested managers.
    pub factory: Arc<dyn TaskFactory>,
    /// Hooks of the creating manager, forwarded to nested managers.
    pub hooks: Arc<dyn TransitionHooks>,
    pub options: EngineOptions,
}

#[derive(Debug)]
struct TaskNodes {
    working: NodeSet,
    ok: NodeSet,
    ko: NodeSet,
    brk: NodeSet,
}

/// Node bookkeeping and the queue channel of one task.
///
/// `working` holds the nodes the task still owns. Raising nodes moves them
/// out of `working` under the task's lock before the event is queued, so a
/// node is handed back to the manager at most once per task.
pub struct TaskCore {
    id: TaskId,
    step: Arc<StepConfig>,
    position: Position,
    attempt: u32,
    original: NodeSet,
    nodes: Mutex<TaskNodes>,
    queue: Sender<QueueEvent>,
    cancel: Cancellation,
    started: Instant,
}

impl TaskCore {
    pub fn new(spec: &TaskSpec) -> Self {
        let original = spec.nodes.clone();
        Self {
            id: TaskId::next(),
            step: Arc::clone(&spec.step),
            position: spec.position,
            attempt: spec.attempt,
            nodes: Mutex::new(TaskNodes {
                working: original.clone(),
                ok: original.empty_like(),
                ko: original.empty_like(),
                brk: original.empty_like(),
            }),
            original,
            queue: spec.queue.clone(),
            cancel: Cancellation::new(),
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.step.name
    }

    pub fn step(&self) -> &StepConfig {
        &self.step
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn task_ref(&self) -> TaskRef {
        TaskRef {
            id: self.id,
            step: self.step.name.clone(),
            position: self.position,
            attempt: self.attempt,
            group: self.original.id(),
            started: self.started,
        }
    }

    /// Nodes the task still owns.
    pub fn nodes(&self) -> NodeSet {
        lock_unpoisoned(&self.nodes).working.clone()
    }

    pub fn nodes_ok(&self) -> NodeSet {
        lock_unpoisoned(&self.nodes).ok.clone()
    }

    pub fn nodes_ko(&self) -> NodeSet {
        lock_unpoisoned(&self.nodes).ko.clone()
    }

    pub fn nodes_brk(&self) -> NodeSet {
        lock_unpoisoned(&self.nodes).brk.clone()
    }

    /// Sender of the owning manager's queue.
    pub fn queue(&self) -> &Sender<QueueEvent> {
        &self.queue
    }

    pub fn cancellation(&self) -> Cancellation {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Hands `nodes` back to the manager with the given status.
    ///
    /// Only nodes the task still owns are raised; the others are ignored.
    /// When the raised nodes are a strict subset of the task's original set
    /// the event carries a fresh group id, marking a split. Returns the
    /// raised nodes.
    pub fn raise_nodes(&self, nodes: &NodeSet, status: Status) -> NodeSet {
        let mut guard = lock_unpoisoned(&self.nodes);
        self.raise_locked(&mut guard, nodes, status)
    }

    /// Raises every node still owned as KO, recording `reason` on each.
    pub fn fail_remaining(&self, reason: &str) -> NodeSet {
        let mut guard = lock_unpoisoned(&self.nodes);
        let remaining = guard.working.clone();
        if remaining.is_empty() {
            return remaining;
        }
        remaining.record_error(reason);
        self.raise_locked(&mut guard, &remaining, Status::Ko)
    }

    /// Forgets nodes the manager has consumed.
    pub fn clean_nodes(&self, nodes: &NodeSet) {
        let mut guard = lock_unpoisoned(&self.nodes);
        guard.working.remove_all(nodes);
        guard.ok.remove_all(nodes);
        guard.ko.remove_all(nodes);
        guard.brk.remove_all(nodes);
    }

    fn raise_locked(&self, guard: &mut TaskNodes, nodes: &NodeSet, status: Status) -> NodeSet {
        let mut raised = nodes.intersect(&guard.working);
        if raised.is_empty() {
            return raised;
        }
        guard.working.remove_all(&raised);
        match status {
            Status::Ok => guard.ok.add(&raised),
            Status::Ko => guard.ko.add(&raised),
            Status::Breakpoint => guard.brk.add(&raised),
        }
        if raised.same_members(&self.original) {
            raised.set_id(self.original.id());
        }

        let event = QueueEvent {
            task: self.task_ref(),
            status,
            nodes: raised.clone(),
        };
        if self.queue.send(event).is_err() {
            debug!(task = %self.id, step = %self.step.name, "manager queue closed, event dropped");
        }
        raised
    }
}

impl fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCore")
            .field("id", &self.id)
            .field("step", &self.step.name)
            .field("position", &self.position)
            .field("attempt", &self.attempt)
            .field("nodes", &self.original)
            .finish()
    }
}

/// A unit of work bound to a node set and a step position.
pub trait Task: Send + Sync {
    fn core(&self) -> &TaskCore;

    /// Processes the task's nodes, raising their outcome through
    /// [`TaskCore::raise_nodes`]. Runs on a dedicated thread.
    fn run(&self) -> Result<()>;

    /// Asks a running `run` to stop and releases its external resources.
    fn kill(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automata::{NoopHooks, StepTaskFactory};
    use crate::node::NodeArena;
    use crate::step::StepRegistry;
    use std::sync::mpsc;

    fn spec(nodes: NodeSet, queue: Sender<QueueEvent>) -> TaskSpec {
        TaskSpec {
            manager: "test".to_string(),
            depth: 0,
            step: Arc::new(StepConfig::new("noop")),
            position: Position::START,
            attempt: 0,
            nodes,
            queue,
            factory: Arc::new(StepTaskFactory::new(Arc::new(StepRegistry::with_builtins()))),
            hooks: Arc::new(NoopHooks),
            options: EngineOptions::default(),
        }
    }

    fn arena() -> Arc<NodeArena> {
        Arc::new(NodeArena::from_nodes([("n1", "c"), ("n2", "c"), ("n3", "c")]).unwrap())
    }

    #[test]
    fn test_raise_whole_set_keeps_group_id() {
        let arena = arena();
        let nodes = NodeSet::all(Arc::clone(&arena));
        let (tx, rx) = mpsc::channel();
        let core = TaskCore::new(&spec(nodes.clone(), tx));

        let raised = core.raise_nodes(&nodes, Status::Ok);
        assert_eq!(raised.id(), nodes.id());
        let event = rx.try_recv().unwrap();
        assert_eq!(event.status, Status::Ok);
        assert_eq!(event.nodes.id(), event.task.group);
        assert!(core.nodes().is_empty());
        assert_eq!(core.nodes_ok().len(), 3);
    }

    #[test]
    fn test_partial_raise_is_a_split() {
        let arena = arena();
        let nodes = NodeSet::all(Arc::clone(&arena));
        let (tx, rx) = mpsc::channel();
        let core = TaskCore::new(&spec(nodes.clone(), tx));

        let some = NodeSet::from_hostnames(Arc::clone(&arena), ["n1"]);
        core.raise_nodes(&some, Status::Ko);
        let event = rx.try_recv().unwrap();
        assert_ne!(event.nodes.id(), event.task.group);
        assert_eq!(core.nodes().hostnames(), vec!["n2", "n3"]);
        assert_eq!(core.nodes_ko().hostnames(), vec!["n1"]);
    }

    #[test]
    fn test_nodes_are_raised_once() {
        let arena = arena();
        let nodes = NodeSet::all(Arc::clone(&arena));
        let (tx, rx) = mpsc::channel();
        let core = TaskCore::new(&spec(nodes.clone(), tx));

        let some = NodeSet::from_hostnames(Arc::clone(&arena), ["n1", "n2"]);
        assert_eq!(core.raise_nodes(&some, Status::Ok).len(), 2);
        assert!(core.raise_nodes(&some, Status::Ko).is_empty());
        let failed = core.fail_remaining("timed out");
        assert_eq!(failed.hostnames(), vec!["n3"]);

        let events: Vec<QueueEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        let n3 = arena.get(arena.lookup("n3").unwrap()).unwrap();
        assert_eq!(n3.status().last_error.as_deref(), Some("timed out"));
    }

    #[test]
    fn test_clean_nodes_forgets_consumed_nodes() {
        let arena = arena();
        let nodes = NodeSet::all(Arc::clone(&arena));
        let (tx, _rx) = mpsc::channel();
        let core = TaskCore::new(&spec(nodes.clone(), tx));

        core.raise_nodes(&nodes, Status::Breakpoint);
        assert_eq!(core.nodes_brk().len(), 3);
        core.clean_nodes(&nodes);
        assert!(core.nodes_brk().is_empty());
    }
}
