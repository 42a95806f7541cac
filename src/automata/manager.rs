//! The task manager state machine.
//!
//! One controller thread (the caller of [`TaskManager::start`]) owns the
//! bookkeeping. Tasks run on their own threads and only talk back through the
//! queue, so every scheduling decision is serialized while node sets of
//! different branches execute concurrently.
//!
//! Lock order: `running` and `accounting` are never held at the same time.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, error, info, warn};

use super::{
    EngineOptions, NoopHooks, QueueEvent, RunOutcome, Status, Task, TaskFactory, TaskId, TaskRef,
    TaskSpec, Transition, TransitionHooks,
};
use crate::error::DeployError;
use crate::executor::panic_message;
use crate::lock_unpoisoned;
use crate::node::NodeId;
use crate::nodeset::NodeSet;
use crate::plan::{Plan, Position, StepConfig};

/// Sleep between liveness checks while awaiting a cancelled thread.
const JOIN_POLL: Duration = Duration::from_millis(5);

/// Terminal accumulators plus the current owner of every in-flight node.
struct Accounting {
    ok: NodeSet,
    ko: NodeSet,
    brk: NodeSet,
    done: NodeSet,
    owners: HashMap<NodeId, TaskId>,
}

struct RunningTask {
    task: Arc<dyn Task>,
    handle: JoinHandle<Result<()>>,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct Running {
    killed: bool,
    tasks: Vec<RunningTask>,
    /// Timed-out tasks, killed but not yet joined.
    zombies: Vec<RunningTask>,
}

/// Drives a node population through a [`Plan`].
pub struct TaskManager {
    name: String,
    depth: usize,
    plan: Arc<Plan>,
    universe: NodeSet,
    factory: Arc<dyn TaskFactory>,
    hooks: Arc<dyn TransitionHooks>,
    child_hooks: Arc<dyn TransitionHooks>,
    options: EngineOptions,
    queue: Sender<QueueEvent>,
    receiver: Mutex<Option<Receiver<QueueEvent>>>,
    accounting: Mutex<Accounting>,
    running: Mutex<Running>,
    killed: AtomicBool,
}

impl TaskManager {
    pub fn new(
        name: impl Into<String>,
        plan: Arc<Plan>,
        nodes: NodeSet,
        factory: Arc<dyn TaskFactory>,
    ) -> Self {
        let (queue, receiver) = mpsc::channel();
        let accounting = Accounting {
            ok: nodes.empty_like(),
            ko: nodes.empty_like(),
            brk: nodes.empty_like(),
            done: nodes.empty_like(),
            owners: HashMap::new(),
        };
        let hooks: Arc<dyn TransitionHooks> = Arc::new(NoopHooks);
        Self {
            name: name.into(),
            depth: 0,
            plan,
            universe: nodes,
            factory,
            child_hooks: Arc::clone(&hooks),
            hooks,
            options: EngineOptions::default(),
            queue,
            receiver: Mutex::new(Some(receiver)),
            accounting: Mutex::new(accounting),
            running: Mutex::new(Running::default()),
            killed: AtomicBool::new(false),
        }
    }

    /// Sets the hooks of this manager and of every manager nested below it.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn TransitionHooks>) -> Self {
        self.child_hooks = Arc::clone(&hooks);
        self.hooks = hooks;
        self
    }

    /// Sets only the hooks handed to nested managers.
    #[must_use]
    pub(crate) fn with_child_hooks(mut self, hooks: Arc<dyn TransitionHooks>) -> Self {
        self.child_hooks = hooks;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub(crate) fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Every node this manager is responsible for.
    pub fn nodes(&self) -> &NodeSet {
        &self.universe
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// True once every node is OK, KO or breakpointed.
    pub fn is_done(&self) -> bool {
        lock_unpoisoned(&self.accounting).done.len() >= self.universe.len()
    }

    /// Snapshot of the accumulators.
    pub fn outcome(&self) -> RunOutcome {
        let acc = lock_unpoisoned(&self.accounting);
        RunOutcome {
            ok: acc.ok.clone(),
            ko: acc.ko.clone(),
            brk: acc.brk.clone(),
        }
    }

    /// Runs the state machine until every node reached a terminal state.
    ///
    /// Fails without touching any node when the plan is rejected by the
    /// factory, or when the manager was already started.
    pub fn start(&self) -> Result<RunOutcome, DeployError> {
        let receiver = lock_unpoisoned(&self.receiver)
            .take()
            .ok_or_else(|| DeployError::AlreadyStarted(self.name.clone()))?;
        self.factory.validate(&self.plan)?;

        info!(
            manager = %self.name,
            depth = self.depth,
            nodes = self.universe.len(),
            phases = self.plan.phase_count(),
            "starting task manager"
        );

        if !self.universe.is_empty() && !self.is_killed() {
            self.dispatch(Position::START, 0, self.universe.clone());
        }

        while !self.is_killed() && !self.is_done() {
            match receiver.recv_timeout(self.poll_timeout()) {
                Ok(event) => self.consume(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.reap();
        }

        if self.is_killed() {
            self.fold_unresolved("deployment aborted");
        }
        self.drain_running();

        let outcome = self.outcome();
        info!(
            manager = %self.name,
            depth = self.depth,
            "task manager finished: {}",
            outcome.summary()
        );
        Ok(outcome)
    }

    /// Cancels the run: kills and awaits every task thread (nested managers
    /// included), then folds every unresolved node into KO.
    ///
    /// Safe to call from any thread except from inside a hook.
    pub fn kill(&self) {
        let (tasks, zombies) = {
            let mut running = lock_unpoisoned(&self.running);
            if running.killed {
                return;
            }
            running.killed = true;
            self.killed.store(true, Ordering::SeqCst);
            (mem::take(&mut running.tasks), mem::take(&mut running.zombies))
        };

        warn!(manager = %self.name, tasks = tasks.len(), "killing task manager");
        for entry in tasks.iter().chain(&zombies) {
            entry.task.kill();
        }
        for entry in tasks.into_iter().chain(zombies) {
            self.await_task(entry);
        }

        self.fold_unresolved("deployment aborted");
    }

    fn transition<'a>(
        &'a self,
        step: &'a StepConfig,
        position: Position,
        attempt: u32,
        nodes: &'a NodeSet,
        elapsed: Option<Duration>,
    ) -> Transition<'a> {
        Transition {
            manager: &self.name,
            depth: self.depth,
            step,
            position,
            attempt,
            nodes,
            elapsed,
        }
    }

    /// Handles one queue event (step 2 of the controller loop).
    fn consume(&self, event: QueueEvent) {
        let QueueEvent {
            task,
            status,
            nodes,
        } = event;
        self.acknowledge(task.id, &nodes);

        // Only the current owner may move a node on; anything else is a
        // duplicate or a late report for nodes settled by other means.
        let accepted = {
            let mut acc = lock_unpoisoned(&self.accounting);
            let mut accepted = nodes.empty_like();
            accepted.set_id(nodes.id());
            for &id in nodes.ids() {
                if acc.owners.get(&id) == Some(&task.id) {
                    acc.owners.remove(&id);
                    accepted.push(id);
                }
            }
            accepted
        };

        if accepted.is_empty() {
            debug!(
                manager = %self.name,
                task = %task.id,
                status = %status,
                nodes = %nodes,
                "ignoring event for nodes already accounted for"
            );
            return;
        }

        let Some(step) = self.plan.step_at(task.position).cloned() else {
            warn!(
                manager = %self.name,
                position = %task.position,
                "event refers to no step of the plan, failing its nodes"
            );
            accepted.record_error("event refers to an unknown step position");
            self.settle(&accepted, Status::Ko);
            return;
        };

        let elapsed = Some(task.started.elapsed());
        let t = self.transition(&step, task.position, task.attempt, &accepted, elapsed);

        if accepted.id() != task.group {
            debug!(
                manager = %self.name,
                step = %step.name,
                from = task.group,
                to = accepted.id(),
                nodes = %accepted,
                "node set split"
            );
            self.hooks.on_split(&t, task.group);
        }

        match status {
            Status::Breakpoint => self.finish(&t, Status::Breakpoint),
            Status::Ok => {
                self.hooks.on_success(&t);
                if self.plan.is_last_phase(task.position) {
                    self.finish(&t, Status::Ok);
                } else {
                    self.dispatch(task.position.next_phase(), 0, accepted.clone());
                }
            }
            Status::Ko => self.handle_failure(&task, &step, &accepted, elapsed),
        }
    }

    /// Retry, fall back to the next variant, or give up.
    fn handle_failure(
        &self,
        task: &TaskRef,
        step: &StepConfig,
        nodes: &NodeSet,
        elapsed: Option<Duration>,
    ) {
        let position = task.position;

        if task.attempt < step.retries {
            let attempt = task.attempt + 1;
            info!(
                manager = %self.name,
                step = %step.name,
                nodes = %nodes,
                "retrying step (attempt {}/{})",
                attempt + 1,
                step.retries + 1
            );
            self.hooks
                .on_retry(&self.transition(step, position, attempt, nodes, None));
            self.dispatch(position, attempt, nodes.clone());
            return;
        }

        let fallback = position.next_variant();
        if let Some(next) = self.plan.step_at(fallback).cloned() {
            info!(
                manager = %self.name,
                failed = %step.name,
                fallback = %next.name,
                nodes = %nodes,
                "step exhausted its retries, falling back to next variant"
            );
            self.hooks
                .on_retry(&self.transition(&next, fallback, 0, nodes, None));
            self.dispatch(fallback, 0, nodes.clone());
            return;
        }

        let t = self.transition(step, position, task.attempt, nodes, elapsed);
        self.finish(&t, Status::Ko);
    }

    /// Starts the step at `position` for `nodes`.
    fn dispatch(&self, position: Position, attempt: u32, nodes: NodeSet) {
        let Some(step) = self.plan.step_at(position).cloned() else {
            warn!(manager = %self.name, position = %position, "no step at position, failing nodes");
            nodes.record_error("no step configured at this position");
            self.settle(&nodes, Status::Ko);
            return;
        };
        let t = self.transition(&step, position, attempt, &nodes, None);

        if step.breakpoint {
            info!(manager = %self.name, step = %step.name, nodes = %nodes, "breakpoint reached");
            self.finish(&t, Status::Breakpoint);
            return;
        }

        let spec = TaskSpec {
            manager: self.name.clone(),
            depth: self.depth,
            step: Arc::clone(&step),
            position,
            attempt,
            nodes: nodes.clone(),
            queue: self.queue.clone(),
            factory: Arc::clone(&self.factory),
            hooks: Arc::clone(&self.child_hooks),
            options: self.options,
        };

        match self.factory.create_task(spec) {
            Ok(task) => self.spawn(task, &t),
            Err(e) => {
                let reason = format!("failed to create task for step '{}': {:#}", step.name, e);
                warn!(manager = %self.name, step = %step.name, "{}", reason);
                self.fail_without_task(&t, &reason);
            }
        }
    }

    /// Feeds a KO event for nodes that never got a task, so the usual
    /// retry policy applies.
    fn fail_without_task(&self, t: &Transition<'_>, reason: &str) {
        let id = TaskId::next();
        {
            let mut acc = lock_unpoisoned(&self.accounting);
            for &node in t.nodes.ids() {
                acc.owners.insert(node, id);
            }
        }
        t.nodes.record_error(reason);
        let event = QueueEvent {
            task: TaskRef {
                id,
                step: t.step.name.clone(),
                position: t.position,
                attempt: t.attempt,
                group: t.nodes.id(),
                started: Instant::now(),
            },
            status: Status::Ko,
            nodes: t.nodes.clone(),
        };
        if self.queue.send(event).is_err() {
            debug!(manager = %self.name, "own queue closed, dropping synthetic failure");
        }
    }

    fn spawn(&self, task: Arc<dyn Task>, t: &Transition<'_>) {
        let task_id = task.core().id();
        {
            let mut acc = lock_unpoisoned(&self.accounting);
            for &node in t.nodes.ids() {
                acc.owners.insert(node, task_id);
            }
        }
        debug!(
            manager = %self.name,
            task = %task_id,
            step = %t.step.name,
            attempt = t.attempt,
            nodes = %t.nodes,
            "starting task"
        );
        self.hooks.on_start(t);

        let mut running = lock_unpoisoned(&self.running);
        if running.killed {
            debug!(manager = %self.name, task = %task_id, "manager killed, task not started");
            return;
        }

        let runner = Arc::clone(&task);
        let spawned = thread::Builder::new()
            .name(format!("{}@{}", t.step.name, t.position))
            .spawn(move || runner.run());
        match spawned {
            Ok(handle) => {
                let deadline = t.step.timeout.map(|timeout| Instant::now() + timeout);
                running.tasks.push(RunningTask {
                    task,
                    handle,
                    deadline,
                });
            }
            Err(e) => {
                drop(running);
                error!(
                    manager = %self.name,
                    step = %t.step.name,
                    "failed to spawn task thread: {}",
                    e
                );
                task.core()
                    .fail_remaining(&format!("failed to spawn task thread: {}", e));
            }
        }
    }

    /// Lets a still-running task forget nodes the manager has consumed.
    fn acknowledge(&self, task: TaskId, nodes: &NodeSet) {
        let running = lock_unpoisoned(&self.running);
        if let Some(entry) = running.tasks.iter().find(|e| e.task.core().id() == task) {
            entry.task.core().clean_nodes(nodes);
        }
    }

    /// Collects finished threads and kills tasks past their deadline.
    ///
    /// Expired tasks move to `zombies` under the same lock `kill` takes.
    fn reap(&self) {
        let now = Instant::now();
        let (finished, expired) = {
            let mut running = lock_unpoisoned(&self.running);
            let mut finished = Vec::new();
            let mut expired = Vec::new();
            let mut i = 0;
            while i < running.tasks.len() {
                let is_finished = running.tasks[i].handle.is_finished();
                let is_expired = running.tasks[i].deadline.is_some_and(|d| now >= d);
                if is_finished {
                    finished.push(running.tasks.swap_remove(i));
                } else if is_expired {
                    let entry = running.tasks.swap_remove(i);
                    expired.push(Arc::clone(&entry.task));
                    running.zombies.push(entry);
                } else {
                    i += 1;
                }
            }
            (finished, expired)
        };

        for entry in finished {
            self.collect_finished(entry);
        }
        for task in expired {
            self.expire(&task);
        }
    }

    /// Classifies how a task thread ended; nodes it still owns become KO.
    fn collect_finished(&self, entry: RunningTask) {
        let RunningTask { task, handle, .. } = entry;
        let core = task.core();
        match handle.join() {
            Ok(Ok(())) => {
                let leftover = core.fail_remaining(&format!(
                    "step '{}' finished without reporting this node",
                    core.name()
                ));
                if !leftover.is_empty() {
                    warn!(
                        manager = %self.name,
                        step = %core.name(),
                        nodes = %leftover,
                        "task returned without reporting some nodes, marking them KO"
                    );
                }
            }
            Ok(Err(e)) => {
                warn!(
                    manager = %self.name,
                    step = %core.name(),
                    error = %format!("{:#}", e),
                    "step execution failed, its nodes are KO"
                );
                core.fail_remaining(&format!("step '{}' failed: {:#}", core.name(), e));
            }
            Err(payload) => {
                let msg = panic_message(&*payload);
                error!(
                    manager = %self.name,
                    step = %core.name(),
                    panic = msg,
                    "task thread panicked"
                );
                core.fail_remaining(&format!("step '{}' panicked: {}", core.name(), msg));
            }
        }
    }

    /// Kills a task past its deadline and fails every node it still owns.
    fn expire(&self, task: &Arc<dyn Task>) {
        let core = task.core();
        let nodes = core.nodes();
        let timeout = core.step().timeout.unwrap_or_default();

        warn!(
            manager = %self.name,
            step = %core.name(),
            nodes = %nodes,
            "step timed out after {:?}, killing it",
            timeout
        );
        self.hooks.on_timeout(&self.transition(
            core.step(),
            core.position(),
            core.attempt(),
            &nodes,
            Some(timeout),
        ));

        task.kill();
        core.fail_remaining(&format!("step '{}' timed out after {:?}", core.name(), timeout));
    }

    /// Settles nodes terminally and notifies the matching hook.
    fn finish(&self, t: &Transition<'_>, status: Status) {
        let settled = self.settle(t.nodes, status);
        if settled.is_empty() {
            return;
        }
        let t = Transition {
            nodes: &settled,
            ..*t
        };
        match status {
            Status::Ok => {
                info!(manager = %self.name, nodes = %settled, "nodes completed every phase");
                self.hooks.on_done(&t);
            }
            Status::Ko => {
                warn!(manager = %self.name, step = %t.step.name, nodes = %settled, "nodes failed");
                self.hooks.on_fail(&t);
            }
            Status::Breakpoint => self.hooks.on_break(&t),
        }
    }

    /// Moves the nodes not yet done into the accumulator for `status`.
    fn settle(&self, nodes: &NodeSet, status: Status) -> NodeSet {
        let mut acc = lock_unpoisoned(&self.accounting);
        let mut settled = nodes.diff(&acc.done);
        settled.set_id(nodes.id());
        for id in settled.ids() {
            acc.owners.remove(id);
        }
        match status {
            Status::Ok => acc.ok.add(&settled),
            Status::Ko => acc.ko.add(&settled),
            Status::Breakpoint => acc.brk.add(&settled),
        }
        acc.done.add(&settled);
        settled
    }

    /// Marks every node not yet done as KO.
    fn fold_unresolved(&self, reason: &str) -> NodeSet {
        let folded = {
            let mut acc = lock_unpoisoned(&self.accounting);
            let unresolved = self.universe.diff(&acc.done);
            acc.ko.add(&unresolved);
            acc.done.add(&unresolved);
            acc.owners.clear();
            unresolved
        };
        if !folded.is_empty() {
            folded.record_error(reason);
            warn!(manager = %self.name, nodes = %folded, "unresolved nodes marked KO");
            self.hooks.on_kill(&self.name, self.depth, &folded);
        }
        folded
    }

    /// Kills whatever still runs and awaits every thread of this manager.
    fn drain_running(&self) {
        let (tasks, zombies) = {
            let mut running = lock_unpoisoned(&self.running);
            (mem::take(&mut running.tasks), mem::take(&mut running.zombies))
        };
        for entry in &tasks {
            if !entry.handle.is_finished() {
                entry.task.kill();
            }
        }
        for entry in tasks.into_iter().chain(zombies) {
            self.await_task(entry);
        }
    }

    /// Joins a task thread, giving up after the kill grace period.
    fn await_task(&self, entry: RunningTask) {
        let RunningTask { task, handle, .. } = entry;
        let label = task.core().name();
        let deadline = Instant::now() + self.options.kill_grace;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    manager = %self.name,
                    task = label,
                    "task thread ignored cancellation for {:?}, detaching it",
                    self.options.kill_grace
                );
                return;
            }
            thread::sleep(JOIN_POLL);
        }
        if let Err(payload) = handle.join() {
            warn!(
                manager = %self.name,
                task = label,
                panic = panic_message(&*payload),
                "task thread panicked"
            );
        }
    }

    /// Queue wait bounded by the poll interval and the nearest deadline.
    fn poll_timeout(&self) -> Duration {
        let now = Instant::now();
        let running = lock_unpoisoned(&self.running);
        running
            .tasks
            .iter()
            .filter_map(|e| e.deadline)
            .map(|d| d.saturating_duration_since(now))
            .min()
            .map_or(self.options.poll_interval, |d| {
                d.min(self.options.poll_interval)
            })
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("name", &self.name)
            .field("depth", &self.depth)
            .field("nodes", &self.universe)
            .finish()
    }
}
