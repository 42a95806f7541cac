use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use pxedeploy::automata::{
    EngineOptions, StepTaskFactory, TaskFactory, TaskManager, Transition, TransitionHooks,
};
use pxedeploy::node::NodeArena;
use pxedeploy::nodeset::NodeSet;
use pxedeploy::plan::Plan;
use pxedeploy::step::{Step, StepContext, StepOutcome, StepRegistry};

/// What a scripted step reports for one node on one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Verdict {
    Ok,
    Ko,
    /// Reported both OK and KO.
    Both,
    Break,
    /// Not reported at all.
    Silent,
    /// Sleeps a little, then OK.
    Slow,
    /// Blocks until the attempt is cancelled.
    Hang,
    /// The whole step returns an error.
    Error,
    /// The whole step panics.
    Panic,
}

pub type Script = Arc<dyn Fn(&str, u32) -> Verdict + Send + Sync>;

/// Ordered record of step invocations: `"name#attempt:host,host"`.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

#[allow(dead_code)]
impl Journal {
    fn record(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Number of invocations of `step`.
    pub fn count(&self, step: &str) -> usize {
        let prefix = format!("{}#", step);
        self.entries().iter().filter(|e| e.starts_with(&prefix)).count()
    }
}

struct ScriptedStep {
    name: String,
    script: Script,
    journal: Journal,
}

impl Step for ScriptedStep {
    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        let attempt = ctx.attempt();
        self.journal.record(format!(
            "{}#{}:{}",
            self.name,
            attempt,
            ctx.nodes().hostnames().join(",")
        ));

        let mut outcome = StepOutcome::new(ctx.nodes());
        for node in ctx.nodes().iter() {
            match (self.script)(node.hostname(), attempt) {
                Verdict::Ok => outcome.ok(node.id()),
                Verdict::Ko => outcome.ko(node.id(), "scripted failure"),
                Verdict::Both => {
                    outcome.ok(node.id());
                    outcome.ko(node.id(), "reported both ways");
                }
                Verdict::Break => outcome.breakpoint(node.id()),
                Verdict::Silent => {}
                Verdict::Slow => {
                    thread::sleep(Duration::from_millis(150));
                    outcome.ok(node.id());
                }
                Verdict::Hang => {
                    while !ctx.is_cancelled() {
                        thread::sleep(Duration::from_millis(5));
                    }
                    return Ok(StepOutcome::all_ok(ctx.nodes()));
                }
                Verdict::Error => bail!("scripted error"),
                Verdict::Panic => panic!("scripted panic"),
            }
        }
        Ok(outcome)
    }
}

/// Builds a registry of scripted steps sharing one journal.
#[derive(Default)]
pub struct Scenario {
    registry: StepRegistry,
    journal: Journal,
}

#[allow(dead_code)]
impl Scenario {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`, whose verdict per (hostname, attempt) is `script`.
    pub fn step<F>(mut self, name: &str, script: F) -> Self
    where
        F: Fn(&str, u32) -> Verdict + Send + Sync + 'static,
    {
        let script: Script = Arc::new(script);
        let journal = self.journal.clone();
        let step_name = name.to_string();
        self.registry.register(name, move |_| {
            Ok(Box::new(ScriptedStep {
                name: step_name.clone(),
                script: Arc::clone(&script),
                journal: journal.clone(),
            }) as Box<dyn Step>)
        });
        self
    }

    /// Registers `name` reporting `verdict` for every node and attempt.
    pub fn always(self, name: &str, verdict: Verdict) -> Self {
        self.step(name, move |_, _| verdict)
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    pub fn factory(&self) -> Arc<StepTaskFactory> {
        Arc::new(StepTaskFactory::new(Arc::new(self.registry.clone())))
    }
}

/// Engine options tuned for tests.
pub fn fast_options() -> EngineOptions {
    EngineOptions {
        poll_interval: Duration::from_millis(5),
        kill_grace: Duration::from_secs(2),
    }
}

/// Arena of nodes in the default cluster.
pub fn arena(hostnames: &[&str]) -> Arc<NodeArena> {
    Arc::new(NodeArena::from_nodes(hostnames.iter().map(|h| (*h, ""))).unwrap())
}

#[allow(dead_code)]
pub fn manager(plan: Plan, arena: &Arc<NodeArena>, factory: Arc<dyn TaskFactory>) -> TaskManager {
    TaskManager::new("test", Arc::new(plan), NodeSet::all(Arc::clone(arena)), factory)
        .with_options(fast_options())
}

/// Hostnames of a set, sorted.
#[allow(dead_code)]
pub fn sorted(set: &NodeSet) -> Vec<String> {
    let mut hostnames = set.hostnames();
    hostnames.sort();
    hostnames
}

/// One hook invocation.
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEvent {
    pub kind: &'static str,
    pub depth: usize,
    pub step: String,
    pub attempt: u32,
    pub group: u64,
    pub hosts: Vec<String>,
}

/// Hooks recording every transition in order.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct RecordingHooks {
    events: Mutex<Vec<HookEvent>>,
}

#[allow(dead_code)]
impl RecordingHooks {
    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn of_kind(&self, kind: &str) -> Vec<HookEvent> {
        self.events().into_iter().filter(|e| e.kind == kind).collect()
    }

    fn push(&self, kind: &'static str, t: &Transition<'_>) {
        self.events.lock().unwrap().push(HookEvent {
            kind,
            depth: t.depth,
            step: t.step.name.clone(),
            attempt: t.attempt,
            group: t.nodes.id(),
            hosts: sorted(t.nodes),
        });
    }
}

impl TransitionHooks for RecordingHooks {
    fn on_start(&self, t: &Transition<'_>) {
        self.push("start", t);
    }

    fn on_success(&self, t: &Transition<'_>) {
        self.push("success", t);
    }

    fn on_retry(&self, t: &Transition<'_>) {
        self.push("retry", t);
    }

    fn on_timeout(&self, t: &Transition<'_>) {
        self.push("timeout", t);
    }

    fn on_split(&self, t: &Transition<'_>, _previous_group: u64) {
        self.push("split", t);
    }

    fn on_break(&self, t: &Transition<'_>) {
        self.push("break", t);
    }

    fn on_fail(&self, t: &Transition<'_>) {
        self.push("fail", t);
    }

    fn on_done(&self, t: &Transition<'_>) {
        self.push("done", t);
    }

    fn on_kill(&self, _manager: &str, depth: usize, nodes: &NodeSet) {
        self.events.lock().unwrap().push(HookEvent {
            kind: "kill",
            depth,
            step: String::new(),
            attempt: 0,
            group: nodes.id(),
            hosts: sorted(nodes),
        });
    }
}
