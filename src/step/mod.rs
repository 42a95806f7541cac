//! Step catalogue interface.
//!
//! A step is the smallest named unit of work. The engine never calls steps
//! by method name: phase tables reference catalogue entries that are looked
//! up in a [`StepRegistry`] when the configuration is loaded, so unknown
//! names fail before any node is touched.

pub mod builtin;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use crate::automata::{Status, TaskCore};
use crate::error::DeployError;
use crate::node::{NodeId, NodeRef};
use crate::nodeset::NodeSet;
use crate::plan::StepConfig;

/// Shared cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a step hands back: a partition of its input nodes.
///
/// A node listed as both OK and KO counts as KO. Input nodes left out of
/// every list are treated as KO by the engine.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    ok: NodeSet,
    ko: NodeSet,
    brk: NodeSet,
}

impl StepOutcome {
    /// Empty outcome over the arena of `nodes`.
    pub fn new(nodes: &NodeSet) -> Self {
        Self {
            ok: nodes.empty_like(),
            ko: nodes.empty_like(),
            brk: nodes.empty_like(),
        }
    }

    pub fn all_ok(nodes: &NodeSet) -> Self {
        let mut outcome = Self::new(nodes);
        outcome.ok.add(nodes);
        outcome
    }

    /// Every node KO with the same failure message.
    pub fn all_ko(nodes: &NodeSet, reason: &str) -> Self {
        let mut outcome = Self::new(nodes);
        nodes.record_error(reason);
        outcome.ko.add(nodes);
        outcome
    }

    pub fn ok(&mut self, node: NodeId) {
        self.ok.push(node);
    }

    /// Marks a node KO and records why on the node.
    pub fn ko(&mut self, node: NodeId, reason: impl Into<String>) {
        if let Some(n) = self.ko.arena().get(node) {
            n.record_error(reason);
        }
        self.ko.push(node);
    }

    pub fn breakpoint(&mut self, node: NodeId) {
        self.brk.push(node);
    }

    pub fn ok_nodes(&self) -> &NodeSet {
        &self.ok
    }

    pub fn ko_nodes(&self) -> &NodeSet {
        &self.ko
    }

    pub fn breakpoint_nodes(&self) -> &NodeSet {
        &self.brk
    }
}

/// Everything a step may look at or act on while it runs.
pub struct StepContext<'a> {
    task: &'a TaskCore,
    nodes: NodeSet,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(task: &'a TaskCore, nodes: NodeSet) -> Self {
        Self { task, nodes }
    }

    /// Configured name of the running step.
    pub fn step_name(&self) -> &str {
        &self.task.step().name
    }

    pub fn config(&self) -> &StepConfig {
        self.task.step()
    }

    /// Positional parameters from the configuration.
    pub fn params(&self) -> &[String] {
        &self.task.step().params
    }

    /// Nodes this attempt works on.
    pub fn nodes(&self) -> &NodeSet {
        &self.nodes
    }

    /// Zero-based attempt number for this step on these nodes.
    pub fn attempt(&self) -> u32 {
        self.task.attempt()
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    pub fn cancellation(&self) -> Cancellation {
        self.task.cancellation()
    }

    /// Reports part of the outcome before the step returns, letting the
    /// manager move those nodes on immediately. Returns the nodes actually
    /// handed over (those not already reported).
    pub fn report(&self, nodes: &NodeSet, status: Status) -> NodeSet {
        self.task.raise_nodes(nodes, status)
    }

    /// Convenience accessor for a node by hostname.
    pub fn node(&self, hostname: &str) -> Option<NodeRef<'_>> {
        self.nodes.get(hostname)
    }
}

/// A catalogue entry instance, created once per task attempt.
pub trait Step: Send + Sync {
    /// Performs the work against `ctx.nodes()` and partitions them.
    ///
    /// Returning an error marks every node still owned by the attempt KO.
    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome>;

    /// Releases external resources (child processes, sockets) of a running
    /// attempt. Called from another thread while `run` may be in progress.
    fn kill(&self) {}
}

/// Builds a step instance from its positional parameters.
pub type StepConstructor = Arc<dyn Fn(&[String]) -> Result<Box<dyn Step>> + Send + Sync>;

/// Name → constructor map of the available steps.
#[derive(Clone, Default)]
pub struct StepRegistry {
    constructors: BTreeMap<String, StepConstructor>,
}

impl StepRegistry {
    /// Registry without any step.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in steps backed by real command execution.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_builtins(&mut registry, builtin::default_executor());
        registry
    }

    /// Registers (or replaces) a constructor.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&[String]) -> Result<Box<dyn Step>> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Creates a step instance.
    pub fn instantiate(&self, name: &str, params: &[String]) -> Result<Box<dyn Step>, DeployError> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| DeployError::unknown_step(name, "the step registry"))?;
        constructor(params).map_err(|e| DeployError::InvalidStepParams {
            step: name.to_string(),
            reason: format!("{:#}", e),
        })
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}
