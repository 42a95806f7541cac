//! Deployment file model and loader.
//!
//! The YAML file is deserialized as-is, then turned into the runtime types
//! ([`NodeArena`], [`Plan`], [`EngineOptions`]) by [`DeployConfig::arena`],
//! [`DeployConfig::plan`] and [`DeployConfig::engine_options`]. Every check
//! happens there, so a file that loads and validates can be run without a
//! configuration error surfacing mid-deployment.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use camino::Utf8Path;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::automata::EngineOptions;
use crate::error::DeployError;
use crate::node::NodeArena;
use crate::plan::{Phase, Plan, StepConfig};
use crate::step::StepRegistry;

type Pattern = LazyLock<Result<Regex, regex::Error>>;

static STEP_NAME: Pattern =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$"));

static HOSTNAME: Pattern =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9.-]*[A-Za-z0-9])?$"));

fn pattern(re: &'static Pattern) -> Result<&'static Regex, DeployError> {
    re.as_ref()
        .map_err(|e| DeployError::Config(format!("invalid built-in pattern: {}", e)))
}

fn default_poll_interval_ms() -> u64 {
    20
}

fn default_kill_grace_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

/// Root of a deployment file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployConfig {
    /// Identifier passed to the node state store with every transition.
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub engine: EngineConfig,
    pub nodes: Vec<NodeConfig>,
    /// Top-level phase table.
    pub phases: Vec<PhaseConfig>,
    #[serde(default)]
    pub steps: BTreeMap<String, StepEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub hostname: String,
    #[serde(default)]
    pub cluster: Option<String>,
}

/// A phase: one step name, or alternatives tried in order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PhaseConfig {
    Single(String),
    Alternatives(Vec<String>),
}

impl PhaseConfig {
    pub fn variants(&self) -> &[String] {
        match self {
            PhaseConfig::Single(name) => std::slice::from_ref(name),
            PhaseConfig::Alternatives(names) => names,
        }
    }
}

/// Scheduling policy and implementation of a named step.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepEntry {
    /// Seconds; 0 means unbounded.
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_true")]
    pub raisable: bool,
    #[serde(default)]
    pub breakpoint: bool,
    /// Catalogue entry; defaults to the step's own name.
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub params: Vec<String>,
    /// Nested phase table, run by a nested manager.
    #[serde(default)]
    pub phases: Option<Vec<PhaseConfig>>,
}

/// Loads a deployment file.
pub fn load_config(path: &Utf8Path) -> Result<DeployConfig, DeployError> {
    let file = File::open(path)
        .map_err(|e| DeployError::io(format!("failed to load file: {}", path), e))?;
    let reader = BufReader::new(file);
    serde_yaml::from_reader(reader)
        .map_err(|e| DeployError::Config(format!("failed to parse yaml: {}: {}", path, e)))
}

/// Parses a deployment file from a string.
pub fn parse_config(yaml: &str) -> Result<DeployConfig, DeployError> {
    serde_yaml::from_str(yaml)
        .map_err(|e| DeployError::Config(format!("failed to parse yaml: {}", e)))
}

impl DeployConfig {
    /// Runs every check without keeping the results.
    pub fn validate(&self, registry: &StepRegistry) -> Result<(), DeployError> {
        self.engine_options()?;
        self.arena()?;
        self.plan(registry)?;
        Ok(())
    }

    pub fn engine_options(&self) -> Result<EngineOptions, DeployError> {
        if self.engine.poll_interval_ms == 0 {
            return Err(DeployError::Config(
                "engine.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(EngineOptions {
            poll_interval: Duration::from_millis(self.engine.poll_interval_ms),
            kill_grace: Duration::from_millis(self.engine.kill_grace_ms),
        })
    }

    /// Builds the node arena, rejecting malformed and duplicate hostnames.
    pub fn arena(&self) -> Result<NodeArena, DeployError> {
        if self.nodes.is_empty() {
            return Err(DeployError::Config("at least one node must be configured".to_string()));
        }
        let hostname = pattern(&HOSTNAME)?;
        for node in &self.nodes {
            if !hostname.is_match(&node.hostname) {
                return Err(DeployError::Config(format!("invalid hostname '{}'", node.hostname)));
            }
        }
        NodeArena::from_nodes(
            self.nodes
                .iter()
                .map(|n| (n.hostname.as_str(), n.cluster.as_deref().unwrap_or_default())),
        )
    }

    /// Resolves the phase tables into a [`Plan`] and checks every leaf step
    /// against `registry`.
    pub fn plan(&self, registry: &StepRegistry) -> Result<Plan, DeployError> {
        let name = pattern(&STEP_NAME)?;
        if let Some(bad) = self.steps.keys().find(|k| !name.is_match(k)) {
            return Err(DeployError::Config(format!("invalid step name '{}'", bad)));
        }

        let mut builder = PlanBuilder {
            steps: &self.steps,
            registry,
            built: HashMap::new(),
            visiting: Vec::new(),
        };
        let plan = builder.build(&self.phases, "")?;
        plan.check_catalogue(registry)?;

        for unused in self.steps.keys().filter(|k| !builder.is_referenced(k, &self.phases)) {
            debug!(step = %unused, "configured step is not referenced by any phase table");
        }
        Ok(plan)
    }
}

/// Resolves phase tables recursively, sharing nested plans between the
/// phase tables that reference the same nested step.
struct PlanBuilder<'a> {
    steps: &'a BTreeMap<String, StepEntry>,
    registry: &'a StepRegistry,
    built: HashMap<String, Arc<Plan>>,
    /// Nested steps being resolved, outermost first.
    visiting: Vec<String>,
}

impl PlanBuilder<'_> {
    fn build(&mut self, phases: &[PhaseConfig], owner: &str) -> Result<Plan, DeployError> {
        let location = |i: usize| {
            if owner.is_empty() {
                format!("phase {}", i + 1)
            } else {
                format!("phase {} of step '{}'", i + 1, owner)
            }
        };
        if phases.is_empty() {
            return Err(DeployError::Config(if owner.is_empty() {
                "phase table must not be empty".to_string()
            } else {
                format!("phase table of step '{}' must not be empty", owner)
            }));
        }

        let mut table = Vec::with_capacity(phases.len());
        let mut configs: BTreeMap<String, StepConfig> = BTreeMap::new();
        for (i, phase) in phases.iter().enumerate() {
            let variants = phase.variants();
            if variants.is_empty() {
                return Err(DeployError::Config(format!(
                    "{} must list at least one step",
                    location(i)
                )));
            }
            for name in variants {
                if !configs.contains_key(name) {
                    let cfg = self.step_config(name, &location(i))?;
                    configs.insert(name.clone(), cfg);
                }
            }
            table.push(Phase::alternatives(variants.iter()));
        }
        Plan::new(table, configs.into_values())
    }

    fn step_config(&mut self, name: &str, context: &str) -> Result<StepConfig, DeployError> {
        let Some(entry) = self.steps.get(name) else {
            if self.registry.contains(name) {
                return Ok(StepConfig::new(name));
            }
            return Err(DeployError::unknown_step(name, context));
        };

        let mut cfg = StepConfig::new(name)
            .with_timeout_secs(entry.timeout)
            .with_retries(entry.retries)
            .with_raisable(entry.raisable)
            .with_breakpoint(entry.breakpoint)
            .with_params(entry.params.iter());

        match (&entry.step, &entry.phases) {
            (Some(_), Some(_)) => {
                return Err(DeployError::Config(format!(
                    "step '{}' cannot set both 'step' and 'phases'",
                    name
                )));
            }
            (None, Some(phases)) => {
                if !entry.params.is_empty() {
                    return Err(DeployError::Config(format!(
                        "step '{}' has a phase table and cannot take params",
                        name
                    )));
                }
                cfg.nested = Some(self.nested(name, phases)?);
            }
            (Some(kind), None) => cfg = cfg.with_kind(kind.as_str()),
            (None, None) => {}
        }

        if !cfg.is_nested() && !cfg.breakpoint && !self.registry.contains(&cfg.kind) {
            return Err(DeployError::unknown_step(&cfg.kind, format!("step '{}'", name)));
        }
        Ok(cfg)
    }

    fn nested(&mut self, name: &str, phases: &[PhaseConfig]) -> Result<Arc<Plan>, DeployError> {
        if let Some(plan) = self.built.get(name) {
            return Ok(Arc::clone(plan));
        }
        if let Some(start) = self.visiting.iter().position(|n| n == name) {
            let mut cycle = self.visiting[start..].to_vec();
            cycle.push(name.to_string());
            return Err(DeployError::NestingCycle(cycle.join(" -> ")));
        }

        self.visiting.push(name.to_string());
        let plan = self.build(phases, name);
        self.visiting.pop();

        let plan = Arc::new(plan?);
        self.built.insert(name.to_string(), Arc::clone(&plan));
        Ok(plan)
    }

    fn is_referenced(&self, name: &str, top: &[PhaseConfig]) -> bool {
        top.iter().any(|p| p.variants().iter().any(|v| v == name))
            || self.steps.iter().any(|(owner, entry)| {
                self.built.contains_key(owner)
                    && entry
                        .phases
                        .as_ref()
                        .is_some_and(|ps| ps.iter().any(|p| p.variants().iter().any(|v| v == name)))
            })
    }
}
