//! Validated phase tables and per-step configuration.
//!
//! A [`Plan`] is read-only once built: managers index into it by
//! [`Position`] for the whole duration of a run without locking.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::time::Duration;

use crate::error::DeployError;
use crate::step::StepRegistry;

/// Location of a step in a phase table: `idx` selects the phase,
/// `subidx` the variant inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    pub idx: usize,
    pub subidx: usize,
}

impl Position {
    /// First variant of the first phase.
    pub const START: Position = Position { idx: 0, subidx: 0 };

    pub fn new(idx: usize, subidx: usize) -> Self {
        Self { idx, subidx }
    }

    /// First variant of the following phase.
    pub fn next_phase(self) -> Self {
        Self::new(self.idx + 1, 0)
    }

    /// Following variant of the same phase.
    pub fn next_variant(self) -> Self {
        Self::new(self.idx, self.subidx + 1)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.idx + 1, self.subidx + 1)
    }
}

/// Scheduling policy of one named step.
#[derive(Debug, Clone)]
pub struct StepConfig {
    /// Name used in phase tables.
    pub name: String,
    /// Catalogue entry implementing the step (defaults to `name`).
    pub kind: String,
    /// Wall-clock limit for one attempt, `None` for unbounded.
    pub timeout: Option<Duration>,
    /// Extra attempts after the first failure.
    pub retries: u32,
    /// Whether a nested manager reports this step's final outcomes to its
    /// enclosing manager as soon as they happen.
    pub raisable: bool,
    /// Operator pause point: the step is never executed.
    pub breakpoint: bool,
    /// Positional parameters handed to the catalogue constructor.
    pub params: Vec<String>,
    /// Nested phase table, making this step a manager of its own.
    pub nested: Option<Arc<Plan>>,
}

impl StepConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: name.clone(),
            name,
            timeout: None,
            retries: 0,
            raisable: true,
            breakpoint: false,
            params: Vec::new(),
            nested: None,
        }
    }

    /// Sets the timeout in seconds; `0` means unbounded.
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = (secs > 0).then(|| Duration::from_secs(secs));
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn with_raisable(mut self, raisable: bool) -> Self {
        self.raisable = raisable;
        self
    }

    #[must_use]
    pub fn with_breakpoint(mut self, breakpoint: bool) -> Self {
        self.breakpoint = breakpoint;
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    #[must_use]
    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_nested(mut self, plan: Plan) -> Self {
        self.nested = Some(Arc::new(plan));
        self
    }

    pub fn is_nested(&self) -> bool {
        self.nested.is_some()
    }
}

/// One stage of a phase table: a list of variants tried in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    variants: Vec<String>,
}

impl Phase {
    pub fn single(step: impl Into<String>) -> Self {
        Self {
            variants: vec![step.into()],
        }
    }

    pub fn alternatives<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            variants: steps.into_iter().map(Into::into).collect(),
        }
    }

    pub fn variants(&self) -> &[String] {
        &self.variants
    }
}

/// Ordered phase table plus the configuration of every step it references.
#[derive(Debug, Clone)]
pub struct Plan {
    phases: Vec<Phase>,
    steps: BTreeMap<String, Arc<StepConfig>>,
}

impl Plan {
    /// Builds a plan, rejecting empty tables and unconfigured step names.
    pub fn new(
        phases: Vec<Phase>,
        steps: impl IntoIterator<Item = StepConfig>,
    ) -> Result<Self, DeployError> {
        if phases.is_empty() {
            return Err(DeployError::Config("phase table must not be empty".to_string()));
        }

        let steps: BTreeMap<String, Arc<StepConfig>> = steps
            .into_iter()
            .map(|cfg| (cfg.name.clone(), Arc::new(cfg)))
            .collect();

        for (i, phase) in phases.iter().enumerate() {
            if phase.variants.is_empty() {
                return Err(DeployError::Config(format!(
                    "phase {} must list at least one step",
                    i + 1
                )));
            }
            for name in &phase.variants {
                if !steps.contains_key(name) {
                    return Err(DeployError::unknown_step(name, format!("phase {}", i + 1)));
                }
            }
        }

        Ok(Self { phases, steps })
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    /// Configuration of a step by name.
    pub fn step(&self, name: &str) -> Option<&Arc<StepConfig>> {
        self.steps.get(name)
    }

    /// Configuration of the step at `pos`.
    pub fn step_at(&self, pos: Position) -> Option<&Arc<StepConfig>> {
        let name = self.phases.get(pos.idx)?.variants.get(pos.subidx)?;
        self.steps.get(name)
    }

    /// Whether `pos` designates an existing variant.
    pub fn has_step_at(&self, pos: Position) -> bool {
        self.step_at(pos).is_some()
    }

    /// Whether `pos` is in the last phase.
    pub fn is_last_phase(&self, pos: Position) -> bool {
        pos.idx + 1 >= self.phases.len()
    }

    /// Checks that every leaf step, at any nesting depth, exists in the
    /// registry and accepts its parameters.
    pub fn check_catalogue(&self, registry: &StepRegistry) -> Result<(), DeployError> {
        for cfg in self.steps.values() {
            match &cfg.nested {
                Some(nested) => nested.check_catalogue(registry)?,
                None if cfg.breakpoint => {}
                None => {
                    registry.instantiate(&cfg.kind, &cfg.params).map_err(|e| match e {
                        DeployError::UnknownStep { name, .. } => {
                            DeployError::unknown_step(name, format!("step '{}'", cfg.name))
                        }
                        DeployError::InvalidStepParams { reason, .. } => {
                            DeployError::InvalidStepParams {
                                step: cfg.name.clone(),
                                reason,
                            }
                        }
                        other => other,
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Human-readable rendering of the plan, nested tables indented.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        self.describe_into(&mut out, 0);
        out
    }

    fn describe_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        for (i, phase) in self.phases.iter().enumerate() {
            for (j, name) in phase.variants.iter().enumerate() {
                let label = if j == 0 {
                    format!("phase {}", i + 1)
                } else {
                    format!("  fallback {}", j)
                };
                let Some(cfg) = self.steps.get(name) else {
                    continue;
                };
                let _ = write!(out, "{}{}: {}", indent, label, name);
                if cfg.kind != cfg.name && !cfg.is_nested() {
                    let _ = write!(out, " ({})", cfg.kind);
                }
                match cfg.timeout {
                    Some(t) => {
                        let _ = write!(out, " timeout={}s", t.as_secs());
                    }
                    None => out.push_str(" timeout=none"),
                }
                let _ = write!(out, " retries={}", cfg.retries);
                if !cfg.raisable {
                    out.push_str(" raisable=false");
                }
                if cfg.breakpoint {
                    out.push_str(" BREAKPOINT");
                }
                out.push('\n');
                if let Some(nested) = &cfg.nested {
                    nested.describe_into(out, depth + 2);
                }
            }
        }
    }
}
