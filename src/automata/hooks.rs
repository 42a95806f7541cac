//! Notification points of the state machine.
//!
//! Hooks observe transitions for logging, metrics and external state
//! synchronisation. They run on the controller thread and cannot influence
//! scheduling.

use std::time::Duration;

use crate::nodeset::NodeSet;
use crate::plan::{Position, StepConfig};

/// What a hook is told about a transition.
#[derive(Debug, Clone, Copy)]
pub struct Transition<'a> {
    /// Name of the manager making the transition.
    pub manager: &'a str,
    /// Nesting depth of that manager (0 for the outermost).
    pub depth: usize,
    /// Step concerned by the transition.
    pub step: &'a StepConfig,
    pub position: Position,
    /// Zero-based attempt number of the step on these nodes.
    pub attempt: u32,
    pub nodes: &'a NodeSet,
    /// Time spent by the attempt, when the transition ends one.
    pub elapsed: Option<Duration>,
}

/// Observer of manager transitions. Every method defaults to doing nothing.
pub trait TransitionHooks: Send + Sync {
    /// A task was started for `nodes`.
    fn on_start(&self, _t: &Transition<'_>) {}

    /// `nodes` completed the step successfully.
    fn on_success(&self, _t: &Transition<'_>) {}

    /// `nodes` are about to run the step again, or a fallback variant when
    /// `t.attempt == 0`.
    fn on_retry(&self, _t: &Transition<'_>) {}

    /// The attempt exceeded its timeout and was killed.
    fn on_timeout(&self, _t: &Transition<'_>) {}

    /// `nodes` were split off the group `previous_group`.
    fn on_split(&self, _t: &Transition<'_>, _previous_group: u64) {}

    /// `nodes` stopped at a breakpoint (terminal).
    fn on_break(&self, _t: &Transition<'_>) {}

    /// `nodes` exhausted retries and variants (terminal).
    fn on_fail(&self, _t: &Transition<'_>) {}

    /// `nodes` completed the last phase (terminal).
    fn on_done(&self, _t: &Transition<'_>) {}

    /// The manager was killed; `nodes` were unresolved and are now KO.
    fn on_kill(&self, _manager: &str, _depth: usize, _nodes: &NodeSet) {}
}

/// Hooks that ignore every transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl TransitionHooks for NoopHooks {}
