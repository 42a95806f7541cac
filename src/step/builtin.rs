//! Built-in catalogue entries.
//!
//! - `noop`: every node succeeds.
//! - `command`: runs a local program once per node, in parallel. The
//!   parameters are the program and its arguments; `{hostname}` and
//!   `{cluster}` are substituted per node, so remote execution is a matter
//!   of configuring e.g. `[ssh, "{hostname}", reboot]`.

use std::sync::Arc;
use std::thread;

use anyhow::Result;

use super::{Cancellation, Step, StepContext, StepOutcome, StepRegistry};
use crate::executor::{CommandExecutor, CommandSpec, RealCommandExecutor, panic_message};
use crate::node::NodeRef;

/// Executor used by [`StepRegistry::with_builtins`].
pub fn default_executor() -> Arc<dyn CommandExecutor> {
    Arc::new(RealCommandExecutor { dry_run: false })
}

/// Registers `noop` and `command`, the latter running through `executor`.
pub fn register_builtins(registry: &mut StepRegistry, executor: Arc<dyn CommandExecutor>) {
    registry.register("noop", |_| Ok(Box::new(NoopStep) as Box<dyn Step>));
    registry.register("command", move |params| {
        Ok(Box::new(CommandStep::from_params(params, Arc::clone(&executor))?) as Box<dyn Step>)
    });
}

/// Step that succeeds for every node.
pub struct NoopStep;

impl Step for NoopStep {
    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        Ok(StepOutcome::all_ok(ctx.nodes()))
    }
}

/// Step running a command template against each node.
pub struct CommandStep {
    program: String,
    args: Vec<String>,
    executor: Arc<dyn CommandExecutor>,
    cancel: Cancellation,
}

enum NodeResult {
    Ok,
    Ko(String),
}

impl CommandStep {
    pub fn from_params(params: &[String], executor: Arc<dyn CommandExecutor>) -> Result<Self> {
        let Some((program, args)) = params.split_first() else {
            anyhow::bail!("a program to execute is required as first parameter");
        };
        if program.trim().is_empty() {
            anyhow::bail!("the program name must not be empty");
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            executor,
            cancel: Cancellation::new(),
        })
    }

    /// Builds the concrete command for one node.
    pub fn command_for(&self, node: &NodeRef<'_>) -> CommandSpec {
        let args = self.args.iter().map(|a| render(a, node)).collect();
        CommandSpec::new(render(&self.program, node), args)
            .with_env("DEPLOY_HOSTNAME", node.hostname())
            .with_env("DEPLOY_CLUSTER", node.cluster())
    }

    fn run_on(&self, node: &NodeRef<'_>, ctx_cancel: &Cancellation) -> NodeResult {
        if ctx_cancel.is_cancelled() || self.cancel.is_cancelled() {
            return NodeResult::Ko("cancelled before execution".to_string());
        }
        let spec = self.command_for(node);
        match self.executor.execute(&spec, &self.cancel) {
            Ok(result) => {
                node.update(|status| {
                    status.last_exit = result.code();
                    status.stdout = result.stdout.clone();
                    status.stderr = result.stderr.clone();
                });
                if result.success() {
                    NodeResult::Ok
                } else if result.cancelled {
                    NodeResult::Ko(format!("{} was cancelled", spec.command))
                } else {
                    let status = result
                        .status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "no exit status".to_string());
                    match result.stderr.lines().last() {
                        Some(line) => {
                            NodeResult::Ko(format!("{} {}: {}", spec.command, status, line))
                        }
                        None => NodeResult::Ko(format!("{} {}", spec.command, status)),
                    }
                }
            }
            Err(e) => NodeResult::Ko(format!("{:#}", e)),
        }
    }
}

fn render(template: &str, node: &NodeRef<'_>) -> String {
    template
        .replace("{hostname}", node.hostname())
        .replace("{cluster}", node.cluster())
}

impl Step for CommandStep {
    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        let ctx_cancel = ctx.cancellation();
        let mut outcome = StepOutcome::new(ctx.nodes());

        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = ctx
                .nodes()
                .iter()
                .map(|node| {
                    let ctx_cancel = &ctx_cancel;
                    (node.id(), scope.spawn(move || self.run_on(&node, ctx_cancel)))
                })
                .collect();
            handles
                .into_iter()
                .map(|(id, handle)| {
                    let result = handle.join().unwrap_or_else(|e| {
                        NodeResult::Ko(format!("node thread panicked: {}", panic_message(&*e)))
                    });
                    (id, result)
                })
                .collect()
        });

        for (id, result) in results {
            match result {
                NodeResult::Ok => outcome.ok(id),
                NodeResult::Ko(reason) => outcome.ko(id, reason),
            }
        }
        Ok(outcome)
    }

    fn kill(&self) {
        self.cancel.cancel();
    }
}
