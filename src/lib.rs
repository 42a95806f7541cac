pub mod automata;
pub mod cli;
pub mod config;
pub mod deploy;
pub mod error;
pub mod executor;
pub mod node;
pub mod nodeset;
pub mod plan;
pub mod sink;
pub mod step;

pub use error::DeployError;

use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{FmtSubscriber, filter::LevelFilter};

use crate::deploy::{Deployment, DeploymentReport};
use crate::nodeset::NodeSet;
use crate::step::StepRegistry;

/// Locks a mutex, recovering the data of a poisoned one.
///
/// Every critical section in this crate is a plain set or status update,
/// so the data stays consistent even if its holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn init_logging(log_level: cli::LogLevel) -> Result<()> {
    let filter = match log_level {
        cli::LogLevel::Trace => LevelFilter::TRACE,
        cli::LogLevel::Debug => LevelFilter::DEBUG,
        cli::LogLevel::Info => LevelFilter::INFO,
        cli::LogLevel::Warn => LevelFilter::WARN,
        cli::LogLevel::Error => LevelFilter::ERROR,
    };

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_max_level(filter).finish(),
    )
    .context("failed to set global default tracing subscriber")
}

/// Loads, validates and runs a deployment file.
pub fn run_deploy(opts: &cli::DeployArgs, registry: Arc<StepRegistry>) -> Result<DeploymentReport> {
    let file = &opts.common.file;
    let config = config::load_config(file)
        .with_context(|| format!("failed to load deployment from {}", file))?;
    let deployment = Deployment::from_config(&config, registry)
        .context("deployment validation failed")?;

    info!(deployment = %deployment.id(), file = %file, "loaded deployment");
    let report = deployment.run().context("deployment failed")?;
    Ok(report)
}

/// Loads and validates a deployment file, then renders what would run.
pub fn run_plan(opts: &cli::CommonArgs, registry: &StepRegistry) -> Result<String> {
    let config = config::load_config(&opts.file)
        .with_context(|| format!("failed to load deployment from {}", opts.file))?;
    config.validate(registry).context("deployment validation failed")?;
    let arena = Arc::new(config.arena()?);
    let plan = config.plan(registry)?;

    let mut out = String::new();
    if let Some(env) = &config.environment {
        let _ = writeln!(out, "environment: {}", env);
    }
    for (cluster, nodes) in NodeSet::all(arena).group_by_cluster() {
        let _ = writeln!(out, "cluster {}: {}", cluster, nodes);
    }
    out.push_str(&plan.describe());
    Ok(out)
}

pub fn run_validate(opts: &cli::ValidateArgs, registry: &StepRegistry) -> Result<()> {
    let config = config::load_config(&opts.common.file)?;
    config.validate(registry).context("deployment validation failed")?;
    info!(
        "validation successful: {} node(s), {} phase(s)",
        config.nodes.len(),
        config.phases.len()
    );
    Ok(())
}
