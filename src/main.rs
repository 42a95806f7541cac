use std::io;
use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::CommandFactory;
use pxedeploy::cli::{self, Commands};
use pxedeploy::step::StepRegistry;
use tracing::error;

fn main() -> Result<()> {
    let args = cli::parse_args()?;

    if let Commands::Completions(opts) = &args.command {
        let mut cmd = cli::Cli::command();
        clap_complete::generate(opts.shell, &mut cmd, env!("CARGO_PKG_NAME"), &mut io::stdout());
        return Ok(());
    }

    if let Some(log_level) = args.command.log_level() {
        pxedeploy::init_logging(log_level)?;
    }

    let registry = Arc::new(StepRegistry::with_builtins());

    match &args.command {
        Commands::Deploy(opts) if opts.dry_run => {
            match pxedeploy::run_plan(&opts.common, &registry) {
                Ok(plan) => print!("{}", plan),
                Err(e) => {
                    error!("{:#}", e);
                    process::exit(1);
                }
            }
        }
        Commands::Deploy(opts) => {
            let report = match pxedeploy::run_deploy(opts, registry) {
                Ok(report) => report,
                Err(e) => {
                    error!("{:#}", e);
                    process::exit(1);
                }
            };
            println!("{}", report.summary());
            for (hostname, last_error) in &report.ko {
                let reason = last_error.as_deref().unwrap_or("no error recorded");
                println!("  {}: {}", hostname, reason);
            }
            for hostname in &report.brk {
                println!("  {}: stopped at breakpoint", hostname);
            }
            if !report.ko.is_empty() {
                process::exit(1);
            }
        }
        Commands::Validate(opts) => {
            if let Err(e) = pxedeploy::run_validate(opts, &registry) {
                error!("{:#}", e);
                process::exit(1);
            }
        }
        Commands::Completions(_) => {}
    }

    Ok(())
}
