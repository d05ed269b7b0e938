//! `memsoak run` - one soak run against the simulated controller.
//!
//! Every run gets a fresh controller data directory under the scratch dir,
//! removed when the run ends. A configured controller config that does not
//! exist skips the run rather than failing it.

use anyhow::{Context, Result};
use colored::Colorize;
use memsoak_core::memory::format_byte_count;
use memsoak_core::simulated::SimulatedControllerFactory;
use memsoak_core::{
    ControllerParams, Orchestrator, ProcessMemoryProbe, RunReport, SampleStatus,
};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{Instrument, info_span, warn};
use uuid::Uuid;

use crate::cli::RunArgs;
use crate::config::Config;

/// How a run ended.
#[derive(Debug)]
pub enum Outcome {
    Passed(RunReport),
    Failed(memsoak_core::Error),
    Skipped(String),
}

pub async fn execute(args: RunArgs, config: &Config) -> Result<ExitCode> {
    let mut config = config.clone();
    config.apply_args(&args);

    let outcome = run(&config).await?;
    Ok(report(&outcome))
}

/// Run once with the given configuration.
pub async fn run(config: &Config) -> Result<Outcome> {
    let Some(params) = load_controller_params(config.paths.controller_config.as_deref())? else {
        return Ok(Outcome::Skipped(format!(
            "controller config not found: {}",
            config
                .paths
                .controller_config
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        )));
    };

    std::fs::create_dir_all(&config.paths.scratch_dir)
        .context("Failed to create scratch directory")?;
    let data_dir = tempfile::Builder::new()
        .prefix("memsoak-")
        .tempdir_in(&config.paths.scratch_dir)
        .context("Failed to create controller data directory")?;

    let mut run_config = config.run.clone();
    run_config.controller = params;
    run_config.controller.apply_soak_overrides(data_dir.path());

    let run_id = Uuid::new_v4();
    println!(
        "{} {} ({}s, sample every {}s, ceiling {})",
        "Starting soak run:".cyan(),
        run_config.mode.as_str().bold(),
        run_config.duration_secs,
        run_config.sample_interval_secs,
        format_byte_count(run_config.max_sys_memory)
    );

    let factory = Arc::new(SimulatedControllerFactory::new(config.simulation.clone()));
    let orchestrator = Orchestrator::new(run_config, factory, Arc::new(ProcessMemoryProbe::new()))
        .on_sample(print_status);

    let result = orchestrator
        .run()
        .instrument(info_span!("memsoak", run_id = %run_id))
        .await;

    if let Err(e) = data_dir.close() {
        warn!(error = %e, "failed to remove controller data directory");
    }

    Ok(match result {
        Ok(report) => Outcome::Passed(report),
        Err(e) => Outcome::Failed(e),
    })
}

/// Read the controller config. `Ok(None)` means the configured file is
/// missing; no configured file means empty parameters.
fn load_controller_params(path: Option<&Path>) -> Result<Option<ControllerParams>> {
    let Some(path) = path else {
        return Ok(Some(ControllerParams::default()));
    };
    if !path.exists() {
        return Ok(None);
    }

    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read controller config {}", path.display()))?;
    let params = ControllerParams::from_json_slice(&bytes)
        .with_context(|| format!("Failed to process controller config {}", path.display()))?;
    Ok(Some(params))
}

fn print_status(status: &SampleStatus) {
    println!(
        "[{}] Tunnels established: {}, sys memory: {}, cumulative allocations: {}",
        status.sample.taken_at.format("%H:%M:%S"),
        status.tunnels_established.to_string().bold(),
        format_byte_count(status.sample.system_memory_in_use),
        format_byte_count(status.sample.cumulative_allocated)
    );
}

/// Print the single terminal message for a run and pick the exit code.
fn report(outcome: &Outcome) -> ExitCode {
    match outcome {
        Outcome::Passed(report) => {
            println!(
                "{} {} tunnels, {} reconnects, {} restarts, peak sys memory {}",
                "✓ PASS:".green(),
                report.tunnels_established,
                report.reconnects,
                report.restarts,
                format_byte_count(report.peak_system_memory)
            );
            ExitCode::SUCCESS
        }
        Outcome::Failed(e) if e.is_fatal_check() => {
            println!("{} {}", "✗ FAIL:".red(), e);
            ExitCode::FAILURE
        }
        Outcome::Failed(e) => {
            println!("{} {}", "✗ ERROR:".red(), e);
            ExitCode::FAILURE
        }
        Outcome::Skipped(reason) => {
            println!("{} {}", "⚠ SKIP:".yellow(), reason);
            ExitCode::SUCCESS
        }
    }
}
