//! CLI argument definitions using clap derive macros.

use clap::{Args, Parser, Subcommand};
use memsoak_core::TestMode;
use std::path::PathBuf;

/// memsoak - tunnel controller soak testing
///
/// Drives the controller through reconnect/restart cycles and fails on a
/// memory ceiling breach or stalled tunnel establishment.
#[derive(Parser, Debug)]
#[command(name = "memsoak")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a soak test
    Run(RunArgs),

    /// List the available test modes
    Modes,

    /// Show version
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Test mode: reconnect, restart or both
    #[arg(short, long, value_parser = parse_mode)]
    pub mode: Option<TestMode>,

    /// Total run duration in seconds
    #[arg(long)]
    pub duration_secs: Option<u64>,

    /// Memory inspection interval in seconds
    #[arg(long)]
    pub interval_secs: Option<u64>,

    /// Delay after each establishment before acting, in milliseconds
    #[arg(long)]
    pub settle_ms: Option<u64>,

    /// Maximum allowed system memory in bytes
    #[arg(long)]
    pub max_sys_memory: Option<u64>,

    /// Controller configuration (JSON). The run is skipped if it is missing.
    #[arg(long, env = "MEMSOAK_CONTROLLER_CONFIG")]
    pub controller_config: Option<PathBuf>,

    /// Simulated controller: time to establish a tunnel, in milliseconds
    #[arg(long)]
    pub establish_ms: Option<u64>,

    /// Simulated controller: bytes retained per establishment
    #[arg(long)]
    pub leak_bytes: Option<usize>,
}

fn parse_mode(s: &str) -> Result<TestMode, String> {
    TestMode::parse(s).ok_or_else(|| {
        format!(
            "unknown mode '{}' (expected reconnect, restart or both)",
            s
        )
    })
}
