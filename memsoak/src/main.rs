//! memsoak - tunnel controller soak testing
//!
//! Repeatedly reconnects or restarts the controller while sampling memory;
//! fails on a memory ceiling breach or stalled tunnel establishment.

use anyhow::Result;
use clap::Parser;
use memsoak_core::memory::CountingAllocator;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod cli;
mod commands;
mod config;

use cli::{Cli, Commands};

#[global_allocator]
static ALLOC: CountingAllocator = CountingAllocator;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::from_default_env()
        .add_directive("memsoak=info".parse()?)
        .add_directive("memsoak_core=info".parse()?);
    tracing_subscriber::registry()
        .with(cli.json.then(|| fmt::layer().json()))
        .with((!cli.json).then(fmt::layer))
        .with(filter)
        .init();

    // Load configuration
    let config = config::Config::load()?;

    // Execute command
    match cli.command {
        Commands::Run(args) => commands::run::execute(args, &config).await,
        Commands::Modes => commands::modes::execute().map(|()| ExitCode::SUCCESS),
        Commands::Version => {
            println!("memsoak {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
    }
}
