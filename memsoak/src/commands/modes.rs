//! List the available test modes.

use anyhow::Result;
use colored::Colorize;
use memsoak_core::TestMode;

pub fn execute() -> Result<()> {
    println!("{}", "Test modes:".cyan());
    for mode in TestMode::ALL {
        println!("  {:<24} {}", mode.as_str().bold(), mode.description());
    }
    Ok(())
}
