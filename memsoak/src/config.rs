//! Configuration management for memsoak.
//!
//! Configuration is loaded from multiple sources with precedence:
//! 1. Command-line flags
//! 2. Config file (`MEMSOAK_CONFIG`, else the platform data dir's config.toml)
//! 3. Default values

use anyhow::{Context, Result};
use directories::ProjectDirs;
use memsoak_core::RunConfig;
use memsoak_core::simulated::SimulationSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cli::RunArgs;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Soak run settings
    #[serde(default)]
    pub run: RunConfig,

    /// Simulated controller settings
    #[serde(default)]
    pub simulation: SimulationSettings,

    /// Paths
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Controller configuration document (JSON)
    #[serde(default)]
    pub controller_config: Option<PathBuf>,

    /// Parent directory for per-run controller data directories
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            controller_config: None,
            scratch_dir: default_scratch_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("dev", "memsoak", "memsoak") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".memsoak")
    }
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir()
}

impl Config {
    /// Load configuration from file, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific file. A missing file yields
    /// defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Get the config file path.
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("MEMSOAK_CONFIG") {
            PathBuf::from(path)
        } else {
            default_data_dir().join("config.toml")
        }
    }

    /// Apply command-line overrides on top of the loaded configuration.
    pub fn apply_args(&mut self, args: &RunArgs) {
        if let Some(mode) = args.mode {
            self.run.mode = mode;
        }
        if let Some(secs) = args.duration_secs {
            self.run.duration_secs = secs;
        }
        if let Some(secs) = args.interval_secs {
            self.run.sample_interval_secs = secs;
        }
        if let Some(ms) = args.settle_ms {
            self.run.settle_delay_ms = ms;
        }
        if let Some(bytes) = args.max_sys_memory {
            self.run.max_sys_memory = bytes;
        }
        if let Some(path) = &args.controller_config {
            self.paths.controller_config = Some(path.clone());
        }
        if let Some(ms) = args.establish_ms {
            self.simulation.establish_ms = ms;
        }
        if let Some(bytes) = args.leak_bytes {
            self.simulation.leak_bytes_per_tunnel = bytes;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memsoak_core::TestMode;
    use tempfile::tempdir;

    fn run_args() -> RunArgs {
        RunArgs {
            mode: None,
            duration_secs: None,
            interval_secs: None,
            settle_ms: None,
            max_sys_memory: None,
            controller_config: None,
            establish_ms: None,
            leak_bytes: None,
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.run.mode, TestMode::ReconnectTunnel);
        assert_eq!(config.run.duration_secs, 120);
        assert_eq!(config.run.sample_interval_secs, 10);
        assert_eq!(config.run.max_sys_memory, 11 * 1024 * 1024);
        assert_eq!(config.simulation.establish_ms, 500);
        assert!(config.paths.controller_config.is_none());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let temp = tempdir().expect("Failed to create temp dir");
        let config = Config::load_from(&temp.path().join("absent.toml")).unwrap();
        assert_eq!(config.run.duration_secs, 120);
    }

    #[test]
    fn test_load_partial_file() {
        let temp = tempdir().expect("Failed to create temp dir");
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[run]
mode = "restart_controller"
sample_interval_secs = 5

[simulation]
leak_bytes_per_tunnel = 4096

[paths]
controller_config = "/etc/controller.json"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();

        assert_eq!(config.run.mode, TestMode::RestartController);
        assert_eq!(config.run.sample_interval_secs, 5);
        assert_eq!(config.run.duration_secs, 120);
        assert_eq!(config.simulation.leak_bytes_per_tunnel, 4096);
        assert_eq!(config.simulation.establish_ms, 500);
        assert_eq!(
            config.paths.controller_config,
            Some(PathBuf::from("/etc/controller.json"))
        );
    }

    #[test]
    fn test_load_invalid_file_errors() {
        let temp = tempdir().expect("Failed to create temp dir");
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[run\nmode = ").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_args_override_file_values() {
        let mut config = Config::default();
        let args = RunArgs {
            mode: Some(TestMode::ReconnectAndRestart),
            duration_secs: Some(30),
            leak_bytes: Some(1024),
            ..run_args()
        };

        config.apply_args(&args);

        assert_eq!(config.run.mode, TestMode::ReconnectAndRestart);
        assert_eq!(config.run.duration_secs, 30);
        assert_eq!(config.run.sample_interval_secs, 10);
        assert_eq!(config.simulation.leak_bytes_per_tunnel, 1024);
    }
}
