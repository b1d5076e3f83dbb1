//! Configuration: an optional `cloudforge.toml`, layered under CLI flags.
//!
//! Shaped after the teacher's `ForgeToml`/`ForgeConfig` split: a plain
//! `serde`-deserialized TOML struct for the file contents, and a resolved
//! `Config` that merges CLI overrides on top (CLI always wins).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ITERATION_CAP: u32 = 25;
const DEFAULT_MAX_PHASE_RETRIES: u32 = 3;
const DEFAULT_MAX_TURNS: u32 = 50;
const DEFAULT_RATE_LIMIT_WAIT_SECS: u64 = 43_200;
const DEFAULT_CLI_PATH: &str = "claude";

/// The on-disk shape of `cloudforge.toml`. Every field optional: absence
/// means "use the built-in default."
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudforgeToml {
    #[serde(default)]
    pub cli_path: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub max_phase_retries: Option<u32>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub rate_limit_wait_secs: Option<u64>,
}

impl CloudforgeToml {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse config file at {}", path.display()))
    }

    /// `None` if the file is simply absent (non-fatal); `Err` if present
    /// but malformed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write config file at {}", path.display()))
    }

    /// Human-readable warnings; an empty vec means the file is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.max_iterations == Some(0) {
            warnings.push("max_iterations must be greater than 0".to_string());
        }
        if self.max_phase_retries == Some(0) {
            warnings.push("max_phase_retries must be greater than 0".to_string());
        }
        if self.max_turns == Some(0) {
            warnings.push("max_turns must be greater than 0".to_string());
        }
        if self.rate_limit_wait_secs == Some(0) {
            warnings.push("rate_limit_wait_secs must be greater than 0".to_string());
        }
        warnings
    }
}

/// CLI overrides collected in `main.rs`, passed into [`Config::resolve`].
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub cli_path: Option<String>,
    pub model: Option<String>,
    pub max_iterations: Option<u32>,
    pub max_phase_retries: Option<u32>,
    pub max_turns: Option<u32>,
    pub rate_limit_wait_secs: Option<u64>,
    pub working_dir: Option<PathBuf>,
}

/// The fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub cli_path: String,
    pub model: Option<String>,
    pub max_iterations: u32,
    pub max_phase_retries: u32,
    pub max_turns: u32,
    pub rate_limit_wait_secs: u64,
    pub working_dir: PathBuf,
}

impl Config {
    /// Loads `<working_dir>/cloudforge.toml` if present, then applies CLI
    /// overrides, which always win.
    pub fn resolve(working_dir: PathBuf, overrides: CliOverrides) -> Result<Self> {
        let toml_path = working_dir.join("cloudforge.toml");
        let file = CloudforgeToml::load_or_default(&toml_path)?;

        Ok(Self {
            cli_path: overrides
                .cli_path
                .or(file.cli_path)
                .unwrap_or_else(|| DEFAULT_CLI_PATH.to_string()),
            model: overrides.model.or(file.model),
            max_iterations: overrides
                .max_iterations
                .or(file.max_iterations)
                .unwrap_or(DEFAULT_ITERATION_CAP),
            max_phase_retries: overrides
                .max_phase_retries
                .or(file.max_phase_retries)
                .unwrap_or(DEFAULT_MAX_PHASE_RETRIES),
            max_turns: overrides.max_turns.or(file.max_turns).unwrap_or(DEFAULT_MAX_TURNS),
            rate_limit_wait_secs: overrides
                .rate_limit_wait_secs
                .or(file.rate_limit_wait_secs)
                .unwrap_or(DEFAULT_RATE_LIMIT_WAIT_SECS),
            working_dir: overrides.working_dir.unwrap_or(working_dir),
        })
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.max_iterations == 0 {
            warnings.push("max_iterations must be greater than 0".to_string());
        }
        if self.max_phase_retries == 0 {
            warnings.push("max_phase_retries must be greater than 0".to_string());
        }
        if self.max_turns == 0 {
            warnings.push("max_turns must be greater than 0".to_string());
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn resolve_uses_defaults_when_no_file_and_no_overrides() {
        let dir = tempdir().unwrap();
        let config = Config::resolve(dir.path().to_path_buf(), CliOverrides::default()).unwrap();
        assert_eq!(config.cli_path, "claude");
        assert_eq!(config.max_iterations, DEFAULT_ITERATION_CAP);
        assert_eq!(config.max_phase_retries, DEFAULT_MAX_PHASE_RETRIES);
    }

    #[test]
    fn cli_overrides_win_over_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("cloudforge.toml"), "max_iterations = 10\n").unwrap();
        let overrides = CliOverrides {
            max_iterations: Some(99),
            ..Default::default()
        };
        let config = Config::resolve(dir.path().to_path_buf(), overrides).unwrap();
        assert_eq!(config.max_iterations, 99);
    }

    #[test]
    fn file_value_used_when_no_override_given() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("cloudforge.toml"), "model = \"opus\"\n").unwrap();
        let config = Config::resolve(dir.path().to_path_buf(), CliOverrides::default()).unwrap();
        assert_eq!(config.model.as_deref(), Some("opus"));
    }

    #[test]
    fn malformed_toml_file_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("cloudforge.toml"), "not = [valid").unwrap();
        assert!(Config::resolve(dir.path().to_path_buf(), CliOverrides::default()).is_err());
    }

    #[test]
    fn validate_flags_zero_max_iterations() {
        let config = Config {
            cli_path: "claude".into(),
            model: None,
            max_iterations: 0,
            max_phase_retries: 3,
            max_turns: 50,
            rate_limit_wait_secs: 100,
            working_dir: PathBuf::from("."),
        };
        assert!(!config.validate().is_empty());
    }

    #[test]
    fn save_then_load_round_trips_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cloudforge.toml");
        let toml = CloudforgeToml {
            model: Some("sonnet".into()),
            max_iterations: Some(40),
            ..Default::default()
        };
        toml.save(&path).unwrap();
        let loaded = CloudforgeToml::load(&path).unwrap();
        assert_eq!(loaded.model.as_deref(), Some("sonnet"));
        assert_eq!(loaded.max_iterations, Some(40));
    }
}
