//! Immutable runtime configuration.
//!
//! Loaded once at startup and passed by reference into every component, so
//! there is no global mutable state. Invalid values fail fast before any
//! command runs.
use crate::error::CoreError;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "reqflow.config.json";

/// Timing knobs for one lock class.
#[derive(Debug, Clone, Copy)]
pub struct LockTuning {
    pub timeout: Duration,
    pub poll: Duration,
    pub stale: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectMode {
    Existing,
    Greenfield,
}

impl ProjectMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectMode::Existing => "existing",
            ProjectMode::Greenfield => "greenfield",
        }
    }
}

impl fmt::Display for ProjectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectMode {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "existing" => Ok(ProjectMode::Existing),
            "greenfield" => Ok(ProjectMode::Greenfield),
            other => Err(CoreError::InvalidInput(format!(
                "invalid project mode: {other} (allowed: existing, greenfield)"
            ))
            .into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory holding per-date requirement directories.
    pub spec_dir: PathBuf,
    /// Tokens the final review flags as unfinished content.
    pub placeholders: Vec<String>,
    pub default_project_mode: ProjectMode,
    pub dry_run_default: bool,
    pub metadata_lock: LockTuning,
    pub requirement_lock: LockTuning,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            spec_dir: PathBuf::from("spec"),
            placeholders: vec![
                "TODO".to_string(),
                "TBD".to_string(),
                "FIXME".to_string(),
            ],
            default_project_mode: ProjectMode::Existing,
            dry_run_default: false,
            metadata_lock: LockTuning {
                timeout: Duration::from_millis(8_000),
                poll: Duration::from_millis(50),
                stale: Duration::from_millis(120_000),
            },
            requirement_lock: LockTuning {
                timeout: Duration::from_millis(8_000),
                poll: Duration::from_millis(50),
                stale: Duration::from_millis(120_000),
            },
        }
    }
}

/// On-disk shape: every field optional, merged over defaults.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    spec_dir: Option<PathBuf>,
    placeholders: Option<Vec<String>>,
    default_project_mode: Option<String>,
    dry_run_default: Option<bool>,
    metadata_lock_timeout_sec: Option<f64>,
    metadata_lock_poll_sec: Option<f64>,
    metadata_lock_stale_sec: Option<f64>,
    requirement_lock_timeout_sec: Option<f64>,
    requirement_lock_poll_sec: Option<f64>,
    requirement_lock_stale_sec: Option<f64>,
}

/// Load config from the working directory, else the user config directory,
/// else built-in defaults.
pub fn load_config() -> Result<Config> {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.is_file() {
        return load_config_from(&local);
    }
    if let Some(base) = dirs::config_dir() {
        let user = base.join("reqflow").join("config.json");
        if user.is_file() {
            return load_config_from(&user);
        }
    }
    Ok(Config::default())
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let raw: RawConfig = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse {}", path.display()))?;
    let config = merge_raw(raw)?;
    validate_config(&config)?;
    Ok(config)
}

fn merge_raw(raw: RawConfig) -> Result<Config> {
    let mut config = Config::default();
    if let Some(spec_dir) = raw.spec_dir {
        config.spec_dir = spec_dir;
    }
    if let Some(placeholders) = raw.placeholders {
        config.placeholders = placeholders;
    }
    if let Some(mode) = raw.default_project_mode {
        config.default_project_mode = mode.parse()?;
    }
    if let Some(dry_run) = raw.dry_run_default {
        config.dry_run_default = dry_run;
    }
    config.metadata_lock = LockTuning {
        timeout: duration_override(raw.metadata_lock_timeout_sec, config.metadata_lock.timeout, "metadata_lock_timeout_sec")?,
        poll: duration_override(raw.metadata_lock_poll_sec, config.metadata_lock.poll, "metadata_lock_poll_sec")?,
        stale: duration_override(raw.metadata_lock_stale_sec, config.metadata_lock.stale, "metadata_lock_stale_sec")?,
    };
    config.requirement_lock = LockTuning {
        timeout: duration_override(raw.requirement_lock_timeout_sec, config.requirement_lock.timeout, "requirement_lock_timeout_sec")?,
        poll: duration_override(raw.requirement_lock_poll_sec, config.requirement_lock.poll, "requirement_lock_poll_sec")?,
        stale: duration_override(raw.requirement_lock_stale_sec, config.requirement_lock.stale, "requirement_lock_stale_sec")?,
    };
    Ok(config)
}

fn duration_override(raw: Option<f64>, default: Duration, key: &str) -> Result<Duration> {
    let Some(secs) = raw else {
        return Ok(default);
    };
    if !secs.is_finite() || secs <= 0.0 {
        return Err(CoreError::InvalidInput(format!(
            "config {key} must be a positive number"
        ))
        .into());
    }
    Ok(Duration::from_secs_f64(secs))
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.spec_dir.as_os_str().is_empty() {
        return Err(CoreError::InvalidInput("config spec_dir cannot be empty".to_string()).into());
    }
    for (name, tuning) in [
        ("metadata", &config.metadata_lock),
        ("requirement", &config.requirement_lock),
    ] {
        if tuning.timeout.is_zero() || tuning.poll.is_zero() || tuning.stale.is_zero() {
            return Err(CoreError::InvalidInput(format!(
                "config {name} lock timings must be positive"
            ))
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
