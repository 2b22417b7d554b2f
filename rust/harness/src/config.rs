//! Configuration parsing and validation for an experiment.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use rnn_config::{ModelVars, TrainOptions, VarsError};
use serde::{Deserialize, Serialize};

use crate::toolkit::ToolkitPrograms;

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub train: TrainOptions,
    #[serde(default)]
    pub toolkit: ToolkitPrograms,
    #[serde(default)]
    pub harness: HarnessSettings,
}

/// Settings of the harness process itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessSettings {
    /// Program used to deliver mail to `train.email`.
    #[serde(default = "default_mail_program")]
    pub mail_program: String,
    /// Longest wait for the failure notification before exiting.
    #[serde(default = "default_notify_timeout")]
    pub notify_timeout_secs: u64,
    /// Longest wait for background jobs once training has finished. Unset
    /// waits indefinitely.
    #[serde(default)]
    pub drain_timeout_secs: Option<u64>,
}

fn default_mail_program() -> String {
    "mail".to_string()
}

fn default_notify_timeout() -> u64 {
    60
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            mail_program: default_mail_program(),
            notify_timeout_secs: default_notify_timeout(),
            drain_timeout_secs: None,
        }
    }
}

impl ExperimentConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// `<dir>/configs/vars`.
#[must_use]
pub fn vars_path(dir: &Path) -> PathBuf {
    dir.join("configs").join("vars")
}

/// Check the options that can be checked before touching the toolkit, and
/// load the model vars.
pub fn validate(options: &TrainOptions) -> Result<ModelVars, ConfigError> {
    let egs = &options.egs;
    let trainer = &options.trainer;

    if egs.chunk_width < 1 {
        return Err(invalid("chunk_width", "must be at least 1"));
    }
    if egs.chunk_left_context < 0 {
        return Err(invalid("chunk_left_context", "must be non-negative"));
    }
    if egs.chunk_right_context < 0 {
        return Err(invalid("chunk_right_context", "must be non-negative"));
    }
    if trainer.num_jobs_initial < 1 {
        return Err(invalid("num_jobs_initial", "must be at least 1"));
    }
    if trainer.num_jobs_final < 1 {
        return Err(invalid("num_jobs_final", "must be at least 1"));
    }
    if trainer.num_epochs <= 0.0 || !trainer.num_epochs.is_finite() {
        return Err(invalid("num_epochs", "must be positive"));
    }
    if trainer.initial_effective_lrate <= 0.0 || trainer.final_effective_lrate <= 0.0 {
        return Err(invalid("effective_lrate", "learning rates must be positive"));
    }
    if trainer.shrink_value <= 0.0 || trainer.shrink_value > 1.0 {
        return Err(invalid("shrink_value", "must be in (0, 1]"));
    }
    polling_interval(options.background_polling_time)?;

    let configs = options.dir.join("configs");
    if !configs.is_dir() {
        return Err(ConfigError::MissingConfigDir(configs));
    }
    let vars = ModelVars::load(vars_path(&options.dir))?;

    if !options.use_dense_targets && vars.num_targets.is_none() {
        return Err(ConfigError::MissingNumTargets(vars_path(&options.dir)));
    }
    Ok(vars)
}

/// Background polling period, rejecting anything that is not a positive,
/// finite number of seconds.
pub fn polling_interval(seconds: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(seconds)
        .ok()
        .filter(|interval| !interval.is_zero())
        .ok_or_else(|| invalid("background_polling_time", "must be a positive number of seconds"))
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("config directory {0} does not exist")]
    MissingConfigDir(PathBuf),
    #[error(transparent)]
    Vars(#[from] VarsError),
    #[error("num_targets needs to be defined in {0} for sparse targets")]
    MissingNumTargets(PathBuf),
    #[error("mismatch between num_targets in configs ({expected}) and the targets ({found})")]
    TargetMismatch { expected: i64, found: i64 },
    #[error("num_jobs_final ({num_jobs_final}) cannot exceed the number of archives ({num_archives})")]
    InsufficientArchives {
        num_jobs_final: usize,
        num_archives: usize,
    },
    #[error(
        "{num_iters} iterations are not enough for layer-wise training; at least {required} are \
         needed, so increase num_epochs"
    )]
    InsufficientIterations { num_iters: usize, required: usize },
}
