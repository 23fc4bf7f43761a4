//! Engine configuration using Figment
//!
//! Settings are loaded from:
//! 1. `nv_daq.toml` (optional; every section has defaults)
//! 2. Environment variables prefixed with `NVDAQ_`, `__` separating sections
//!
//! ```text
//! NVDAQ_STORAGE__ROOT=/data/nv_lab
//! NVDAQ_RUNNER__FAULT_POLICY=continue
//! NVDAQ_LOGGING__LEVEL=debug
//! ```
//!
//! Recalibration is off unless a `[recalibration]` table is present, and
//! then its `trigger` must be given explicitly:
//!
//! ```toml
//! [recalibration]
//! trigger = { kind = "any_of", triggers = [
//!     { kind = "every_n_runs", runs = 20 },
//!     { kind = "interval", seconds = 1800 },
//! ] }
//! ```

use crate::error::DaqError;
use crate::parameter::ParameterSet;
use crate::recalibration::{AnyOf, EveryNRuns, Interval, ManualOnly, ReadoutThreshold, TriggerPolicy};
use crate::runner::FaultPolicy;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default settings file.
pub const SETTINGS_FILE: &str = "nv_daq.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    Load(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

impl From<ConfigError> for DaqError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Load(err) => DaqError::Config(err),
            ConfigError::Validation(msg) => DaqError::Validation(msg),
        }
    }
}

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Recalibration loop; absent means disabled
    #[serde(default)]
    pub recalibration: Option<RecalibrationSettings>,
}

/// Where snapshots and run records live
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Store root directory. `None` keeps everything in memory.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerSettings {
    #[serde(default)]
    pub fault_policy: FaultPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error). `RUST_LOG` wins.
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecalibrationSettings {
    /// Required; there is no default trigger
    pub trigger: TriggerSettings,
    /// Parameters passed to the calibration experiment
    #[serde(default)]
    pub params: ParameterSet,
}

/// Serializable form of a [`TriggerPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSettings {
    EveryNRuns {
        runs: u64,
    },
    Interval {
        seconds: u64,
    },
    ReadoutThreshold {
        label: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    AnyOf {
        triggers: Vec<TriggerSettings>,
    },
    Manual,
}

impl TriggerSettings {
    /// Instantiates the policy.
    pub fn build(&self) -> Box<dyn TriggerPolicy> {
        match self {
            TriggerSettings::EveryNRuns { runs } => Box::new(EveryNRuns(*runs)),
            TriggerSettings::Interval { seconds } => {
                Box::new(Interval(Duration::from_secs(*seconds)))
            }
            TriggerSettings::ReadoutThreshold { label, min, max } => Box::new(ReadoutThreshold {
                label: label.clone(),
                min: *min,
                max: *max,
            }),
            TriggerSettings::AnyOf { triggers } => {
                Box::new(AnyOf(triggers.iter().map(TriggerSettings::build).collect()))
            }
            TriggerSettings::Manual => Box::new(ManualOnly),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            TriggerSettings::EveryNRuns { runs: 0 } => Err(ConfigError::Validation(
                "every_n_runs trigger needs runs > 0".into(),
            )),
            TriggerSettings::Interval { seconds: 0 } => Err(ConfigError::Validation(
                "interval trigger needs seconds > 0".into(),
            )),
            TriggerSettings::ReadoutThreshold { label, min, max } => match (min, max) {
                (None, None) => Err(ConfigError::Validation(format!(
                    "readout_threshold trigger on '{label}' needs min or max"
                ))),
                (Some(min), Some(max)) if min > max => Err(ConfigError::Validation(format!(
                    "readout_threshold trigger on '{label}' has min {min} > max {max}"
                ))),
                _ => Ok(()),
            },
            TriggerSettings::AnyOf { triggers } if triggers.is_empty() => Err(
                ConfigError::Validation("any_of trigger needs at least one trigger".into()),
            ),
            TriggerSettings::AnyOf { triggers } => triggers.iter().try_for_each(Self::validate),
            _ => Ok(()),
        }
    }
}

impl Settings {
    /// Load from `nv_daq.toml` in the working directory and the environment.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if extraction or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(SETTINGS_FILE)
    }

    /// Load from a specific file path. A missing file yields defaults
    /// (plus environment overrides).
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("NVDAQ_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks log level and trigger parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }
        if let Some(recalibration) = &self.recalibration {
            recalibration.trigger.validate()?;
        }
        Ok(())
    }
}
