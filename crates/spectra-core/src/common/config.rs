//! Immutable run configuration.
//!
//! Every component receives its section of [`SynthesisConfig`] by value when it
//! is constructed; nothing reads process-wide defaults after loading.

use crate::domain::SynthError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_WORK_ROOT: &str = "SPECTRA_WORK_ROOT";
pub const ENV_CACHE_DIR: &str = "SPECTRA_CACHE_DIR";
pub const ENV_KERNEL: &str = "SPECTRA_KERNEL";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SynthesisConfig {
    pub partition: PartitionConfig,
    pub scheduler: SchedulerConfig,
    pub tuner: TunerConfig,
    pub convolution: ConvolutionConfig,
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    #[default]
    KeepFirst,
    KeepStrongest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PartitionConfig {
    /// Chunk width in the line list's wavelength unit.
    pub chunk_width: f64,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            chunk_width: 100.0,
            duplicate_policy: DuplicatePolicy::KeepFirst,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Worker count; `0` means one worker per available core.
    pub workers: usize,
    pub timeout_secs: f64,
    pub poll_interval_ms: u64,
    pub kernel: PathBuf,
    pub kernel_args: Vec<String>,
    pub session_root: PathBuf,
    pub keep_sessions: bool,
    /// Number of trailing kernel log lines attached to a failed session.
    pub diagnostic_lines: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            timeout_secs: 600.0,
            poll_interval_ms: 20,
            kernel: PathBuf::from("pfant"),
            kernel_args: Vec::new(),
            session_root: PathBuf::from("sessions"),
            keep_sessions: false,
            diagnostic_lines: 20,
        }
    }
}

impl SchedulerConfig {
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1)
    }

    /// Saturates at [`Duration::MAX`]; `validate` rejects values that do
    /// not fit.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs).unwrap_or(Duration::MAX)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TunerConfig {
    pub start: f64,
    pub step: f64,
    /// Multiplier applied to the step after every failed trial.
    pub growth: f64,
    pub tolerance: f64,
    pub max_attempts: usize,
    /// Width of the band at each interval edge where residuals are measured.
    pub edge_band: f64,
    /// zinf used for the reference run the trials are compared against.
    pub reference_zinf: f64,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            start: 0.5,
            step: 0.5,
            growth: 1.0,
            tolerance: 1e-3,
            max_attempts: 8,
            edge_band: 1.0,
            reference_zinf: 50.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConvolutionConfig {
    /// Sampling step of the stitched spectrum; inferred from the segments when unset.
    pub sampling_step: Option<f64>,
    /// Kernel truncation, in half-widths at half maximum.
    pub truncation_half_widths: f64,
}

impl Default for ConvolutionConfig {
    fn default() -> Self {
        Self {
            sampling_step: None,
            truncation_half_widths: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceConfig {
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration '{path}': {message}")]
    Io { path: PathBuf, message: String },
    #[error("failed to parse configuration '{path}': {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl From<ConfigError> for SynthError {
    fn from(error: ConfigError) -> Self {
        match &error {
            ConfigError::Io { .. } => SynthError::io_system("IO.CONFIG_READ", error.to_string()),
            ConfigError::Parse { .. } => {
                SynthError::input_validation("INPUT.CONFIG_PARSE", error.to_string())
            }
            ConfigError::Invalid { .. } => {
                SynthError::input_validation("INPUT.CONFIG_VALUE", error.to_string())
            }
        }
    }
}

impl SynthesisConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            message: source.to_string(),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            message: source.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `SPECTRA_*` overrides from `lookup` (normally `std::env::var`).
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ENV_WORK_ROOT).filter(|value| !value.is_empty()) {
            self.scheduler.session_root = PathBuf::from(root);
        }
        if let Some(cache) = lookup(ENV_CACHE_DIR).filter(|value| !value.is_empty()) {
            self.source.cache_dir = Some(PathBuf::from(cache));
        }
        if let Some(kernel) = lookup(ENV_KERNEL).filter(|value| !value.is_empty()) {
            self.scheduler.kernel = PathBuf::from(kernel);
        }
        self
    }

    pub fn from_process_env(self) -> Self {
        self.with_env_overrides(|key| std::env::var(key).ok())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("partition.chunkWidth", self.partition.chunk_width)?;
        positive("scheduler.timeoutSecs", self.scheduler.timeout_secs)?;
        let timeout_secs = self.scheduler.timeout_secs;
        Duration::try_from_secs_f64(timeout_secs).map_err(|source| ConfigError::Invalid {
            field: "scheduler.timeoutSecs",
            reason: format!("{} s is not a usable timeout: {}", timeout_secs, source),
        })?;
        positive("tuner.step", self.tuner.step)?;
        positive("tuner.tolerance", self.tuner.tolerance)?;
        positive("tuner.edgeBand", self.tuner.edge_band)?;
        positive("tuner.referenceZinf", self.tuner.reference_zinf)?;
        if !self.tuner.start.is_finite() || self.tuner.start < 0.0 {
            return Err(ConfigError::Invalid {
                field: "tuner.start",
                reason: format!("expected a finite value >= 0, got {}", self.tuner.start),
            });
        }
        if !self.tuner.growth.is_finite() || self.tuner.growth < 1.0 {
            return Err(ConfigError::Invalid {
                field: "tuner.growth",
                reason: format!("expected a finite value >= 1, got {}", self.tuner.growth),
            });
        }
        if self.tuner.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "tuner.maxAttempts",
                reason: "expected at least one attempt".to_string(),
            });
        }
        if let Some(step) = self.convolution.sampling_step {
            positive("convolution.samplingStep", step)?;
        }
        positive(
            "convolution.truncationHalfWidths",
            self.convolution.truncation_half_widths,
        )?;
        Ok(())
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("expected a finite value > 0, got {}", value),
        })
    }
}
