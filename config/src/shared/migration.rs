use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use crate::Config;
use crate::shared::{
    CloudRetryConfig, ExportRetryConfig, HelperConfig, MigrationOptions, MonitorConfig,
    SchedulerConfig, WorkRequestConfig,
};

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("`work_dir` cannot be empty")]
    EmptyWorkDir,
    #[error("`export_retry.max_attempts` cannot be zero")]
    ExportMaxAttemptsZero,
    #[error("`export_retry.growth_factor` must be >= 1.0, got {0}")]
    GrowthFactorTooSmall(f64),
    #[error("`export_retry.base_delay_ms` ({base}) exceeds `export_retry.max_delay_ms` ({max})")]
    BaseDelayAboveMax { base: u64, max: u64 },
    #[error("`cloud_retry.max_attempts` cannot be zero")]
    CloudMaxAttemptsZero,
    #[error("`cloud_connectivity` must be set for a hot migration")]
    MissingConnectivity,
}

/// Top level configuration of one migration run.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    /// Directory holding the persisted status, resource and coordinate documents.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub options: MigrationOptions,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub export_retry: ExportRetryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub helper: HelperConfig,
    #[serde(default)]
    pub work_request: WorkRequestConfig,
    #[serde(default)]
    pub cloud_retry: CloudRetryConfig,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("migration")
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            options: MigrationOptions::default(),
            scheduler: SchedulerConfig::default(),
            export_retry: ExportRetryConfig::default(),
            monitor: MonitorConfig::default(),
            helper: HelperConfig::default(),
            work_request: WorkRequestConfig::default(),
            cloud_retry: CloudRetryConfig::default(),
        }
    }
}

impl Config for MigrationConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}

impl MigrationConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.work_dir.as_os_str().is_empty() {
            return Err(ValidationError::EmptyWorkDir);
        }

        let retry = &self.export_retry;
        if retry.max_attempts == 0 {
            return Err(ValidationError::ExportMaxAttemptsZero);
        }
        if retry.growth_factor < 1.0 {
            return Err(ValidationError::GrowthFactorTooSmall(retry.growth_factor));
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(ValidationError::BaseDelayAboveMax {
                base: retry.base_delay_ms,
                max: retry.max_delay_ms,
            });
        }

        if self.cloud_retry.max_attempts == 0 {
            return Err(ValidationError::CloudMaxAttemptsZero);
        }

        if self.options.is_hot()
            && self.options.cloud_connectivity == crate::shared::CloudConnectivity::NotSet
        {
            return Err(ValidationError::MissingConnectivity);
        }

        Ok(())
    }
}
