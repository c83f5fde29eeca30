use std::{fs::File, io::BufReader, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

pub const DEFAULT_MAX_FILE_BYTES: usize = 50 * 1024 * 1024;
pub const DEFAULT_ENCODING_SAMPLE_BYTES: usize = 100 * 1024;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;
pub const DEFAULT_SCHEMA_SAMPLE_SIZE: usize = 100;
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// How the provisioner treats an existing destination table.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    #[default]
    CreateIfAbsent,
    RecreateAlways,
}

/// Bounded retry applied to each fallback chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff_ms: 200,
        }
    }
}

impl RetryPolicy {
    /// Linear backoff before attempt `attempt` (1-based; the first attempt never waits).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt.saturating_sub(1))))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_file_bytes: usize,
    pub encoding_sample_bytes: usize,
    pub encoding_confidence_threshold: f64,
    pub delimiter_sample_lines: usize,
    pub schema_sample_size: usize,
    pub chunk_size: usize,
    pub max_workers: usize,
    pub statement_timeout_secs: u64,
    pub audit_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_timeout_secs: Option<u64>,
    pub progress_interval_rows: usize,
    pub max_text_len: usize,
    pub raw_sample_rows: usize,
    pub fast_path_enabled: bool,
    pub create_mode: CreateMode,
    pub retry: RetryPolicy,
    /// Recorded as `user_id` on every audit event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_user: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            encoding_sample_bytes: DEFAULT_ENCODING_SAMPLE_BYTES,
            encoding_confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            delimiter_sample_lines: 5,
            schema_sample_size: DEFAULT_SCHEMA_SAMPLE_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_workers: 4,
            statement_timeout_secs: 30,
            audit_timeout_secs: 5,
            job_timeout_secs: None,
            progress_interval_rows: 5_000,
            max_text_len: 10_000,
            raw_sample_rows: 10,
            fast_path_enabled: true,
            create_mode: CreateMode::default(),
            retry: RetryPolicy::default(),
            audit_user: None,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening config file {path:?}"))?;
        let reader = BufReader::new(file);
        let config: PipelineConfig =
            serde_yaml::from_reader(reader).context("Parsing pipeline config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("Creating config file {path:?}"))?;
        serde_yaml::to_writer(file, self).context("Writing pipeline config YAML")
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Serializing pipeline config to YAML string")
    }

    pub fn validate(&self) -> std::result::Result<(), IngestError> {
        let invalid = |msg: &str| Err(IngestError::Config(msg.to_string()));
        if self.max_file_bytes == 0 {
            return invalid("max_file_bytes must be positive");
        }
        if self.encoding_sample_bytes == 0 {
            return invalid("encoding_sample_bytes must be positive");
        }
        if !(0.0..=1.0).contains(&self.encoding_confidence_threshold) {
            return invalid("encoding_confidence_threshold must lie within [0, 1]");
        }
        if self.delimiter_sample_lines == 0 {
            return invalid("delimiter_sample_lines must be positive");
        }
        if self.schema_sample_size == 0 {
            return invalid("schema_sample_size must be positive");
        }
        if self.chunk_size == 0 {
            return invalid("chunk_size must be positive");
        }
        if self.max_workers == 0 {
            return invalid("max_workers must be positive");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.statement_timeout_secs == 0 {
            return invalid("statement_timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }

    pub fn audit_timeout(&self) -> Duration {
        Duration::from_secs(self.audit_timeout_secs)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}
