//! Error taxonomy for the ingestion pipeline.
//!
//! Errors are split by the stage that raises them. Rejections that happen
//! before a job exists (`UnsupportedFormat`, `EmptyFile`, `FileTooLarge`) are
//! returned synchronously to the submitter; everything else is recorded on the
//! job. Fast-path and chunk errors are recoverable: the loader absorbs them
//! into fallback or partial-success accounting.

use std::time::Duration;

/// Failure reported by a storage engine call.
#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("statement exceeded {0:?} timeout")]
    Timeout(Duration),

    #[error("staged artifact '{0}' not found")]
    MissingArtifact(String),

    #[error("warehouse connection lock poisoned")]
    LockPoisoned,

    #[error("blocking warehouse task failed: {0}")]
    Join(String),

    #[error("{0}")]
    Rejected(String),
}

/// Failure reported by an audit recorder. Never fails a job.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit sink rejected event: {0}")]
    Sink(String),

    #[error("audit call exceeded {0:?} timeout")]
    Timeout(Duration),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("unsupported file format '{extension}' (expected one of csv, xlsx, xls, json)")]
    UnsupportedFormat { extension: String },

    #[error("file '{0}' is empty")]
    EmptyFile(String),

    #[error("file is {size} bytes, exceeding the {limit} byte ceiling")]
    FileTooLarge { size: usize, limit: usize },

    #[error("failed to decode input: {0}")]
    Decode(String),

    #[error("provisioning table '{table}' failed: {reason}")]
    Ddl { table: String, reason: String },

    #[error("staging upload failed: {0}")]
    Staging(String),

    #[error("bulk load statement failed: {0}")]
    FastPathLoad(String),

    #[error("chunk at offset {offset} failed after {attempts} attempt(s): {reason}")]
    ChunkInsert {
        offset: usize,
        attempts: u32,
        reason: String,
    },

    #[error("job cancelled")]
    Cancelled,

    #[error("job exceeded its {0:?} deadline")]
    TimedOut(Duration),

    #[error("ingestion job '{0}' not found")]
    NotFound(String),

    #[error("ingestion job '{job_id}' failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Errors the loader may absorb instead of failing the job.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            IngestError::Staging(_) | IngestError::FastPathLoad(_) | IngestError::ChunkInsert { .. }
        )
    }

    /// Errors raised before any job id is allocated.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            IngestError::UnsupportedFormat { .. }
                | IngestError::EmptyFile(_)
                | IngestError::FileTooLarge { .. }
        )
    }
}

impl From<tokio::task::JoinError> for IngestError {
    fn from(err: tokio::task::JoinError) -> Self {
        IngestError::Task(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
