use std::{
    collections::HashMap,
    fmt,
    sync::{PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{IngestError, Result},
    loader::LoadMethod,
    schema::ColumnSchema,
};

pub const INGESTION_ID_PREFIX: &str = "ING";

/// `PREFIX-XXXXXXXX` with eight upper-case hex characters from a v4 UUID.
pub fn prefixed_id(prefix: &str) -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", simple[..8].to_ascii_uppercase())
}

pub fn new_ingestion_id() -> String {
    prefixed_id(INGESTION_ID_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Sniffing,
    Inferring,
    Provisioning,
    Loading,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobStatus::Pending => "pending",
            JobStatus::Sniffing => "sniffing",
            JobStatus::Inferring => "inferring",
            JobStatus::Provisioning => "provisioning",
            JobStatus::Loading => "loading",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionJob {
    pub job_id: String,
    pub filename: String,
    pub byte_size: usize,
    pub detected_encoding: Option<String>,
    pub detected_delimiter: Option<char>,
    pub target_table: String,
    pub schema: Vec<ColumnSchema>,
    pub total_rows: usize,
    pub rows_loaded: usize,
    pub status: JobStatus,
    pub method_used: Option<LoadMethod>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Advisory notes: skipped rows, widened columns, lost chunks.
    pub warnings: Vec<String>,
}

impl IngestionJob {
    pub fn new(
        job_id: impl Into<String>,
        filename: impl Into<String>,
        byte_size: usize,
        target_table: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            filename: filename.into(),
            byte_size,
            detected_encoding: None,
            detected_delimiter: None,
            target_table: target_table.into(),
            schema: Vec::new(),
            total_rows: 0,
            rows_loaded: 0,
            status: JobStatus::Pending,
            method_used: None,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            warnings: Vec::new(),
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at)
            .to_std()
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn summary(&self) -> IngestionSummary {
        IngestionSummary {
            job_id: self.job_id.clone(),
            table_name: self.target_table.clone(),
            rows_loaded: self.rows_loaded,
            total_rows: self.total_rows,
            method_used: self.method_used,
            elapsed_seconds: self.elapsed_seconds(),
            status: self.status,
            warnings: self.warnings.clone(),
        }
    }
}

/// Result handed back to a submitter once a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionSummary {
    pub job_id: String,
    pub table_name: String,
    pub rows_loaded: usize,
    pub total_rows: usize,
    pub method_used: Option<LoadMethod>,
    pub elapsed_seconds: f64,
    pub status: JobStatus,
    pub warnings: Vec<String>,
}

/// Registry of jobs keyed by id. Jobs are never removed.
pub trait JobStore: Send + Sync {
    fn insert(&self, job: IngestionJob);

    /// Apply `change` to a job in place and return the updated copy.
    fn update(&self, job_id: &str, change: &mut dyn FnMut(&mut IngestionJob)) -> Result<IngestionJob>;

    fn get(&self, job_id: &str) -> Result<IngestionJob>;

    /// Every job in submission order.
    fn list(&self) -> Vec<IngestionJob>;

    /// Snapshots from concurrent workers arrive unordered; the count never
    /// moves backwards.
    fn record_progress(&self, job_id: &str, rows_loaded: usize) -> Result<()> {
        self.update(job_id, &mut |job: &mut IngestionJob| {
            job.rows_loaded = job.rows_loaded.max(rows_loaded)
        })
        .map(|_| ())
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    jobs: HashMap<String, IngestionJob>,
    order: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: RwLock<StoreInner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn insert(&self, job: IngestionJob) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !inner.jobs.contains_key(&job.job_id) {
            inner.order.push(job.job_id.clone());
        }
        inner.jobs.insert(job.job_id.clone(), job);
    }

    fn update(&self, job_id: &str, change: &mut dyn FnMut(&mut IngestionJob)) -> Result<IngestionJob> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| IngestError::NotFound(job_id.to_string()))?;
        change(job);
        Ok(job.clone())
    }

    fn get(&self, job_id: &str) -> Result<IngestionJob> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| IngestError::NotFound(job_id.to_string()))
    }

    fn list(&self) -> Vec<IngestionJob> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect()
    }
}
