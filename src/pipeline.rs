//! Ingestion orchestrator.
//!
//! [`Pipeline::submit`] validates a file synchronously and either rejects it
//! or allocates a job id and runs the job on its own task. Stages run
//! strictly in order: sniff, infer, provision, load. Each transition is
//! recorded on the job and reported to the audit recorder.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::Utc;
use log::{debug, info, warn};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    audit::{self, AuditEvent, AuditLevel, AuditRecorder, LogAuditRecorder},
    config::PipelineConfig,
    data::Value,
    error::{IngestError, Result},
    frame::TypedFrame,
    job::{IngestionJob, IngestionSummary, JobStatus, JobStore, MemoryJobStore, new_ingestion_id},
    literal::{encode_literal, encode_text},
    loader::{BulkLoader, LoadContext, LoadProgress, LoadResult, LoaderSettings},
    naming,
    provision::{self, RAW_DATA_TABLE},
    schema::{self, ColumnSchema},
    sniff::{self, FileFormat},
    warehouse::{Warehouse, with_timeout},
};

const AUDIT_PROCESS: &str = "ingestion";

struct JobHandle {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

struct PipelineInner {
    config: PipelineConfig,
    warehouse: Arc<dyn Warehouse>,
    store: Arc<dyn JobStore>,
    audit: Arc<dyn AuditRecorder>,
    handles: Mutex<HashMap<String, JobHandle>>,
}

/// Cheap to clone; clones share jobs, store and warehouse.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, warehouse: Arc<dyn Warehouse>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PipelineInner {
                config,
                warehouse,
                store: Arc::new(MemoryJobStore::new()),
                audit: Arc::new(LogAuditRecorder),
                handles: Mutex::new(HashMap::new()),
            }),
        })
    }

    fn rebuild(self, change: impl FnOnce(&mut PipelineInner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                change(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(shared) => {
                warn!("Pipeline already shared; builder change ignored");
                Self { inner: shared }
            }
        }
    }

    pub fn with_store(self, store: Arc<dyn JobStore>) -> Self {
        self.rebuild(|inner| inner.store = store)
    }

    pub fn with_audit(self, audit: Arc<dyn AuditRecorder>) -> Self {
        self.rebuild(|inner| inner.audit = audit)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Validate and start ingesting `bytes`. Must be called within a Tokio
    /// runtime. Format and size problems are returned here and never
    /// allocate a job.
    pub fn submit(&self, bytes: Vec<u8>, filename: &str, target_table: Option<&str>) -> Result<String> {
        FileFormat::from_filename(filename)?;
        if bytes.is_empty() {
            return Err(IngestError::EmptyFile(filename.to_string()));
        }
        let limit = self.inner.config.max_file_bytes;
        if bytes.len() > limit {
            return Err(IngestError::FileTooLarge {
                size: bytes.len(),
                limit,
            });
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| IngestError::Config(format!("no async runtime available: {err}")))?;

        let job_id = new_ingestion_id();
        let table = match target_table {
            Some(name) => naming::sanitize_identifier(name),
            None => naming::table_name_for(filename),
        };
        self.inner
            .store
            .insert(IngestionJob::new(&job_id, filename, bytes.len(), &table));

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        self.inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                job_id.clone(),
                JobHandle {
                    cancel: cancel.clone(),
                    done: done_rx,
                },
            );

        info!("Accepted '{filename}' ({} bytes) as job {job_id} targeting '{table}'", bytes.len());
        let worker = JobWorker {
            inner: Arc::clone(&self.inner),
            job_id: job_id.clone(),
            filename: filename.to_string(),
            table,
            cancel,
            audit_calls: Vec::new(),
        };
        runtime.spawn(async move {
            worker.run(bytes).await;
            let _ = done_tx.send(true);
        });
        Ok(job_id)
    }

    pub fn status(&self, job_id: &str) -> Result<IngestionJob> {
        self.inner.store.get(job_id)
    }

    pub fn history(&self) -> Vec<IngestionJob> {
        self.inner.store.list()
    }

    /// Request cancellation; the job stops at its next suspension point.
    pub fn cancel(&self, job_id: &str) -> Result<()> {
        let handles = self.inner.handles.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = handles
            .get(job_id)
            .ok_or_else(|| IngestError::NotFound(job_id.to_string()))?;
        info!("Cancelling job {job_id}");
        handle.cancel.cancel();
        Ok(())
    }

    /// Wait for a job to reach a terminal state and its audit calls to settle.
    pub async fn wait(&self, job_id: &str) -> Result<IngestionJob> {
        let mut done = {
            let handles = self.inner.handles.lock().unwrap_or_else(PoisonError::into_inner);
            handles
                .get(job_id)
                .map(|handle| handle.done.clone())
                .ok_or_else(|| IngestError::NotFound(job_id.to_string()))?
        };
        // A closed channel means the worker is gone; the store is authoritative.
        let _ = done.wait_for(|finished| *finished).await;
        self.inner.store.get(job_id)
    }

    /// Submit and wait. Partial loads are returned as `Ok`; failed jobs as
    /// [`IngestError::JobFailed`].
    pub async fn ingest(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        target_table: Option<&str>,
    ) -> Result<IngestionSummary> {
        let job_id = self.submit(bytes, filename, target_table)?;
        let job = self.wait(&job_id).await?;
        match job.status {
            JobStatus::Completed => Ok(job.summary()),
            _ => Err(IngestError::JobFailed {
                job_id,
                reason: job.error.unwrap_or_else(|| format!("ended in status {}", job.status)),
            }),
        }
    }

    /// Create the audit and raw-sample tables.
    pub async fn setup(&self) -> Result<()> {
        provision::setup_infrastructure(
            self.inner.warehouse.as_ref(),
            self.inner.config.statement_timeout(),
        )
        .await
    }
}

/// Owns one job from its first stage to its terminal state.
struct JobWorker {
    inner: Arc<PipelineInner>,
    job_id: String,
    filename: String,
    table: String,
    cancel: CancellationToken,
    audit_calls: Vec<JoinHandle<()>>,
}

/// What the staged part of a job hands back for the raw sample and summary.
struct LoadedFrame {
    result: LoadResult,
    typed: Arc<TypedFrame>,
    ctx: LoadContext,
}

impl JobWorker {
    async fn run(mut self, bytes: Vec<u8>) {
        self.audit(
            AuditLevel::Info,
            format!("Ingestion started for '{}'", self.filename),
            &[("bytes", bytes.len().into())],
        );

        let outcome = match self.inner.config.job_timeout() {
            Some(limit) => {
                let cancel = self.cancel.clone();
                let stages = self.run_stages(bytes);
                tokio::pin!(stages);
                tokio::select! {
                    result = &mut stages => result,
                    _ = tokio::time::sleep(limit) => {
                        cancel.cancel();
                        Err(IngestError::TimedOut(limit))
                    }
                }
            }
            None => self.run_stages(bytes).await,
        };

        match outcome {
            Ok(loaded) => {
                if let Err(err) = self.capture_raw_sample(&loaded.typed, &loaded.ctx).await {
                    warn!("Raw sample for job {} was not stored: {err}", self.job_id);
                }
                self.complete(loaded.result)
            }
            Err(err) => self.fail(err),
        }
        self.flush_audit().await;
    }

    async fn run_stages(&mut self, bytes: Vec<u8>) -> Result<LoadedFrame> {
        let config = self.inner.config.clone();

        self.transition(JobStatus::Sniffing)?;
        let filename = self.filename.clone();
        let sniff_config = config.clone();
        let outcome = self
            .blocking(move || sniff::sniff(&bytes, &filename, &sniff_config))
            .await?;
        let encoding = outcome.encoding_label();
        let delimiter = outcome.delimiter.map(char::from);
        let total_rows = outcome.frame.row_count();
        let notes = outcome.issues.notes.clone();
        self.update(|job| {
            job.detected_encoding = Some(encoding.clone());
            job.detected_delimiter = delimiter;
            job.total_rows = total_rows;
            job.warnings.extend(notes.iter().cloned());
        })?;
        self.audit(
            AuditLevel::Info,
            format!("Sniffed {} file", outcome.format),
            &[
                ("encoding", encoding.clone().into()),
                ("delimiter", delimiter.map(String::from).into()),
                ("rows", total_rows.into()),
                ("skipped_rows", outcome.issues.skipped_rows.into()),
            ],
        );

        self.transition(JobStatus::Inferring)?;
        let frame = outcome.frame;
        let sample_size = config.schema_sample_size;
        let (inferred, typed) = self
            .blocking(move || {
                let inferred = schema::infer(&frame, sample_size);
                let typed = schema::type_rows(&frame, inferred.columns.clone());
                Ok((inferred, typed))
            })
            .await?;
        let columns = typed.schema.clone();
        let issues = inferred.issues.clone();
        self.update(|job| {
            job.schema = columns.clone();
            job.warnings.extend(issues.iter().cloned());
        })?;
        self.audit(
            AuditLevel::Info,
            format!("Schema inferred with {} column(s)", columns.len()),
            &[
                ("columns", schema_metadata(&columns)),
                ("duplicate_rows", inferred.profile.duplicate_rows.into()),
                ("null_percentages", serde_json::json!(inferred.profile.null_percentages)),
            ],
        );

        self.transition(JobStatus::Provisioning)?;
        let provisioned = tokio::select! {
            _ = self.cancel.cancelled() => return Err(IngestError::Cancelled),
            provisioned = provision::provision(
                self.inner.warehouse.as_ref(),
                &self.table,
                &columns,
                config.create_mode,
                config.statement_timeout(),
            ) => provisioned?,
        };
        let typed = if provisioned.is_fully_compatible() {
            typed
        } else {
            let note = format!(
                "table '{}' lacks column(s) {}; their values were not loaded",
                provisioned.name,
                provisioned.missing.join(", ")
            );
            let projected = typed.project(&provisioned.loadable);
            let kept = projected.schema.clone();
            self.update(|job| {
                job.schema = kept.clone();
                job.warnings.push(note.clone());
            })?;
            self.audit(AuditLevel::Warning, note, &[]);
            projected
        };
        self.audit(
            AuditLevel::Info,
            format!("Table '{}' provisioned", provisioned.name),
            &[("columns", provisioned.columns.len().into())],
        );

        self.transition(JobStatus::Loading)?;
        let typed = Arc::new(typed);
        let loader = BulkLoader::new(Arc::clone(&self.inner.warehouse), LoaderSettings::from(&config));
        let store = Arc::clone(&self.inner.store);
        let progress_job = self.job_id.clone();
        let ctx = LoadContext::new(&self.job_id)
            .with_cancel(self.cancel.clone())
            .with_progress(Arc::new(move |progress: LoadProgress| {
                debug!(
                    "Job {progress_job}: {}/{} row(s) loaded ({:.0} rows/s)",
                    progress.rows_loaded, progress.total_rows, progress.rows_per_second
                );
                if let Err(err) = store.record_progress(&progress_job, progress.rows_loaded) {
                    warn!("Could not record progress for {progress_job}: {err}");
                }
            }));
        let result = loader.load(&provisioned.name, Arc::clone(&typed), &ctx).await?;
        Ok(LoadedFrame { result, typed, ctx })
    }

    /// Run CPU-bound work off the async workers, honouring cancellation.
    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let task = tokio::task::spawn_blocking(work);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(IngestError::Cancelled),
            joined = task => joined?,
        }
    }

    fn update(&self, mut change: impl FnMut(&mut IngestionJob)) -> Result<IngestionJob> {
        self.inner.store.update(&self.job_id, &mut change)
    }

    fn transition(&self, status: JobStatus) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        self.update(|job| job.status = status)?;
        info!("Job {} -> {status}", self.job_id);
        Ok(())
    }

    fn audit(&mut self, level: AuditLevel, message: String, metadata: &[(&str, serde_json::Value)]) {
        let mut event = AuditEvent::new(AUDIT_PROCESS, level, message)
            .with("job_id", self.job_id.clone())
            .with("table", self.table.clone());
        for (key, value) in metadata {
            event = event.with(key, value.clone());
        }
        if let Some(user) = &self.inner.config.audit_user {
            event = event.with_user(user.clone());
        }
        let call = audit::emit(&self.inner.audit, event, self.inner.config.audit_timeout());
        self.audit_calls.push(call);
    }

    async fn flush_audit(&mut self) {
        for call in self.audit_calls.drain(..) {
            if let Err(err) = call.await {
                warn!("Audit task for job {} ended abnormally: {err}", self.job_id);
            }
        }
    }

    fn complete(&mut self, result: LoadResult) {
        let warnings = result.warnings.clone();
        let updated = self.update(|job| {
            job.status = JobStatus::Completed;
            job.rows_loaded = result.rows_loaded;
            job.total_rows = result.total_rows;
            job.method_used = Some(result.method_used);
            job.finished_at = Some(Utc::now());
            job.warnings.extend(warnings.iter().cloned());
        });
        if let Err(err) = updated {
            warn!("Could not record completion of job {}: {err}", self.job_id);
        }
        let level = if result.is_partial() {
            AuditLevel::Warning
        } else {
            AuditLevel::Success
        };
        info!(
            "Job {} completed: {}/{} row(s) via {} in {:.2}s",
            self.job_id,
            result.rows_loaded,
            result.total_rows,
            result.method_used,
            result.elapsed.as_secs_f64()
        );
        self.audit(
            level,
            format!("Loaded {} of {} row(s)", result.rows_loaded, result.total_rows),
            &[
                ("rows_loaded", result.rows_loaded.into()),
                ("total_rows", result.total_rows.into()),
                ("method_used", result.method_used.to_string().into()),
                ("elapsed_seconds", result.elapsed.as_secs_f64().into()),
                ("rows_per_second", result.rows_per_second.into()),
                ("failed_chunks", result.failed_chunks.len().into()),
            ],
        );
    }

    fn fail(&mut self, err: IngestError) {
        let reason = err.to_string();
        warn!("Job {} failed: {reason}", self.job_id);
        let updated = self.update(|job| {
            job.status = JobStatus::Failed;
            job.finished_at = Some(Utc::now());
            job.error = Some(reason.clone());
        });
        if let Err(store_err) = updated {
            warn!("Could not record failure of job {}: {store_err}", self.job_id);
        }
        self.audit(AuditLevel::Error, format!("Ingestion failed: {reason}"), &[]);
    }

    /// Store the first rows and per-column type info in `raw_data`, if that
    /// table has been set up.
    async fn capture_raw_sample(&self, typed: &TypedFrame, ctx: &LoadContext) -> Result<()> {
        let limit = self.inner.config.statement_timeout();
        let warehouse = self.inner.warehouse.as_ref();
        if !with_timeout(limit, warehouse.table_exists(RAW_DATA_TABLE)).await? {
            debug!("No {RAW_DATA_TABLE} table; skipping raw sample for job {}", self.job_id);
            return Ok(());
        }
        let sql = raw_sample_sql(
            typed,
            &self.job_id,
            &self.table,
            &self.filename,
            ctx,
            self.inner.config.raw_sample_rows,
            warehouse,
        );
        with_timeout(limit, warehouse.execute(&sql)).await?;
        Ok(())
    }
}

fn schema_metadata(columns: &[ColumnSchema]) -> serde_json::Value {
    serde_json::Value::Array(
        columns
            .iter()
            .map(|column| {
                serde_json::json!({
                    "name": column.sanitized_name,
                    "source": column.source_name,
                    "type": column.inferred_type.as_str(),
                    "nullable": column.nullable,
                })
            })
            .collect(),
    )
}

fn raw_sample_sql(
    typed: &TypedFrame,
    job_id: &str,
    table: &str,
    filename: &str,
    ctx: &LoadContext,
    sample_rows: usize,
    warehouse: &dyn Warehouse,
) -> String {
    let names = typed.column_names();
    let sample: Vec<serde_json::Value> = typed
        .rows
        .iter()
        .take(sample_rows)
        .map(|row| {
            let object: serde_json::Map<String, serde_json::Value> = names
                .iter()
                .zip(row)
                .map(|(name, cell)| {
                    (
                        name.clone(),
                        cell.as_ref().map(Value::to_json).unwrap_or(serde_json::Value::Null),
                    )
                })
                .collect();
            serde_json::Value::Object(object)
        })
        .collect();
    let column_info: serde_json::Map<String, serde_json::Value> = typed
        .schema
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let first = typed
                .rows
                .iter()
                .find_map(|row| row[idx].as_ref())
                .map(Value::as_display);
            (
                column.sanitized_name.clone(),
                serde_json::json!({ "dtype": column.inferred_type.as_str(), "sample": first }),
            )
        })
        .collect();

    let dialect = warehouse.dialect();
    let text = |value: &str| encode_text(value, dialect, usize::MAX);
    format!(
        "INSERT INTO {RAW_DATA_TABLE} (ingestion_id, table_name, filename, raw_data, uploaded_at, \
         record_count, column_info) VALUES ({}, {}, {}, {}, {}, {}, {})",
        text(job_id),
        text(table),
        text(filename),
        text(&serde_json::Value::Array(sample).to_string()),
        encode_literal(Some(&Value::Timestamp(ctx.processed_at)), dialect, usize::MAX),
        typed.row_count(),
        text(&serde_json::Value::Object(column_info).to_string()),
    )
}

/// Helper for callers that only need the job outcome after a bounded wait.
pub async fn wait_with_deadline(
    pipeline: &Pipeline,
    job_id: &str,
    deadline: Duration,
) -> Result<IngestionJob> {
    tokio::time::timeout(deadline, pipeline.wait(job_id))
        .await
        .map_err(|_| IngestError::TimedOut(deadline))?
}
