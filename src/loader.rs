//! Two-tier bulk loading.
//!
//! The fast path serializes every row into one staged artifact and asks the
//! engine to ingest it in a single call; it is all-or-nothing. Any failure
//! there hands the whole frame to the fallback path, which splits rows into
//! chunks and issues one multi-row INSERT per chunk from a bounded pool of
//! workers. Each chunk is retried on the worker that owns it; chunks that
//! exhaust their attempts are counted as lost and the load continues.
//! Rows a failed bulk load left under the job's ingestion id are deleted
//! before the fallback writes anything.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::NaiveDateTime;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{PipelineConfig, RetryPolicy},
    data::{CANONICAL_TIMESTAMP_FORMAT, Value},
    error::{IngestError, Result, WarehouseError},
    frame::TypedFrame,
    literal::{SqlDialect, cap_text, column_list, encode_literal, encode_text, quote_identifier},
    provision::{INGESTION_ID_COLUMN, PROCESSED_AT_COLUMN},
    warehouse::{Result as WarehouseResult, Warehouse, with_timeout},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadMethod {
    FastPath,
    Fallback,
}

impl fmt::Display for LoadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoadMethod::FastPath => "fast_path",
            LoadMethod::Fallback => "fallback",
        })
    }
}

/// Snapshot handed to progress observers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadProgress {
    pub rows_loaded: usize,
    pub total_rows: usize,
    pub elapsed: Duration,
    pub rows_per_second: f64,
}

pub type ProgressCallback = Arc<dyn Fn(LoadProgress) + Send + Sync>;

/// Per-job inputs threaded through every load call.
#[derive(Clone)]
pub struct LoadContext {
    pub ingestion_id: String,
    pub processed_at: NaiveDateTime,
    pub cancel: CancellationToken,
    pub on_progress: Option<ProgressCallback>,
}

impl LoadContext {
    pub fn new(ingestion_id: impl Into<String>) -> Self {
        Self {
            ingestion_id: ingestion_id.into(),
            processed_at: chrono::Utc::now().naive_utc(),
            cancel: CancellationToken::new(),
            on_progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }
}

/// A chunk that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub offset: usize,
    pub rows: usize,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadResult {
    pub rows_loaded: usize,
    pub total_rows: usize,
    pub method_used: LoadMethod,
    pub elapsed: Duration,
    pub rows_per_second: f64,
    pub failed_chunks: Vec<ChunkFailure>,
    pub warnings: Vec<String>,
}

impl LoadResult {
    pub fn is_partial(&self) -> bool {
        self.rows_loaded < self.total_rows
    }
}

/// Contiguous slice of typed rows; the unit of retry and progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadChunk {
    pub index: usize,
    pub offset: usize,
    pub len: usize,
}

pub fn plan_chunks(total_rows: usize, chunk_size: usize) -> Vec<LoadChunk> {
    let chunk_size = chunk_size.max(1);
    (0..total_rows)
        .step_by(chunk_size)
        .enumerate()
        .map(|(index, offset)| LoadChunk {
            index,
            offset,
            len: chunk_size.min(total_rows - offset),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub chunk_size: usize,
    pub max_workers: usize,
    pub statement_timeout: Duration,
    pub retry: RetryPolicy,
    pub max_text_len: usize,
    pub progress_interval_rows: usize,
    pub fast_path_enabled: bool,
}

impl From<&PipelineConfig> for LoaderSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_workers: config.max_workers,
            statement_timeout: config.statement_timeout(),
            retry: config.retry.clone(),
            max_text_len: config.max_text_len,
            progress_interval_rows: config.progress_interval_rows,
            fast_path_enabled: config.fast_path_enabled,
        }
    }
}

fn rate(rows: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { rows as f64 / secs } else { 0.0 }
}

/// Thread-safe progress accounting shared by fallback workers.
struct ProgressTracker {
    loaded: AtomicUsize,
    total_rows: usize,
    interval: usize,
    started: Instant,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    fn new(total_rows: usize, interval: usize, started: Instant, callback: Option<ProgressCallback>) -> Self {
        Self {
            loaded: AtomicUsize::new(0),
            total_rows,
            interval: interval.max(1),
            started,
            callback,
        }
    }

    fn add(&self, rows: usize) {
        let before = self.loaded.fetch_add(rows, Ordering::SeqCst);
        let after = before + rows;
        if after / self.interval > before / self.interval || after == self.total_rows {
            self.report(after);
        }
    }

    fn report(&self, rows_loaded: usize) {
        if let Some(callback) = &self.callback {
            let elapsed = self.started.elapsed();
            callback(LoadProgress {
                rows_loaded,
                total_rows: self.total_rows,
                elapsed,
                rows_per_second: rate(rows_loaded, elapsed),
            });
        }
    }

    fn loaded(&self) -> usize {
        self.loaded.load(Ordering::SeqCst)
    }
}

/// Destination columns in write order: the frame's columns then system columns.
pub fn load_columns(frame: &TypedFrame) -> Vec<String> {
    let mut columns = frame.column_names();
    columns.push(INGESTION_ID_COLUMN.to_string());
    columns.push(PROCESSED_AT_COLUMN.to_string());
    columns
}

/// Newline-delimited JSON arrays, one per row, system columns last.
pub fn serialize_artifact(
    frame: &TypedFrame,
    ingestion_id: &str,
    processed_at: NaiveDateTime,
    max_text_len: usize,
) -> std::result::Result<Vec<u8>, serde_json::Error> {
    let processed_at = processed_at.format(CANONICAL_TIMESTAMP_FORMAT).to_string();
    let mut payload = Vec::with_capacity(frame.row_count() * 64);
    for row in &frame.rows {
        let mut cells: Vec<serde_json::Value> = row
            .iter()
            .map(|cell| match cell {
                None => serde_json::Value::Null,
                Some(Value::String(s)) => serde_json::Value::String(cap_text(s, max_text_len).to_string()),
                Some(value) => value.to_json(),
            })
            .collect();
        cells.push(serde_json::Value::String(ingestion_id.to_string()));
        cells.push(serde_json::Value::String(processed_at.clone()));
        serde_json::to_writer(&mut payload, &cells)?;
        payload.push(b'\n');
    }
    Ok(payload)
}

/// One multi-row INSERT naming every destination column explicitly.
pub fn chunk_insert_sql(
    table: &str,
    columns: &[String],
    rows: &[Vec<Option<Value>>],
    ingestion_id: &str,
    processed_at: NaiveDateTime,
    dialect: SqlDialect,
    max_text_len: usize,
) -> String {
    let id_literal = encode_text(ingestion_id, dialect, max_text_len);
    let ts_literal = encode_literal(Some(&Value::Timestamp(processed_at)), dialect, max_text_len);
    let tuples: Vec<String> = rows
        .iter()
        .map(|row| {
            let mut literals: Vec<String> = row
                .iter()
                .map(|cell| encode_literal(cell.as_ref(), dialect, max_text_len))
                .collect();
            literals.push(id_literal.clone());
            literals.push(ts_literal.clone());
            format!("({})", literals.join(", "))
        })
        .collect();
    format!(
        "INSERT INTO {} {} VALUES {}",
        quote_identifier(table),
        column_list(columns),
        tuples.join(", ")
    )
}

/// Deletes every row one ingestion wrote to `table`.
pub fn purge_sql(table: &str, ingestion_id: &str, dialect: SqlDialect, max_text_len: usize) -> String {
    format!(
        "DELETE FROM {} WHERE {} = {}",
        quote_identifier(table),
        quote_identifier(INGESTION_ID_COLUMN),
        encode_text(ingestion_id, dialect, max_text_len)
    )
}

fn bulk_load_outcome(
    joined: std::result::Result<WarehouseResult<u64>, JoinError>,
) -> Result<usize> {
    match joined {
        Ok(Ok(rows)) => Ok(rows as usize),
        Ok(Err(err)) => Err(IngestError::FastPathLoad(err.to_string())),
        Err(err) => Err(IngestError::FastPathLoad(format!("bulk load task failed: {err}"))),
    }
}

enum ChunkOutcome {
    Loaded,
    Failed(ChunkFailure),
    Cancelled,
}

/// Everything a fallback worker needs, shareable across tasks.
struct FallbackShared {
    warehouse: Arc<dyn Warehouse>,
    table: String,
    columns: Vec<String>,
    frame: Arc<TypedFrame>,
    chunks: Vec<LoadChunk>,
    cursor: AtomicUsize,
    progress: ProgressTracker,
    settings: LoaderSettings,
    ingestion_id: String,
    processed_at: NaiveDateTime,
    cancel: CancellationToken,
}

impl FallbackShared {
    async fn run_worker(self: Arc<Self>, worker: usize) -> Vec<ChunkOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let next = self.cursor.fetch_add(1, Ordering::SeqCst);
            let Some(chunk) = self.chunks.get(next).copied() else {
                break;
            };
            if self.cancel.is_cancelled() {
                outcomes.push(ChunkOutcome::Cancelled);
                break;
            }
            let outcome = self.load_chunk(worker, chunk).await;
            let stop = matches!(outcome, ChunkOutcome::Cancelled);
            outcomes.push(outcome);
            if stop {
                break;
            }
        }
        outcomes
    }

    async fn load_chunk(&self, worker: usize, chunk: LoadChunk) -> ChunkOutcome {
        let rows = &self.frame.rows[chunk.offset..chunk.offset + chunk.len];
        let sql = chunk_insert_sql(
            &self.table,
            &self.columns,
            rows,
            &self.ingestion_id,
            self.processed_at,
            self.warehouse.dialect(),
            self.settings.max_text_len,
        );
        let max_attempts = self.settings.retry.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.settings.retry.delay_before(attempt);
                tokio::select! {
                    _ = self.cancel.cancelled() => return ChunkOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
                if let Err(err) =
                    with_timeout(self.settings.statement_timeout, self.warehouse.reconnect()).await
                {
                    warn!("Worker {worker}: reconnect before retrying chunk {} failed: {err}", chunk.index);
                }
            }
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return ChunkOutcome::Cancelled,
                result = with_timeout(self.settings.statement_timeout, self.warehouse.execute(&sql)) => result,
            };
            match result {
                Ok(_) => {
                    debug!(
                        "Worker {worker}: chunk {} ({} row(s) at offset {}) loaded on attempt {attempt}",
                        chunk.index, chunk.len, chunk.offset
                    );
                    self.progress.add(chunk.len);
                    return ChunkOutcome::Loaded;
                }
                Err(err) => {
                    warn!(
                        "Worker {worker}: chunk {} at offset {} failed attempt {attempt}/{max_attempts}: {err}",
                        chunk.index, chunk.offset
                    );
                    last_error = err.to_string();
                }
            }
        }
        ChunkOutcome::Failed(ChunkFailure {
            offset: chunk.offset,
            rows: chunk.len,
            attempts: max_attempts,
            reason: last_error,
        })
    }
}

pub struct BulkLoader {
    warehouse: Arc<dyn Warehouse>,
    settings: LoaderSettings,
}

impl BulkLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, settings: LoaderSettings) -> Self {
        Self { warehouse, settings }
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    /// Load every row of `frame` into `table`.
    ///
    /// Returns `Ok` whenever at least one row landed (or there was nothing
    /// to load); `rows_loaded < total_rows` marks a partial load. Fails with
    /// [`IngestError::ChunkInsert`] when no chunk succeeded and with
    /// [`IngestError::Cancelled`] when the context was cancelled.
    pub async fn load(
        &self,
        table: &str,
        frame: Arc<TypedFrame>,
        ctx: &LoadContext,
    ) -> Result<LoadResult> {
        let started = Instant::now();
        let total_rows = frame.row_count();
        if total_rows == 0 {
            info!("Nothing to load into '{table}'");
            return Ok(self.finish(0, 0, LoadMethod::FastPath, started, Vec::new(), Vec::new()));
        }
        if ctx.cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        let columns = load_columns(&frame);
        let mut warnings = Vec::new();

        if self.settings.fast_path_enabled {
            match self.fast_path(table, &frame, &columns, ctx).await {
                Ok(rows) => {
                    info!("Fast path loaded {rows} row(s) into '{table}'");
                    if let Some(callback) = &ctx.on_progress {
                        let elapsed = started.elapsed();
                        callback(LoadProgress {
                            rows_loaded: rows,
                            total_rows,
                            elapsed,
                            rows_per_second: rate(rows, elapsed),
                        });
                    }
                    return Ok(self.finish(rows, total_rows, LoadMethod::FastPath, started, Vec::new(), warnings));
                }
                Err(err) if err.is_recoverable() => {
                    warn!("Fast path into '{table}' failed, falling back to chunked inserts: {err}");
                    if matches!(err, IngestError::FastPathLoad(_))
                        && let Some(rows) = self.reclaim_fast_path(table, total_rows, ctx).await?
                    {
                        return Ok(self.finish(rows, total_rows, LoadMethod::FastPath, started, Vec::new(), warnings));
                    }
                    warnings.push(format!("fast path unavailable: {err}"));
                }
                Err(err) => return Err(err),
            }
        }

        self.fallback(table, frame, columns, ctx, started, warnings).await
    }

    fn finish(
        &self,
        rows_loaded: usize,
        total_rows: usize,
        method_used: LoadMethod,
        started: Instant,
        failed_chunks: Vec<ChunkFailure>,
        warnings: Vec<String>,
    ) -> LoadResult {
        let elapsed = started.elapsed();
        LoadResult {
            rows_loaded,
            total_rows,
            method_used,
            elapsed,
            rows_per_second: rate(rows_loaded, elapsed),
            failed_chunks,
            warnings,
        }
    }

    /// The fast path may only give up once its budget covers every chunk.
    fn fast_path_timeout(&self, total_rows: usize) -> Duration {
        let chunks = total_rows.div_ceil(self.settings.chunk_size.max(1)).max(1);
        self.settings
            .statement_timeout
            .saturating_mul(u32::try_from(chunks).unwrap_or(u32::MAX))
    }

    async fn fast_path(
        &self,
        table: &str,
        frame: &TypedFrame,
        columns: &[String],
        ctx: &LoadContext,
    ) -> Result<usize> {
        let payload = serialize_artifact(
            frame,
            &ctx.ingestion_id,
            ctx.processed_at,
            self.settings.max_text_len,
        )
        .map_err(|err| IngestError::Staging(format!("serializing artifact: {err}")))?;
        let name = format!("{}-{table}.ndjson", ctx.ingestion_id);
        let timeout = self.fast_path_timeout(frame.row_count());

        let artifact = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(IngestError::Cancelled),
            staged = with_timeout(timeout, self.warehouse.stage(&name, payload)) => {
                staged.map_err(|err| IngestError::Staging(err.to_string()))?
            }
        };
        debug!("Staged {} byte(s) for '{table}' as {}", artifact.bytes, artifact.name);

        let mut pending = {
            let warehouse = Arc::clone(&self.warehouse);
            let (table, columns, artifact) = (table.to_string(), columns.to_vec(), artifact.clone());
            tokio::spawn(async move { warehouse.bulk_load(&table, &columns, &artifact).await })
        };
        let loaded = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                pending.abort();
                Err(IngestError::Cancelled)
            }
            joined = tokio::time::timeout(timeout, &mut pending) => match joined {
                Ok(joined) => bulk_load_outcome(joined),
                Err(_) => self.settle_abandoned(table, &mut pending, timeout).await,
            },
        };

        match with_timeout(self.settings.statement_timeout, self.warehouse.unstage(&artifact)).await {
            Ok(()) | Err(WarehouseError::MissingArtifact(_)) => {}
            Err(err) => warn!("Could not remove staged artifact {}: {err}", artifact.name),
        }

        let loaded = loaded?;
        if loaded != frame.row_count() {
            return Err(IngestError::FastPathLoad(format!(
                "engine reported {loaded} row(s), expected {}",
                frame.row_count()
            )));
        }
        Ok(loaded)
    }

    /// A bulk load past its deadline gets one more statement timeout to
    /// finish before it is abandoned.
    async fn settle_abandoned(
        &self,
        table: &str,
        pending: &mut JoinHandle<WarehouseResult<u64>>,
        deadline: Duration,
    ) -> Result<usize> {
        match tokio::time::timeout(self.settings.statement_timeout, &mut *pending).await {
            Ok(joined) => {
                info!("Bulk load into '{table}' settled after its {deadline:?} deadline");
                bulk_load_outcome(joined)
            }
            Err(_) => {
                pending.abort();
                Err(IngestError::FastPathLoad(WarehouseError::Timeout(deadline).to_string()))
            }
        }
    }

    /// Rows tagged with this ingestion id after a failed bulk load. A full
    /// set means the load committed late and the fast path stands. Anything
    /// short of that is deleted so the fallback starts from zero.
    async fn reclaim_fast_path(
        &self,
        table: &str,
        total_rows: usize,
        ctx: &LoadContext,
    ) -> Result<Option<usize>> {
        let counted = with_timeout(
            self.settings.statement_timeout,
            self.warehouse.count_ingested(table, &ctx.ingestion_id),
        )
        .await;
        match counted {
            Ok(0) => return Ok(None),
            Ok(rows) if rows as usize == total_rows => {
                info!("Fast path into '{table}' committed after its deadline; skipping fallback");
                return Ok(Some(total_rows));
            }
            Ok(rows) => warn!("{rows} row(s) from an abandoned fast path are in '{table}'; removing them"),
            Err(err) => debug!("Could not count ingested rows in '{table}', purging before fallback: {err}"),
        }
        let purge = purge_sql(table, &ctx.ingestion_id, self.warehouse.dialect(), self.settings.max_text_len);
        let removed = with_timeout(self.settings.statement_timeout, self.warehouse.execute(&purge)).await?;
        debug!("Removed {removed} row(s) tagged {} from '{table}'", ctx.ingestion_id);
        Ok(None)
    }

    async fn fallback(
        &self,
        table: &str,
        frame: Arc<TypedFrame>,
        columns: Vec<String>,
        ctx: &LoadContext,
        started: Instant,
        mut warnings: Vec<String>,
    ) -> Result<LoadResult> {
        let total_rows = frame.row_count();
        let chunks = plan_chunks(total_rows, self.settings.chunk_size);
        let chunk_count = chunks.len();
        let workers = self.settings.max_workers.clamp(1, chunk_count.max(1));
        info!(
            "Loading {total_rows} row(s) into '{table}' as {chunk_count} chunk(s) on {workers} worker(s)"
        );

        let shared = Arc::new(FallbackShared {
            warehouse: Arc::clone(&self.warehouse),
            table: table.to_string(),
            columns,
            frame,
            chunks,
            cursor: AtomicUsize::new(0),
            progress: ProgressTracker::new(
                total_rows,
                self.settings.progress_interval_rows,
                started,
                ctx.on_progress.clone(),
            ),
            settings: self.settings.clone(),
            ingestion_id: ctx.ingestion_id.clone(),
            processed_at: ctx.processed_at,
            cancel: ctx.cancel.clone(),
        });

        let mut set = JoinSet::new();
        for worker in 0..workers {
            set.spawn(Arc::clone(&shared).run_worker(worker));
        }

        let mut loaded_chunks = 0usize;
        let mut failures = Vec::new();
        let mut cancelled = false;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        match outcome {
                            ChunkOutcome::Loaded => loaded_chunks += 1,
                            ChunkOutcome::Failed(failure) => failures.push(failure),
                            ChunkOutcome::Cancelled => cancelled = true,
                        }
                    }
                }
                Err(err) => warnings.push(format!("loader worker aborted: {err}")),
            }
        }

        let rows_loaded = shared.progress.loaded();
        if cancelled || ctx.cancel.is_cancelled() {
            warn!("Load into '{table}' cancelled after {rows_loaded} row(s)");
            return Err(IngestError::Cancelled);
        }

        failures.sort_by_key(|failure| failure.offset);
        if loaded_chunks == 0 {
            let first = failures.first();
            return Err(IngestError::ChunkInsert {
                offset: first.map(|f| f.offset).unwrap_or(0),
                attempts: first.map(|f| f.attempts).unwrap_or(0),
                reason: first
                    .map(|f| f.reason.clone())
                    .unwrap_or_else(|| "no chunk completed".to_string()),
            });
        }
        if !failures.is_empty() {
            let lost: usize = failures.iter().map(|f| f.rows).sum();
            warnings.push(format!(
                "{} of {chunk_count} chunk(s) failed; {lost} row(s) not loaded",
                failures.len()
            ));
            for failure in &failures {
                warnings.push(format!(
                    "chunk at offset {} ({} row(s)) failed after {} attempt(s): {}",
                    failure.offset, failure.rows, failure.attempts, failure.reason
                ));
            }
        }
        let result = self.finish(rows_loaded, total_rows, LoadMethod::Fallback, started, failures, warnings);
        info!(
            "Fallback loaded {}/{} row(s) into '{table}' in {:.2}s ({:.0} rows/s)",
            result.rows_loaded,
            result.total_rows,
            result.elapsed.as_secs_f64(),
            result.rows_per_second
        );
        Ok(result)
    }
}
