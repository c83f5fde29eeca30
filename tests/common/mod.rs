#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tabload::audit::{AuditEvent, AuditRecorder};
use tabload::error::{AuditError, WarehouseError};
use tabload::literal::SqlDialect;
use tabload::warehouse::{SqliteWarehouse, StagedArtifact, Warehouse};
use tempfile::{TempDir, tempdir};

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        self.write_bytes(name, contents.as_bytes())
    }

    pub fn write_bytes(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents).expect("write temp file contents");
        path
    }

    /// A file-backed warehouse whose staging area lives inside the workspace.
    pub fn warehouse(&self, name: &str) -> SqliteWarehouse {
        SqliteWarehouse::open(&self.path().join(name)).expect("open warehouse")
    }
}

/// `id,name,score,active,joined` CSV with `rows` data rows.
pub fn people_csv(rows: usize, delimiter: char) -> String {
    let d = delimiter;
    let mut out = format!("id{d}name{d}score{d}active{d}joined\n");
    for i in 0..rows {
        let active = if i % 2 == 0 { "true" } else { "false" };
        let day = i % 28 + 1;
        out.push_str(&format!("{i}{d}person {i}{d}{}.5{d}{active}{d}2024-03-{day:02}\n", i % 100));
    }
    out
}

/// Wraps a real warehouse and injects failures on demand.
pub struct FlakyWarehouse {
    inner: Arc<SqliteWarehouse>,
    pub fail_staging: AtomicBool,
    pub fail_bulk_load: AtomicBool,
    /// `table_columns` reports nothing, as if DDL silently did not apply.
    pub hide_columns: AtomicBool,
    /// Bulk loads commit in the background after this delay while the call
    /// itself hangs.
    late_commit: Mutex<Option<Duration>>,
    /// Statements containing the fragment are delayed before running.
    slow: Mutex<Option<(String, Duration)>>,
    /// Statements containing any of these fragments always fail.
    poisoned: Mutex<Vec<String>>,
    /// The next N INSERT statements fail.
    transient_insert_failures: AtomicUsize,
    pub stage_calls: AtomicUsize,
    pub reconnects: AtomicUsize,
    pub inserts_attempted: AtomicUsize,
}

impl FlakyWarehouse {
    pub fn new(inner: SqliteWarehouse) -> Self {
        Self {
            inner: Arc::new(inner),
            fail_staging: AtomicBool::new(false),
            fail_bulk_load: AtomicBool::new(false),
            hide_columns: AtomicBool::new(false),
            late_commit: Mutex::new(None),
            slow: Mutex::new(None),
            poisoned: Mutex::new(Vec::new()),
            transient_insert_failures: AtomicUsize::new(0),
            stage_calls: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
            inserts_attempted: AtomicUsize::new(0),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(SqliteWarehouse::in_memory().expect("in-memory warehouse"))
    }

    pub fn without_staging(self) -> Self {
        self.fail_staging.store(true, Ordering::SeqCst);
        self
    }

    pub fn poison(&self, fragment: &str) {
        self.poisoned.lock().unwrap().push(fragment.to_string());
    }

    pub fn commit_bulk_loads_late(&self, delay: Duration) {
        *self.late_commit.lock().unwrap() = Some(delay);
    }

    pub fn slow_down(&self, fragment: &str, delay: Duration) {
        *self.slow.lock().unwrap() = Some((fragment.to_string(), delay));
    }

    pub fn fail_next_inserts(&self, count: usize) {
        self.transient_insert_failures.store(count, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &SqliteWarehouse {
        &self.inner
    }

    fn rejection(reason: &str) -> WarehouseError {
        WarehouseError::Rejected(reason.to_string())
    }
}

#[async_trait]
impl Warehouse for FlakyWarehouse {
    fn dialect(&self) -> SqlDialect {
        self.inner.dialect()
    }

    async fn execute(&self, sql: &str) -> Result<u64, WarehouseError> {
        let delay = self
            .slow
            .lock()
            .unwrap()
            .as_ref()
            .filter(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if sql.starts_with("INSERT") {
            self.inserts_attempted.fetch_add(1, Ordering::SeqCst);
            let poisoned = self
                .poisoned
                .lock()
                .unwrap()
                .iter()
                .any(|fragment| sql.contains(fragment.as_str()));
            if poisoned {
                return Err(Self::rejection("poisoned statement"));
            }
            let remaining = self.transient_insert_failures.load(Ordering::SeqCst);
            if remaining > 0
                && self
                    .transient_insert_failures
                    .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                return Err(Self::rejection("transient insert failure"));
            }
        }
        self.inner.execute(sql).await
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>, WarehouseError> {
        if self.hide_columns.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        self.inner.table_columns(table).await
    }

    async fn row_count(&self, table: &str) -> Result<u64, WarehouseError> {
        self.inner.row_count(table).await
    }

    async fn count_ingested(&self, table: &str, ingestion_id: &str) -> Result<u64, WarehouseError> {
        self.inner.count_ingested(table, ingestion_id).await
    }

    async fn stage(&self, name: &str, payload: Vec<u8>) -> Result<StagedArtifact, WarehouseError> {
        self.stage_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_staging.load(Ordering::SeqCst) {
            return Err(Self::rejection("staging area unreachable"));
        }
        self.inner.stage(name, payload).await
    }

    async fn unstage(&self, artifact: &StagedArtifact) -> Result<(), WarehouseError> {
        self.inner.unstage(artifact).await
    }

    async fn bulk_load(
        &self,
        table: &str,
        columns: &[String],
        artifact: &StagedArtifact,
    ) -> Result<u64, WarehouseError> {
        if self.fail_bulk_load.load(Ordering::SeqCst) {
            return Err(Self::rejection("bulk load rejected"));
        }
        let late = *self.late_commit.lock().unwrap();
        if let Some(delay) = late {
            let inner = Arc::clone(&self.inner);
            let (table, columns, artifact) = (table.to_string(), columns.to_vec(), artifact.clone());
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.bulk_load(&table, &columns, &artifact).await
            });
            tokio::time::sleep(Duration::from_secs(30)).await;
            return Err(Self::rejection("bulk load never answered"));
        }
        self.inner.bulk_load(table, columns, artifact).await
    }

    async fn reconnect(&self) -> Result<(), WarehouseError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.inner.reconnect().await
    }
}

/// Audit recorder that keeps every event for later assertions.
#[derive(Default)]
pub struct CaptureAudit {
    events: Mutex<Vec<AuditEvent>>,
    pub fail: AtomicBool,
}

impl CaptureAudit {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let capture = Self::default();
        capture.fail.store(true, Ordering::SeqCst);
        Arc::new(capture)
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events().into_iter().map(|event| event.message).collect()
    }
}

#[async_trait]
impl AuditRecorder for CaptureAudit {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AuditError::Sink("audit sink offline".to_string()));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
