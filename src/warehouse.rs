//! Storage engine seam.
//!
//! [`Warehouse`] is the only way pipeline stages talk to storage. Calls are
//! the pipeline's suspension points; callers bound them with
//! [`with_timeout`]. [`SqliteWarehouse`] serializes all statements through a
//! single `Mutex<Connection>` and runs them on the blocking pool.

use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, info};
use rusqlite::{Connection, params_from_iter, types::Value as SqlValue};

use crate::{
    error::WarehouseError,
    literal::{SqlDialect, column_list, quote_identifier},
    provision::INGESTION_ID_COLUMN,
};

pub type Result<T> = std::result::Result<T, WarehouseError>;

/// A file uploaded to the engine's staging area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub name: String,
    pub location: PathBuf,
    pub bytes: usize,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    fn dialect(&self) -> SqlDialect;

    /// Run one statement, returning the number of rows it changed.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Column names of `table` in declaration order; empty if it does not exist.
    async fn table_columns(&self, table: &str) -> Result<Vec<String>>;

    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(!self.table_columns(table).await?.is_empty())
    }

    async fn row_count(&self, table: &str) -> Result<u64>;

    /// Rows in `table` tagged with `ingestion_id`.
    async fn count_ingested(&self, table: &str, ingestion_id: &str) -> Result<u64>;

    /// Upload `payload` under `name` to the staging area.
    async fn stage(&self, name: &str, payload: Vec<u8>) -> Result<StagedArtifact>;

    async fn unstage(&self, artifact: &StagedArtifact) -> Result<()>;

    /// Engine-native load of a staged newline-delimited JSON artifact, one
    /// array per row in `columns` order. All rows land or none do.
    async fn bulk_load(
        &self,
        table: &str,
        columns: &[String],
        artifact: &StagedArtifact,
    ) -> Result<u64>;

    /// Drop and re-establish the underlying connection.
    async fn reconnect(&self) -> Result<()>;
}

/// Bound a warehouse call by `limit`.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| WarehouseError::Timeout(limit))?
}

#[derive(Debug, Clone)]
enum Target {
    File(PathBuf),
    Memory,
}

pub struct SqliteWarehouse {
    target: Target,
    conn: Arc<Mutex<Connection>>,
    staging_dir: PathBuf,
}

impl SqliteWarehouse {
    /// Open or create a database file. Staged artifacts live in a sibling
    /// `<name>.staging` directory.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Ok(Self {
            target: Target::File(path.to_path_buf()),
            conn: Arc::new(Mutex::new(conn)),
            staging_dir: path.with_extension("staging"),
        })
    }

    /// In-memory database, mainly for tests. Reconnecting keeps the same
    /// connection so data survives.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let staging_dir =
            std::env::temp_dir().join(format!("tabload-staging-{}", uuid::Uuid::new_v4().simple()));
        Ok(Self {
            target: Target::Memory,
            conn: Arc::new(Mutex::new(conn)),
            staging_dir,
        })
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Run `op` against the shared connection on the blocking pool.
    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock_conn(&conn)?;
            op(&mut guard)
        })
        .await
        .map_err(|err| WarehouseError::Join(err.to_string()))?
    }

    /// Fetch every row a query returns. Used by previews and tests.
    pub async fn query(&self, sql: &str) -> Result<Vec<Vec<SqlValue>>> {
        let sql = sql.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let width = stmt.column_count();
            let rows = stmt
                .query_map([], |row| {
                    (0..width)
                        .map(|idx| row.get::<_, SqlValue>(idx))
                        .collect::<rusqlite::Result<Vec<_>>>()
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}

fn lock_conn(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| WarehouseError::LockPoisoned)
}

fn json_to_sql(value: serde_json::Value) -> SqlValue {
    match value {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(b) => SqlValue::Integer(i64::from(b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        serde_json::Value::String(s) => SqlValue::Text(s),
        nested => SqlValue::Text(nested.to_string()),
    }
}

/// Plain-text rendering of a fetched cell.
pub fn render_sql_value(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => String::new(),
        SqlValue::Integer(i) => i.to_string(),
        SqlValue::Real(f) => f.to_string(),
        SqlValue::Text(s) => s.clone(),
        SqlValue::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let sql = sql.to_string();
        self.run(move |conn| Ok(conn.execute(&sql, [])? as u64)).await
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let table = table.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
            let names = stmt
                .query_map([table], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(names)
        })
        .await
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(table));
        self.run(move |conn| {
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn count_ingested(&self, table: &str, ingestion_id: &str) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?1",
            quote_identifier(table),
            quote_identifier(INGESTION_ID_COLUMN)
        );
        let ingestion_id = ingestion_id.to_string();
        self.run(move |conn| {
            let count: i64 = conn.query_row(&sql, [ingestion_id], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn stage(&self, name: &str, payload: Vec<u8>) -> Result<StagedArtifact> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let location = self.staging_dir.join(name);
        let bytes = payload.len();
        tokio::fs::write(&location, payload).await?;
        debug!("Staged {bytes} byte(s) at {location:?}");
        Ok(StagedArtifact {
            name: name.to_string(),
            location,
            bytes,
        })
    }

    async fn unstage(&self, artifact: &StagedArtifact) -> Result<()> {
        match tokio::fs::remove_file(&artifact.location).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(WarehouseError::MissingArtifact(artifact.name.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn bulk_load(
        &self,
        table: &str,
        columns: &[String],
        artifact: &StagedArtifact,
    ) -> Result<u64> {
        let placeholders = (1..=columns.len())
            .map(|idx| format!("?{idx}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} {} VALUES ({placeholders})",
            quote_identifier(table),
            column_list(columns)
        );
        let width = columns.len();
        let location = artifact.location.clone();
        let name = artifact.name.clone();
        self.run(move |conn| {
            let payload = match std::fs::read_to_string(&location) {
                Ok(payload) => payload,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(WarehouseError::MissingArtifact(name));
                }
                Err(err) => return Err(err.into()),
            };
            let tx = conn.transaction()?;
            let mut loaded = 0u64;
            {
                let mut stmt = tx.prepare(&sql)?;
                for (line_no, line) in payload.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let row: Vec<serde_json::Value> = serde_json::from_str(line).map_err(|err| {
                        WarehouseError::Rejected(format!("artifact line {}: {err}", line_no + 1))
                    })?;
                    if row.len() != width {
                        return Err(WarehouseError::Rejected(format!(
                            "artifact line {} has {} value(s), expected {width}",
                            line_no + 1,
                            row.len()
                        )));
                    }
                    stmt.execute(params_from_iter(row.into_iter().map(json_to_sql)))?;
                    loaded += 1;
                }
            }
            tx.commit()?;
            Ok(loaded)
        })
        .await
    }

    async fn reconnect(&self) -> Result<()> {
        let target = self.target.clone();
        self.run(move |conn| {
            match target {
                Target::File(path) => {
                    *conn = Connection::open(&path)?;
                    info!("Reconnected to {path:?}");
                }
                Target::Memory => debug!("In-memory warehouse keeps its connection"),
            }
            Ok(())
        })
        .await
    }
}
