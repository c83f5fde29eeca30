use std::time::Duration;

use log::{info, warn};

use crate::{
    config::CreateMode,
    error::{IngestError, Result},
    literal::{SqlDialect, quote_identifier},
    naming,
    schema::{ColumnSchema, ColumnType},
    warehouse::{Warehouse, with_timeout},
};

pub const INGESTION_ID_COLUMN: &str = "_ingestion_id";
pub const PROCESSED_AT_COLUMN: &str = "_processed_at";
pub const AUDIT_TABLE: &str = "audit_logs";
pub const RAW_DATA_TABLE: &str = "raw_data";

/// System columns appended to every provisioned table, in order.
pub fn system_columns() -> [(&'static str, ColumnType); 2] {
    [
        (INGESTION_ID_COLUMN, ColumnType::String),
        (PROCESSED_AT_COLUMN, ColumnType::Timestamp),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedTable {
    pub name: String,
    /// Every column the table holds after provisioning.
    pub columns: Vec<String>,
    /// Inferred columns the table can receive, in schema order.
    pub loadable: Vec<String>,
    /// Inferred columns an older table lacks; their values are not loaded.
    pub missing: Vec<String>,
}

impl ProvisionedTable {
    pub fn is_fully_compatible(&self) -> bool {
        self.missing.is_empty()
    }
}

pub fn create_table_sql(table: &str, schema: &[ColumnSchema], dialect: SqlDialect) -> String {
    let mut definitions: Vec<String> = schema
        .iter()
        .map(|column| {
            format!(
                "{} {}",
                quote_identifier(&column.sanitized_name),
                dialect.type_name(column.inferred_type)
            )
        })
        .collect();
    definitions.extend(
        system_columns()
            .iter()
            .map(|(name, ty)| format!("{} {}", quote_identifier(name), dialect.type_name(*ty))),
    );
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_identifier(table),
        definitions.join(", ")
    )
}

fn ddl_error(table: &str, reason: impl ToString) -> IngestError {
    IngestError::Ddl {
        table: table.to_string(),
        reason: reason.to_string(),
    }
}

async fn run_ddl(warehouse: &dyn Warehouse, table: &str, sql: &str, timeout: Duration) -> Result<()> {
    with_timeout(timeout, warehouse.execute(sql))
        .await
        .map(|_| ())
        .map_err(|err| ddl_error(table, err))
}

/// Create (or recreate) the destination table for `schema` and verify it.
pub async fn provision(
    warehouse: &dyn Warehouse,
    requested_name: &str,
    schema: &[ColumnSchema],
    mode: CreateMode,
    timeout: Duration,
) -> Result<ProvisionedTable> {
    let table = naming::sanitize_identifier(requested_name);
    let dialect = warehouse.dialect();

    if mode == CreateMode::RecreateAlways {
        let drop = format!("DROP TABLE IF EXISTS {}", quote_identifier(&table));
        run_ddl(warehouse, &table, &drop, timeout).await?;
        info!("Dropped table '{table}' before recreating it");
    }
    run_ddl(
        warehouse,
        &table,
        &create_table_sql(&table, schema, dialect),
        timeout,
    )
    .await?;

    let mut columns = with_timeout(timeout, warehouse.table_columns(&table))
        .await
        .map_err(|err| ddl_error(&table, err))?;
    if columns.is_empty() {
        return Err(ddl_error(&table, "verification found no columns after DDL"));
    }

    for (name, ty) in system_columns() {
        if columns.iter().any(|column| column == name) {
            continue;
        }
        warn!("Table '{table}' predates system column '{name}'; adding it");
        let alter = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_identifier(&table),
            quote_identifier(name),
            dialect.type_name(ty)
        );
        run_ddl(warehouse, &table, &alter, timeout).await?;
        columns.push(name.to_string());
    }

    let (loadable, missing): (Vec<String>, Vec<String>) = schema
        .iter()
        .map(|column| column.sanitized_name.clone())
        .partition(|name| columns.contains(name));
    if !missing.is_empty() {
        warn!(
            "Table '{table}' already exists without column(s) {}; their values will not be loaded",
            missing.join(", ")
        );
    }
    info!(
        "Provisioned table '{table}' with {} column(s) ({:?})",
        columns.len(),
        mode
    );
    Ok(ProvisionedTable {
        name: table,
        columns,
        loadable,
        missing,
    })
}

/// Idempotently create the audit and raw-sample tables.
pub async fn setup_infrastructure(warehouse: &dyn Warehouse, timeout: Duration) -> Result<()> {
    let dialect = warehouse.dialect();
    let text = dialect.type_name(ColumnType::String);
    let ts = dialect.type_name(ColumnType::Timestamp);
    let int = dialect.type_name(ColumnType::Integer);
    let audit = format!(
        "CREATE TABLE IF NOT EXISTS {AUDIT_TABLE} (event_id {text}, timestamp {ts}, process {text}, \
         level {text}, message {text}, metadata {text}, user_id {text})"
    );
    let raw = format!(
        "CREATE TABLE IF NOT EXISTS {RAW_DATA_TABLE} (ingestion_id {text}, table_name {text}, \
         filename {text}, raw_data {text}, uploaded_at {ts}, record_count {int}, column_info {text})"
    );
    run_ddl(warehouse, AUDIT_TABLE, &audit, timeout).await?;
    run_ddl(warehouse, RAW_DATA_TABLE, &raw, timeout).await?;
    info!("Warehouse infrastructure tables are ready");
    Ok(())
}
