//! Lifecycle audit events.
//!
//! Recording is fire-and-forget: [`emit`] spawns the call with a bounded
//! timeout and only logs failures, so an unavailable audit sink never slows
//! or fails a job.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::{
    data::Value,
    error::AuditError,
    job::prefixed_id,
    literal::{encode_literal, encode_text},
    provision::AUDIT_TABLE,
    warehouse::Warehouse,
};

pub const EVENT_ID_PREFIX: &str = "EVT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuditLevel::Info => "INFO",
            AuditLevel::Success => "SUCCESS",
            AuditLevel::Warning => "WARNING",
            AuditLevel::Error => "ERROR",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: NaiveDateTime,
    pub process: String,
    pub level: AuditLevel,
    pub message: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub user_id: Option<String>,
}

impl AuditEvent {
    pub fn new(process: impl Into<String>, level: AuditLevel, message: impl Into<String>) -> Self {
        Self {
            event_id: prefixed_id(EVENT_ID_PREFIX),
            timestamp: Utc::now().naive_utc(),
            process: process.into(),
            level,
            message: message.into(),
            metadata: BTreeMap::new(),
            user_id: None,
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

#[async_trait]
pub trait AuditRecorder: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Spawn `recorder.record(event)` bounded by `timeout`. The returned handle
/// may be awaited to flush; dropping it detaches the call.
pub fn emit(recorder: &Arc<dyn AuditRecorder>, event: AuditEvent, timeout: Duration) -> JoinHandle<()> {
    let recorder = Arc::clone(recorder);
    tokio::spawn(async move {
        let outcome = match tokio::time::timeout(timeout, recorder.record(&event)).await {
            Ok(result) => result,
            Err(_) => Err(AuditError::Timeout(timeout)),
        };
        if let Err(err) = outcome {
            warn!(
                "Audit event {} ({} / {}) was not recorded: {err}",
                event.event_id, event.process, event.level
            );
        }
    })
}

/// Writes events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditRecorder;

#[async_trait]
impl AuditRecorder for LogAuditRecorder {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let metadata =
            serde_json::to_string(&event.metadata).map_err(|err| AuditError::Sink(err.to_string()))?;
        match event.level {
            AuditLevel::Error => error!("[{}] {}: {} {metadata}", event.event_id, event.process, event.message),
            AuditLevel::Warning => warn!("[{}] {}: {} {metadata}", event.event_id, event.process, event.message),
            AuditLevel::Info | AuditLevel::Success => {
                info!("[{}] {} {}: {} {metadata}", event.event_id, event.level, event.process, event.message)
            }
        }
        Ok(())
    }
}

/// Persists events into the warehouse's `audit_logs` table.
pub struct WarehouseAuditRecorder {
    warehouse: Arc<dyn Warehouse>,
}

impl WarehouseAuditRecorder {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    pub fn insert_sql(&self, event: &AuditEvent) -> Result<String, AuditError> {
        let dialect = self.warehouse.dialect();
        let metadata =
            serde_json::to_string(&event.metadata).map_err(|err| AuditError::Sink(err.to_string()))?;
        let text = |value: &str| encode_text(value, dialect, usize::MAX);
        let user = event
            .user_id
            .as_deref()
            .map(text)
            .unwrap_or_else(|| "NULL".to_string());
        Ok(format!(
            "INSERT INTO {AUDIT_TABLE} (event_id, timestamp, process, level, message, metadata, user_id) \
             VALUES ({}, {}, {}, {}, {}, {}, {user})",
            text(&event.event_id),
            encode_literal(Some(&Value::Timestamp(event.timestamp)), dialect, usize::MAX),
            text(&event.process),
            text(&event.level.to_string()),
            text(&event.message),
            text(&metadata),
        ))
    }
}

#[async_trait]
impl AuditRecorder for WarehouseAuditRecorder {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let sql = self.insert_sql(event)?;
        self.warehouse.execute(&sql).await?;
        Ok(())
    }
}
