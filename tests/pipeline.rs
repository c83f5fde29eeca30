mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{CaptureAudit, FlakyWarehouse, TestWorkspace, people_csv};
use encoding_rs::WINDOWS_1252;
use rusqlite::types::Value as SqlValue;
use tabload::audit::{AuditLevel, AuditRecorder};
use tabload::config::{PipelineConfig, RetryPolicy};
use tabload::error::IngestError;
use tabload::job::JobStatus;
use tabload::loader::LoadMethod;
use tabload::pipeline::{Pipeline, wait_with_deadline};
use tabload::schema::ColumnType;
use tabload::warehouse::{SqliteWarehouse, Warehouse};

fn quick_config() -> PipelineConfig {
    PipelineConfig {
        chunk_size: 10,
        audit_timeout_secs: 1,
        retry: RetryPolicy {
            max_attempts: 2,
            backoff_ms: 1,
        },
        ..PipelineConfig::default()
    }
}

fn pipeline_over(warehouse: Arc<dyn Warehouse>, config: PipelineConfig) -> (Pipeline, Arc<CaptureAudit>) {
    let audit = CaptureAudit::new();
    let recorder: Arc<dyn AuditRecorder> = audit.clone();
    let pipeline = Pipeline::new(config, warehouse).expect("valid config").with_audit(recorder);
    (pipeline, audit)
}

#[tokio::test]
async fn latin1_patient_file_lands_in_a_five_column_table() {
    let warehouse = Arc::new(SqliteWarehouse::in_memory().expect("warehouse"));
    let (pipeline, audit) = pipeline_over(warehouse.clone(), quick_config());
    let (bytes, _, _) =
        WINDOWS_1252.encode("id;Age;Symptoms\n1;30;fiebre en Logroño, España\n2;;tos en Medellín\n");

    let summary = pipeline
        .ingest(bytes.into_owned(), "Patients 2024.csv", None)
        .await
        .expect("ingest");
    assert_eq!(summary.table_name, "patients_2024");
    assert_eq!(summary.rows_loaded, 2);
    assert_eq!(summary.total_rows, 2);
    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.method_used, Some(LoadMethod::FastPath));

    let job = pipeline.status(&summary.job_id).expect("job recorded");
    assert_eq!(job.detected_delimiter, Some(';'));
    assert_eq!(job.detected_encoding.as_deref(), Some("latin-1"));
    let schema: Vec<(&str, ColumnType, bool)> = job
        .schema
        .iter()
        .map(|c| (c.sanitized_name.as_str(), c.inferred_type, c.nullable))
        .collect();
    assert_eq!(
        schema,
        vec![
            ("id", ColumnType::Integer, false),
            ("age", ColumnType::Integer, true),
            ("symptoms", ColumnType::String, false),
        ]
    );
    assert!(job.finished_at.is_some());

    let columns = warehouse.table_columns("patients_2024").await.unwrap();
    assert_eq!(columns.len(), 5);
    let rows = warehouse
        .query("SELECT age, symptoms FROM patients_2024 ORDER BY id")
        .await
        .unwrap();
    assert_eq!(rows[0], vec![SqlValue::Integer(30), SqlValue::Text("fiebre en Logroño, España".into())]);
    assert_eq!(rows[1][0], SqlValue::Null);

    let levels: Vec<AuditLevel> = audit.events().iter().map(|event| event.level).collect();
    assert!(levels.contains(&AuditLevel::Success));
    assert!(audit.messages().iter().any(|m| m.starts_with("Schema inferred")));
    assert!(audit.events().iter().all(|event| event.metadata["job_id"] == summary.job_id.as_str()));
}

#[tokio::test]
async fn unsupported_and_oversized_files_are_rejected_before_a_job_exists() {
    let warehouse: Arc<dyn Warehouse> = Arc::new(SqliteWarehouse::in_memory().expect("warehouse"));
    let config = PipelineConfig {
        max_file_bytes: 16,
        ..quick_config()
    };
    let (pipeline, _) = pipeline_over(warehouse, config);

    let err = pipeline.submit(b"a,b".to_vec(), "notes.txt", None).expect_err("format");
    assert!(matches!(err, IngestError::UnsupportedFormat { .. }));
    let err = pipeline.submit(Vec::new(), "empty.csv", None).expect_err("empty");
    assert!(matches!(err, IngestError::EmptyFile(_)));
    let err = pipeline
        .submit(people_csv(5, ',').into_bytes(), "big.csv", None)
        .expect_err("size");
    assert!(matches!(err, IngestError::FileTooLarge { limit: 16, .. }));
    assert!(err.is_rejection());
    assert!(pipeline.history().is_empty());
}

#[tokio::test]
async fn staging_outage_still_completes_via_fallback() {
    let warehouse = Arc::new(FlakyWarehouse::in_memory().without_staging());
    let (pipeline, _) = pipeline_over(warehouse.clone(), quick_config());
    let summary = pipeline
        .ingest(people_csv(35, ',').into_bytes(), "people.csv", Some("Staff List"))
        .await
        .expect("ingest");
    assert_eq!(summary.table_name, "staff_list");
    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.method_used, Some(LoadMethod::Fallback));
    assert_eq!(summary.rows_loaded, summary.total_rows);
    assert_eq!(warehouse.row_count("staff_list").await.unwrap(), 35);
}

#[tokio::test]
async fn lost_chunk_completes_with_a_warning() {
    let warehouse = Arc::new(FlakyWarehouse::in_memory().without_staging());
    warehouse.poison("'person 70'");
    let (pipeline, audit) = pipeline_over(warehouse.clone(), quick_config());
    let summary = pipeline
        .ingest(people_csv(100, ',').into_bytes(), "people.csv", None)
        .await
        .expect("partial ingest is not a failure");
    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.rows_loaded, 90);
    assert_eq!(summary.total_rows, 100);
    assert!(summary.warnings.iter().any(|w| w.contains("1 of 10 chunk(s) failed")));
    assert!(audit.events().iter().any(|e| e.level == AuditLevel::Warning));
}

#[tokio::test]
async fn total_load_failure_marks_the_job_failed() {
    let warehouse = Arc::new(FlakyWarehouse::in_memory().without_staging());
    warehouse.poison("INSERT INTO");
    let (pipeline, audit) = pipeline_over(warehouse, quick_config());
    let job_id = pipeline
        .submit(people_csv(15, ',').into_bytes(), "people.csv", None)
        .expect("accepted");
    let job = pipeline.wait(&job_id).await.expect("job finished");
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().is_some_and(|e| e.contains("failed after 2 attempt")));
    assert!(audit.events().iter().any(|e| e.level == AuditLevel::Error));
}

#[tokio::test]
async fn unverifiable_table_fails_the_job_before_loading() {
    let warehouse = Arc::new(FlakyWarehouse::in_memory());
    warehouse.hide_columns.store(true, Ordering::SeqCst);
    let (pipeline, audit) = pipeline_over(warehouse.clone(), quick_config());
    let job_id = pipeline
        .submit(people_csv(8, ',').into_bytes(), "people.csv", None)
        .expect("accepted");
    let job = pipeline.wait(&job_id).await.expect("job finished");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.rows_loaded, 0);
    assert!(job.error.as_deref().is_some_and(|e| e.contains("no columns")));
    assert_eq!(warehouse.stage_calls.load(Ordering::SeqCst), 0);
    assert_eq!(warehouse.inserts_attempted.load(Ordering::SeqCst), 0);
    assert!(audit.events().iter().any(|e| e.level == AuditLevel::Error));
}

#[tokio::test]
async fn decode_failures_fail_the_job_not_the_submission() {
    let warehouse: Arc<dyn Warehouse> = Arc::new(SqliteWarehouse::in_memory().expect("warehouse"));
    let (pipeline, _) = pipeline_over(warehouse, quick_config());
    let err = pipeline
        .ingest(b"{\"not\": \"records\"}".to_vec(), "broken.json", None)
        .await
        .expect_err("job fails");
    match err {
        IngestError::JobFailed { job_id, reason } => {
            assert!(reason.contains("no array of records"));
            let job = pipeline.status(&job_id).unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert!(job.schema.is_empty());
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn configured_user_is_stamped_on_audit_events() {
    let warehouse: Arc<dyn Warehouse> = Arc::new(SqliteWarehouse::in_memory().expect("warehouse"));
    let config = PipelineConfig {
        audit_user: Some("etl-bot".to_string()),
        ..quick_config()
    };
    let (pipeline, audit) = pipeline_over(warehouse, config);
    pipeline
        .ingest(people_csv(3, ',').into_bytes(), "people.csv", None)
        .await
        .expect("ingest");
    let events = audit.events();
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.user_id.as_deref() == Some("etl-bot")));
}

#[tokio::test]
async fn audit_outage_never_fails_a_job() {
    let warehouse: Arc<dyn Warehouse> = Arc::new(SqliteWarehouse::in_memory().expect("warehouse"));
    let recorder: Arc<dyn AuditRecorder> = CaptureAudit::failing();
    let pipeline = Pipeline::new(quick_config(), warehouse)
        .expect("config")
        .with_audit(recorder);
    let summary = pipeline
        .ingest(people_csv(3, ',').into_bytes(), "people.csv", None)
        .await
        .expect("ingest");
    assert_eq!(summary.rows_loaded, 3);
}

#[tokio::test]
async fn history_keeps_every_job_in_submission_order() {
    let warehouse: Arc<dyn Warehouse> = Arc::new(SqliteWarehouse::in_memory().expect("warehouse"));
    let (pipeline, _) = pipeline_over(warehouse, quick_config());
    let first = pipeline
        .ingest(people_csv(4, ',').into_bytes(), "first.csv", None)
        .await
        .expect("first");
    let second = pipeline
        .ingest(people_csv(6, ';').into_bytes(), "second.csv", None)
        .await
        .expect("second");
    let ids: Vec<String> = pipeline.history().into_iter().map(|job| job.job_id).collect();
    assert_eq!(ids, vec![first.job_id, second.job_id]);
    assert!(ids.iter().all(|id| id.starts_with("ING-")));
    assert!(matches!(pipeline.status("ING-FFFFFFFF"), Err(IngestError::NotFound(_))));
    assert!(matches!(pipeline.cancel("ING-FFFFFFFF"), Err(IngestError::NotFound(_))));
}

#[tokio::test]
async fn raw_sample_is_captured_once_infrastructure_exists() {
    let warehouse = Arc::new(SqliteWarehouse::in_memory().expect("warehouse"));
    let config = PipelineConfig {
        raw_sample_rows: 3,
        ..quick_config()
    };
    let (pipeline, _) = pipeline_over(warehouse.clone(), config);
    pipeline.setup().await.expect("setup");
    let summary = pipeline
        .ingest(people_csv(8, ',').into_bytes(), "people.csv", None)
        .await
        .expect("ingest");

    let rows = warehouse
        .query("SELECT ingestion_id, table_name, record_count, raw_data FROM raw_data")
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], SqlValue::Text(summary.job_id.clone()));
    assert_eq!(rows[0][1], SqlValue::Text("people".into()));
    assert_eq!(rows[0][2], SqlValue::Integer(8));
    let SqlValue::Text(sample) = &rows[0][3] else {
        panic!("raw_data should be text");
    };
    let sample: serde_json::Value = serde_json::from_str(sample).unwrap();
    assert_eq!(sample.as_array().map(Vec::len), Some(3));
    assert_eq!(sample[0]["name"], "person 0");
}

#[tokio::test]
async fn slow_raw_sample_does_not_push_a_loaded_job_past_its_deadline() {
    let warehouse = Arc::new(FlakyWarehouse::in_memory());
    let config = PipelineConfig {
        job_timeout_secs: Some(1),
        ..quick_config()
    };
    let (pipeline, _) = pipeline_over(warehouse.clone(), config);
    pipeline.setup().await.expect("setup");
    warehouse.slow_down("INSERT INTO raw_data", Duration::from_millis(1500));

    let job_id = pipeline
        .submit(people_csv(5, ',').into_bytes(), "people.csv", None)
        .expect("accepted");
    let job = wait_with_deadline(&pipeline, &job_id, Duration::from_secs(30))
        .await
        .expect("job settles");
    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    assert_eq!(job.rows_loaded, 5);
    assert_eq!(warehouse.inner().row_count("raw_data").await.unwrap(), 1);
}

#[tokio::test]
async fn cancelled_job_ends_failed() {
    let warehouse: Arc<dyn Warehouse> = Arc::new(SqliteWarehouse::in_memory().expect("warehouse"));
    let config = PipelineConfig {
        chunk_size: 1,
        max_workers: 1,
        fast_path_enabled: false,
        ..quick_config()
    };
    let (pipeline, _) = pipeline_over(warehouse, config);
    let job_id = pipeline
        .submit(people_csv(5_000, ',').into_bytes(), "people.csv", None)
        .expect("accepted");
    pipeline.cancel(&job_id).expect("cancel");
    let job = wait_with_deadline(&pipeline, &job_id, Duration::from_secs(30))
        .await
        .expect("job settles");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("job cancelled"));
    assert!(job.rows_loaded < 5_000);
}

#[tokio::test]
async fn job_deadline_is_enforced() {
    let warehouse: Arc<dyn Warehouse> = Arc::new(SqliteWarehouse::in_memory().expect("warehouse"));
    let config = PipelineConfig {
        chunk_size: 1,
        max_workers: 1,
        fast_path_enabled: false,
        job_timeout_secs: Some(1),
        ..quick_config()
    };
    let (pipeline, _) = pipeline_over(warehouse, config);
    let job_id = pipeline
        .submit(people_csv(200_000, ',').into_bytes(), "people.csv", None)
        .expect("accepted");
    let job = wait_with_deadline(&pipeline, &job_id, Duration::from_secs(60))
        .await
        .expect("job settles");
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().is_some_and(|e| e.contains("deadline")));
}

#[tokio::test]
async fn file_backed_warehouse_keeps_rows_across_reopen() {
    let workspace = TestWorkspace::new();
    let path = workspace.path().join("warehouse.db");
    {
        let warehouse: Arc<dyn Warehouse> = Arc::new(SqliteWarehouse::open(&path).expect("open"));
        let (pipeline, _) = pipeline_over(warehouse, quick_config());
        pipeline
            .ingest(people_csv(12, '|').into_bytes(), "people.csv", None)
            .await
            .expect("ingest");
    }
    let reopened = SqliteWarehouse::open(&path).expect("reopen");
    assert_eq!(reopened.row_count("people").await.unwrap(), 12);
}

#[test]
fn submitting_outside_a_runtime_is_a_configuration_error() {
    let warehouse: Arc<dyn Warehouse> = Arc::new(SqliteWarehouse::in_memory().expect("warehouse"));
    let pipeline = Pipeline::new(quick_config(), warehouse).expect("config");
    let err = pipeline
        .submit(people_csv(2, ',').into_bytes(), "people.csv", None)
        .expect_err("no runtime");
    assert!(matches!(err, IngestError::Config(_)));
    assert!(pipeline.history().is_empty());
}

#[test]
fn invalid_configuration_is_refused() {
    let warehouse: Arc<dyn Warehouse> = Arc::new(SqliteWarehouse::in_memory().expect("warehouse"));
    let config = PipelineConfig {
        chunk_size: 0,
        ..PipelineConfig::default()
    };
    assert!(matches!(Pipeline::new(config, warehouse), Err(IngestError::Config(_))));
}
