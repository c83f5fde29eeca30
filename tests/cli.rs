mod common;

use assert_cmd::Command;
use common::{TestWorkspace, people_csv};
use predicates::str::contains;
use tabload::config::PipelineConfig;
use tabload::schema::{ColumnType, TableSchema};

fn tabload() -> Command {
    let mut cmd = Command::cargo_bin("tabload").expect("binary exists");
    cmd.env("RUST_LOG", "error");
    cmd
}

#[test]
fn sniff_reports_delimiter_and_shape() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("people.csv", &people_csv(7, ';'));
    tabload()
        .args(["sniff", "-i", input.to_str().unwrap()])
        .assert()
        .success()
        .stdout(contains("format: csv"))
        .stdout(contains("encoding: utf-8"))
        .stdout(contains("delimiter: ;"))
        .stdout(contains("columns: 5"))
        .stdout(contains("rows: 7"));
}

#[test]
fn infer_prints_and_saves_the_schema() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("people.csv", &people_csv(4, ','));
    let output = workspace.path().join("people.yaml");
    tabload()
        .args([
            "infer",
            "-i",
            input.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "--table",
            "Staff",
        ])
        .assert()
        .success()
        .stdout(contains("joined"))
        .stdout(contains("boolean"));

    let schema = TableSchema::load(&output).expect("schema file");
    assert_eq!(schema.table_name, "staff");
    assert_eq!(schema.columns[0].inferred_type, ColumnType::Integer);
    assert_eq!(schema.columns[4].inferred_type, ColumnType::Date);
}

#[test]
fn infer_prints_engine_specific_ddl() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("people.csv", &people_csv(3, ','));
    tabload()
        .args(["infer", "-i", input.to_str().unwrap(), "--ddl", "spark"])
        .assert()
        .success()
        .stdout(contains("CREATE TABLE IF NOT EXISTS \"people\" (\"id\" BIGINT"))
        .stdout(contains("\"name\" STRING"));
}

#[test]
fn ingest_count_and_preview_round_trip() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("people.csv", &people_csv(25, ','));
    let db = workspace.path().join("warehouse.db");
    let db_arg = db.to_str().unwrap();

    tabload()
        .args(["ingest", "-i", input.to_str().unwrap(), "-d", db_arg, "--chunk-size", "10", "--audit"])
        .assert()
        .success()
        .stdout(contains("\"rows_loaded\": 25"))
        .stdout(contains("\"table_name\": \"people\""));

    tabload()
        .args(["count", "-d", db_arg, "-t", "people"])
        .assert()
        .success()
        .stdout("25\n");

    tabload()
        .args(["count", "-d", db_arg, "-t", "audit_logs"])
        .assert()
        .success()
        .stdout(predicates::str::is_match("^[1-9][0-9]*\n$").unwrap());

    tabload()
        .args(["preview", "-d", db_arg, "-t", "people", "--rows", "2"])
        .assert()
        .success()
        .stdout(contains("person 1"))
        .stdout(contains("_ingestion_id"));
}

#[test]
fn ingest_without_fast_path_recreates_the_table() {
    let workspace = TestWorkspace::new();
    let db = workspace.path().join("warehouse.db");
    let db_arg = db.to_str().unwrap();
    let first = workspace.write("first.csv", &people_csv(5, ','));
    let second = workspace.write("second.csv", "code,label\nA,alpha\n");

    for input in [&first, &second] {
        tabload()
            .args([
                "ingest",
                "-i",
                input.to_str().unwrap(),
                "-d",
                db_arg,
                "-t",
                "shared",
                "--recreate",
                "--no-fast-path",
            ])
            .assert()
            .success()
            .stdout(contains("Fallback"));
    }
    tabload()
        .args(["preview", "-d", db_arg, "-t", "shared"])
        .assert()
        .success()
        .stdout(contains("label"))
        .stdout(contains("alpha"));
}

#[test]
fn rejected_input_exits_with_an_error() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("notes.txt", "hello");
    let db = workspace.path().join("warehouse.db");
    tabload()
        .args(["ingest", "-i", input.to_str().unwrap(), "-d", db.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(contains("unsupported file format 'txt'"));
}

#[test]
fn count_of_missing_table_fails() {
    let workspace = TestWorkspace::new();
    let db = workspace.path().join("warehouse.db");
    tabload()
        .args(["setup", "-d", db.to_str().unwrap()])
        .assert()
        .success();
    tabload()
        .args(["count", "-d", db.to_str().unwrap(), "-t", "nowhere"])
        .assert()
        .failure()
        .stderr(contains("does not exist"));
}

#[test]
fn config_defaults_round_trip_through_a_file() {
    let workspace = TestWorkspace::new();
    let path = workspace.path().join("pipeline.yaml");
    tabload()
        .args(["config", "-o", path.to_str().unwrap()])
        .assert()
        .success();
    let loaded = PipelineConfig::load(&path).expect("load config");
    assert_eq!(loaded, PipelineConfig::default());

    tabload()
        .arg("config")
        .assert()
        .success()
        .stdout(contains("chunk_size: 10000"))
        .stdout(contains("create_mode: create_if_absent"));
}
