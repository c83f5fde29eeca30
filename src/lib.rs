pub mod audit;
pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod frame;
pub mod io_utils;
pub mod job;
pub mod literal;
pub mod loader;
pub mod naming;
pub mod pipeline;
pub mod provision;
pub mod schema;
pub mod sniff;
pub mod table;
pub mod warehouse;

use std::{
    env,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use log::{LevelFilter, info, warn};

use crate::{
    audit::{AuditRecorder, WarehouseAuditRecorder},
    cli::{Cli, Commands},
    config::{CreateMode, PipelineConfig},
    io_utils::printable_delimiter,
    literal::quote_identifier,
    pipeline::Pipeline,
    schema::TableSchema,
    warehouse::{SqliteWarehouse, Warehouse, render_sql_value},
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("tabload", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Sniff(args) => handle_sniff(&args),
        Commands::Infer(args) => handle_infer(&args),
        Commands::Config(args) => handle_config(&args),
        Commands::Ingest(args) => block_on(handle_ingest(args)),
        Commands::Setup(args) => block_on(handle_setup(args)),
        Commands::Count(args) => block_on(handle_count(args)),
        Commands::Preview(args) => block_on(handle_preview(args)),
    }
}

fn block_on<F: std::future::Future<Output = Result<()>>>(future: F) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Starting async runtime")?;
    runtime.block_on(future)
}

fn load_config(path: Option<&PathBuf>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path),
        None => Ok(PipelineConfig::default()),
    }
}

fn read_input(path: &Path) -> Result<(Vec<u8>, String)> {
    let bytes = std::fs::read(path).with_context(|| format!("Reading {path:?}"))?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Input path {path:?} has no usable file name"))?;
    Ok((bytes, filename))
}

fn open_warehouse(path: &Path) -> Result<Arc<SqliteWarehouse>> {
    let warehouse =
        SqliteWarehouse::open(path).with_context(|| format!("Opening warehouse {path:?}"))?;
    Ok(Arc::new(warehouse))
}

fn handle_sniff(args: &cli::SniffArgs) -> Result<()> {
    let config = load_config(args.config.as_ref())?;
    let (bytes, filename) = read_input(&args.input)?;
    let outcome = sniff::sniff(&bytes, &filename, &config)
        .with_context(|| format!("Sniffing {:?}", args.input))?;
    println!("format: {}", outcome.format);
    println!("encoding: {}", outcome.encoding_label());
    if let Some(encoding) = &outcome.encoding {
        println!("confidence: {:.2}", encoding.confidence);
    }
    match outcome.delimiter {
        Some(delimiter) => println!("delimiter: {}", printable_delimiter(delimiter)),
        None => println!("delimiter: none"),
    }
    println!("columns: {}", outcome.frame.column_count());
    println!("rows: {}", outcome.frame.row_count());
    println!("skipped_rows: {}", outcome.issues.skipped_rows);
    for note in &outcome.issues.notes {
        warn!("{note}");
    }
    Ok(())
}

fn handle_infer(args: &cli::InferArgs) -> Result<()> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(sample_size) = args.sample_size {
        config.schema_sample_size = sample_size;
    }
    config.validate()?;
    let (bytes, filename) = read_input(&args.input)?;
    let outcome = sniff::sniff(&bytes, &filename, &config)
        .with_context(|| format!("Sniffing {:?}", args.input))?;
    let inferred = schema::infer(&outcome.frame, config.schema_sample_size);
    for issue in &inferred.issues {
        warn!("{issue}");
    }

    let headers = ["source", "column", "type", "nullable"].map(String::from).to_vec();
    let rows: Vec<Vec<String>> = inferred
        .columns
        .iter()
        .map(|column| {
            vec![
                column.source_name.clone(),
                column.sanitized_name.clone(),
                column.inferred_type.to_string(),
                column.nullable.to_string(),
            ]
        })
        .collect();
    table::print_table(&headers, &rows);
    info!(
        "{} row(s), {} duplicate row(s)",
        inferred.profile.row_count, inferred.profile.duplicate_rows
    );

    let table_name = match &args.table {
        Some(name) => naming::sanitize_identifier(name),
        None => naming::table_name_for(&filename),
    };
    if let Some(dialect) = args.ddl {
        println!(
            "{};",
            provision::create_table_sql(&table_name, &inferred.columns, dialect.into())
        );
    }
    if let Some(output) = &args.output {
        TableSchema::new(table_name, inferred.columns)
            .save(output)
            .with_context(|| format!("Writing schema to {output:?}"))?;
        info!("Schema written to {output:?}");
    }
    Ok(())
}

fn handle_config(args: &cli::ConfigArgs) -> Result<()> {
    let config = PipelineConfig::default();
    match &args.output {
        Some(path) => {
            config
                .save(path)
                .with_context(|| format!("Writing configuration to {path:?}"))?;
            info!("Default configuration written to {path:?}");
        }
        None => print!("{}", config.to_yaml_string()?),
    }
    Ok(())
}

async fn handle_ingest(args: cli::IngestArgs) -> Result<()> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(workers) = args.workers {
        config.max_workers = workers;
    }
    if args.timeout_secs.is_some() {
        config.job_timeout_secs = args.timeout_secs;
    }
    if args.recreate {
        config.create_mode = CreateMode::RecreateAlways;
    }
    if args.no_fast_path {
        config.fast_path_enabled = false;
    }
    if args.user.is_some() {
        config.audit_user = args.user.clone();
    }

    let (bytes, filename) = read_input(&args.input)?;
    let warehouse = open_warehouse(&args.db)?;
    let warehouse: Arc<dyn Warehouse> = warehouse;
    let mut pipeline = Pipeline::new(config, Arc::clone(&warehouse))?;
    if args.audit {
        pipeline.setup().await.context("Creating infrastructure tables")?;
        let recorder: Arc<dyn AuditRecorder> =
            Arc::new(WarehouseAuditRecorder::new(Arc::clone(&warehouse)));
        pipeline = pipeline.with_audit(recorder);
    }

    let summary = pipeline
        .ingest(bytes, &filename, args.table.as_deref())
        .await
        .with_context(|| format!("Ingesting {:?}", args.input))?;
    for warning in &summary.warnings {
        warn!("{warning}");
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn handle_setup(args: cli::SetupArgs) -> Result<()> {
    let warehouse = open_warehouse(&args.db)?;
    let pipeline = Pipeline::new(PipelineConfig::default(), warehouse)?;
    pipeline.setup().await.context("Creating infrastructure tables")?;
    info!("Infrastructure tables ready in {:?}", args.db);
    Ok(())
}

async fn handle_count(args: cli::CountArgs) -> Result<()> {
    let warehouse = open_warehouse(&args.db)?;
    let table_name = naming::sanitize_identifier(&args.table);
    if !warehouse.table_exists(&table_name).await? {
        return Err(anyhow!("Table '{table_name}' does not exist in {:?}", args.db));
    }
    println!("{}", warehouse.row_count(&table_name).await?);
    Ok(())
}

async fn handle_preview(args: cli::PreviewArgs) -> Result<()> {
    let warehouse = open_warehouse(&args.db)?;
    let table_name = naming::sanitize_identifier(&args.table);
    let headers = warehouse.table_columns(&table_name).await?;
    if headers.is_empty() {
        return Err(anyhow!("Table '{table_name}' does not exist in {:?}", args.db));
    }
    let sql = format!("SELECT * FROM {} LIMIT {}", quote_identifier(&table_name), args.rows);
    let rows: Vec<Vec<String>> = warehouse
        .query(&sql)
        .await?
        .iter()
        .map(|row| row.iter().map(render_sql_value).collect())
        .collect();
    table::print_table(&headers, &rows);
    Ok(())
}
