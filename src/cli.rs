use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::literal::SqlDialect;

#[derive(Debug, Parser)]
#[command(author, version, about = "Sniff, type and bulk-load tabular files into a SQL warehouse", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Detect the format, encoding and delimiter of a file
    Sniff(SniffArgs),
    /// Infer a column schema and optionally write it to a YAML file
    Infer(InferArgs),
    /// Load a file into a warehouse table, creating the table as needed
    Ingest(IngestArgs),
    /// Create the audit and raw-sample tables in a warehouse
    Setup(SetupArgs),
    /// Print the number of rows in a warehouse table
    Count(CountArgs),
    /// Show the first rows of a warehouse table
    Preview(PreviewArgs),
    /// Print or write the default pipeline configuration
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct SniffArgs {
    /// File to inspect (csv, json, xlsx or xls)
    #[arg(short, long)]
    pub input: PathBuf,
    /// Pipeline configuration file (YAML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct InferArgs {
    /// File to inspect (csv, json, xlsx or xls)
    #[arg(short, long)]
    pub input: PathBuf,
    /// Destination schema file (YAML)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Table name recorded in the schema file (defaults to the file stem)
    #[arg(short, long)]
    pub table: Option<String>,
    /// Non-null values sampled per column
    #[arg(long)]
    pub sample_size: Option<usize>,
    /// Pipeline configuration file (YAML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Print the CREATE TABLE statement for this engine
    #[arg(long, value_enum)]
    pub ddl: Option<DdlDialect>,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum DdlDialect {
    Sqlite,
    Spark,
}

impl From<DdlDialect> for SqlDialect {
    fn from(value: DdlDialect) -> Self {
        match value {
            DdlDialect::Sqlite => SqlDialect::Sqlite,
            DdlDialect::Spark => SqlDialect::Spark,
        }
    }
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// File to load (csv, json, xlsx or xls)
    #[arg(short, long)]
    pub input: PathBuf,
    /// SQLite warehouse file (created if missing)
    #[arg(short, long)]
    pub db: PathBuf,
    /// Destination table (defaults to the sanitized file stem)
    #[arg(short, long)]
    pub table: Option<String>,
    /// Pipeline configuration file (YAML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Rows per fallback chunk
    #[arg(long)]
    pub chunk_size: Option<usize>,
    /// Concurrent fallback workers
    #[arg(long)]
    pub workers: Option<usize>,
    /// Abort the job after this many seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,
    /// Drop and recreate the destination table
    #[arg(long)]
    pub recreate: bool,
    /// Skip the staged bulk load and insert in chunks
    #[arg(long)]
    pub no_fast_path: bool,
    /// Persist audit events into the warehouse (implies setup)
    #[arg(long)]
    pub audit: bool,
    /// User recorded on audit events
    #[arg(long)]
    pub user: Option<String>,
}

#[derive(Debug, Args)]
pub struct SetupArgs {
    /// SQLite warehouse file (created if missing)
    #[arg(short, long)]
    pub db: PathBuf,
}

#[derive(Debug, Args)]
pub struct CountArgs {
    /// SQLite warehouse file
    #[arg(short, long)]
    pub db: PathBuf,
    /// Table to count
    #[arg(short, long)]
    pub table: String,
}

#[derive(Debug, Args)]
pub struct PreviewArgs {
    /// SQLite warehouse file
    #[arg(short, long)]
    pub db: PathBuf,
    /// Table to show
    #[arg(short, long)]
    pub table: String,
    /// Number of rows to display
    #[arg(long, default_value_t = 10)]
    pub rows: usize,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Write the configuration here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}
