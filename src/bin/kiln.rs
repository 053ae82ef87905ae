//! kiln: flatten JSONL streams into tabular outputs
//!
//! Usage:
//!   # Flatten to CSV (default output is <input>.csv)
//!   kiln events.jsonl
//!
//!   # Multiple outputs at once
//!   kiln --output events.csv.gz,events.sqlite events.jsonl
//!
//!   # Transpose and rename via a config file
//!   kiln --config rules.yaml --replace-keys events.jsonl
//!
//!   # Inspect the discovered keys without writing anything
//!   kiln --show-keys-info events.jsonl

// Use MiMalloc allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use kiln::{FlattenConfig, Options, Processor};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kiln", version)]
#[command(about = "Flatten JSONL streams into CSV, SQLite, PostgreSQL dump and raw files", long_about = None)]
struct Args {
    /// Input JSONL files (.gz and .zst are decompressed by suffix)
    #[arg(value_name = "FILE")]
    inputs: Vec<PathBuf>,

    /// Input files, comma-separated (alternative to positional arguments)
    #[arg(long)]
    input: Option<String>,

    /// Output files, comma-separated, routed by suffix (.csv, .raw, .sqlite)
    #[arg(long, short = 'o')]
    output: Option<String>,

    /// Output to CSV file (gzip/zstd encoded if it ends with .gz/.zst)
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Output to SQLite file
    #[arg(long)]
    sqlite: Option<PathBuf>,

    /// Output to PostgreSQL dump file
    #[arg(long)]
    pg_dump: Option<PathBuf>,

    /// Output to RAW file (values written as-is without escaping)
    #[arg(long)]
    raw: Option<PathBuf>,

    /// RAW file column delimiter
    #[arg(long, default_value = "")]
    raw_delim: String,

    /// Table name for SQL outputs
    #[arg(long, default_value = "kiln")]
    sql_table: String,

    /// Maximum columns in a single SQL table before part splitting
    #[arg(long, default_value_t = 2000)]
    sql_max_cols: usize,

    /// Configuration YAML or JSON file with projection rules
    #[arg(long)]
    config: Option<PathBuf>,

    /// Add a single key to the list of included keys
    #[arg(long)]
    get_key: Option<String>,

    /// Use unique tail segment converted to snake_case as column name
    #[arg(long)]
    replace_keys: bool,

    /// Check string values for nested JSON and URLs and extract them
    #[arg(long)]
    extract_strings: bool,

    /// Skip columns that only ever held zero values (0, "", false, null)
    #[arg(long)]
    skip_zero_cols: bool,

    /// Add an auto-incremented sequence column
    #[arg(long)]
    add_sequence: bool,

    /// Use case-sensitive keys (can fail for SQLite)
    #[arg(long)]
    case_sensitive_keys: bool,

    /// Regular expression to capture parts of line prefix preceding JSON
    #[arg(long)]
    match_line_prefix: Option<String>,

    /// Max number of lines to process, 0 for unlimited
    #[arg(long, default_value_t = 0)]
    max_lines: usize,

    /// Skip a number of first lines
    #[arg(long, default_value_t = 0)]
    offset_lines: usize,

    /// Max number of lines to process when scanning keys
    #[arg(long, default_value_t = 0)]
    max_lines_keys: usize,

    /// Max length of field value, exceeding tail is truncated, 0 for unlimited
    #[arg(long, default_value_t = 0)]
    field_limit: usize,

    /// Max length of column name, 0 for unlimited
    #[arg(long, default_value_t = 0)]
    key_limit: usize,

    /// Max unique child keys before a parent collapses to raw JSON,
    /// comma-separated for <object>,<array>, 0 for unlimited
    #[arg(long, default_value = "100,10")]
    children_limit: String,

    /// Buffer size (max length of file line) in bytes
    #[arg(long, default_value_t = 10_000_000)]
    buf_size: usize,

    /// Number of concurrent workers, 0 for 2 x CPU count
    #[arg(long, default_value_t = 0)]
    concurrency: usize,

    /// Heap in use soft limit in MB, 0 to disable throttling
    #[arg(long, default_value_t = 1000)]
    mem_limit: usize,

    /// Progress verbosity: 0 silent, 1 status, 2 adds more metrics
    #[arg(long, default_value_t = 1)]
    verbosity: u8,

    /// Show all discovered keys as a flat list
    #[arg(long)]
    show_keys_flat: bool,

    /// Show discovered keys as a hierarchy
    #[arg(long)]
    show_keys_hier: bool,

    /// Show projected columns with their renames and types
    #[arg(long)]
    show_keys_info: bool,

    /// Show discovered structure as a draft JSON Schema
    #[arg(long)]
    show_json_schema: bool,
}

fn parse_children_limit(s: &str) -> Result<(usize, usize)> {
    let mut parts = s.split(',');

    let object: usize = parts
        .next()
        .unwrap_or_default()
        .trim()
        .parse()
        .context("invalid --children-limit object threshold")?;

    let array = match parts.next() {
        Some(a) => a.trim().parse().context("invalid --children-limit array threshold")?,
        None => object,
    };

    Ok((object, array))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbosity {
        0 => "error",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut inputs = args.inputs.clone();
    if let Some(list) = &args.input {
        inputs.extend(list.split(',').filter(|s| !s.is_empty()).map(PathBuf::from));
    }

    if inputs.is_empty() {
        anyhow::bail!("no input files; see kiln --help");
    }

    let (children_limit_object, children_limit_array) =
        parse_children_limit(&args.children_limit)?;

    let mut opts = Options {
        csv: args.csv,
        raw: args.raw,
        raw_delim: args.raw_delim,
        sqlite: args.sqlite,
        pg_dump: args.pg_dump,
        sql_table: args.sql_table,
        sql_max_cols: args.sql_max_cols,
        max_lines: args.max_lines,
        offset_lines: args.offset_lines,
        max_lines_keys: args.max_lines_keys,
        field_limit: args.field_limit,
        key_limit: args.key_limit,
        children_limit_object,
        children_limit_array,
        buf_size: args.buf_size,
        get_key: args.get_key,
        replace_keys: args.replace_keys,
        extract_strings: args.extract_strings,
        skip_zero_cols: args.skip_zero_cols,
        add_sequence: args.add_sequence,
        case_sensitive_keys: args.case_sensitive_keys,
        match_line_prefix: args.match_line_prefix,
        show_keys_flat: args.show_keys_flat,
        show_keys_hier: args.show_keys_hier,
        show_keys_info: args.show_keys_info,
        show_json_schema: args.show_json_schema,
        concurrency: args.concurrency,
        mem_limit_mb: args.mem_limit,
        verbosity: args.verbosity,
    };

    if let Some(output) = &args.output {
        opts.route_outputs(output);
    }

    // Default to <input>.csv when no output and no diagnostics were asked for.
    let show_only = opts.show_keys_flat
        || opts.show_keys_hier
        || opts.show_keys_info
        || opts.show_json_schema;
    let has_output =
        opts.csv.is_some() || opts.raw.is_some() || opts.sqlite.is_some() || opts.pg_dump.is_some();

    if !has_output && !show_only {
        let mut default_csv = inputs[0].as_os_str().to_owned();
        default_csv.push(".csv");
        opts.csv = Some(PathBuf::from(default_csv));
    }

    let config = match &args.config {
        Some(path) => FlattenConfig::load(path)?,
        None => FlattenConfig::default(),
    };

    let mut processor = Processor::new(opts, config, inputs).context("invalid configuration")?;
    processor.process().context("processing failed")?;

    Ok(())
}
