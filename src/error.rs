//! Error types for the flattening pipeline.

use thiserror::Error;

/// Result type for flattening operations.
pub type Result<T> = std::result::Result<T, KilnError>;

/// Errors surfaced by the pipeline.
///
/// Malformed input lines are not errors: they increment the `errors` metric
/// and are skipped. Everything here terminates the pass that raises it.
#[derive(Debug, Error)]
pub enum KilnError {
    /// Invalid configuration, fatal at construction.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Regex compilation failure in configuration.
    #[error("parse regular expression {pattern}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Input file exists but has no content.
    #[error("empty input file: {0}")]
    EmptyInput(String),

    /// File or stream I/O failure with its operation context.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The completion drainer could not observe progress.
    #[error(
        "could not wait for {count} pending lines ({min} - {max}), expected seq {expected}, in progress {in_progress}"
    )]
    Stall {
        count: usize,
        min: i64,
        max: i64,
        expected: i64,
        in_progress: usize,
    },

    /// Joined receiver failures from a fan-out call.
    #[error("{0}")]
    Receivers(String),

    /// A pass failed while reading one input.
    #[error("failed to process file {path}: {source}")]
    Process {
        path: String,
        #[source]
        source: Box<KilnError>,
    },

    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("CSV: {0}")]
    Csv(#[from] csv::Error),
}

impl KilnError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        KilnError::Io { context: context.into(), source }
    }
}
