//! # Kiln - JSONL Flattening Toolkit
//!
//! Converts newline-delimited JSON streams into flat, column-oriented
//! tabular outputs (CSV, SQLite, PostgreSQL dump, raw delimited).
//!
//! ## How it works
//!
//! Processing is two-pass: pass 1 walks every line to discover the set of
//! scalar leaf paths and unify their types, pass 2 walks the input again and
//! assembles one output row per line, in input order, under a bounded worker
//! pool.
//!
//! - **flatten**: the pipeline itself - walker, key registry, projection
//!   planner, concurrent reader and the two-pass processor
//! - **writers**: output receivers behind one row-dispatch contract
//!
//! ## Quick Start
//!
//! ```no_run
//! use kiln::{FlattenConfig, Options, Processor};
//!
//! # fn main() -> kiln::Result<()> {
//! let mut opts = Options::default();
//! opts.csv = Some("events.csv".into());
//! opts.add_sequence = true;
//!
//! let config = FlattenConfig::default();
//! let mut processor = Processor::new(opts, config, vec!["events.jsonl".into()])?;
//! processor.process()?;
//! # Ok(())
//! # }
//! ```
//!
//! Nested objects become dot-separated columns (`.a.b.c`), arrays index as
//! `.[n]`, and repeating subtrees can be transposed into sibling tables that
//! share the parent row's sequence number.

pub mod config;
pub mod error;
pub mod flatten;
pub mod hash;
pub mod progress;
pub mod schema;
pub mod types;
pub mod writers;

// Re-export commonly used types for convenience
pub use config::{FlattenConfig, Options};
pub use error::{KilnError, Result};
pub use flatten::{Extract, FlKey, Processor, Walker};
pub use types::{Scalar, Type, Value};
pub use writers::{WriteReceiver, WriterFanout};
