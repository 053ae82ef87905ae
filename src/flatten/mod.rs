//! The flattening pipeline: walker, key discovery, projection planning,
//! line dispatch and the two-pass processor that ties them together.

pub mod extract;
pub mod keys;
pub mod plan;
pub mod processor;
pub mod reader;
pub mod walker;

pub use extract::Extract;
pub use keys::{key_from_path, FlKey, IndexKey, KeyRegistry};
pub use plan::{build_projection, KeyNamer, Projection};
pub use processor::Processor;
pub use reader::LineReader;
pub use walker::{WalkSink, Walker};
