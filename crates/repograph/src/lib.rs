#![forbid(unsafe_code)]

//! Repository-to-graph ingestion: load a snapshot, parse every file,
//! resolve cross-file references and merge the result into a graph store
//! under stable identities.

pub mod config;
pub mod db;
pub mod error;
pub mod graph;
pub mod parser;
pub mod pipeline;
pub mod resolution;
pub mod retry;
pub mod source;
pub mod types;
pub mod upsert;
pub mod utils;

pub use db::{GraphStore, SqliteGraphStore};
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{CancellationToken, RunRequest, run};
pub use types::{RunStatus, RunSummary};
