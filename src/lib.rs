//! sydradb - a single-node time series database with an embedded query
//! language, built around a write-ahead log, an in-memory memtable, and
//! hour-bucketed on-disk segments.

pub mod config;
pub mod query;
pub mod storage;
pub mod types;

pub use config::{Config, FsyncPolicy};
pub use query::{execute, ExecuteError, ExecutionCursor, ExecutionStats};
pub use storage::{Engine, EngineError, IngestItem};
pub use types::{Point, SeriesId};
