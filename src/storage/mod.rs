//! Storage engine core: ingest queue, WAL, memtable, hour-bucketed segment
//! flush, manifest, recovery, and retention.

pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod metrics;
pub mod queue;
pub mod retention;
pub mod segment;
pub mod tag_index;
pub mod wal;

pub use engine::{Engine, EngineError, IngestItem};
