use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::storage::manifest::{Manifest, ManifestError, ManifestEntry};
use crate::storage::memtable::MemTable;
use crate::storage::metrics::{Metrics, MetricsSnapshot};
use crate::storage::queue::{IngestQueue, QueueError};
use crate::storage::retention;
use crate::storage::segment::{self, SegmentError};
use crate::storage::tag_index::{TagIndex, TagIndexError};
use crate::storage::wal::{WalError, WriteAheadLog};
use crate::types::{hour_bucket, Point, SeriesId};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wal error: {0}")]
    Wal(#[from] WalError),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),
    #[error("queue is closed")]
    QueueClosed,
}

impl From<QueueError> for EngineError {
    fn from(_: QueueError) -> Self {
        EngineError::QueueClosed
    }
}

impl From<TagIndexError> for EngineError {
    fn from(err: TagIndexError) -> Self {
        match err {
            TagIndexError::Io(e) => EngineError::Io(e),
        }
    }
}

/// An item enqueued for the writer thread to persist.
pub struct IngestItem {
    pub series_id: SeriesId,
    pub ts: i64,
    pub value: f64,
    pub tags_json: Option<String>,
}

struct Shared {
    wal: Mutex<WriteAheadLog>,
    memtable: Mutex<MemTable>,
    manifest: Mutex<Manifest>,
    tags: Mutex<TagIndex>,
    queue: IngestQueue<IngestItem>,
    metrics: Metrics,
    data_dir: std::path::PathBuf,
    config: Config,
    stop: AtomicBool,
}

/// Owns the WAL, memtable, manifest, tag index, and ingest queue; spawns
/// the writer thread; serves ingest and query_range.
pub struct Engine {
    shared: Arc<Shared>,
    writer_thread: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn init(config: Config) -> Result<Self, EngineError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let wal = WriteAheadLog::open(config.data_dir.join("wal"), config.fsync_policy)?
            .with_max_segment_size(config.wal_segment_max_bytes);
        let manifest = Manifest::load_or_init(&config.data_dir)?;
        let tags = TagIndex::load_or_init(&config.data_dir)?;

        let shared = Arc::new(Shared {
            wal: Mutex::new(wal),
            memtable: Mutex::new(MemTable::new()),
            manifest: Mutex::new(manifest),
            tags: Mutex::new(tags),
            queue: IngestQueue::new(),
            metrics: Metrics::new(),
            data_dir: config.data_dir.clone(),
            config,
            stop: AtomicBool::new(false),
        });

        recover(&shared)?;

        let writer_shared = Arc::clone(&shared);
        let writer_thread = thread::Builder::new()
            .name("sydradb-writer".to_string())
            .spawn(move || writer_loop(writer_shared))
            .map_err(EngineError::Io)?;

        Ok(Self {
            shared,
            writer_thread: Some(writer_thread),
        })
    }

    /// Enqueues `item` for the writer thread and samples queue depth.
    pub fn ingest(&self, item: IngestItem) -> Result<(), EngineError> {
        self.shared.queue.push(item)?;
        self.shared.metrics.sample_queue_len(self.shared.queue.len() as u64);
        Ok(())
    }

    /// Delegates to the segment reader using the current manifest snapshot.
    /// The memtable is intentionally not scanned — see the open question in
    /// the storage engine's design notes.
    pub fn query_range(
        &self,
        series_id: SeriesId,
        start_ts: i64,
        end_ts: i64,
        out: &mut Vec<Point>,
    ) -> Result<(), EngineError> {
        let manifest = self.shared.manifest.lock().unwrap();
        for entry in manifest.entries_for(series_id) {
            if entry.end_ts < start_ts || entry.start_ts > end_ts {
                continue;
            }
            segment::read_range(
                &self.shared.data_dir,
                std::path::Path::new(&entry.path),
                start_ts,
                end_ts,
                out,
            )?;
        }
        Ok(())
    }

    pub fn note_tags(&self, series_id: SeriesId, tags_json: &str) {
        self.shared.tags.lock().unwrap().note_tags(series_id, tags_json);
    }

    /// Snapshots the engine-wide counters, folding in the ingest queue's own
    /// pop counters (the queue tracks those itself, not `Metrics`).
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.shared.metrics.snapshot();
        snapshot.queue_pop_total = self.shared.queue.pop_total();
        snapshot.queue_wait_ns_total = self.shared.queue.pop_wait_ns();
        snapshot
    }

    /// Sets the stop flag, closes the queue (waking the writer), and joins
    /// the writer thread.
    pub fn deinit(mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.queue.close();
        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.queue.close();
        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Builds a per-series highwater mark from the manifest, then replays the
/// WAL, skipping any record at or before that mark. If anything new was
/// inserted, flushes immediately so recovered data becomes a segment before
/// normal operation resumes.
fn recover(shared: &Arc<Shared>) -> Result<(), EngineError> {
    let mut highwater: std::collections::HashMap<SeriesId, i64> = std::collections::HashMap::new();
    {
        let manifest = shared.manifest.lock().unwrap();
        for entry in manifest.entries() {
            let current = highwater.entry(entry.series_id).or_insert(i64::MIN);
            if entry.end_ts > *current {
                *current = entry.end_ts;
            }
        }
    }

    let mut inserted_any = false;
    {
        let wal = shared.wal.lock().unwrap();
        let mut memtable = shared.memtable.lock().unwrap();
        wal.replay(&mut |series_id: SeriesId, ts: i64, value: f64| {
            let mark = highwater.get(&series_id).copied().unwrap_or(i64::MIN);
            if ts <= mark {
                return;
            }
            memtable.insert(series_id, Point::new(ts, value));
            highwater.insert(series_id, ts);
            inserted_any = true;
        })?;
    }

    if inserted_any {
        info!("replayed wal records into memtable; flushing before resuming");
        flush_memtable(shared)?;
    }
    Ok(())
}

fn writer_loop(shared: Arc<Shared>) {
    let mut last_flush = Instant::now();
    let mut last_sync = Instant::now();
    let flush_interval = Duration::from_millis(shared.config.flush_interval_ms);

    loop {
        match shared.queue.pop() {
            Some(item) => {
                if let Err(e) = process_item(&shared, item) {
                    error!(error = %e, "failed to persist ingest item");
                }
            }
            None => {
                if shared.stop.load(Ordering::SeqCst) && shared.queue.is_empty() {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
        }

        let bytes = shared.memtable.lock().unwrap().bytes();
        let should_flush =
            bytes >= shared.config.memtable_max_bytes || last_flush.elapsed() >= flush_interval;
        if should_flush {
            if let Err(e) = flush_memtable(&shared) {
                error!(error = %e, "flush failed");
            }
            last_flush = Instant::now();
            let report = retention::apply(
                &mut shared.manifest.lock().unwrap(),
                &shared.data_dir,
                shared.config.retention_days,
                now_secs(),
            );
            if report.segments_removed > 0 {
                info!(removed = report.segments_removed, "retention applied");
            }
        }

        if shared.config.fsync_policy == crate::config::FsyncPolicy::Interval
            && last_sync.elapsed() >= flush_interval
        {
            if let Err(e) = shared.wal.lock().unwrap().sync() {
                warn!(error = %e, "wal fsync failed");
            }
            last_sync = Instant::now();
        }

        if shared.stop.load(Ordering::SeqCst) && shared.queue.is_empty() {
            break;
        }
    }

    if let Err(e) = flush_memtable(&shared) {
        error!(error = %e, "final flush on shutdown failed");
    }
}

fn process_item(shared: &Arc<Shared>, item: IngestItem) -> Result<(), EngineError> {
    let bytes_written = shared
        .wal
        .lock()
        .unwrap()
        .append(item.series_id, item.ts, item.value)?;
    shared.metrics.record_wal_write(bytes_written);

    shared
        .memtable
        .lock()
        .unwrap()
        .insert(item.series_id, Point::new(item.ts, item.value));
    shared.metrics.record_ingest();

    if let Some(tags_json) = &item.tags_json {
        shared.tags.lock().unwrap().note_tags(item.series_id, tags_json);
    }

    Ok(())
}

/// For each series with buffered points: sort ascending by `ts`, partition
/// into maximal runs sharing an hour bucket, write each run to a segment
/// file, and append a manifest entry per run.
fn flush_memtable(shared: &Arc<Shared>) -> Result<(), EngineError> {
    let start = Instant::now();
    let mut memtable = shared.memtable.lock().unwrap();
    if memtable.is_empty() {
        return Ok(());
    }

    let mut manifest = shared.manifest.lock().unwrap();
    let mut total_points = 0u64;

    let runs: Vec<(SeriesId, Vec<Point>)> = memtable
        .iter()
        .map(|(id, points)| (*id, points.clone()))
        .collect();
    for (series_id, mut points) in runs {
        if points.is_empty() {
            continue;
        }
        points.sort_by_key(|p| p.ts);

        let mut run_start = 0;
        while run_start < points.len() {
            let bucket = hour_bucket(points[run_start].ts);
            let mut run_end = run_start + 1;
            while run_end < points.len() && hour_bucket(points[run_end].ts) == bucket {
                run_end += 1;
            }
            let run = &points[run_start..run_end];
            let path = segment::write_segment(&shared.data_dir, series_id, bucket, run)?;
            manifest.add(ManifestEntry {
                series_id,
                hour_bucket: bucket,
                start_ts: run[0].ts,
                end_ts: run[run.len() - 1].ts,
                count: run.len() as u32,
                path: path.to_string_lossy().into_owned(),
            })?;
            total_points += run.len() as u64;
            run_start = run_end;
        }
    }

    memtable.clear();
    drop(memtable);
    drop(manifest);

    shared.wal.lock().unwrap().rotate_if_needed()?;
    shared.tags.lock().unwrap().save();

    shared
        .metrics
        .record_flush(total_points, start.elapsed().as_nanos() as u64);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsyncPolicy;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> Config {
        Config::default()
            .with_data_dir(dir)
            .with_fsync_policy(FsyncPolicy::None)
            .with_flush_interval_ms(60_000)
            .with_memtable_max_bytes(usize::MAX)
    }

    #[test]
    fn ingest_then_query_after_shutdown_flush_returns_all_points() {
        let dir = tempdir().unwrap();
        let engine = Engine::init(config(dir.path())).unwrap();
        engine
            .ingest(IngestItem { series_id: 1, ts: 1000, value: 1.5, tags_json: None })
            .unwrap();
        engine
            .ingest(IngestItem { series_id: 1, ts: 1500, value: 2.25, tags_json: None })
            .unwrap();
        // give the writer thread a moment to drain the queue
        std::thread::sleep(Duration::from_millis(50));
        engine.deinit();

        let engine = Engine::init(config(dir.path())).unwrap();
        let mut out = Vec::new();
        engine.query_range(1, 0, 10_000, &mut out).unwrap();
        assert_eq!(out, vec![Point::new(1000, 1.5), Point::new(1500, 2.25)]);
        engine.deinit();
    }

    #[test]
    fn recovery_replays_unflushed_wal_records() {
        let dir = tempdir().unwrap();
        {
            let mut wal = WriteAheadLog::open(dir.path().join("wal"), FsyncPolicy::None).unwrap();
            wal.append(7, 1000, 42.0).unwrap();
            wal.append(7, 1050, 43.5).unwrap();
        }
        let engine = Engine::init(config(dir.path())).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let mut out = Vec::new();
        engine.query_range(7, 0, 10_000, &mut out).unwrap();
        assert_eq!(out, vec![Point::new(1000, 42.0), Point::new(1050, 43.5)]);
        engine.deinit();
    }

    #[test]
    fn metrics_reports_queue_pops_after_ingest_drains() {
        let dir = tempdir().unwrap();
        let engine = Engine::init(config(dir.path())).unwrap();
        engine
            .ingest(IngestItem { series_id: 1, ts: 1000, value: 1.5, tags_json: None })
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let snapshot = engine.metrics();
        assert!(snapshot.queue_pop_total >= 1);
        engine.deinit();
    }

    #[test]
    fn note_tags_updates_the_index() {
        let dir = tempdir().unwrap();
        let engine = Engine::init(config(dir.path())).unwrap();
        engine.note_tags(1, r#"{"host":"a"}"#);
        assert!(engine
            .shared
            .tags
            .lock()
            .unwrap()
            .series_for("host", "a")
            .unwrap()
            .contains(&1));
        engine.deinit();
    }
}
