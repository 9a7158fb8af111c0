use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::types::SeriesId;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse manifest line: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub series_id: SeriesId,
    pub hour_bucket: i64,
    pub start_ts: i64,
    pub end_ts: i64,
    pub count: u32,
    pub path: String,
}

/// Durable, append-only record of which segments exist. The in-memory
/// mirror is an ordered sequence; order = append order.
pub struct Manifest {
    path: PathBuf,
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Ensures `segments/` and `MANIFEST` exist under `dir`; parses
    /// `MANIFEST` as newline-delimited JSON.
    pub fn load_or_init(dir: &Path) -> Result<Self, ManifestError> {
        fs::create_dir_all(dir.join("segments"))?;
        let path = dir.join("MANIFEST");
        OpenOptions::new().create(true).append(true).open(&path)?;

        let mut entries = Vec::new();
        let file = File::open(&path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ManifestEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(error = %e, "skipping unparseable manifest line");
                }
            }
        }

        Ok(Self { path, entries })
    }

    /// Appends `entry` to the on-disk `MANIFEST` file, then records it in
    /// the in-memory sequence. The disk write happens first so a crash
    /// between the two still leaves the entry durable for the next load.
    pub fn add(&mut self, entry: ManifestEntry) -> Result<(), ManifestError> {
        let line = serde_json::to_string(&entry)?;
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn max_end_ts(&self, series_id: SeriesId) -> Option<i64> {
        self.entries
            .iter()
            .filter(|e| e.series_id == series_id)
            .map(|e| e.end_ts)
            .max()
    }

    pub fn entries_for(&self, series_id: SeriesId) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter().filter(move |e| e.series_id == series_id)
    }

    /// Removes the in-memory entry matching `path`. Callers are responsible
    /// for deleting the underlying file; either order is tolerated by
    /// readers since a missing file is skipped.
    pub fn remove_by_path(&mut self, path: &str) {
        self.entries.retain(|e| e.path != path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(series_id: SeriesId, hour_bucket: i64, start_ts: i64, end_ts: i64) -> ManifestEntry {
        ManifestEntry {
            series_id,
            hour_bucket,
            start_ts,
            end_ts,
            count: (end_ts - start_ts + 1) as u32,
            path: format!("segments/{}/{}.seg", hour_bucket, series_id),
        }
    }

    #[test]
    fn add_then_reload_preserves_append_order() {
        let dir = tempdir().unwrap();
        {
            let mut manifest = Manifest::load_or_init(dir.path()).unwrap();
            manifest.add(entry(1, 0, 0, 100)).unwrap();
            manifest.add(entry(2, 0, 0, 200)).unwrap();
        }
        let reloaded = Manifest::load_or_init(dir.path()).unwrap();
        assert_eq!(reloaded.entries().len(), 2);
        assert_eq!(reloaded.entries()[0].series_id, 1);
        assert_eq!(reloaded.entries()[1].series_id, 2);
    }

    #[test]
    fn max_end_ts_is_per_series() {
        let dir = tempdir().unwrap();
        let mut manifest = Manifest::load_or_init(dir.path()).unwrap();
        manifest.add(entry(1, 0, 0, 100)).unwrap();
        manifest.add(entry(1, 3600, 3600, 3700)).unwrap();
        manifest.add(entry(2, 0, 0, 50)).unwrap();
        assert_eq!(manifest.max_end_ts(1), Some(3700));
        assert_eq!(manifest.max_end_ts(2), Some(50));
        assert_eq!(manifest.max_end_ts(99), None);
    }

    #[test]
    fn remove_by_path_drops_the_matching_entry() {
        let dir = tempdir().unwrap();
        let mut manifest = Manifest::load_or_init(dir.path()).unwrap();
        manifest.add(entry(1, 0, 0, 100)).unwrap();
        let path = manifest.entries()[0].path.clone();
        manifest.remove_by_path(&path);
        assert!(manifest.entries().is_empty());
    }
}
