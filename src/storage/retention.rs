use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::storage::manifest::Manifest;

/// Report of what a retention pass removed (or, under `dry_run`, would
/// remove).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionReport {
    pub segments_removed: usize,
}

/// Deletes segments whose `end_ts` is older than `now - retention_days`
/// and drops their manifest entries. Best-effort: file-delete failures are
/// logged and skipped, never propagated.
pub fn apply(
    manifest: &mut Manifest,
    dir: &Path,
    retention_days: u64,
    now_secs: i64,
) -> RetentionReport {
    let cutoff = now_secs - (retention_days as i64) * 86_400;
    let expired_paths: Vec<String> = manifest
        .entries()
        .iter()
        .filter(|e| e.end_ts < cutoff)
        .map(|e| e.path.clone())
        .collect();

    for path in &expired_paths {
        let full_path = dir.join(path);
        match fs::remove_file(&full_path) {
            Ok(()) => info!(path = %full_path.display(), "removed expired segment"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %full_path.display(), error = %e, "failed to remove expired segment"),
        }
        manifest.remove_by_path(path);
    }

    RetentionReport {
        segments_removed: expired_paths.len(),
    }
}

/// Like [`apply`] but never touches the filesystem or manifest; only
/// reports what would be removed.
pub fn dry_run(
    manifest: &Manifest,
    retention_days: u64,
    now_secs: i64,
) -> RetentionReport {
    let cutoff = now_secs - (retention_days as i64) * 86_400;
    let segments_removed = manifest
        .entries()
        .iter()
        .filter(|e| e.end_ts < cutoff)
        .count();
    RetentionReport { segments_removed }
}
