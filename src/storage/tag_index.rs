use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::types::SeriesId;

#[derive(Error, Debug)]
pub enum TagIndexError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// In-memory `"k=v" -> set of SeriesId`, snapshotted to `tags.json` after
/// flush.
#[derive(Debug, Default)]
pub struct TagIndex {
    path: PathBuf,
    entries: HashMap<String, HashSet<SeriesId>>,
}

impl TagIndex {
    pub fn load_or_init(dir: &Path) -> Result<Self, TagIndexError> {
        let path = dir.join("tags.json");
        let entries = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str::<HashMap<String, HashSet<SeriesId>>>(&contents)
                .unwrap_or_default(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, entries })
    }

    /// Parses `tags_json` as a flat object; for each string-valued field
    /// `{k: v}`, indexes `"k=v" -> series_id`. Non-object input is ignored.
    pub fn note_tags(&mut self, series_id: SeriesId, tags_json: &str) {
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(tags_json) else {
            return;
        };
        for (key, value) in map {
            if let Value::String(value) = value {
                self.entries
                    .entry(format!("{key}={value}"))
                    .or_default()
                    .insert(series_id);
            }
        }
    }

    pub fn series_for(&self, key: &str, value: &str) -> Option<&HashSet<SeriesId>> {
        self.entries.get(&format!("{key}={value}"))
    }

    /// Writes the current index to `tags.json`. Best-effort: failures are
    /// logged, never propagated.
    pub fn save(&self) {
        if let Err(e) = self.try_save() {
            warn!(error = %e, "failed to snapshot tag index");
        }
    }

    fn try_save(&self) -> Result<(), TagIndexError> {
        let json = serde_json::to_string(&self.entries).unwrap_or_else(|_| "{}".to_string());
        let mut file = File::create(&self.path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn note_tags_indexes_string_fields_only() {
        let dir = tempdir().unwrap();
        let mut index = TagIndex::load_or_init(dir.path()).unwrap();
        index.note_tags(1, r#"{"host":"a","port":8080}"#);
        assert!(index.series_for("host", "a").unwrap().contains(&1));
        assert!(index.series_for("port", "8080").is_none());
    }

    #[test]
    fn non_object_input_is_ignored() {
        let dir = tempdir().unwrap();
        let mut index = TagIndex::load_or_init(dir.path()).unwrap();
        index.note_tags(1, "[1,2,3]");
        assert!(index.series_for("host", "a").is_none());
    }

    #[test]
    fn save_then_reload_round_trips() {
        let dir = tempdir().unwrap();
        {
            let mut index = TagIndex::load_or_init(dir.path()).unwrap();
            index.note_tags(1, r#"{"host":"a"}"#);
            index.save();
        }
        let reloaded = TagIndex::load_or_init(dir.path()).unwrap();
        assert!(reloaded.series_for("host", "a").unwrap().contains(&1));
    }
}
