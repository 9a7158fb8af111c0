use std::hash::Hasher;

use twox_hash::XxHash64;

/// Identifies a logical time series. Collisions are tolerated as
/// correctness-equivalent: series identity *is* the id.
pub type SeriesId = u64;

const HASH_SEED: u64 = 0;

/// Derives a `SeriesId` from a series name alone.
pub fn hash_series(series_name: &str) -> SeriesId {
    let mut hasher = XxHash64::with_seed(HASH_SEED);
    hasher.write(series_name.as_bytes());
    hasher.finish()
}

/// Derives a `SeriesId` from a series name and its tag set, serialized as
/// `series_name|tags_json`.
pub fn hash_series_with_tags(series_name: &str, tags_json: &str) -> SeriesId {
    let mut hasher = XxHash64::with_seed(HASH_SEED);
    hasher.write(series_name.as_bytes());
    hasher.write(b"|");
    hasher.write(tags_json.as_bytes());
    hasher.finish()
}

/// A timestamped sample. Immutable once flushed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub ts: i64,
    pub value: f64,
}

impl Point {
    pub fn new(ts: i64, value: f64) -> Self {
        Self { ts, value }
    }
}

/// `(ts / 3600) * 3600`, the segment's partition key.
pub fn hour_bucket(ts: i64) -> i64 {
    ts.div_euclid(3600) * 3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash_series("cpu.total"), hash_series("cpu.total"));
    }

    #[test]
    fn hash_with_tags_differs_from_bare() {
        assert_ne!(
            hash_series("cpu.total"),
            hash_series_with_tags("cpu.total", "{\"host\":\"a\"}")
        );
    }

    #[test]
    fn hour_bucket_aligns_down() {
        assert_eq!(hour_bucket(3599), 0);
        assert_eq!(hour_bucket(3600), 3600);
        assert_eq!(hour_bucket(7199), 3600);
    }
}
