use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::{Point, SeriesId};

const SEGMENT_MAGIC: u32 = 0x53594447; // "SYDG"
const SEGMENT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("not a sydraDB segment file (bad magic)")]
    BadMagic,
    #[error("unsupported segment version {0}")]
    UnsupportedVersion(u32),
}

/// Writes `sorted_points` (already ascending by `ts`) to an immutable file
/// under `dir`, returning the path recorded in the manifest. Appends to an
/// existing file at the same `(series_id, hour_bucket)` rather than
/// overwriting — flush never merges runs, so distinct flush batches for the
/// same bucket get distinct manifest entries but may share or not share a
/// file depending on append timing; here each call produces its own file by
/// suffixing with the run's starting timestamp to keep writes atomic.
pub fn write_segment(
    dir: &Path,
    series_id: SeriesId,
    hour_bucket: i64,
    sorted_points: &[Point],
) -> Result<PathBuf, SegmentError> {
    let dir_path = dir.join("segments").join(hour_bucket.to_string());
    fs::create_dir_all(&dir_path)?;
    let start_ts = sorted_points.first().map(|p| p.ts).unwrap_or(0);
    let file_name = format!("{}.{}.seg", series_id, start_ts);
    let full_path = dir_path.join(&file_name);

    let file = File::create(&full_path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&SEGMENT_MAGIC.to_le_bytes())?;
    writer.write_all(&SEGMENT_VERSION.to_le_bytes())?;
    writer.write_all(&(sorted_points.len() as u32).to_le_bytes())?;
    for point in sorted_points {
        writer.write_all(&point.ts.to_le_bytes())?;
        writer.write_all(&point.value.to_bits().to_le_bytes())?;
    }
    writer.flush()?;

    let relative = PathBuf::from("segments")
        .join(hour_bucket.to_string())
        .join(&file_name);
    Ok(relative)
}

/// Opens `dir.join(relative_path)` and emits every point with
/// `ts ∈ [start_ts, end_ts]` (inclusive) into `out`, in file order
/// (ascending).
pub fn read_range(
    dir: &Path,
    relative_path: &Path,
    start_ts: i64,
    end_ts: i64,
    out: &mut Vec<Point>,
) -> Result<(), SegmentError> {
    let full_path = dir.join(relative_path);
    let file = match File::open(&full_path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if u32::from_le_bytes(magic) != SEGMENT_MAGIC {
        return Err(SegmentError::BadMagic);
    }
    let mut version = [0u8; 4];
    reader.read_exact(&mut version)?;
    let version = u32::from_le_bytes(version);
    if version != SEGMENT_VERSION {
        return Err(SegmentError::UnsupportedVersion(version));
    }
    let mut count_bytes = [0u8; 4];
    reader.read_exact(&mut count_bytes)?;
    let count = u32::from_le_bytes(count_bytes);

    for _ in 0..count {
        let mut ts_bytes = [0u8; 8];
        reader.read_exact(&mut ts_bytes)?;
        let ts = i64::from_le_bytes(ts_bytes);
        let mut value_bytes = [0u8; 8];
        reader.read_exact(&mut value_bytes)?;
        let value = f64::from_bits(u64::from_le_bytes(value_bytes));
        if ts >= start_ts && ts <= end_ts {
            out.push(Point::new(ts, value));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips_points_in_range() {
        let dir = tempdir().unwrap();
        let points = vec![Point::new(1000, 1.5), Point::new(1500, 2.25), Point::new(2000, 3.0)];
        let path = write_segment(dir.path(), 42, 0, &points).unwrap();

        let mut out = Vec::new();
        read_range(dir.path(), &path, 0, 10_000, &mut out).unwrap();
        assert_eq!(out, points);
    }

    #[test]
    fn read_range_filters_outside_bounds() {
        let dir = tempdir().unwrap();
        let points = vec![Point::new(1000, 1.5), Point::new(1500, 2.25), Point::new(2000, 3.0)];
        let path = write_segment(dir.path(), 42, 0, &points).unwrap();

        let mut out = Vec::new();
        read_range(dir.path(), &path, 1200, 1800, &mut out).unwrap();
        assert_eq!(out, vec![Point::new(1500, 2.25)]);
    }

    #[test]
    fn read_range_on_missing_file_is_a_noop() {
        let dir = tempdir().unwrap();
        let mut out = Vec::new();
        read_range(dir.path(), Path::new("segments/0/missing.seg"), 0, 1, &mut out).unwrap();
        assert!(out.is_empty());
    }
}
