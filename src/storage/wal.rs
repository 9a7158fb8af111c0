use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::FsyncPolicy;
use crate::types::SeriesId;

const RECORD_TYPE_PUT: u8 = 1;
const MAX_RECORD_LEN: u32 = 1 << 20;
/// `type:u8 | series_id:u64 | ts:i64 | value_bits:u64`
const PAYLOAD_LEN: u32 = 1 + 8 + 8 + 8;
const DEFAULT_MAX_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A decoded WAL record, handed to a replay callback.
pub struct WalRecord {
    pub series_id: SeriesId,
    pub ts: i64,
    pub value: f64,
}

/// Something that consumes records during replay.
pub trait ReplayContext {
    fn on_record(&mut self, series_id: SeriesId, ts: i64, value: f64);
}

impl<F: FnMut(SeriesId, i64, f64)> ReplayContext for F {
    fn on_record(&mut self, series_id: SeriesId, ts: i64, value: f64) {
        self(series_id, ts, value)
    }
}

pub struct WriteAheadLog {
    dir: PathBuf,
    current_path: PathBuf,
    current: File,
    bytes_written: u64,
    max_segment_size: u64,
    fsync_policy: FsyncPolicy,
    crc: Crc<u32>,
}

impl WriteAheadLog {
    /// Ensures `dir` exists and opens `dir/current.wal` in append+read mode.
    pub fn open<P: AsRef<Path>>(dir: P, fsync_policy: FsyncPolicy) -> Result<Self, WalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let current_path = dir.join("current.wal");
        let current = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&current_path)?;
        let bytes_written = current.metadata()?.len();

        Ok(Self {
            dir,
            current_path,
            current,
            bytes_written,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            fsync_policy,
            crc: Crc::<u32>::new(&CRC_32_ISO_HDLC),
        })
    }

    pub fn with_max_segment_size(mut self, bytes: u64) -> Self {
        self.max_segment_size = bytes;
        self
    }

    pub fn with_fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.fsync_policy = policy;
        self
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Encodes and appends one Put record. Returns total bytes written
    /// (header + payload + crc).
    pub fn append(&mut self, series_id: SeriesId, ts: i64, value: f64) -> Result<u64, WalError> {
        let mut payload = Vec::with_capacity(PAYLOAD_LEN as usize);
        payload.push(RECORD_TYPE_PUT);
        payload.extend_from_slice(&series_id.to_le_bytes());
        payload.extend_from_slice(&ts.to_le_bytes());
        payload.extend_from_slice(&value.to_bits().to_le_bytes());

        let mut digest = self.crc.digest();
        digest.update(&payload);
        let crc = digest.finalize();

        let mut buf = Vec::with_capacity(4 + payload.len() + 4);
        buf.extend_from_slice(&PAYLOAD_LEN.to_le_bytes());
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&crc.to_le_bytes());

        self.current.write_all(&buf)?;
        if self.fsync_policy == FsyncPolicy::Always {
            self.current.sync_data()?;
        }
        self.bytes_written += buf.len() as u64;
        Ok(buf.len() as u64)
    }

    pub fn sync(&self) -> Result<(), WalError> {
        self.current.sync_data()?;
        Ok(())
    }

    /// Closes `current.wal`, renaming it to `<epoch_ms>.wal`, and opens a
    /// fresh `current.wal` if the active segment has grown past the limit.
    pub fn rotate_if_needed(&mut self) -> Result<(), WalError> {
        if self.bytes_written < self.max_segment_size {
            return Ok(());
        }
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let rotated_path = self.dir.join(format!("{}.wal", epoch_ms));
        self.current.sync_data()?;
        fs::rename(&self.current_path, &rotated_path)?;
        self.current = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.current_path)?;
        self.bytes_written = 0;
        info!(path = %rotated_path.display(), "rotated wal segment");
        Ok(())
    }

    /// Iterates all `*.wal` files in lexicographic order with `current.wal`
    /// forced last, invoking `ctx.on_record` for each valid record. Stops
    /// replay of a file at the first CRC/length error but continues with
    /// the remaining files.
    pub fn replay(&self, ctx: &mut impl ReplayContext) -> Result<(), WalError> {
        let mut rotated: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().and_then(|e| e.to_str()) == Some("wal")
                    && p.file_name().and_then(|n| n.to_str()) != Some("current.wal")
            })
            .collect();
        rotated.sort();

        for path in rotated {
            Self::replay_file(&path, &self.crc, ctx);
        }
        Self::replay_file(&self.current_path, &self.crc, ctx);
        Ok(())
    }

    fn replay_file(path: &Path, crc: &Crc<u32>, ctx: &mut impl ReplayContext) {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to open wal file for replay");
                return;
            }
        };
        let mut reader = BufReader::new(file);
        loop {
            match Self::read_record(&mut reader, crc) {
                Ok(Some(record)) => ctx.on_record(record.series_id, record.ts, record.value),
                Ok(None) => break,
                Err(reason) => {
                    warn!(path = %path.display(), %reason, "halting wal replay for this file");
                    break;
                }
            }
        }
    }

    fn read_record<R: Read>(reader: &mut R, crc: &Crc<u32>) -> Result<Option<WalRecord>, String> {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.to_string()),
        }
        let len = u32::from_le_bytes(len_bytes);
        if len == 0 || len > MAX_RECORD_LEN {
            return Err(format!("invalid record length {len}"));
        }

        let mut payload = vec![0u8; len as usize];
        reader
            .read_exact(&mut payload)
            .map_err(|_| "short read mid-record".to_string())?;

        let mut crc_bytes = [0u8; 4];
        reader
            .read_exact(&mut crc_bytes)
            .map_err(|_| "short read mid-crc".to_string())?;
        let expected = u32::from_le_bytes(crc_bytes);

        let mut digest = crc.digest();
        digest.update(&payload);
        if digest.finalize() != expected {
            return Err("crc mismatch".to_string());
        }

        if payload.is_empty() || payload[0] != RECORD_TYPE_PUT {
            return Err(format!("unknown record type {:?}", payload.first()));
        }
        if payload.len() != PAYLOAD_LEN as usize {
            return Err("unexpected payload length".to_string());
        }

        let series_id = u64::from_le_bytes(payload[1..9].try_into().unwrap());
        let ts = i64::from_le_bytes(payload[9..17].try_into().unwrap());
        let value = f64::from_bits(u64::from_le_bytes(payload[17..25].try_into().unwrap()));

        Ok(Some(WalRecord {
            series_id,
            ts,
            value,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct Collector(Vec<(SeriesId, i64, f64)>);
    impl ReplayContext for Collector {
        fn on_record(&mut self, series_id: SeriesId, ts: i64, value: f64) {
            self.0.push((series_id, ts, value));
        }
    }

    #[test]
    fn append_and_replay_round_trips() {
        let dir = tempdir().unwrap();
        let mut wal = WriteAheadLog::open(dir.path(), FsyncPolicy::None).unwrap();
        wal.append(1, 1000, 1.5).unwrap();
        wal.append(1, 1500, 2.25).unwrap();

        let mut collector = Collector(Vec::new());
        wal.replay(&mut collector).unwrap();
        assert_eq!(collector.0, vec![(1, 1000, 1.5), (1, 1500, 2.25)]);
    }

    #[test]
    fn rotation_produces_a_new_current_segment() {
        let dir = tempdir().unwrap();
        let mut wal = WriteAheadLog::open(dir.path(), FsyncPolicy::None)
            .unwrap()
            .with_max_segment_size(1);
        wal.append(1, 1, 1.0).unwrap();
        wal.rotate_if_needed().unwrap();
        assert_eq!(wal.bytes_written(), 0);

        let rotated: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "current.wal")
            .collect();
        assert_eq!(rotated.len(), 1);
    }

    #[test]
    fn replay_stops_at_corruption_but_keeps_other_files() {
        let dir = tempdir().unwrap();
        {
            let mut wal = WriteAheadLog::open(dir.path(), FsyncPolicy::None).unwrap();
            wal.append(7, 100, 9.0).unwrap();
        }
        // corrupt current.wal by truncating mid-crc
        let current = dir.path().join("current.wal");
        let bytes = fs::read(&current).unwrap();
        fs::write(&current, &bytes[..bytes.len() - 1]).unwrap();

        let wal = WriteAheadLog::open(dir.path(), FsyncPolicy::None).unwrap();
        let mut collector = Collector(Vec::new());
        wal.replay(&mut collector).unwrap();
        assert!(collector.0.is_empty());
    }
}
