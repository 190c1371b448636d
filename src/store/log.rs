//! Append-only record log backing the result store.
//!
//! Records are written in JSON Lines format: one JSON object per line. The
//! format is crash-safe because complete lines are always valid JSON, while a
//! partial line from a crash mid-write fails to parse and is truncated on
//! replay.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Result;

/// One persisted key/value record.
///
/// Example line:
/// ```json
/// {"seq":0,"ts":"2024-01-15T10:00:00Z","key":"ok:hello","value":[104,105]}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct StoreRecord {
    /// Monotonic sequence number, used to detect corruption on replay.
    pub seq: u64,

    /// Timestamp when the record was written (UTC).
    pub ts: DateTime<Utc>,

    pub key: String,
    pub value: Vec<u8>,
}

/// An append-only JSON-lines log of [`StoreRecord`]s.
pub(super) struct RecordLog {
    file: File,
    path: PathBuf,
    next_seq: u64,
}

impl RecordLog {
    /// Opens the log for appending with a known next sequence number
    /// (obtained from [`RecordLog::replay`]).
    pub fn open(path: impl AsRef<Path>, next_seq: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let is_new = !path.exists();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        // Files opened with append(true) may report position 0 until the
        // first write; seek so the cursor reflects the real end.
        file.seek(SeekFrom::End(0))?;

        // A newly created file needs its directory entry persisted too.
        if is_new && let Some(parent) = path.parent() {
            fsync_dir(parent)?;
        }

        Ok(RecordLog {
            file,
            path,
            next_seq,
        })
    }

    /// Appends one record. No fsync; call [`RecordLog::sync`] to flush.
    pub fn append(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let record = StoreRecord {
            seq: self.next_seq,
            ts: Utc::now(),
            key: key.to_string(),
            value: value.to_vec(),
        };

        let json = serde_json::to_string(&record)?;
        writeln!(self.file, "{}", json)?;
        self.next_seq += 1;
        Ok(())
    }

    /// Forces the log file to disk.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Reads all valid records from `path`, truncating any partial trailing
    /// line left by a crash mid-write.
    ///
    /// Returns `(records, next_seq)`. A missing or empty file yields
    /// `(vec![], 0)`. Records after the first unparseable or
    /// non-monotonically-sequenced line are discarded and the file is
    /// truncated to the valid prefix.
    pub fn replay(path: impl AsRef<Path>) -> Result<(Vec<StoreRecord>, u64)> {
        let path = path.as_ref();

        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((vec![], 0)),
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();
        if file_len == 0 {
            return Ok((vec![], 0));
        }

        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid_end = 0u64;
        let mut pos = 0u64;
        let mut max_seq: Option<u64> = None;

        loop {
            // Read raw bytes up to the newline so invalid UTF-8 from a torn
            // write is handled as corruption rather than a panic.
            let mut line_bytes = Vec::new();
            let n = reader.read_until(b'\n', &mut line_bytes)?;
            if n == 0 {
                break;
            }
            let line_start = pos;
            pos += n as u64;

            let Ok(line) = std::str::from_utf8(&line_bytes) else {
                valid_end = line_start;
                break;
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                valid_end = pos;
                continue;
            }

            match serde_json::from_str::<StoreRecord>(trimmed) {
                Ok(record) => {
                    if max_seq.is_some_and(|prev| record.seq <= prev) {
                        // Non-monotonic sequence: the tail is corrupt.
                        valid_end = line_start;
                        break;
                    }
                    max_seq = Some(record.seq);
                    records.push(record);
                    valid_end = pos;
                }
                Err(_) => {
                    // Partial line from a crash; truncate from here.
                    valid_end = line_start;
                    break;
                }
            }
        }

        if valid_end < file_len {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_end)?;
            file.sync_all()?;
        }

        let next_seq = max_seq.map(|s| s + 1).unwrap_or(0);
        Ok((records, next_seq))
    }

    /// Path to the log file.
    #[allow(dead_code)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Syncs a directory so newly created entries survive a power loss.
///
/// On POSIX systems, creating a file updates the directory; without a
/// directory fsync that entry may not be durable even when the file
/// contents are.
pub(super) fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.log");

        assert!(!path.exists());
        let _log = RecordLog::open(&path, 0).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn append_writes_json_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.log");

        let mut log = RecordLog::open(&path, 0).unwrap();
        log.append("hello", b"world").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);

        let record: StoreRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record.seq, 0);
        assert_eq!(record.key, "hello");
        assert_eq!(record.value, b"world");
    }

    #[test]
    fn sequence_numbers_increment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.log");

        let mut log = RecordLog::open(&path, 0).unwrap();
        log.append("a", b"1").unwrap();
        log.append("b", b"2").unwrap();
        log.append("c", b"3").unwrap();

        let (records, next_seq) = RecordLog::replay(&path).unwrap();
        assert_eq!(next_seq, 3);
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let (records, next_seq) = RecordLog::replay(dir.path().join("nope.log")).unwrap();
        assert!(records.is_empty());
        assert_eq!(next_seq, 0);
    }

    #[test]
    fn replay_truncates_partial_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.log");

        let mut log = RecordLog::open(&path, 0).unwrap();
        log.append("a", b"1").unwrap();
        drop(log);

        let valid_len = std::fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"seq\":1,\"ts\":\"garbage").unwrap();
        drop(file);

        let (records, next_seq) = RecordLog::replay(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(next_seq, 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), valid_len);
    }

    #[test]
    fn replay_truncates_invalid_utf8_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.log");

        let mut log = RecordLog::open(&path, 0).unwrap();
        log.append("a", b"1").unwrap();
        drop(log);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xff, 0xfe, 0xc0]).unwrap();
        drop(file);

        let (records, _) = RecordLog::replay(&path).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn replay_stops_at_non_monotonic_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.log");

        let mut log = RecordLog::open(&path, 0).unwrap();
        log.append("a", b"1").unwrap();
        log.append("b", b"2").unwrap();
        drop(log);

        // Hand-write a record that repeats seq 0: corrupt tail.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        let bogus = StoreRecord {
            seq: 0,
            ts: Utc::now(),
            key: "c".to_string(),
            value: vec![],
        };
        writeln!(file, "{}", serde_json::to_string(&bogus).unwrap()).unwrap();
        drop(file);

        let (records, next_seq) = RecordLog::replay(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(next_seq, 2);
    }

    #[test]
    fn append_resumes_after_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.log");

        {
            let mut log = RecordLog::open(&path, 0).unwrap();
            log.append("a", b"1").unwrap();
        }

        let (_, next_seq) = RecordLog::replay(&path).unwrap();
        let mut log = RecordLog::open(&path, next_seq).unwrap();
        log.append("b", b"2").unwrap();

        let (records, next_seq) = RecordLog::replay(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(next_seq, 2);
    }
}
