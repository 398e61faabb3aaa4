//! On-disk state.
//!
//! Three small stores back the pool's durable state: the ban list and the
//! pending-submission table are rewritten atomically (write `path.tmp`,
//! fsync, rename, fsync the directory), while the found-blocks log is
//! append-only and fsynced per record. Records are length-delimited: a u32
//! little-endian byte count followed by a JSON document, so a torn final
//! record from a crash is detected and dropped on load.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tracing::prelude::*;

/// Atomically replace `path` with `bytes`.
///
/// Survives an OS crash consistent with the most recently fsynced
/// generation: the tmp file is fully synced before the rename, and the
/// directory is synced after it.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    if let Some(dir) = path.parent() {
        if let Ok(dir_handle) = File::open(dir) {
            let _ = dir_handle.sync_all();
        }
    }
    Ok(())
}

/// Serialize records as a length-delimited stream.
pub fn encode_records<T: Serialize>(records: impl IntoIterator<Item = T>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for record in records {
        let body = serde_json::to_vec(&record)?;
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
    }
    Ok(out)
}

/// Read a length-delimited record stream, stopping at the first torn or
/// malformed record.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut bytes = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut bytes)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    }

    let mut records = Vec::new();
    let mut cursor = 0usize;
    while cursor + 4 <= bytes.len() {
        let len = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;
        let Some(body) = bytes.get(cursor..cursor + len) else {
            warn!(path = %path.display(), "Dropping torn trailing record");
            break;
        };
        match serde_json::from_slice(body) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Dropping malformed record");
                break;
            }
        }
        cursor += len;
    }
    Ok(records)
}

/// A block submission awaiting (or past) `submitblock`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingSubmission {
    pub timestamp: u64,
    pub height: i64,
    pub hash: String,
    pub worker: String,
    pub block_hex: String,
    #[serde(default)]
    pub rpc_error: Option<String>,
    #[serde(default)]
    pub rpc_url: Option<String>,
    #[serde(default)]
    pub payout_addr: Option<String>,
    pub status: SubmissionStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Submitted,
}

impl PendingSubmission {
    /// Submission key: the block hash when known, else the block hex.
    pub fn key(&self) -> &str {
        if self.hash.is_empty() {
            &self.block_hex
        } else {
            &self.hash
        }
    }
}

/// Keyed store of block submissions; newer records override older ones
/// under the same key.
pub struct SubmissionStore {
    path: PathBuf,
    inner: Mutex<HashMap<String, PendingSubmission>>,
}

impl SubmissionStore {
    pub fn load(path: PathBuf) -> Result<Self> {
        let records: Vec<PendingSubmission> = read_records(&path)?;
        let mut map = HashMap::new();
        for record in records {
            map.insert(record.key().to_string(), record);
        }
        Ok(Self {
            path,
            inner: Mutex::new(map),
        })
    }

    /// Insert or replace the record for its key, then persist.
    pub fn upsert(&self, record: PendingSubmission) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.insert(record.key().to_string(), record);
        self.persist_locked(&inner)
    }

    /// Submissions whose latest record is still pending.
    pub fn pending(&self) -> Vec<PendingSubmission> {
        self.inner
            .lock()
            .values()
            .filter(|record| record.status == SubmissionStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<PendingSubmission> {
        self.inner.lock().get(key).cloned()
    }

    fn persist_locked(&self, map: &HashMap<String, PendingSubmission>) -> Result<()> {
        let bytes = encode_records(map.values())?;
        atomic_write(&self.path, &bytes)
    }
}

/// Append-only log of found blocks.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct FoundBlockRecord {
    pub created_at: u64,
    pub payload: serde_json::Value,
}

pub struct FoundBlockLog {
    path: PathBuf,
}

impl FoundBlockLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn append(&self, record: &FoundBlockRecord) -> Result<()> {
        let bytes = encode_records(std::iter::once(record))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&bytes)?;
        file.sync_data()?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<FoundBlockRecord>> {
        read_records(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submission(hash: &str, status: SubmissionStatus) -> PendingSubmission {
        PendingSubmission {
            timestamp: 1_700_000_000,
            height: 1,
            hash: hash.into(),
            worker: "worker".into(),
            block_hex: "00".into(),
            rpc_error: None,
            rpc_url: None,
            payout_addr: None,
            status,
        }
    }

    #[test]
    fn atomic_write_leaves_no_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        atomic_write(&path, b"hello").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn records_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.bin");
        let records = vec![
            submission("aa", SubmissionStatus::Pending),
            submission("bb", SubmissionStatus::Submitted),
        ];
        atomic_write(&path, &encode_records(records.iter()).unwrap()).unwrap();
        let loaded: Vec<PendingSubmission> = read_records(&path).unwrap();
        assert_eq!(loaded, records);
    }

    #[test]
    fn torn_trailing_record_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.bin");
        let mut bytes = encode_records(std::iter::once(submission(
            "aa",
            SubmissionStatus::Pending,
        )))
        .unwrap();
        // A crash mid-append: length prefix present, body truncated.
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(b"{\"partial");
        std::fs::write(&path, &bytes).unwrap();

        let loaded: Vec<PendingSubmission> = read_records(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].hash, "aa");
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Vec<PendingSubmission> =
            read_records(&dir.path().join("absent.bin")).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn upsert_overrides_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = SubmissionStore::load(dir.path().join("subs.bin")).unwrap();

        store.upsert(submission("aa", SubmissionStatus::Pending)).unwrap();
        assert_eq!(store.pending().len(), 1);

        store.upsert(submission("aa", SubmissionStatus::Submitted)).unwrap();
        assert!(store.pending().is_empty());
        assert_eq!(
            store.get("aa").unwrap().status,
            SubmissionStatus::Submitted
        );
    }

    #[test]
    fn store_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subs.bin");
        {
            let store = SubmissionStore::load(path.clone()).unwrap();
            store.upsert(submission("aa", SubmissionStatus::Pending)).unwrap();
            store.upsert(submission("bb", SubmissionStatus::Submitted)).unwrap();
        }
        let store = SubmissionStore::load(path).unwrap();
        assert_eq!(store.pending().len(), 1);
        assert_eq!(store.pending()[0].hash, "aa");
    }

    #[test]
    fn key_falls_back_to_block_hex() {
        let mut record = submission("", SubmissionStatus::Pending);
        record.block_hex = "deadbeef".into();
        assert_eq!(record.key(), "deadbeef");
    }

    #[test]
    fn found_block_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = FoundBlockLog::new(dir.path().join("blocks.bin"));
        log.append(&FoundBlockRecord {
            created_at: 1_700_000_000,
            payload: json!({"height": 1, "hash": "aa"}),
        })
        .unwrap();
        log.append(&FoundBlockRecord {
            created_at: 1_700_000_100,
            payload: json!({"height": 2, "hash": "bb"}),
        })
        .unwrap();

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].payload["height"], 2);
    }
}
