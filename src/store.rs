//! Persistent fingerprint store
//!
//! One record per task, keyed by task path, kept under
//! `<build>/fingerprints/<project-path-encoded>/<task-name>.rec`.
//! A record summarizes the last successful execution: task hash, input
//! and output digests, duration and completion time.
//!
//! Writes go through a temp file in `<build>/tmp` and a rename, so a
//! record is either the old version or the new one, never a torn mix.
//! Store problems are never fatal: a corrupt or unreadable record is
//! logged and treated as "no prior record", costing incrementality
//! but not correctness. One store belongs to one Context; two Contexts
//! over the same directory are a user error and get no coordination.

use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::digest::Digest;
use crate::error::{KilnError, StoreError};
use crate::paths;

/// File magic for fingerprint records
const MAGIC: &[u8; 4] = b"KRec";
/// Bumped whenever the record layout changes
const SCHEMA_VERSION: u16 = 1;

// ============================================================================
// RECORD
// ============================================================================

/// Summary of one successful task execution
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintRecord {
    pub task_hash: Digest,
    /// (path, content digest) per input file, sorted by path
    pub inputs: Vec<(PathBuf, Digest)>,
    /// (path, content digest) per output file, sorted by path
    pub outputs: Vec<(PathBuf, Digest)>,
    pub duration_ms: u64,
    /// Unix epoch milliseconds
    pub completed_at_ms: u64,
}

impl FingerprintRecord {
    /// Stored digest for an input path, if any
    pub fn input_digest(&self, path: &Path) -> Option<&Digest> {
        self.inputs
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, d)| d)
    }

    pub fn output_digest(&self, path: &Path) -> Option<&Digest> {
        self.outputs
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, d)| d)
    }

    /// Encode to the on-disk layout
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(MAGIC);
        // Infallible: writing to a Vec cannot fail
        out.write_u16::<BigEndian>(SCHEMA_VERSION).unwrap();
        out.extend_from_slice(self.task_hash.as_bytes());
        encode_entries(&mut out, &self.inputs);
        encode_entries(&mut out, &self.outputs);
        out.write_u64::<BigEndian>(self.duration_ms).unwrap();
        out.write_u64::<BigEndian>(self.completed_at_ms).unwrap();
        out
    }

    /// Decode from the on-disk layout
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let mut cur = Cursor::new(bytes);

        let mut magic = [0u8; 4];
        cur.read_exact(&mut magic).map_err(short)?;
        if &magic != MAGIC {
            return Err(format!("bad magic {:02x?}", magic));
        }

        let version = cur.read_u16::<BigEndian>().map_err(short)?;
        if version != SCHEMA_VERSION {
            return Err(format!(
                "schema version {} (supported: {})",
                version, SCHEMA_VERSION
            ));
        }

        let mut hash = [0u8; Digest::LEN];
        cur.read_exact(&mut hash).map_err(short)?;

        let inputs = decode_entries(&mut cur)?;
        let outputs = decode_entries(&mut cur)?;
        let duration_ms = cur.read_u64::<BigEndian>().map_err(short)?;
        let completed_at_ms = cur.read_u64::<BigEndian>().map_err(short)?;

        if cur.position() != bytes.len() as u64 {
            return Err("trailing bytes after record".to_string());
        }

        Ok(Self {
            task_hash: Digest::from_bytes(hash),
            inputs,
            outputs,
            duration_ms,
            completed_at_ms,
        })
    }
}

fn short(e: io::Error) -> String {
    format!("truncated record: {}", e)
}

fn encode_entries(out: &mut Vec<u8>, entries: &[(PathBuf, Digest)]) {
    out.write_u32::<BigEndian>(entries.len() as u32).unwrap();
    for (path, digest) in entries {
        let bytes = path.to_string_lossy();
        let bytes = bytes.as_bytes();
        out.write_u16::<BigEndian>(bytes.len() as u16).unwrap();
        out.extend_from_slice(bytes);
        out.extend_from_slice(digest.as_bytes());
    }
}

fn decode_entries(cur: &mut Cursor<&[u8]>) -> Result<Vec<(PathBuf, Digest)>, String> {
    let count = cur.read_u32::<BigEndian>().map_err(short)?;
    let mut entries = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let len = cur.read_u16::<BigEndian>().map_err(short)? as usize;
        let mut path = vec![0u8; len];
        cur.read_exact(&mut path).map_err(short)?;
        let path = String::from_utf8(path).map_err(|e| format!("non-utf8 path: {}", e))?;
        let mut digest = [0u8; Digest::LEN];
        cur.read_exact(&mut digest).map_err(short)?;
        entries.push((PathBuf::from(path), Digest::from_bytes(digest)));
    }
    Ok(entries)
}

// ============================================================================
// STORE
// ============================================================================

/// On-disk fingerprint store for one build directory
pub struct FingerprintStore {
    fingerprint_dir: PathBuf,
    tmp_dir: PathBuf,
    /// Records already read or written this invocation
    cache: DashMap<String, FingerprintRecord>,
    /// Serializes directory creation and renames
    write_lock: Mutex<()>,
}

impl FingerprintStore {
    pub fn open(build_dir: &Path) -> Self {
        Self {
            fingerprint_dir: build_dir.join("fingerprints"),
            tmp_dir: build_dir.join("tmp"),
            cache: DashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Record file for a task path like `:app:compile`
    fn record_path(&self, task_path: &str) -> PathBuf {
        let (project, name) = match task_path.rfind(':') {
            Some(idx) => (&task_path[..idx], &task_path[idx + 1..]),
            None => ("", task_path),
        };
        self.fingerprint_dir
            .join(paths::encode_project_path(project))
            .join(format!("{}.rec", name))
    }

    /// Load the last successful record for a task, if any.
    ///
    /// Corrupt records are logged at warn level and read as absent.
    pub fn load(&self, task_path: &str) -> Option<FingerprintRecord> {
        if let Some(record) = self.cache.get(task_path) {
            return Some(record.clone());
        }

        let path = self.record_path(task_path);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(task = task_path, error = %e, "fingerprint record unreadable; treating as absent");
                return None;
            }
        };

        match FingerprintRecord::decode(&bytes) {
            Ok(record) => {
                self.cache.insert(task_path.to_string(), record.clone());
                Some(record)
            }
            Err(detail) => {
                let err = StoreError::Corrupt {
                    path,
                    detail,
                };
                warn!(task = task_path, error = %err, "treating as absent");
                None
            }
        }
    }

    /// Persist a record, replacing any previous one.
    ///
    /// Failures are logged and swallowed: the build stays correct, it
    /// just loses incremental skips for this task.
    pub fn save(&self, task_path: &str, record: &FingerprintRecord) {
        if let Err(err) = self.try_save(task_path, record) {
            warn!(task = task_path, error = %err, "failed to persist fingerprint record");
        }
        self.cache.insert(task_path.to_string(), record.clone());
    }

    fn try_save(&self, task_path: &str, record: &FingerprintRecord) -> Result<(), KilnError> {
        let target = self.record_path(task_path);
        let io_err = |detail: String| StoreError::Io {
            path: target.clone(),
            detail,
        };

        let _guard = self.write_lock.lock();
        std::fs::create_dir_all(&self.tmp_dir).map_err(|e| io_err(e.to_string()))?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(e.to_string()))?;
        }

        let mut tmp = tempfile::NamedTempFile::new_in(&self.tmp_dir)
            .map_err(|e| io_err(e.to_string()))?;
        tmp.write_all(&record.encode())
            .map_err(|e| io_err(e.to_string()))?;
        tmp.persist(&target)
            .map_err(|e| io_err(e.error.to_string()))?;

        debug!(task = task_path, path = %target.display(), "fingerprint record written");
        Ok(())
    }

    /// Drop the stored record for a task (used by clean-style tasks)
    pub fn forget(&self, task_path: &str) {
        self.cache.remove(task_path);
        let path = self.record_path(task_path);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(task = task_path, error = %e, "failed to remove fingerprint record");
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::hash_bytes;

    fn sample_record() -> FingerprintRecord {
        FingerprintRecord {
            task_hash: hash_bytes(b"task"),
            inputs: vec![
                (PathBuf::from("/src/a.c"), hash_bytes(b"a")),
                (PathBuf::from("/src/b.c"), hash_bytes(b"b")),
            ],
            outputs: vec![(PathBuf::from("/out/a.o"), hash_bytes(b"obj"))],
            duration_ms: 1234,
            completed_at_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn encode_decode_is_identity() {
        let record = sample_record();
        let decoded = FingerprintRecord::decode(&record.encode()).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn encode_decode_handles_empty_entry_lists() {
        let record = FingerprintRecord {
            task_hash: hash_bytes(b"t"),
            inputs: vec![],
            outputs: vec![],
            duration_ms: 0,
            completed_at_ms: 0,
        };
        assert_eq!(FingerprintRecord::decode(&record.encode()).unwrap(), record);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut bytes = sample_record().encode();
        bytes[0] = b'X';
        assert!(FingerprintRecord::decode(&bytes).unwrap_err().contains("magic"));
    }

    #[test]
    fn decode_rejects_truncation_and_trailing_garbage() {
        let bytes = sample_record().encode();
        assert!(FingerprintRecord::decode(&bytes[..bytes.len() - 3]).is_err());

        let mut extended = bytes;
        extended.push(0);
        assert!(FingerprintRecord::decode(&extended)
            .unwrap_err()
            .contains("trailing"));
    }

    #[test]
    fn save_then_load_round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FingerprintStore::open(tmp.path());
        let record = sample_record();

        store.save(":app:compile", &record);

        // A fresh store must read from disk, not from the write cache
        let fresh = FingerprintStore::open(tmp.path());
        assert_eq!(fresh.load(":app:compile").unwrap(), record);
        assert!(fresh.load(":app:link").is_none());
    }

    #[test]
    fn record_files_land_under_encoded_project_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FingerprintStore::open(tmp.path());
        store.save(":app:lib:compile", &sample_record());

        assert!(tmp
            .path()
            .join("fingerprints/app_lib/compile.rec")
            .is_file());
    }

    #[test]
    fn corrupt_record_reads_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FingerprintStore::open(tmp.path());
        store.save(":t", &sample_record());

        let path = tmp.path().join("fingerprints/root/t.rec");
        std::fs::write(&path, b"garbage").unwrap();

        let fresh = FingerprintStore::open(tmp.path());
        assert!(fresh.load(":t").is_none());
    }

    #[test]
    fn forget_removes_the_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FingerprintStore::open(tmp.path());
        store.save(":t", &sample_record());
        store.forget(":t");

        let fresh = FingerprintStore::open(tmp.path());
        assert!(fresh.load(":t").is_none());
    }
}
