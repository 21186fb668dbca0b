//! Append-only disk mirror for high-priority operations.
//!
//! The store is a single `.jsonl` file: each line is either a full
//! operation record or a tombstone (`{"rm": "<id>"}`) marking a prior
//! record as dispatched. Restore replays the log, collapsing duplicates
//! and tombstones by operation id, so recovering twice from the same file
//! yields the same result. The file is compacted after every restore.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::Operation;
use crate::error::TunnelError;

/// Durable mirror interface. Any embedded append/remove log works as long
/// as restore-after-crash is idempotent.
pub trait OperationStore: Send + Sync {
    /// Persist one operation. Called synchronously on enqueue.
    fn append(&self, op: &Operation) -> Result<(), TunnelError>;
    /// Mark an operation as dispatched or expired.
    fn remove(&self, id: &str) -> Result<(), TunnelError>;
    /// Replay the log into the set of still-pending operations.
    fn load(&self) -> Result<Vec<Operation>, TunnelError>;
}

/// One line in the log file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum StoreRecord {
    Put(Operation),
    Tombstone { rm: String },
}

/// File-backed [`OperationStore`].
pub struct JsonlStore {
    path: PathBuf,
    file: Mutex<fs::File>,
}

impl JsonlStore {
    /// Open (or create) the log file at `dir/pending.jsonl`.
    pub fn open(dir: &Path) -> Result<Self, TunnelError> {
        fs::create_dir_all(dir).map_err(|e| {
            TunnelError::Configuration(format!("create store dir {}: {e}", dir.display()))
        })?;
        let path = dir.join("pending.jsonl");
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                TunnelError::Configuration(format!("open store {}: {e}", path.display()))
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    fn write_record(&self, record: &StoreRecord) -> Result<(), TunnelError> {
        let line = serde_json::to_string(record)
            .map_err(|e| TunnelError::Unknown(format!("store serialize: {e}")))?;
        let mut file = self.file.lock().expect("store mutex poisoned");
        file.write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .and_then(|()| file.flush())
            .map_err(|e| TunnelError::Unknown(format!("store write: {e}")))
    }

    /// Rewrite the file so it contains exactly `pending`, dropping replayed
    /// tombstones. The caller holds the file lock, keeping appends out
    /// during the swap.
    fn compact_locked(
        &self,
        file: &mut fs::File,
        pending: &[Operation],
    ) -> Result<(), TunnelError> {
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut out = fs::File::create(&tmp)
                .map_err(|e| TunnelError::Unknown(format!("store compact: {e}")))?;
            for op in pending {
                let line = serde_json::to_string(op)
                    .map_err(|e| TunnelError::Unknown(format!("store serialize: {e}")))?;
                out.write_all(line.as_bytes())
                    .and_then(|()| out.write_all(b"\n"))
                    .map_err(|e| TunnelError::Unknown(format!("store compact: {e}")))?;
            }
            out.flush()
                .map_err(|e| TunnelError::Unknown(format!("store compact: {e}")))?;
        }
        fs::rename(&tmp, &self.path)
            .map_err(|e| TunnelError::Unknown(format!("store compact rename: {e}")))?;
        *file = fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| TunnelError::Unknown(format!("store reopen: {e}")))?;
        Ok(())
    }
}

impl OperationStore for JsonlStore {
    fn append(&self, op: &Operation) -> Result<(), TunnelError> {
        self.write_record(&StoreRecord::Put(op.clone()))
    }

    fn remove(&self, id: &str) -> Result<(), TunnelError> {
        self.write_record(&StoreRecord::Tombstone { rm: id.to_string() })
    }

    fn load(&self) -> Result<Vec<Operation>, TunnelError> {
        let mut file = self.file.lock().expect("store mutex poisoned");
        let content = fs::read_to_string(&self.path)
            .map_err(|e| TunnelError::Unknown(format!("store read: {e}")))?;

        // Later records win; duplicate puts for one id collapse to the last.
        let mut pending: HashMap<String, Operation> = HashMap::new();
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<StoreRecord>(line) {
                Ok(StoreRecord::Put(op)) => {
                    pending.insert(op.id.clone(), op);
                }
                Ok(StoreRecord::Tombstone { rm }) => {
                    pending.remove(&rm);
                }
                Err(e) => {
                    warn!("Skipping corrupt store line: {e}");
                }
            }
        }

        let mut ops: Vec<Operation> = pending.into_values().collect();
        ops.sort_by_key(|op| op.enqueued_ms);
        self.compact_locked(&mut file, &ops)?;
        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Priority;

    fn op(id: &str) -> Operation {
        Operation {
            id: id.to_string(),
            identity: "acme".to_string(),
            priority: Priority::High,
            payload: b"payload".to_vec(),
            headers: HashMap::new(),
            timeout_ms: 1000,
            deadline_ms: None,
            enqueued_ms: 1,
            retries: 0,
            correlation_id: None,
        }
    }

    #[test]
    fn append_then_load_returns_pending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonlStore::open(dir.path()).expect("open");

        store.append(&op("a")).expect("append");
        store.append(&op("b")).expect("append");
        store.remove("a").expect("remove");

        let pending = store.load().expect("load");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "b");
    }

    #[test]
    fn load_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonlStore::open(dir.path()).expect("open");

        store.append(&op("a")).expect("append");
        // Duplicate append for the same id collapses on load.
        store.append(&op("a")).expect("append");

        let first = store.load().expect("load");
        let second = store.load().expect("load again");
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, "a");
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonlStore::open(dir.path()).expect("open");
        store.append(&op("a")).expect("append");

        {
            let mut file = fs::OpenOptions::new()
                .append(true)
                .open(dir.path().join("pending.jsonl"))
                .expect("open raw");
            file.write_all(b"{not json\n").expect("write garbage");
        }

        let pending = store.load().expect("load");
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn append_works_after_compaction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonlStore::open(dir.path()).expect("open");

        store.append(&op("a")).expect("append");
        store.load().expect("load compacts");
        store.append(&op("b")).expect("append after compact");

        let pending = store.load().expect("load");
        assert_eq!(pending.len(), 2);
    }
}
