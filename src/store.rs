//! JSONL persistence primitives.
//!
//! Each registry owns exactly one file and is the only writer to it, so no
//! cross-process locking is needed. Appends are a single `write(2)` of one
//! newline-terminated buffer; rewrites go through a temp file in the same
//! directory followed by a rename.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::{CoreError, CoreResult};

/// One JSONL file with read / append / rewrite access.
#[derive(Debug)]
pub struct JsonlStore {
    path: PathBuf,
    /// Serializes writers within this process; appends are line-atomic on
    /// the filesystem side.
    io: Mutex<()>,
}

impl JsonlStore {
    /// Create a store for `path`. The file is created lazily on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record in file order. A missing file reads as empty.
    /// Malformed lines are skipped with a warning rather than failing the
    /// whole load.
    pub fn read_all<T: DeserializeOwned>(&self) -> CoreResult<Vec<T>> {
        let _guard = self.lock();
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CoreError::Internal(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )))
            }
        };

        let mut records = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        line = idx.saturating_add(1),
                        error = %e,
                        "skipping malformed jsonl line"
                    );
                }
            }
        }
        Ok(records)
    }

    /// Append one record as a single newline-terminated write.
    pub fn append<T: Serialize>(&self, record: &T) -> CoreResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.lock();
        ensure_parent_dir(&self.path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                CoreError::Internal(format!("failed to open {}: {e}", self.path.display()))
            })?;
        file.write_all(line.as_bytes()).map_err(|e| {
            CoreError::Internal(format!("failed to append {}: {e}", self.path.display()))
        })?;
        Ok(())
    }

    /// Replace the whole file with `records`, atomically via a same-directory
    /// temp file and rename.
    pub fn rewrite<T: Serialize>(&self, records: &[T]) -> CoreResult<()> {
        let mut buf = String::new();
        for record in records {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
        }

        let _guard = self.lock();
        ensure_parent_dir(&self.path)?;
        let tmp = self.path.with_extension("jsonl.tmp");
        std::fs::write(&tmp, buf.as_bytes()).map_err(|e| {
            CoreError::Internal(format!("failed to write {}: {e}", tmp.display()))
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            CoreError::Internal(format!(
                "failed to replace {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        // A poisoned lock only means a previous writer panicked mid-write;
        // the file itself is still line-consistent.
        match self.io.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Create the parent directory of `path` if it does not exist.
pub fn ensure_parent_dir(path: &Path) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            CoreError::Internal(format!(
                "failed to create directory {}: {e}",
                parent.display()
            ))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Rec {
        id: String,
        n: u32,
    }

    fn rec(id: &str, n: u32) -> Rec {
        Rec { id: id.to_owned(), n }
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonlStore::new(dir.path().join("missing.jsonl"));
        let records: Vec<Rec> = store.read_all().expect("read");
        assert!(records.is_empty());
    }

    #[test]
    fn append_then_read_roundtrips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonlStore::new(dir.path().join("a.jsonl"));
        store.append(&rec("x", 1)).expect("append");
        store.append(&rec("y", 2)).expect("append");

        let records: Vec<Rec> = store.read_all().expect("read");
        assert_eq!(records, vec![rec("x", 1), rec("y", 2)]);
    }

    #[test]
    fn rewrite_replaces_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonlStore::new(dir.path().join("b.jsonl"));
        store.append(&rec("old", 1)).expect("append");
        store.rewrite(&[rec("new", 7)]).expect("rewrite");

        let records: Vec<Rec> = store.read_all().expect("read");
        assert_eq!(records, vec![rec("new", 7)]);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.jsonl");
        std::fs::write(&path, "{\"id\":\"ok\",\"n\":1}\nnot json\n\n").expect("write");

        let store = JsonlStore::new(&path);
        let records: Vec<Rec> = store.read_all().expect("read");
        assert_eq!(records, vec![rec("ok", 1)]);
    }
}
