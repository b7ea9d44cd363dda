//! AppendFileStore - append-only JSONL backend
//!
//! One JSON record per line. The durable contract: `add` flushes and syncs
//! before acknowledging, so a successful write is visible to subsequent
//! reads across restart. State is rebuilt by replaying the record stream
//! on open; the in-memory index answers reads.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{ArborError, Result};

use super::store::{MemoryStore, Query};
use super::{ContextItem, Tier};

/// One line of the record stream
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Record {
    Add { item: ContextItem },
    Delete { id: String },
    Clear,
}

#[derive(Debug)]
struct Inner {
    writer: File,
    index: FxHashMap<String, ContextItem>,
}

/// JSONL-backed store for the long-lived tiers
#[derive(Debug)]
pub struct AppendFileStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl AppendFileStore {
    /// Open (or create) the store at `path`, replaying existing records.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let index = Self::replay(&path)?;
        let writer = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            inner: Mutex::new(Inner { writer, index }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(path: &Path) -> Result<FxHashMap<String, ContextItem>> {
        let mut index = FxHashMap::default();
        if !path.exists() {
            return Ok(index);
        }

        let reader = BufReader::new(File::open(path)?);
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record =
                serde_json::from_str(&line).map_err(|e| ArborError::StoreUnavailable {
                    tier: Tier::Project.as_str().to_string(),
                    reason: format!("corrupt record at line {}: {e}", line_no + 1),
                })?;
            match record {
                Record::Add { item } => {
                    index.insert(item.id.clone(), item);
                }
                Record::Delete { id } => {
                    index.remove(&id);
                }
                Record::Clear => index.clear(),
            }
        }
        Ok(index)
    }

    /// Write one record and make it durable before returning
    fn append(inner: &mut Inner, record: &Record) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        inner.writer.write_all(&line)?;
        inner.writer.flush()?;
        inner.writer.sync_data()?;
        Ok(())
    }

    fn sorted(items: impl Iterator<Item = ContextItem>) -> Vec<ContextItem> {
        let mut v: Vec<ContextItem> = items.collect();
        v.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        v
    }
}

impl MemoryStore for AppendFileStore {
    fn add(&self, item: ContextItem) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::append(&mut inner, &Record::Add { item: item.clone() })?;
        inner.index.insert(item.id.clone(), item);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<ContextItem>> {
        Ok(self.inner.lock().index.get(id).cloned())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.index.contains_key(id) {
            return Ok(false);
        }
        Self::append(&mut inner, &Record::Delete { id: id.to_string() })?;
        inner.index.remove(id);
        Ok(true)
    }

    fn query(&self, query: &Query) -> Result<Vec<ContextItem>> {
        let items = Self::sorted(self.inner.lock().index.values().cloned());
        Ok(query.apply(items))
    }

    fn list_all(&self) -> Result<Vec<ContextItem>> {
        Ok(Self::sorted(self.inner.lock().index.values().cloned()))
    }

    fn count(&self) -> Result<usize> {
        Ok(self.inner.lock().index.len())
    }

    fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::append(&mut inner, &Record::Clear)?;
        inner.index.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str, importance: f32) -> ContextItem {
        ContextItem::new(id, Tier::Project, "note", json!({"id": id})).with_importance(importance)
    }

    #[test]
    fn writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.jsonl");

        {
            let store = AppendFileStore::open(&path).unwrap();
            store.add(item("a", 0.5)).unwrap();
            store.add(item("b", 0.9)).unwrap();
            store.delete("a").unwrap();
        }

        let store = AppendFileStore::open(&path).unwrap();
        assert_eq!(store.count().unwrap(), 1);
        assert!(store.get("b").unwrap().is_some());
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn clear_is_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.jsonl");

        {
            let store = AppendFileStore::open(&path).unwrap();
            store.add(item("a", 0.5)).unwrap();
            store.clear().unwrap();
            store.add(item("b", 0.5)).unwrap();
        }

        let store = AppendFileStore::open(&path).unwrap();
        assert_eq!(store.count().unwrap(), 1);
        assert!(store.get("b").unwrap().is_some());
    }

    #[test]
    fn file_is_one_record_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.jsonl");

        let store = AppendFileStore::open(&path).unwrap();
        store.add(item("a", 0.5)).unwrap();
        store.add(item("b", 0.5)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(v["op"], "add");
        }
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.jsonl");
        std::fs::write(&path, "{\"op\": \"add\"").unwrap();

        let err = AppendFileStore::open(&path).unwrap_err();
        assert_eq!(err.code(), "ARBOR-050");
    }

    #[test]
    fn query_through_trait() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppendFileStore::open(dir.path().join("store.jsonl")).unwrap();
        store.add(item("weak", 0.1)).unwrap();
        store.add(item("strong", 0.9)).unwrap();

        let results = store
            .query(&Query::new().filter(crate::memory::Filter::importance_at_least(0.5)))
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "strong");
    }
}
