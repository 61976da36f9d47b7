use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;
use wave_types::OType;

use crate::backend::{BackendTxn, StorageBackend};
use crate::error::{StoreError, StoreResult};

type Key = (OType, String);

struct Slot {
    rev: u64,
    data: Vec<u8>,
}

#[derive(Default)]
struct Tables {
    rows: HashMap<Key, Slot>,
    /// Bumped whenever a key of the type is created or removed, so scans
    /// can detect phantoms at commit.
    type_gen: HashMap<OType, u64>,
    next_rev: u64,
}

/// In-memory, HashMap-based storage backend.
///
/// Intended for tests and embedding. Transactions buffer their writes and
/// record the revision of every key they read; commit validates that read
/// set under the write lock (optimistic concurrency) and fails with
/// [`StoreError::CommitConflict`] if anything moved.
pub struct InMemoryBackend {
    tables: RwLock<Tables>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Number of stored rows across all types.
    pub fn len(&self) -> usize {
        self.tables.read().map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("row_count", &self.len())
            .finish()
    }
}

fn poisoned() -> StoreError {
    StoreError::Storage("lock poisoned".into())
}

impl StorageBackend for InMemoryBackend {
    fn begin(&self) -> StoreResult<Box<dyn BackendTxn + '_>> {
        Ok(Box::new(MemoryTxn {
            backend: self,
            writes: HashMap::new(),
            reads: HashMap::new(),
            scanned: HashMap::new(),
        }))
    }
}

struct MemoryTxn<'a> {
    backend: &'a InMemoryBackend,
    writes: HashMap<Key, Option<Vec<u8>>>,
    reads: HashMap<Key, Option<u64>>,
    scanned: HashMap<OType, u64>,
}

impl BackendTxn for MemoryTxn<'_> {
    fn get(&mut self, otype: OType, oid: &str) -> StoreResult<Option<Vec<u8>>> {
        let key = (otype, oid.to_string());
        if let Some(pending) = self.writes.get(&key) {
            return Ok(pending.clone());
        }
        let tables = self.backend.tables.read().map_err(|_| poisoned())?;
        let slot = tables.rows.get(&key);
        self.reads.entry(key).or_insert(slot.map(|s| s.rev));
        Ok(slot.map(|s| s.data.clone()))
    }

    fn put(&mut self, otype: OType, oid: &str, data: Vec<u8>) -> StoreResult<()> {
        self.writes.insert((otype, oid.to_string()), Some(data));
        Ok(())
    }

    fn delete(&mut self, otype: OType, oid: &str) -> StoreResult<()> {
        self.writes.insert((otype, oid.to_string()), None);
        Ok(())
    }

    fn scan(&mut self, otype: OType) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let mut found: HashMap<String, Vec<u8>> = HashMap::new();
        {
            let tables = self.backend.tables.read().map_err(|_| poisoned())?;
            let gen = tables.type_gen.get(&otype).copied().unwrap_or(0);
            self.scanned.entry(otype).or_insert(gen);
            for ((t, oid), slot) in tables.rows.iter() {
                if *t != otype {
                    continue;
                }
                self.reads
                    .entry((otype, oid.clone()))
                    .or_insert(Some(slot.rev));
                found.insert(oid.clone(), slot.data.clone());
            }
        }
        for ((t, oid), pending) in self.writes.iter() {
            if *t != otype {
                continue;
            }
            match pending {
                Some(data) => {
                    found.insert(oid.clone(), data.clone());
                }
                None => {
                    found.remove(oid);
                }
            }
        }
        let mut rows: Vec<(String, Vec<u8>)> = found.into_iter().collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTxn {
            backend,
            writes,
            reads,
            scanned,
        } = *self;
        let mut tables = backend.tables.write().map_err(|_| poisoned())?;

        for (key, rev) in reads.iter() {
            let current = tables.rows.get(key).map(|s| s.rev);
            if current != *rev {
                return Err(StoreError::CommitConflict(format!("{}:{}", key.0, key.1)));
            }
        }
        for (otype, gen) in scanned.iter() {
            if tables.type_gen.get(otype).copied().unwrap_or(0) != *gen {
                return Err(StoreError::CommitConflict(format!("{otype}:*")));
            }
        }

        let count = writes.len();
        for (key, pending) in writes {
            let otype = key.0;
            match pending {
                Some(data) => {
                    tables.next_rev += 1;
                    let rev = tables.next_rev;
                    if tables.rows.insert(key, Slot { rev, data }).is_none() {
                        *tables.type_gen.entry(otype).or_insert(0) += 1;
                    }
                }
                None => {
                    if tables.rows.remove(&key).is_some() {
                        *tables.type_gen.entry(otype).or_insert(0) += 1;
                    }
                }
            }
        }
        debug!(writes = count, "memory transaction committed");
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        debug!(writes = self.writes.len(), "memory transaction rolled back");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_are_isolated_until_commit() {
        let backend = InMemoryBackend::new();
        let mut txn = backend.begin().unwrap();
        txn.put(OType::Block, "b1", b"one".to_vec()).unwrap();
        assert_eq!(txn.get(OType::Block, "b1").unwrap(), Some(b"one".to_vec()));

        let mut other = backend.begin().unwrap();
        assert_eq!(other.get(OType::Block, "b1").unwrap(), None);
        other.rollback();

        txn.commit().unwrap();
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn rollback_discards_writes() {
        let backend = InMemoryBackend::new();
        let mut txn = backend.begin().unwrap();
        txn.put(OType::Tab, "t1", b"x".to_vec()).unwrap();
        txn.rollback();
        assert!(backend.is_empty());
    }

    #[test]
    fn stale_read_fails_commit() {
        let backend = InMemoryBackend::new();
        let mut seed = backend.begin().unwrap();
        seed.put(OType::Block, "b1", b"v1".to_vec()).unwrap();
        seed.commit().unwrap();

        let mut a = backend.begin().unwrap();
        let mut b = backend.begin().unwrap();
        a.get(OType::Block, "b1").unwrap();
        b.get(OType::Block, "b1").unwrap();
        a.put(OType::Block, "b1", b"a".to_vec()).unwrap();
        b.put(OType::Block, "b1", b"b".to_vec()).unwrap();
        a.commit().unwrap();
        assert!(matches!(b.commit(), Err(StoreError::CommitConflict(_))));
    }

    #[test]
    fn disjoint_keys_commit_independently() {
        let backend = InMemoryBackend::new();
        let mut a = backend.begin().unwrap();
        let mut b = backend.begin().unwrap();
        a.get(OType::Block, "b1").unwrap();
        b.get(OType::Block, "b2").unwrap();
        a.put(OType::Block, "b1", b"a".to_vec()).unwrap();
        b.put(OType::Block, "b2", b"b".to_vec()).unwrap();
        a.commit().unwrap();
        b.commit().unwrap();
        assert_eq!(backend.len(), 2);
    }

    #[test]
    fn scan_sees_pending_writes_and_detects_phantoms() {
        let backend = InMemoryBackend::new();
        let mut seed = backend.begin().unwrap();
        seed.put(OType::Tab, "t1", b"1".to_vec()).unwrap();
        seed.put(OType::Block, "b1", b"1".to_vec()).unwrap();
        seed.commit().unwrap();

        let mut reader = backend.begin().unwrap();
        reader.put(OType::Tab, "t2", b"2".to_vec()).unwrap();
        let rows = reader.scan(OType::Tab).unwrap();
        assert_eq!(
            rows.iter().map(|(oid, _)| oid.as_str()).collect::<Vec<_>>(),
            vec!["t1", "t2"]
        );

        let mut writer = backend.begin().unwrap();
        writer.put(OType::Tab, "t3", b"3".to_vec()).unwrap();
        writer.commit().unwrap();

        assert!(matches!(reader.commit(), Err(StoreError::CommitConflict(_))));
    }
}
