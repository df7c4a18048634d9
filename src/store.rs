//! Key-value storage primitives. The engine is written against `KvBackend`
//! and only ever needs plain reads plus two conditional writes:
//! `put_if_absent` and `replace_if_equal`. Replication records live in their
//! own backend instance alongside the data they describe and share its
//! durability.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use redb::{ReadableTable, ReadableTableMetadata, TableDefinition};

use crate::error::EngineError;

pub trait KvBackend: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError>;

    /// Unconditional write; returns the prior value.
    fn insert(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, EngineError>;

    /// Returns the prior value, `None` if the key was absent.
    fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError>;

    /// Returns the existing value without writing when the key is present.
    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, EngineError>;

    /// Compare-and-set on the full value. False when the current value does
    /// not equal `expected` (including when the key is absent).
    fn replace_if_equal(
        &self,
        key: &[u8],
        expected: &[u8],
        value: &[u8],
    ) -> Result<bool, EngineError>;

    fn remove_if_equal(&self, key: &[u8], expected: &[u8]) -> Result<bool, EngineError>;

    fn len(&self) -> Result<u64, EngineError>;

    fn is_empty(&self) -> Result<bool, EngineError> {
        Ok(self.len()? == 0)
    }

    fn clear(&self) -> Result<(), EngineError>;

    /// Weakly-consistent key snapshot, in key order.
    fn keys(&self) -> Result<Vec<Vec<u8>>, EngineError>;

    fn for_each(
        &self,
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), EngineError>,
    ) -> Result<(), EngineError>;
}

/*──────────────────────── in-memory ─────────────────────*/

#[derive(Default)]
pub struct MemBackend {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl KvBackend for MemBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.map.lock().unwrap().insert(key.to_vec(), value.to_vec()))
    }

    fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.map.lock().unwrap().remove(key))
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let mut map = self.map.lock().unwrap();
        if let Some(existing) = map.get(key) {
            return Ok(Some(existing.clone()));
        }
        map.insert(key.to_vec(), value.to_vec());
        Ok(None)
    }

    fn replace_if_equal(
        &self,
        key: &[u8],
        expected: &[u8],
        value: &[u8],
    ) -> Result<bool, EngineError> {
        let mut map = self.map.lock().unwrap();
        match map.get(key) {
            Some(cur) if cur.as_slice() == expected => {
                map.insert(key.to_vec(), value.to_vec());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn remove_if_equal(&self, key: &[u8], expected: &[u8]) -> Result<bool, EngineError> {
        let mut map = self.map.lock().unwrap();
        match map.get(key) {
            Some(cur) if cur.as_slice() == expected => {
                map.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn len(&self) -> Result<u64, EngineError> {
        Ok(self.map.lock().unwrap().len() as u64)
    }

    fn clear(&self) -> Result<(), EngineError> {
        self.map.lock().unwrap().clear();
        Ok(())
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>, EngineError> {
        Ok(self.map.lock().unwrap().keys().cloned().collect())
    }

    fn for_each(
        &self,
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        // Snapshot so the callback may re-enter the store.
        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = self
            .map
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in snapshot {
            f(&k, &v)?;
        }
        Ok(())
    }
}

/*──────────────────────── redb-backed ───────────────────*/

/// One redb database file holding any number of named tables, each exposed
/// as its own `KvBackend`. redb serialises writers, which is what makes the
/// conditional writes atomic.
pub struct RedbBackend {
    db: Arc<redb::Database>,
}

impl RedbBackend {
    pub fn open(path: &str) -> Result<Arc<Self>, EngineError> {
        let db = redb::Database::create(path).map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(Arc::new(Self { db: Arc::new(db) }))
    }

    /// Open (creating if needed) a named table.
    pub fn table(&self, name: &str) -> Result<Arc<RedbTable>, EngineError> {
        let table = RedbTable {
            db: self.db.clone(),
            name: name.to_owned(),
        };
        let txn = table.begin_write()?;
        txn.open_table(table.def())
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        txn.commit()
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(Arc::new(table))
    }
}

pub struct RedbTable {
    db: Arc<redb::Database>,
    name: String,
}

impl RedbTable {
    fn def(&self) -> TableDefinition<'_, &'static [u8], Vec<u8>> {
        TableDefinition::new(&self.name)
    }

    fn begin_write(&self) -> Result<redb::WriteTransaction, EngineError> {
        self.db
            .begin_write()
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    fn begin_read(&self) -> Result<redb::ReadTransaction, EngineError> {
        self.db
            .begin_read()
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    fn commit(txn: redb::WriteTransaction) -> Result<(), EngineError> {
        txn.commit().map_err(|e| EngineError::Storage(e.to_string()))
    }
}

macro_rules! tbl {
    ($txn:expr, $def:expr) => {
        $txn.open_table($def)
            .map_err(|e| EngineError::Storage(e.to_string()))?
    };
}

impl KvBackend for RedbTable {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let txn = self.begin_read()?;
        let t = tbl!(txn, self.def());
        let got = t.get(key).map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(got.map(|g| g.value()))
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let txn = self.begin_write()?;
        let prior = {
            let mut t = tbl!(txn, self.def());
            let prior = t
                .insert(key, value.to_vec())
                .map_err(|e| EngineError::Storage(e.to_string()))?
                .map(|g| g.value());
            prior
        };
        Self::commit(txn)?;
        Ok(prior)
    }

    fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let txn = self.begin_write()?;
        let prior = {
            let mut t = tbl!(txn, self.def());
            let prior = t
                .remove(key)
                .map_err(|e| EngineError::Storage(e.to_string()))?
                .map(|g| g.value());
            prior
        };
        Self::commit(txn)?;
        Ok(prior)
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let txn = self.begin_write()?;
        let existing = {
            let mut t = tbl!(txn, self.def());
            let existing = t
                .get(key)
                .map_err(|e| EngineError::Storage(e.to_string()))?
                .map(|g| g.value());
            if existing.is_none() {
                t.insert(key, value.to_vec())
                    .map_err(|e| EngineError::Storage(e.to_string()))?;
            }
            existing
        };
        Self::commit(txn)?;
        Ok(existing)
    }

    fn replace_if_equal(
        &self,
        key: &[u8],
        expected: &[u8],
        value: &[u8],
    ) -> Result<bool, EngineError> {
        let txn = self.begin_write()?;
        let swapped = {
            let mut t = tbl!(txn, self.def());
            let matches = match t.get(key).map_err(|e| EngineError::Storage(e.to_string()))? {
                Some(g) => g.value() == expected,
                None => false,
            };
            if matches {
                t.insert(key, value.to_vec())
                    .map_err(|e| EngineError::Storage(e.to_string()))?;
            }
            matches
        };
        Self::commit(txn)?;
        Ok(swapped)
    }

    fn remove_if_equal(&self, key: &[u8], expected: &[u8]) -> Result<bool, EngineError> {
        let txn = self.begin_write()?;
        let removed = {
            let mut t = tbl!(txn, self.def());
            let matches = match t.get(key).map_err(|e| EngineError::Storage(e.to_string()))? {
                Some(g) => g.value() == expected,
                None => false,
            };
            if matches {
                t.remove(key)
                    .map_err(|e| EngineError::Storage(e.to_string()))?;
            }
            matches
        };
        Self::commit(txn)?;
        Ok(removed)
    }

    fn len(&self) -> Result<u64, EngineError> {
        let txn = self.begin_read()?;
        let t = tbl!(txn, self.def());
        t.len().map_err(|e| EngineError::Storage(e.to_string()))
    }

    fn clear(&self) -> Result<(), EngineError> {
        let txn = self.begin_write()?;
        {
            let mut t = tbl!(txn, self.def());
            let keys: Vec<Vec<u8>> = {
                let mut keys = Vec::new();
                for item in t.iter().map_err(|e| EngineError::Storage(e.to_string()))? {
                    let (k, _) = item.map_err(|e| EngineError::Storage(e.to_string()))?;
                    keys.push(k.value().to_vec());
                }
                keys
            };
            for key in keys {
                t.remove(key.as_slice())
                    .map_err(|e| EngineError::Storage(e.to_string()))?;
            }
        }
        Self::commit(txn)
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>, EngineError> {
        let txn = self.begin_read()?;
        let t = tbl!(txn, self.def());
        let mut out = Vec::new();
        for item in t.iter().map_err(|e| EngineError::Storage(e.to_string()))? {
            let (k, _) = item.map_err(|e| EngineError::Storage(e.to_string()))?;
            out.push(k.value().to_vec());
        }
        Ok(out)
    }

    fn for_each(
        &self,
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        let txn = self.begin_read()?;
        let t = tbl!(txn, self.def());
        for item in t.iter().map_err(|e| EngineError::Storage(e.to_string()))? {
            let (k, v) = item.map_err(|e| EngineError::Storage(e.to_string()))?;
            f(k.value(), &v.value())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn backend_contract(store: &dyn KvBackend) {
        assert_eq!(store.get(b"k").unwrap(), None);
        assert_eq!(store.insert(b"k", b"v1").unwrap(), None);
        assert_eq!(store.insert(b"k", b"v2").unwrap(), Some(b"v1".to_vec()));

        // conditional writes
        assert_eq!(store.put_if_absent(b"k", b"x").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(store.put_if_absent(b"k2", b"w").unwrap(), None);
        assert!(!store.replace_if_equal(b"k", b"wrong", b"v3").unwrap());
        assert!(store.replace_if_equal(b"k", b"v2", b"v3").unwrap());
        assert!(!store.replace_if_equal(b"missing", b"", b"v").unwrap());
        assert!(!store.remove_if_equal(b"k", b"nope").unwrap());
        assert!(store.remove_if_equal(b"k2", b"w").unwrap());

        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.keys().unwrap(), vec![b"k".to_vec()]);
        assert_eq!(store.remove(b"k").unwrap(), Some(b"v3".to_vec()));
        assert_eq!(store.remove(b"k").unwrap(), None);

        store.insert(b"a", b"1").unwrap();
        store.insert(b"b", b"2").unwrap();
        let mut seen = Vec::new();
        store
            .for_each(&mut |k, v| {
                seen.push((k.to_vec(), v.to_vec()));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen.len(), 2);
        store.clear().unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn mem_backend_contract() {
        backend_contract(&*MemBackend::new());
    }

    #[test]
    fn redb_backend_contract() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.redb");
        let db = RedbBackend::open(path.to_str().unwrap()).unwrap();
        let table = db.table("data").unwrap();
        backend_contract(&*table);
    }

    #[test]
    fn redb_tables_are_isolated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.redb");
        let db = RedbBackend::open(path.to_str().unwrap()).unwrap();
        let a = db.table("a").unwrap();
        let b = db.table("b").unwrap();
        a.insert(b"k", b"in-a").unwrap();
        assert_eq!(b.get(b"k").unwrap(), None);
        assert_eq!(a.get(b"k").unwrap(), Some(b"in-a".to_vec()));
    }
}
