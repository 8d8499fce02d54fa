//! In-process store
//!
//! Holds every table in ordered maps behind one `RwLock`. `atomic` keeps the
//! write lock for the whole closure and commit, so transactions execute in
//! some serial order.

use super::{AtomicOp, Store, StoreRead, Table, Transaction};
use crate::Result;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

type TableData = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Default)]
struct Tables {
    data: HashMap<Table, TableData>,
}

impl StoreRead for Tables {
    fn get_raw(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(&table).and_then(|t| t.get(key)).cloned())
    }
}

/// Store backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a table
    pub fn len(&self, table: Table) -> usize {
        self.tables.read().data.get(&table).map_or(0, |t| t.len())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("MemoryStore")
            .field("tables", &tables.data.len())
            .finish()
    }
}

impl StoreRead for MemoryStore {
    fn get_raw(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tables.read().get_raw(table, key)
    }
}

impl Store for MemoryStore {
    fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tables = self.tables.read();
        let Some(data) = tables.data.get(&table) else {
            return Ok(Vec::new());
        };

        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn atomic(&self, op: &mut AtomicOp<'_>) -> Result<()> {
        let mut tables = self.tables.write();

        let writes = {
            let mut txn = Transaction::new(&*tables);
            op(&mut txn)?;
            txn.into_writes()
        };

        let count = writes.len();
        for ((table, key), value) in writes {
            tables.data.entry(table).or_default().insert(key, value);
        }

        tracing::debug!(writes = count, "Transaction committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_commit_and_read_back() {
        let store = MemoryStore::new();
        store
            .atomic(&mut |txn| {
                txn.put(Table::Meta, b"a".to_vec(), &1u64)?;
                txn.put(Table::Meta, b"b".to_vec(), &2u64)?;
                // Reads see staged writes
                assert_eq!(txn.get::<u64>(Table::Meta, b"a")?, Some(1));
                Ok(())
            })
            .unwrap();

        assert_eq!(store.len(Table::Meta), 2);
        let raw = store.get_raw(Table::Meta, b"b").unwrap().unwrap();
        assert_eq!(bincode::deserialize::<u64>(&raw).unwrap(), 2);
    }

    #[test]
    fn test_failed_closure_writes_nothing() {
        let store = MemoryStore::new();
        let result = store.atomic(&mut |txn| {
            txn.put(Table::Accounts, b"p-1".to_vec(), &100u64)?;
            Err(Error::InvalidInput("abort".into()))
        });

        assert!(result.is_err());
        assert_eq!(store.len(Table::Accounts), 0);
    }

    #[test]
    fn test_scan_prefix_is_bounded() {
        let store = MemoryStore::new();
        store
            .atomic(&mut |txn| {
                txn.put(Table::Indices, b"a|1".to_vec(), &1u8)?;
                txn.put(Table::Indices, b"a|2".to_vec(), &2u8)?;
                txn.put(Table::Indices, b"b|1".to_vec(), &3u8)?;
                Ok(())
            })
            .unwrap();

        let rows = store.scan_prefix(Table::Indices, b"a|").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(store.scan_prefix(Table::Audit, b"").unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_increments_serialize() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store
                            .atomic(&mut |txn| {
                                let n: u64 = txn.get(Table::Meta, b"n")?.unwrap_or(0);
                                txn.put(Table::Meta, b"n".to_vec(), &(n + 1))
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let raw = store.get_raw(Table::Meta, b"n").unwrap().unwrap();
        assert_eq!(bincode::deserialize::<u64>(&raw).unwrap(), 800);
    }
}
