//! RocksDB-backed store
//!
//! One column family per [`Table`]. Read-modify-write transactions are
//! serialized by a single writer lock and committed with one `WriteBatch`,
//! so a crash never leaves half a transaction on disk.

use super::{AtomicOp, Store, StoreRead, Table, Transaction};
use crate::{Config, Error, Result};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBCompressionType, Direction, IteratorMode,
    Options, WriteBatch, WriteOptions, DB,
};
use std::path::Path;
use std::sync::Arc;

/// Store wrapper for RocksDB
pub struct RocksStore {
    db: Arc<DB>,
    writer: Mutex<()>,
    sync_writes: bool,
}

impl RocksStore {
    /// Open or create the database under `config.data_dir`
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        let descriptors = Table::ALL
            .iter()
            .map(|table| ColumnFamilyDescriptor::new(table.name(), Self::cf_options(*table)))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = Table::ALL.len(),
            "Opened RocksDB store"
        );

        Ok(Self {
            db: Arc::new(db),
            writer: Mutex::new(()),
            sync_writes: config.rocksdb.sync_writes,
        })
    }

    /// Open at an explicit path with default tuning
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let config = Config {
            data_dir: path.as_ref().to_path_buf(),
            ..Config::default()
        };
        Self::open(&config)
    }

    fn cf_options(table: Table) -> Options {
        let mut opts = Options::default();
        match table {
            // Append-only history compresses well
            Table::Audit | Table::TokenTxns => {
                opts.set_compression_type(DBCompressionType::Zstd);
            }
            Table::Indices => {
                opts.set_compression_type(DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
            }
        }
        opts
    }

    fn cf(&self, table: Table) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(table.name())
            .ok_or_else(|| Error::InvariantViolation(format!("column family {} missing", table.name())))
    }
}

impl StoreRead for RocksStore {
    fn get_raw(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(table)?;
        Ok(self.db.get_cf(&cf, key)?)
    }
}

impl Store for RocksStore {
    fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(table)?;
        let mut rows = Vec::new();

        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }

        Ok(rows)
    }

    fn atomic(&self, op: &mut AtomicOp<'_>) -> Result<()> {
        let _guard = self.writer.lock();

        let writes = {
            let mut txn = Transaction::new(self);
            op(&mut txn)?;
            txn.into_writes()
        };

        if writes.is_empty() {
            return Ok(());
        }

        let count = writes.len();
        let mut batch = WriteBatch::default();
        for ((table, key), value) in writes {
            let cf = self.cf(table)?;
            batch.put_cf(&cf, key, value);
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        tracing::debug!(writes = count, "Batch committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_commit_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = RocksStore::open_path(dir.path()).unwrap();
            store
                .atomic(&mut |txn| txn.put(Table::Accounts, b"p-1".to_vec(), &42u64))
                .unwrap();
        }

        let store = RocksStore::open_path(dir.path()).unwrap();
        let raw = store.get_raw(Table::Accounts, b"p-1").unwrap().unwrap();
        assert_eq!(bincode::deserialize::<u64>(&raw).unwrap(), 42);
    }

    #[test]
    fn test_failed_closure_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open_path(dir.path()).unwrap();

        let result = store.atomic(&mut |txn| {
            txn.put(Table::Deposits, b"d-1".to_vec(), &1u8)?;
            Err(Error::InvalidInput("abort".into()))
        });

        assert!(result.is_err());
        assert!(store.get_raw(Table::Deposits, b"d-1").unwrap().is_none());
    }

    #[test]
    fn test_scan_prefix_stops_at_prefix_end() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open_path(dir.path()).unwrap();
        store
            .atomic(&mut |txn| {
                txn.put(Table::Indices, b"a|1".to_vec(), &1u8)?;
                txn.put(Table::Indices, b"a|2".to_vec(), &2u8)?;
                txn.put(Table::Indices, b"b|1".to_vec(), &3u8)
            })
            .unwrap();

        let rows = store.scan_prefix(Table::Indices, b"a|").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].0, b"a|2".to_vec());
    }
}
