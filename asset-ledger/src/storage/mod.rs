//! Persistence boundary
//!
//! # Tables
//!
//! - `deposits` - Deposit records (key: deposit_id)
//! - `accounts` - Patient token accounts (key: patient_id)
//! - `mint_records` - AT mint idempotency records (key: deposit_id)
//! - `pools` - Hospital AT pools (key: hospital_id)
//! - `pool_moves` - Pool allocation idempotency records (key: allocation_id)
//! - `trades` - Trades (key: trade_id)
//! - `distributions` - Profit distributions (key: trade_id)
//! - `redemptions` - Benefit redemptions (key: redemption_id)
//! - `token_txns` - Balance-change history (key: len(patient_id) || patient_id || txn_id)
//! - `indices` - Secondary indices (key: kind || '|' || len(owner) || owner || id)
//! - `audit` - Hash-chained audit log (key: seq, big-endian)
//! - `meta` - Singletons: supply totals, audit head
//!
//! Every mutation goes through [`Store::atomic`]: the closure reads and
//! stages writes on a [`Transaction`], and the store commits the write set
//! as one unit only when the closure returns `Ok`.

pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;

pub use memory::MemoryStore;
#[cfg(feature = "rocksdb")]
pub use rocks::RocksStore;

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;

/// Logical tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    /// Deposits
    Deposits,
    /// Patient token accounts
    Accounts,
    /// AT mint records
    MintRecords,
    /// Hospital AT pools
    Pools,
    /// Pool allocation records
    PoolMoves,
    /// Trades
    Trades,
    /// Profit distributions
    Distributions,
    /// Benefit redemptions
    Redemptions,
    /// Token transaction history
    TokenTxns,
    /// Secondary indices
    Indices,
    /// Audit log
    Audit,
    /// Singletons
    Meta,
}

impl Table {
    /// All tables
    pub const ALL: [Table; 12] = [
        Table::Deposits,
        Table::Accounts,
        Table::MintRecords,
        Table::Pools,
        Table::PoolMoves,
        Table::Trades,
        Table::Distributions,
        Table::Redemptions,
        Table::TokenTxns,
        Table::Indices,
        Table::Audit,
        Table::Meta,
    ];

    /// Table (column family) name
    pub fn name(&self) -> &'static str {
        match self {
            Table::Deposits => "deposits",
            Table::Accounts => "accounts",
            Table::MintRecords => "mint_records",
            Table::Pools => "pools",
            Table::PoolMoves => "pool_moves",
            Table::Trades => "trades",
            Table::Distributions => "distributions",
            Table::Redemptions => "redemptions",
            Table::TokenTxns => "token_txns",
            Table::Indices => "indices",
            Table::Audit => "audit",
            Table::Meta => "meta",
        }
    }
}

/// Read access to committed state
pub trait StoreRead {
    /// Point lookup
    fn get_raw(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// Read-modify-write closure run by [`Store::atomic`]
pub type AtomicOp<'a> = dyn FnMut(&mut Transaction<'_>) -> Result<()> + 'a;

/// Durable storage with serializable read-modify-write transactions
pub trait Store: StoreRead + Send + Sync {
    /// Ordered scan of all keys starting with `prefix`
    fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Run `op` and commit its writes atomically; nothing is written on error
    fn atomic(&self, op: &mut AtomicOp<'_>) -> Result<()>;
}

impl<'s> dyn Store + 's {
    /// Typed point lookup
    pub fn load<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> Result<Option<T>> {
        match self.get_raw(table, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Typed prefix scan
    pub fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &[u8]) -> Result<Vec<T>> {
        self.scan_prefix(table, prefix)?
            .into_iter()
            .map(|(_, value)| Ok(bincode::deserialize(&value)?))
            .collect()
    }

    /// Run a transaction that produces a value
    pub fn transaction<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<T>,
    {
        let mut output = None;
        self.atomic(&mut |txn| {
            output = Some(f(txn)?);
            Ok(())
        })?;
        output.ok_or_else(|| Error::InvariantViolation("transaction produced no output".into()))
    }
}

/// Staged read-modify-write over committed state
///
/// Reads see the transaction's own pending writes first.
pub struct Transaction<'a> {
    reader: &'a dyn StoreRead,
    writes: BTreeMap<(Table, Vec<u8>), Vec<u8>>,
}

impl<'a> Transaction<'a> {
    /// Start a transaction over `reader`
    pub fn new(reader: &'a dyn StoreRead) -> Self {
        Self {
            reader,
            writes: BTreeMap::new(),
        }
    }

    /// Raw point lookup
    pub fn get_raw(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.writes.get(&(table, key.to_vec())) {
            return Ok(Some(value.clone()));
        }
        self.reader.get_raw(table, key)
    }

    /// Typed point lookup
    pub fn get<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> Result<Option<T>> {
        match self.get_raw(table, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Typed point lookup that must succeed
    pub fn require<T: DeserializeOwned>(
        &self,
        table: Table,
        key: &[u8],
        kind: &'static str,
        id: impl ToString,
    ) -> Result<T> {
        self.get(table, key)?.ok_or_else(|| Error::not_found(kind, id))
    }

    /// Stage a typed write
    pub fn put<T: Serialize>(&mut self, table: Table, key: impl Into<Vec<u8>>, value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.writes.insert((table, key.into()), bytes);
        Ok(())
    }

    /// Number of staged writes
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Consume into the write set
    pub fn into_writes(self) -> BTreeMap<(Table, Vec<u8>), Vec<u8>> {
        self.writes
    }
}

/// Key for an index entry: `kind || '|' || len(owner) || owner || id`
pub fn index_key(kind: &str, owner: &str, id: &[u8]) -> Vec<u8> {
    let mut key = index_prefix(kind, owner);
    key.extend_from_slice(id);
    key
}

/// Prefix selecting every index entry of `kind` for `owner`
pub fn index_prefix(kind: &str, owner: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(kind.len() + owner.len() + 5);
    key.extend_from_slice(kind.as_bytes());
    key.push(b'|');
    push_owner(&mut key, owner);
    key
}

/// Key under an owner-prefixed table: `len(owner) || owner || id`
pub fn owned_key(owner: &str, id: &[u8]) -> Vec<u8> {
    let mut key = owned_prefix(owner);
    key.extend_from_slice(id);
    key
}

/// Prefix selecting every key of `owner`
pub fn owned_prefix(owner: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(owner.len() + 4);
    push_owner(&mut key, owner);
    key
}

// Length-prefixed so no owner's prefix is a prefix of another's, whatever
// bytes the id contains
fn push_owner(key: &mut Vec<u8>, owner: &str) {
    key.extend_from_slice(&(owner.len() as u32).to_be_bytes());
    key.extend_from_slice(owner.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_keys_do_not_collide_on_prefix() {
        // "p-1" must not select entries of "p-10"
        let prefix = index_prefix("deposit", "p-1");
        let other = index_key("deposit", "p-10", &[1, 2, 3]);
        assert!(!other.starts_with(&prefix));
        assert!(index_key("deposit", "p-1", &[9]).starts_with(&prefix));
    }

    #[test]
    fn test_owner_with_nul_byte_keeps_its_own_keys() {
        let id = [7u8; 16];

        let prefix = index_prefix("deposit_p", "p");
        assert!(!index_key("deposit_p", "p\0x", &id).starts_with(&prefix));
        assert!(!index_key("deposit_p", "p\0", &id).starts_with(&prefix));
        assert!(index_key("deposit_p", "p", &id).starts_with(&prefix));

        let prefix = owned_prefix("p");
        assert!(!owned_key("p\0x", &id).starts_with(&prefix));
        assert!(owned_key("p", &id).starts_with(&prefix));
    }

    #[test]
    fn test_nul_owner_scan_stays_separate() {
        let store = MemoryStore::new();
        let store: &dyn Store = &store;
        store
            .transaction(|txn| {
                txn.put(Table::Indices, index_key("deposit_p", "p", &[1]), &1u64)?;
                txn.put(Table::Indices, index_key("deposit_p", "p\0\0", &[2]), &2u64)
            })
            .unwrap();

        let plain: Vec<u64> = store.scan(Table::Indices, &index_prefix("deposit_p", "p")).unwrap();
        let nul: Vec<u64> = store.scan(Table::Indices, &index_prefix("deposit_p", "p\0\0")).unwrap();
        assert_eq!(plain, vec![1]);
        assert_eq!(nul, vec![2]);
    }

    #[test]
    fn test_table_names_unique() {
        let names: std::collections::HashSet<_> = Table::ALL.iter().map(|t| t.name()).collect();
        assert_eq!(names.len(), Table::ALL.len());
    }
}
