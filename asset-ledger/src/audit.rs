//! Tamper-evident audit trail
//!
//! Every state transition appends one [`AuditEntry`] inside the same store
//! transaction as the transition itself. Entries are numbered from zero
//! and each one commits to its predecessor's SHA-256 hash, so a rewritten
//! or deleted entry breaks [`verify_chain`].

use crate::storage::{index_key, index_prefix, Store, Table, Transaction};
use crate::types::{Actor, ActorId, Role};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const HEAD_KEY: &[u8] = b"audit_head";
const INDEX_KIND: &str = "audit";

/// Kind of audited resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Physical-asset deposit
    Deposit,
    /// Hospital trading pool
    Pool,
    /// Trade and its distribution
    Trade,
    /// Benefit redemption
    Redemption,
}

impl ResourceKind {
    fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Deposit => "deposit",
            ResourceKind::Pool => "pool",
            ResourceKind::Trade => "trade",
            ResourceKind::Redemption => "redemption",
        }
    }
}

/// Audited resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Resource kind
    pub kind: ResourceKind,
    /// Resource id
    pub id: String,
}

impl ResourceRef {
    /// Build a reference
    pub fn new(kind: ResourceKind, id: impl ToString) -> Self {
        Self {
            kind,
            id: id.to_string(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// One recorded transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the log, from zero
    pub seq: u64,
    /// Acting user
    pub actor: ActorId,
    /// Acting role
    pub role: Role,
    /// Action name, e.g. `deposit.approve`
    pub action: String,
    /// Resource transitioned
    pub resource: ResourceRef,
    /// Status before the transition
    pub before: Option<String>,
    /// Status after the transition
    pub after: Option<String>,
    /// Wall-clock time of the transition
    pub at: DateTime<Utc>,
    /// Hash of the previous entry (zeros for the first)
    pub prev_hash: [u8; 32],
    /// Hash of this entry
    pub hash: [u8; 32],
}

impl AuditEntry {
    /// Compute the entry hash over every field but `hash`
    pub fn compute_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.seq.to_be_bytes());
        hash_str(&mut hasher, self.actor.as_str());
        hash_str(&mut hasher, self.role.as_str());
        hash_str(&mut hasher, &self.action);
        hash_str(&mut hasher, &self.resource.to_string());
        hash_opt(&mut hasher, self.before.as_deref());
        hash_opt(&mut hasher, self.after.as_deref());
        hasher.update(self.at.timestamp_nanos_opt().unwrap_or(0).to_be_bytes());
        hasher.update(self.prev_hash);
        hasher.finalize().into()
    }
}

// Length-prefixed so adjacent fields cannot be shifted into each other
fn hash_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}

fn hash_opt(hasher: &mut Sha256, value: Option<&str>) {
    match value {
        Some(value) => {
            hasher.update([1u8]);
            hash_str(hasher, value);
        }
        None => hasher.update([0u8]),
    }
}

/// Position of the next entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditHead {
    /// Sequence number the next entry receives
    pub next_seq: u64,
    /// Hash of the last entry
    pub last_hash: [u8; 32],
}

/// A transition to record
#[derive(Debug, Clone)]
pub struct Transition<'a> {
    /// Action name
    pub action: &'a str,
    /// Resource transitioned
    pub resource: ResourceRef,
    /// Status before
    pub before: Option<&'a str>,
    /// Status after
    pub after: Option<&'a str>,
}

/// Append an entry inside `txn`
pub fn append(txn: &mut Transaction<'_>, actor: &Actor, transition: Transition<'_>) -> Result<AuditEntry> {
    let head: AuditHead = txn.get(Table::Meta, HEAD_KEY)?.unwrap_or_default();

    let mut entry = AuditEntry {
        seq: head.next_seq,
        actor: actor.id.clone(),
        role: actor.role,
        action: transition.action.to_string(),
        resource: transition.resource,
        before: transition.before.map(str::to_string),
        after: transition.after.map(str::to_string),
        at: Utc::now(),
        prev_hash: head.last_hash,
        hash: [0u8; 32],
    };
    entry.hash = entry.compute_hash();

    let seq_key = entry.seq.to_be_bytes();
    txn.put(Table::Audit, seq_key.to_vec(), &entry)?;
    txn.put(
        Table::Indices,
        index_key(INDEX_KIND, &entry.resource.to_string(), &seq_key),
        &entry.seq,
    )?;
    txn.put(
        Table::Meta,
        HEAD_KEY.to_vec(),
        &AuditHead {
            next_seq: entry.seq + 1,
            last_hash: entry.hash,
        },
    )?;

    Ok(entry)
}

/// Entries recorded for one resource, oldest first
pub fn trail(store: &dyn Store, resource: &ResourceRef) -> Result<Vec<AuditEntry>> {
    let seqs: Vec<u64> = store.scan(Table::Indices, &index_prefix(INDEX_KIND, &resource.to_string()))?;
    seqs.into_iter()
        .map(|seq| {
            store
                .load(Table::Audit, &seq.to_be_bytes())?
                .ok_or_else(|| Error::InvariantViolation(format!("audit entry {} missing", seq)))
        })
        .collect()
}

/// Summary of a verified chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    /// Number of entries verified
    pub entries: u64,
    /// Hex hash of the last entry
    pub head_hash: String,
}

/// Recompute every hash and link; any mismatch is an `InvariantViolation`
pub fn verify_chain(store: &dyn Store) -> Result<AuditReport> {
    let entries: Vec<AuditEntry> = store.scan(Table::Audit, &[])?;
    let head: AuditHead = store.load(Table::Meta, HEAD_KEY)?.unwrap_or_default();

    let mut prev_hash = [0u8; 32];
    for (expected_seq, entry) in (0u64..).zip(entries.iter()) {
        if entry.seq != expected_seq {
            return Err(Error::InvariantViolation(format!(
                "audit gap: expected seq {}, found {}",
                expected_seq, entry.seq
            )));
        }
        if entry.prev_hash != prev_hash {
            return Err(Error::InvariantViolation(format!(
                "audit entry {} does not link to its predecessor",
                entry.seq
            )));
        }
        if entry.compute_hash() != entry.hash {
            return Err(Error::InvariantViolation(format!(
                "audit entry {} hash mismatch",
                entry.seq
            )));
        }
        prev_hash = entry.hash;
    }

    let count = entries.len() as u64;
    if head.next_seq != count || head.last_hash != prev_hash {
        return Err(Error::InvariantViolation(format!(
            "audit head at {} but log holds {} entries",
            head.next_seq, count
        )));
    }

    Ok(AuditReport {
        entries: count,
        head_hash: to_hex(&prev_hash),
    })
}

/// Lowercase hex encoding
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::HospitalId;
    use std::sync::Arc;

    fn record(store: &dyn Store, actor: &Actor, id: &str, before: Option<&str>, after: &str) {
        store
            .transaction(|txn| {
                append(
                    txn,
                    actor,
                    Transition {
                        action: "deposit.approve",
                        resource: ResourceRef::new(ResourceKind::Deposit, id),
                        before,
                        after: Some(after),
                    },
                )
            })
            .unwrap();
    }

    #[test]
    fn test_chain_links_and_verifies() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let admin = Actor::hospital_admin("admin-a", HospitalId::new("A"));

        record(&*store, &admin, "d-1", Some("pending"), "approved");
        record(&*store, &admin, "d-2", Some("pending"), "rejected");
        record(&*store, &admin, "d-1", Some("approved"), "tokens_minted");

        let report = verify_chain(&*store).unwrap();
        assert_eq!(report.entries, 3);
        assert_eq!(report.head_hash.len(), 64);

        let trail = trail(&*store, &ResourceRef::new(ResourceKind::Deposit, "d-1")).unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[1].after.as_deref(), Some("tokens_minted"));
        assert_eq!(trail[1].prev_hash, {
            let all: Vec<AuditEntry> = store.scan(Table::Audit, &[]).unwrap();
            all[1].hash
        });
    }

    #[test]
    fn test_tampered_entry_is_detected() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let admin = Actor::hospital_admin("admin-a", HospitalId::new("A"));
        record(&*store, &admin, "d-1", Some("pending"), "approved");
        record(&*store, &admin, "d-1", Some("approved"), "tokens_minted");

        store
            .atomic(&mut |txn| {
                let mut entry: AuditEntry = txn.require(Table::Audit, &0u64.to_be_bytes(), "AuditEntry", 0)?;
                entry.after = Some("rejected".to_string());
                txn.put(Table::Audit, 0u64.to_be_bytes().to_vec(), &entry)
            })
            .unwrap();

        assert!(matches!(verify_chain(&*store), Err(Error::InvariantViolation(_))));
    }

    #[test]
    fn test_empty_chain_verifies() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        assert_eq!(verify_chain(&*store).unwrap().entries, 0);
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x00, 0xab, 0x10]), "00ab10");
    }
}
