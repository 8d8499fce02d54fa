//! Token ledger
//!
//! Authoritative AT/HT balances per patient, hospital AT pools and global
//! supply. Every balance change happens inside a store transaction that
//! also updates [`SupplyTotals`] and writes a [`TokenTransaction`], so
//! conservation holds after every commit:
//!
//! ```text
//! sum(at_balance) + sum(pool.at_pool) == at_minted - at_burned
//! sum(ht_balance)                     == ht_minted - ht_burned
//! ```
//!
//! Minting is at-most-once per deposit through [`DepositMintRecord`].

use crate::audit::{self, ResourceKind, ResourceRef, Transition};
use crate::chain::{ChainAccount, ChainRequest};
use crate::events::LifecycleEvent;
use crate::permissions::{Permission, Scope};
use crate::platform::Context;
use crate::storage::{owned_key, owned_prefix, Table, Transaction};
use crate::types::{
    Actor, AllocationId, DepositId, HospitalId, PatientId, Processed, RedemptionId, TokenAmount,
    TokenKind, TradeId,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

const SUPPLY_KEY: &[u8] = b"supply";

/// Patient balances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAccount {
    /// Owner
    pub patient_id: PatientId,
    /// Asset Token balance (excludes AT allocated to pools)
    pub at_balance: TokenAmount,
    /// Health Token balance
    pub ht_balance: TokenAmount,
}

impl TokenAccount {
    fn empty(patient_id: PatientId) -> Self {
        Self {
            patient_id,
            at_balance: 0,
            ht_balance: 0,
        }
    }

    /// Balance of one token kind
    pub fn balance(&self, token: TokenKind) -> TokenAmount {
        match token {
            TokenKind::AT => self.at_balance,
            TokenKind::HT => self.ht_balance,
        }
    }

    fn balance_mut(&mut self, token: TokenKind) -> &mut TokenAmount {
        match token {
            TokenKind::AT => &mut self.at_balance,
            TokenKind::HT => &mut self.ht_balance,
        }
    }
}

/// At-most-once marker for a deposit mint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositMintRecord {
    /// Deposit minted against
    pub deposit_id: DepositId,
    /// Set in the same transaction as the credit
    pub processed: bool,
    /// AT credited
    pub amount_at: TokenAmount,
    /// Chain transaction hash
    pub chain_tx: String,
}

/// Hospital-scoped AT trading pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolAccount {
    /// Owning hospital
    pub hospital_id: HospitalId,
    /// AT currently pooled
    pub at_pool: TokenAmount,
    /// Pooled AT per contributing patient; sums to `at_pool`
    pub contributions: BTreeMap<PatientId, TokenAmount>,
}

impl PoolAccount {
    fn empty(hospital_id: HospitalId) -> Self {
        Self {
            hospital_id,
            at_pool: 0,
            contributions: BTreeMap::new(),
        }
    }
}

/// Direction of a pool move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolDirection {
    /// Patient account to pool
    Allocate,
    /// Pool to patient account
    Release,
}

/// Idempotency record of a pool move
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMove {
    /// Caller-chosen key
    pub allocation_id: AllocationId,
    /// Patient moving AT
    pub patient_id: PatientId,
    /// Pool owner
    pub hospital_id: HospitalId,
    /// Direction
    pub direction: PoolDirection,
    /// AT moved
    pub amount: TokenAmount,
    /// Chain transaction hash
    pub chain_tx: String,
    /// Commit time
    pub at: DateTime<Utc>,
}

/// Cumulative supply per token kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyTotals {
    /// AT ever minted
    pub at_minted: TokenAmount,
    /// AT ever burned
    pub at_burned: TokenAmount,
    /// HT ever minted
    pub ht_minted: TokenAmount,
    /// HT ever burned
    pub ht_burned: TokenAmount,
}

impl SupplyTotals {
    /// Tokens in circulation
    pub fn outstanding(&self, token: TokenKind) -> Option<TokenAmount> {
        match token {
            TokenKind::AT => self.at_minted.checked_sub(self.at_burned),
            TokenKind::HT => self.ht_minted.checked_sub(self.ht_burned),
        }
    }
}

/// Kind of balance change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnKind {
    /// New tokens credited
    Mint,
    /// Tokens destroyed
    Burn,
    /// Tokens received from a pool
    TransferIn,
    /// Tokens sent to a pool
    TransferOut,
}

/// One balance change on a patient account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransaction {
    /// Time-ordered id
    pub id: Uuid,
    /// Account changed
    pub account: PatientId,
    /// Change kind
    pub kind: TxnKind,
    /// Token changed
    pub token: TokenKind,
    /// Amount
    pub amount: TokenAmount,
    /// Originating record, e.g. `deposit:<id>`
    pub reference: String,
    /// Chain transaction hash
    pub chain_tx: Option<String>,
    /// Commit time
    pub at: DateTime<Utc>,
}

/// Result of a conservation check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConservationReport {
    /// Sum of patient AT balances
    pub at_in_accounts: TokenAmount,
    /// Sum of pooled AT
    pub at_in_pools: TokenAmount,
    /// Sum of patient HT balances
    pub ht_in_accounts: TokenAmount,
    /// Supply counters
    pub supply: SupplyTotals,
}

/// Originating record of a balance change
pub(crate) enum Reference {
    Deposit(DepositId),
    Trade(TradeId),
    Redemption(RedemptionId),
    Allocation(AllocationId),
}

impl Reference {
    fn render(&self) -> String {
        match self {
            Reference::Deposit(id) => format!("deposit:{}", id),
            Reference::Trade(id) => format!("trade:{}", id),
            Reference::Redemption(id) => format!("redemption:{}", id),
            Reference::Allocation(id) => format!("allocation:{}", id),
        }
    }
}

fn checked_add(a: TokenAmount, b: TokenAmount, what: &str) -> Result<TokenAmount> {
    a.checked_add(b)
        .ok_or_else(|| Error::InvariantViolation(format!("{} overflow", what)))
}

pub(crate) fn load_account(txn: &Transaction<'_>, patient: &PatientId) -> Result<TokenAccount> {
    Ok(txn
        .get(Table::Accounts, patient.as_str().as_bytes())?
        .unwrap_or_else(|| TokenAccount::empty(patient.clone())))
}

fn load_pool(txn: &Transaction<'_>, hospital: &HospitalId) -> Result<PoolAccount> {
    Ok(txn
        .get(Table::Pools, hospital.as_str().as_bytes())?
        .unwrap_or_else(|| PoolAccount::empty(hospital.clone())))
}

fn record_txn(
    txn: &mut Transaction<'_>,
    account: &PatientId,
    kind: TxnKind,
    token: TokenKind,
    amount: TokenAmount,
    reference: &Reference,
    chain_tx: &str,
) -> Result<()> {
    let entry = TokenTransaction {
        id: Uuid::now_v7(),
        account: account.clone(),
        kind,
        token,
        amount,
        reference: reference.render(),
        chain_tx: Some(chain_tx.to_string()),
        at: Utc::now(),
    };
    txn.put(
        Table::TokenTxns,
        owned_key(account.as_str(), entry.id.as_bytes()),
        &entry,
    )
}

/// Credit newly minted tokens to a patient inside `txn`
pub(crate) fn mint_in(
    txn: &mut Transaction<'_>,
    patient: &PatientId,
    token: TokenKind,
    amount: TokenAmount,
    reference: Reference,
    chain_tx: &str,
) -> Result<TokenAccount> {
    let mut account = load_account(txn, patient)?;
    let balance = account.balance_mut(token);
    *balance = checked_add(*balance, amount, "balance")?;

    let mut supply: SupplyTotals = txn.get(Table::Meta, SUPPLY_KEY)?.unwrap_or_default();
    match token {
        TokenKind::AT => supply.at_minted = checked_add(supply.at_minted, amount, "AT supply")?,
        TokenKind::HT => supply.ht_minted = checked_add(supply.ht_minted, amount, "HT supply")?,
    }

    txn.put(Table::Accounts, patient.as_str().as_bytes(), &account)?;
    txn.put(Table::Meta, SUPPLY_KEY, &supply)?;
    record_txn(txn, patient, TxnKind::Mint, token, amount, &reference, chain_tx)?;
    Ok(account)
}

/// Destroy tokens held by a patient inside `txn`
pub(crate) fn burn_in(
    txn: &mut Transaction<'_>,
    patient: &PatientId,
    token: TokenKind,
    amount: TokenAmount,
    reference: Reference,
    chain_tx: &str,
) -> Result<TokenAccount> {
    let mut account = load_account(txn, patient)?;
    let available = account.balance(token);
    let balance = account.balance_mut(token);
    *balance = available
        .checked_sub(amount)
        .ok_or(Error::InsufficientBalance {
            required: amount,
            available,
        })?;

    let mut supply: SupplyTotals = txn.get(Table::Meta, SUPPLY_KEY)?.unwrap_or_default();
    match token {
        TokenKind::AT => supply.at_burned = checked_add(supply.at_burned, amount, "AT supply")?,
        TokenKind::HT => supply.ht_burned = checked_add(supply.ht_burned, amount, "HT supply")?,
    }

    txn.put(Table::Accounts, patient.as_str().as_bytes(), &account)?;
    txn.put(Table::Meta, SUPPLY_KEY, &supply)?;
    record_txn(txn, patient, TxnKind::Burn, token, amount, &reference, chain_tx)?;
    Ok(account)
}

/// Load a pool inside `txn`
pub(crate) fn pool_in(txn: &Transaction<'_>, hospital: &HospitalId) -> Result<PoolAccount> {
    load_pool(txn, hospital)
}

/// Token ledger
#[derive(Clone)]
pub struct TokenLedger {
    ctx: Arc<Context>,
}

impl TokenLedger {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Mint AT for a deposit, at most once per deposit id
    ///
    /// `also` runs inside the committing transaction with the mint record,
    /// both when this call credits and when an earlier call already did.
    pub(crate) async fn mint_at_with<F>(
        &self,
        deposit_id: DepositId,
        patient: &PatientId,
        amount: TokenAmount,
        mut also: F,
    ) -> Result<Processed<DepositMintRecord>>
    where
        F: FnMut(&mut Transaction<'_>, &DepositMintRecord) -> Result<()>,
    {
        if amount == 0 {
            return Err(Error::InvalidInput("mint amount must be positive".to_string()));
        }

        let store = &self.ctx.store;
        let key = deposit_id.as_bytes();

        let existing: Option<DepositMintRecord> = store.load(Table::MintRecords, key)?;
        if let Some(record) = existing.filter(|r| r.processed) {
            // Credited earlier; only the caller's side effects may be missing
            store.transaction(|txn| also(txn, &record))?;
            tracing::info!(deposit_id = %deposit_id, amount = record.amount_at, "AT already minted");
            return Ok(Processed::AlreadyProcessed(record));
        }

        let chain_tx = self
            .ctx
            .submit(&ChainRequest::at_mint(deposit_id, patient, amount))
            .await?;

        let outcome = store.transaction(|txn| {
            let current: Option<DepositMintRecord> = txn.get(Table::MintRecords, key)?;
            if let Some(record) = current.filter(|r| r.processed) {
                also(txn, &record)?;
                return Ok(Processed::AlreadyProcessed(record));
            }

            mint_in(txn, patient, TokenKind::AT, amount, Reference::Deposit(deposit_id), &chain_tx)?;
            let record = DepositMintRecord {
                deposit_id,
                processed: true,
                amount_at: amount,
                chain_tx: chain_tx.clone(),
            };
            txn.put(Table::MintRecords, key.to_vec(), &record)?;
            also(txn, &record)?;
            Ok(Processed::Applied(record))
        })?;

        if outcome.is_applied() {
            self.ctx.metrics.record_mint(TokenKind::AT, amount);
            tracing::info!(
                deposit_id = %deposit_id,
                patient_id = %patient,
                amount,
                chain_tx = %chain_tx,
                "AT minted"
            );
        }
        Ok(outcome)
    }

    /// Mint record for a deposit
    pub fn mint_record(&self, deposit_id: DepositId) -> Result<Option<DepositMintRecord>> {
        self.ctx.store.load(Table::MintRecords, deposit_id.as_bytes())
    }

    /// Current balances; zero for unknown patients
    pub fn balance_of(&self, patient: &PatientId) -> Result<TokenAccount> {
        Ok(self
            .ctx
            .store
            .load(Table::Accounts, patient.as_str().as_bytes())?
            .unwrap_or_else(|| TokenAccount::empty(patient.clone())))
    }

    /// Move own AT into a hospital pool
    pub async fn allocate_to_pool(
        &self,
        actor: &Actor,
        allocation_id: AllocationId,
        hospital_id: &HospitalId,
        amount: TokenAmount,
    ) -> Result<Processed<PoolMove>> {
        self.move_pool(actor, allocation_id, hospital_id, amount, PoolDirection::Allocate)
            .await
    }

    /// Move own AT back out of a hospital pool
    pub async fn release_from_pool(
        &self,
        actor: &Actor,
        allocation_id: AllocationId,
        hospital_id: &HospitalId,
        amount: TokenAmount,
    ) -> Result<Processed<PoolMove>> {
        self.move_pool(actor, allocation_id, hospital_id, amount, PoolDirection::Release)
            .await
    }

    async fn move_pool(
        &self,
        actor: &Actor,
        allocation_id: AllocationId,
        hospital_id: &HospitalId,
        amount: TokenAmount,
        direction: PoolDirection,
    ) -> Result<Processed<PoolMove>> {
        let patient = PatientId::from(&actor.id);
        self.ctx
            .authorize(actor, Permission::AllocateAT, &Scope::patient(patient.clone()))?;

        if amount == 0 {
            return Err(Error::InvalidInput("pool move amount must be positive".to_string()));
        }

        let store = &self.ctx.store;
        let key = allocation_id.as_bytes();

        if let Some(existing) = store.load::<PoolMove>(Table::PoolMoves, key)? {
            return replayed_move(existing, &patient, hospital_id, amount, direction);
        }

        // Pre-check so an obviously short balance never reaches the chain
        let available = match direction {
            PoolDirection::Allocate => self.balance_of(&patient)?.at_balance,
            PoolDirection::Release => self
                .pool(hospital_id)?
                .contributions
                .get(&patient)
                .copied()
                .unwrap_or(0),
        };
        if available < amount {
            return Err(Error::InsufficientBalance {
                required: amount,
                available,
            });
        }

        let wallet = ChainAccount::Patient(patient.clone());
        let pool_account = ChainAccount::HospitalPool(hospital_id.clone());
        let request = match direction {
            PoolDirection::Allocate => ChainRequest::at_pool(allocation_id, wallet, pool_account, amount),
            PoolDirection::Release => ChainRequest::at_pool(allocation_id, pool_account, wallet, amount),
        };
        let chain_tx = self.ctx.submit(&request).await?;

        let outcome = store.transaction(|txn| {
            if let Some(existing) = txn.get::<PoolMove>(Table::PoolMoves, key)? {
                return replayed_move(existing, &patient, hospital_id, amount, direction);
            }

            let mut account = load_account(txn, &patient)?;
            let mut pool = load_pool(txn, hospital_id)?;
            let before = pool.at_pool;
            let contribution = pool.contributions.entry(patient.clone()).or_insert(0);
            let reference = Reference::Allocation(allocation_id);

            match direction {
                PoolDirection::Allocate => {
                    account.at_balance = account.at_balance.checked_sub(amount).ok_or(
                        Error::InsufficientBalance {
                            required: amount,
                            available: account.at_balance,
                        },
                    )?;
                    *contribution = checked_add(*contribution, amount, "pool contribution")?;
                    pool.at_pool = checked_add(pool.at_pool, amount, "pool")?;
                    record_txn(txn, &patient, TxnKind::TransferOut, TokenKind::AT, amount, &reference, &chain_tx)?;
                }
                PoolDirection::Release => {
                    *contribution = contribution.checked_sub(amount).ok_or(
                        Error::InsufficientBalance {
                            required: amount,
                            available: *contribution,
                        },
                    )?;
                    pool.at_pool = pool.at_pool.checked_sub(amount).ok_or_else(|| {
                        Error::InvariantViolation(format!("pool {} below contributions", hospital_id))
                    })?;
                    account.at_balance = checked_add(account.at_balance, amount, "balance")?;
                    record_txn(txn, &patient, TxnKind::TransferIn, TokenKind::AT, amount, &reference, &chain_tx)?;
                }
            }
            pool.contributions.retain(|_, held| *held > 0);

            let record = PoolMove {
                allocation_id,
                patient_id: patient.clone(),
                hospital_id: hospital_id.clone(),
                direction,
                amount,
                chain_tx: chain_tx.clone(),
                at: Utc::now(),
            };

            txn.put(Table::Accounts, patient.as_str().as_bytes(), &account)?;
            txn.put(Table::Pools, hospital_id.as_str().as_bytes(), &pool)?;
            txn.put(Table::PoolMoves, key.to_vec(), &record)?;
            audit::append(
                txn,
                actor,
                Transition {
                    action: match direction {
                        PoolDirection::Allocate => "pool.allocate",
                        PoolDirection::Release => "pool.release",
                    },
                    resource: ResourceRef::new(ResourceKind::Pool, hospital_id),
                    before: Some(&before.to_string()),
                    after: Some(&pool.at_pool.to_string()),
                },
            )?;
            Ok(Processed::Applied(record))
        })?;

        if let Processed::Applied(record) = &outcome {
            tracing::info!(
                allocation_id = %allocation_id,
                patient_id = %patient,
                hospital_id = %hospital_id,
                amount,
                direction = ?direction,
                "Pool updated"
            );
            let event = match direction {
                PoolDirection::Allocate => LifecycleEvent::PoolAllocated {
                    allocation_id,
                    patient_id: record.patient_id.clone(),
                    hospital_id: record.hospital_id.clone(),
                    amount,
                },
                PoolDirection::Release => LifecycleEvent::PoolReleased {
                    allocation_id,
                    patient_id: record.patient_id.clone(),
                    hospital_id: record.hospital_id.clone(),
                    amount,
                },
            };
            self.ctx.emit(event);
        }
        Ok(outcome)
    }

    /// Hospital pool; empty when nothing was allocated
    pub fn pool(&self, hospital_id: &HospitalId) -> Result<PoolAccount> {
        Ok(self
            .ctx
            .store
            .load(Table::Pools, hospital_id.as_str().as_bytes())?
            .unwrap_or_else(|| PoolAccount::empty(hospital_id.clone())))
    }

    /// Balance-change history of a patient, oldest first
    pub fn transactions(&self, patient: &PatientId) -> Result<Vec<TokenTransaction>> {
        self.ctx
            .store
            .scan(Table::TokenTxns, &owned_prefix(patient.as_str()))
    }

    /// Total ever minted to a patient
    pub fn total_minted(&self, patient: &PatientId, token: TokenKind) -> Result<TokenAmount> {
        self.transactions(patient)?
            .iter()
            .filter(|t| t.kind == TxnKind::Mint && t.token == token)
            .try_fold(0u64, |total, t| checked_add(total, t.amount, "minted total"))
    }

    /// Supply counters
    pub fn supply(&self) -> Result<SupplyTotals> {
        Ok(self.ctx.store.load(Table::Meta, SUPPLY_KEY)?.unwrap_or_default())
    }

    /// Compare the sum of all holdings with minted minus burned
    pub fn check_conservation(&self) -> Result<ConservationReport> {
        let store = &self.ctx.store;
        let accounts: Vec<TokenAccount> = store.scan(Table::Accounts, &[])?;
        let pools: Vec<PoolAccount> = store.scan(Table::Pools, &[])?;
        let supply = self.supply()?;

        let mut report = ConservationReport {
            at_in_accounts: 0,
            at_in_pools: 0,
            ht_in_accounts: 0,
            supply,
        };
        for account in &accounts {
            report.at_in_accounts = checked_add(report.at_in_accounts, account.at_balance, "AT sum")?;
            report.ht_in_accounts = checked_add(report.ht_in_accounts, account.ht_balance, "HT sum")?;
        }
        for pool in &pools {
            let contributed = pool
                .contributions
                .values()
                .try_fold(0u64, |total, held| checked_add(total, *held, "contributions"))?;
            if contributed != pool.at_pool {
                return Err(Error::InvariantViolation(format!(
                    "pool {} holds {} AT but contributions sum to {}",
                    pool.hospital_id, pool.at_pool, contributed
                )));
            }
            report.at_in_pools = checked_add(report.at_in_pools, pool.at_pool, "pool sum")?;
        }

        let at_held = checked_add(report.at_in_accounts, report.at_in_pools, "AT held")?;
        if supply.outstanding(TokenKind::AT) != Some(at_held) {
            return Err(Error::InvariantViolation(format!(
                "AT held {} but minted {} burned {}",
                at_held, supply.at_minted, supply.at_burned
            )));
        }
        if supply.outstanding(TokenKind::HT) != Some(report.ht_in_accounts) {
            return Err(Error::InvariantViolation(format!(
                "HT held {} but minted {} burned {}",
                report.ht_in_accounts, supply.ht_minted, supply.ht_burned
            )));
        }

        Ok(report)
    }
}

fn replayed_move(
    existing: PoolMove,
    patient: &PatientId,
    hospital_id: &HospitalId,
    amount: TokenAmount,
    direction: PoolDirection,
) -> Result<Processed<PoolMove>> {
    if &existing.patient_id != patient
        || &existing.hospital_id != hospital_id
        || existing.amount != amount
        || existing.direction != direction
    {
        return Err(Error::InvalidInput(format!(
            "allocation {} already used for a different move",
            existing.allocation_id
        )));
    }
    Ok(Processed::AlreadyProcessed(existing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::InMemoryChain;
    use crate::storage::MemoryStore;
    use crate::Config;

    fn ledger() -> (TokenLedger, Arc<InMemoryChain>) {
        let chain = Arc::new(InMemoryChain::new());
        let ctx = Context::for_tests(Arc::new(MemoryStore::new()), chain.clone());
        (TokenLedger::new(Arc::new(ctx)), chain)
    }

    async fn fund(ledger: &TokenLedger, patient: &str, amount: TokenAmount) -> DepositId {
        let deposit_id = DepositId::generate();
        ledger
            .mint_at_with(deposit_id, &PatientId::new(patient), amount, |_, _| Ok(()))
            .await
            .unwrap();
        deposit_id
    }

    #[tokio::test]
    async fn test_mint_is_at_most_once() {
        let (ledger, chain) = ledger();
        let patient = PatientId::new("p-1");
        let deposit_id = fund(&ledger, "p-1", 10_000).await;

        let replay = ledger
            .mint_at_with(deposit_id, &patient, 10_000, |_, _| Ok(()))
            .await
            .unwrap();

        assert!(!replay.is_applied());
        assert_eq!(replay.get().amount_at, 10_000);
        assert_eq!(ledger.balance_of(&patient).unwrap().at_balance, 10_000);
        assert_eq!(ledger.supply().unwrap().at_minted, 10_000);
        assert_eq!(chain.receipt_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_chain_call_leaves_state_unchanged() {
        let (ledger, chain) = ledger();
        chain.push_fault(crate::chain::Fault::Unavailable);
        let patient = PatientId::new("p-1");

        let err = ledger
            .mint_at_with(DepositId::generate(), &patient, 100, |_, _| Ok(()))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(ledger.balance_of(&patient).unwrap().at_balance, 0);
        assert_eq!(ledger.supply().unwrap(), SupplyTotals::default());
    }

    #[tokio::test]
    async fn test_burn_rejects_overdraw() {
        let (ledger, _) = ledger();
        let patient = PatientId::new("p-1");

        let err = ledger
            .ctx
            .store
            .transaction(|txn| {
                burn_in(txn, &patient, TokenKind::HT, 1, Reference::Redemption(RedemptionId::generate()), "0x")
            })
            .unwrap_err();

        assert!(matches!(
            err,
            Error::InsufficientBalance {
                required: 1,
                available: 0
            }
        ));
        assert!(ledger.transactions(&patient).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pool_allocate_and_release() {
        let (ledger, chain) = ledger();
        let patient = Actor::patient("p-1");
        let hospital = HospitalId::new("A");
        fund(&ledger, "p-1", 1_000).await;

        let allocation = AllocationId::generate();
        ledger.allocate_to_pool(&patient, allocation, &hospital, 600).await.unwrap();
        let replay = ledger.allocate_to_pool(&patient, allocation, &hospital, 600).await.unwrap();
        assert!(!replay.is_applied());

        let pool = ledger.pool(&hospital).unwrap();
        assert_eq!(pool.at_pool, 600);
        assert_eq!(pool.contributions.get(&PatientId::new("p-1")), Some(&600));
        assert_eq!(ledger.balance_of(&PatientId::new("p-1")).unwrap().at_balance, 400);
        assert_eq!(
            chain.balance(&ChainAccount::HospitalPool(hospital.clone()), TokenKind::AT),
            600
        );

        ledger
            .release_from_pool(&patient, AllocationId::generate(), &hospital, 600)
            .await
            .unwrap();
        assert_eq!(ledger.pool(&hospital).unwrap().at_pool, 0);
        assert!(ledger.pool(&hospital).unwrap().contributions.is_empty());
        assert_eq!(ledger.balance_of(&PatientId::new("p-1")).unwrap().at_balance, 1_000);

        let report = ledger.check_conservation().unwrap();
        assert_eq!(report.at_in_accounts, 1_000);
        assert_eq!(report.at_in_pools, 0);
    }

    #[tokio::test]
    async fn test_allocate_beyond_balance_never_reaches_chain() {
        let (ledger, chain) = ledger();
        fund(&ledger, "p-1", 100).await;
        let calls = chain.call_count();

        let err = ledger
            .allocate_to_pool(&Actor::patient("p-1"), AllocationId::generate(), &HospitalId::new("A"), 101)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InsufficientBalance { required: 101, available: 100 }));
        assert_eq!(chain.call_count(), calls);
    }

    #[tokio::test]
    async fn test_allocation_requires_own_account() {
        let (ledger, _) = ledger();
        let admin = Actor::hospital_admin("admin-a", HospitalId::new("A"));

        let err = ledger
            .allocate_to_pool(&admin, AllocationId::generate(), &HospitalId::new("A"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_history_and_totals() {
        let (ledger, _) = ledger();
        let patient = PatientId::new("p-1");
        fund(&ledger, "p-1", 300).await;
        fund(&ledger, "p-1", 200).await;

        let history = ledger.transactions(&patient).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|t| t.kind == TxnKind::Mint && t.token == TokenKind::AT));
        assert_eq!(ledger.total_minted(&patient, TokenKind::AT).unwrap(), 500);
        assert_eq!(ledger.total_minted(&patient, TokenKind::HT).unwrap(), 0);
        assert!(Config::default().validate().is_ok());
    }
}
