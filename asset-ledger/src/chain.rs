//! Ledger/chain collaborator
//!
//! The external source of truth for token balances. Every request carries
//! an idempotency key derived from the domain record that caused it, so a
//! call whose outcome was lost can be repeated without a second effect.
//!
//! Calls are made before the local commit: a failed or unknown outcome
//! leaves local state untouched and the caller retries with the same key.

use crate::audit::to_hex;
use crate::metrics::Metrics;
use crate::types::{
    AllocationId, DepositId, HospitalId, PatientId, RedemptionId, TokenAmount, TokenKind, TradeId,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

/// Balance holder on the chain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainAccount {
    /// Patient wallet
    Patient(PatientId),
    /// Hospital trading pool
    HospitalPool(HospitalId),
}

impl fmt::Display for ChainAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainAccount::Patient(id) => write!(f, "patient:{}", id),
            ChainAccount::HospitalPool(id) => write!(f, "pool:{}", id),
        }
    }
}

/// Balance-affecting operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainOp {
    /// Create tokens
    Mint {
        /// Token
        token: TokenKind,
        /// Credited account
        to: ChainAccount,
        /// Amount
        amount: TokenAmount,
    },
    /// Destroy tokens
    Burn {
        /// Token
        token: TokenKind,
        /// Debited account
        from: ChainAccount,
        /// Amount
        amount: TokenAmount,
    },
    /// Move tokens
    Transfer {
        /// Token
        token: TokenKind,
        /// Debited account
        from: ChainAccount,
        /// Credited account
        to: ChainAccount,
        /// Amount
        amount: TokenAmount,
    },
}

/// Idempotent chain request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRequest {
    /// Replays with the same key return the original outcome
    pub idempotency_key: String,
    /// Operation
    pub op: ChainOp,
}

impl ChainRequest {
    /// AT mint for a deposit
    pub fn at_mint(deposit_id: DepositId, patient_id: &PatientId, amount: TokenAmount) -> Self {
        Self {
            idempotency_key: format!("at-mint:{}", deposit_id),
            op: ChainOp::Mint {
                token: TokenKind::AT,
                to: ChainAccount::Patient(patient_id.clone()),
                amount,
            },
        }
    }

    /// HT mint for one recipient of a trade
    pub fn ht_mint(trade_id: TradeId, patient_id: &PatientId, amount: TokenAmount) -> Self {
        Self {
            idempotency_key: format!("ht-mint:{}:{}", trade_id, patient_id),
            op: ChainOp::Mint {
                token: TokenKind::HT,
                to: ChainAccount::Patient(patient_id.clone()),
                amount,
            },
        }
    }

    /// HT burn for a redemption
    pub fn ht_burn(redemption_id: RedemptionId, patient_id: &PatientId, amount: TokenAmount) -> Self {
        Self {
            idempotency_key: format!("ht-burn:{}", redemption_id),
            op: ChainOp::Burn {
                token: TokenKind::HT,
                from: ChainAccount::Patient(patient_id.clone()),
                amount,
            },
        }
    }

    /// AT move between a patient and a hospital pool
    pub fn at_pool(
        allocation_id: AllocationId,
        from: ChainAccount,
        to: ChainAccount,
        amount: TokenAmount,
    ) -> Self {
        Self {
            idempotency_key: format!("at-pool:{}", allocation_id),
            op: ChainOp::Transfer {
                token: TokenKind::AT,
                from,
                to,
                amount,
            },
        }
    }
}

/// Outcome reported by the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainOutcome {
    /// Applied
    Confirmed {
        /// Transaction hash
        tx_hash: String,
    },
    /// Deterministically refused
    Reverted {
        /// Reason
        reason: String,
    },
    /// Submitted but no receipt; may or may not have applied
    Unknown,
}

/// Chain collaborator
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Submit a request and report its outcome
    async fn submit(&self, request: &ChainRequest) -> Result<ChainOutcome>;
}

/// Submit with a deadline; returns the transaction hash on confirmation
///
/// Timeouts, transport errors and `Unknown` outcomes become
/// `ExternalCallFailed`; a revert becomes `Reverted`.
pub async fn submit_bounded(
    client: &dyn ChainClient,
    request: &ChainRequest,
    timeout: Duration,
    metrics: &Metrics,
) -> Result<String> {
    let start = Instant::now();
    let result = tokio::time::timeout(timeout, client.submit(request)).await;
    let elapsed = start.elapsed().as_secs_f64();

    let outcome = match result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => {
            metrics.record_chain_call(elapsed, true);
            tracing::warn!(key = %request.idempotency_key, error = %err, "Chain call failed");
            return Err(match err {
                Error::ExternalCallFailed(_) | Error::Reverted(_) => err,
                other => Error::ExternalCallFailed(other.to_string()),
            });
        }
        Err(_) => {
            metrics.record_chain_call(elapsed, true);
            tracing::warn!(
                key = %request.idempotency_key,
                timeout_ms = timeout.as_millis() as u64,
                "Chain call timed out"
            );
            return Err(Error::ExternalCallFailed(format!(
                "chain call {} timed out after {:?}",
                request.idempotency_key, timeout
            )));
        }
    };

    match outcome {
        ChainOutcome::Confirmed { tx_hash } => {
            metrics.record_chain_call(elapsed, false);
            tracing::debug!(key = %request.idempotency_key, tx_hash = %tx_hash, "Chain call confirmed");
            Ok(tx_hash)
        }
        ChainOutcome::Reverted { reason } => {
            metrics.record_chain_call(elapsed, false);
            tracing::warn!(key = %request.idempotency_key, reason = %reason, "Chain call reverted");
            Err(Error::Reverted(reason))
        }
        ChainOutcome::Unknown => {
            metrics.record_chain_call(elapsed, true);
            tracing::warn!(key = %request.idempotency_key, "Chain call outcome unknown");
            Err(Error::ExternalCallFailed(format!(
                "chain call {} outcome unknown",
                request.idempotency_key
            )))
        }
    }
}

/// Scripted failure for the next call to [`InMemoryChain`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Transport error; nothing applied
    Unavailable,
    /// Applied, but the receipt is lost (`Unknown`)
    LostReceipt,
    /// Refused with a reason; nothing applied
    Revert(String),
    /// Sleep before handling the call
    Stall(Duration),
}

#[derive(Default)]
struct ChainState {
    balances: HashMap<(ChainAccount, TokenKind), TokenAmount>,
    receipts: HashMap<String, ChainOutcome>,
    faults: VecDeque<Fault>,
    calls: usize,
}

impl ChainState {
    fn balance(&self, account: &ChainAccount, token: TokenKind) -> TokenAmount {
        self.balances
            .get(&(account.clone(), token))
            .copied()
            .unwrap_or(0)
    }

    fn apply(&mut self, request: &ChainRequest) -> ChainOutcome {
        if let Some(receipt) = self.receipts.get(&request.idempotency_key) {
            return receipt.clone();
        }

        let outcome = match self.execute(&request.op) {
            Ok(()) => ChainOutcome::Confirmed {
                tx_hash: to_hex(&Sha256::digest(request.idempotency_key.as_bytes())),
            },
            Err(reason) => ChainOutcome::Reverted { reason },
        };
        self.receipts
            .insert(request.idempotency_key.clone(), outcome.clone());
        outcome
    }

    fn execute(&mut self, op: &ChainOp) -> std::result::Result<(), String> {
        match op {
            ChainOp::Mint { token, to, amount } => {
                let next = self
                    .balance(to, *token)
                    .checked_add(*amount)
                    .ok_or_else(|| format!("{} balance overflow for {}", token, to))?;
                self.balances.insert((to.clone(), *token), next);
            }
            ChainOp::Burn { token, from, amount } => {
                let held = self.balance(from, *token);
                let next = held.checked_sub(*amount).ok_or_else(|| {
                    format!("burn {} {} exceeds balance {} of {}", amount, token, held, from)
                })?;
                self.balances.insert((from.clone(), *token), next);
            }
            ChainOp::Transfer {
                token,
                from,
                to,
                amount,
            } => {
                let held = self.balance(from, *token);
                let debited = held.checked_sub(*amount).ok_or_else(|| {
                    format!("transfer {} {} exceeds balance {} of {}", amount, token, held, from)
                })?;
                self.balances.insert((from.clone(), *token), debited);
                let credited = self
                    .balance(to, *token)
                    .checked_add(*amount)
                    .ok_or_else(|| format!("{} balance overflow for {}", token, to))?;
                self.balances.insert((to.clone(), *token), credited);
            }
        }
        Ok(())
    }
}

/// Reference chain client held in memory
///
/// Keeps balances, deduplicates by idempotency key and reverts burns and
/// transfers that exceed the balance. Faults queued with
/// [`InMemoryChain::push_fault`] are consumed one per call.
#[derive(Default)]
pub struct InMemoryChain {
    state: Mutex<ChainState>,
}

impl InMemoryChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fault for a future call
    pub fn push_fault(&self, fault: Fault) {
        self.state.lock().faults.push_back(fault);
    }

    /// Chain-side balance
    pub fn balance(&self, account: &ChainAccount, token: TokenKind) -> TokenAmount {
        self.state.lock().balance(account, token)
    }

    /// Calls received, including faulted ones
    pub fn call_count(&self) -> usize {
        self.state.lock().calls
    }

    /// Distinct idempotency keys processed
    pub fn receipt_count(&self) -> usize {
        self.state.lock().receipts.len()
    }
}

#[async_trait]
impl ChainClient for InMemoryChain {
    async fn submit(&self, request: &ChainRequest) -> Result<ChainOutcome> {
        let fault = {
            let mut state = self.state.lock();
            state.calls += 1;
            state.faults.pop_front()
        };

        match fault {
            Some(Fault::Unavailable) => {
                return Err(Error::ExternalCallFailed("chain unavailable".to_string()))
            }
            Some(Fault::Revert(reason)) => return Ok(ChainOutcome::Reverted { reason }),
            Some(Fault::Stall(delay)) => tokio::time::sleep(delay).await,
            Some(Fault::LostReceipt) => {
                self.state.lock().apply(request);
                return Ok(ChainOutcome::Unknown);
            }
            None => {}
        }

        Ok(self.state.lock().apply(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patient(id: &str) -> ChainAccount {
        ChainAccount::Patient(PatientId::new(id))
    }

    fn metrics() -> Metrics {
        Metrics::new().unwrap()
    }

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_replay_returns_original_receipt() {
        let chain = InMemoryChain::new();
        let request = ChainRequest::at_mint(DepositId::generate(), &PatientId::new("p-1"), 500);

        let first = submit_bounded(&chain, &request, TIMEOUT, &metrics()).await.unwrap();
        let second = submit_bounded(&chain, &request, TIMEOUT, &metrics()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(chain.balance(&patient("p-1"), TokenKind::AT), 500);
        assert_eq!(chain.receipt_count(), 1);
    }

    #[tokio::test]
    async fn test_burn_beyond_balance_reverts() {
        let chain = InMemoryChain::new();
        let request = ChainRequest::ht_burn(RedemptionId::generate(), &PatientId::new("p-1"), 150);

        let err = submit_bounded(&chain, &request, TIMEOUT, &metrics()).await.unwrap_err();
        assert!(matches!(err, Error::Reverted(_)));
        assert_eq!(chain.balance(&patient("p-1"), TokenKind::HT), 0);
    }

    #[tokio::test]
    async fn test_lost_receipt_applies_once() {
        let chain = InMemoryChain::new();
        chain.push_fault(Fault::LostReceipt);
        let request = ChainRequest::ht_mint(TradeId::generate(), &PatientId::new("p-1"), 60);

        let err = submit_bounded(&chain, &request, TIMEOUT, &metrics()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(chain.balance(&patient("p-1"), TokenKind::HT), 60);

        submit_bounded(&chain, &request, TIMEOUT, &metrics()).await.unwrap();
        assert_eq!(chain.balance(&patient("p-1"), TokenKind::HT), 60);
    }

    #[tokio::test]
    async fn test_stall_times_out_without_effect() {
        let chain = InMemoryChain::new();
        chain.push_fault(Fault::Stall(Duration::from_secs(5)));
        let request = ChainRequest::at_mint(DepositId::generate(), &PatientId::new("p-1"), 10);
        let metrics = metrics();

        let err = submit_bounded(&chain, &request, Duration::from_millis(20), &metrics)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExternalCallFailed(_)));
        assert_eq!(chain.balance(&patient("p-1"), TokenKind::AT), 0);
        assert_eq!(metrics.chain_failures.get(), 1);
    }

    #[tokio::test]
    async fn test_transfer_moves_balance() {
        let chain = InMemoryChain::new();
        let owner = PatientId::new("p-1");
        submit_bounded(
            &chain,
            &ChainRequest::at_mint(DepositId::generate(), &owner, 100),
            TIMEOUT,
            &metrics(),
        )
        .await
        .unwrap();

        let pool = ChainAccount::HospitalPool(HospitalId::new("A"));
        let request = ChainRequest::at_pool(AllocationId::generate(), patient("p-1"), pool.clone(), 40);
        submit_bounded(&chain, &request, TIMEOUT, &metrics()).await.unwrap();

        assert_eq!(chain.balance(&patient("p-1"), TokenKind::AT), 60);
        assert_eq!(chain.balance(&pool, TokenKind::AT), 40);
    }
}
