//! Benefit redemption
//!
//! ```text
//! Pending -> Approved -> Completed
//!        \           \-> Rejected
//!         \-> Rejected
//! ```
//!
//! The redemption row is written before anything else, so every attempt
//! is auditable. `Approved` means the HT burn has been sent to the chain;
//! HT is only debited locally once the burn is confirmed.

use crate::audit::{self, ResourceKind, ResourceRef, Transition};
use crate::chain::ChainRequest;
use crate::config::BenefitConfig;
use crate::events::LifecycleEvent;
use crate::ledger::{self, Reference, TokenLedger};
use crate::permissions::{Permission, Scope};
use crate::platform::Context;
use crate::storage::{index_key, index_prefix, Table};
use crate::types::{
    Actor, BenefitId, PatientId, Processed, RedemptionId, TokenAmount, TokenKind,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const BY_PATIENT: &str = "redemption_p";

/// Redemption status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedemptionStatus {
    /// Recorded, not yet checked
    Pending,
    /// Eligible; burn sent to the chain
    Approved,
    /// HT burned (terminal)
    Completed,
    /// Refused (terminal)
    Rejected,
}

impl RedemptionStatus {
    /// Stable name
    pub fn as_str(&self) -> &'static str {
        match self {
            RedemptionStatus::Pending => "pending",
            RedemptionStatus::Approved => "approved",
            RedemptionStatus::Completed => "completed",
            RedemptionStatus::Rejected => "rejected",
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, RedemptionStatus::Completed | RedemptionStatus::Rejected)
    }
}

impl fmt::Display for RedemptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HT spent on a benefit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenefitRedemption {
    /// Redemption id, also the burn idempotency key
    pub id: RedemptionId,
    /// Redeeming patient
    pub patient_id: PatientId,
    /// Benefit redeemed
    pub benefit_id: BenefitId,
    /// HT cost
    pub token_spent: TokenAmount,
    /// Creation time
    pub created_at: DateTime<Utc>,
    status: RedemptionStatus,
    reason: Option<String>,
    tx_hash: Option<String>,
}

impl BenefitRedemption {
    /// Current status
    pub fn status(&self) -> RedemptionStatus {
        self.status
    }

    /// Rejection reason
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Burn transaction hash, once completed
    pub fn tx_hash(&self) -> Option<&str> {
        self.tx_hash.as_deref()
    }

    fn move_to(&mut self, from: RedemptionStatus, to: RedemptionStatus) -> Result<()> {
        if self.status != from {
            return Err(Error::InvalidTransition(format!(
                "redemption {} is {}, expected {}",
                self.id, self.status, from
            )));
        }
        self.status = to;
        Ok(())
    }

    fn approve(&mut self) -> Result<()> {
        self.move_to(RedemptionStatus::Pending, RedemptionStatus::Approved)
    }

    fn complete(&mut self, tx_hash: String) -> Result<()> {
        self.move_to(RedemptionStatus::Approved, RedemptionStatus::Completed)?;
        self.tx_hash = Some(tx_hash);
        Ok(())
    }

    fn reject(&mut self, reason: String) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::InvalidTransition(format!(
                "redemption {} is already {}",
                self.id, self.status
            )));
        }
        self.status = RedemptionStatus::Rejected;
        self.reason = Some(reason);
        Ok(())
    }
}

/// Catalog entry with the patient's eligibility
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BenefitAvailability {
    /// Benefit
    pub benefit: BenefitConfig,
    /// Whether the current HT balance covers the minimum cost
    pub eligible: bool,
}

/// Redemption engine
#[derive(Clone)]
pub struct RedemptionEngine {
    ctx: Arc<Context>,
    ledger: TokenLedger,
}

impl RedemptionEngine {
    pub(crate) fn new(ctx: Arc<Context>, ledger: TokenLedger) -> Self {
        Self { ctx, ledger }
    }

    /// Redeem HT for a catalogued benefit
    ///
    /// An unknown benefit, a cost below the benefit's minimum or a short
    /// balance is not an error: the redemption is returned `Rejected` and
    /// the balance is untouched.
    pub async fn redeem(
        &self,
        actor: &Actor,
        patient_id: &PatientId,
        benefit_id: &BenefitId,
        token_cost: TokenAmount,
    ) -> Result<BenefitRedemption> {
        self.ctx
            .authorize(actor, Permission::RedeemHT, &Scope::patient(patient_id.clone()))?;

        let redemption = BenefitRedemption {
            id: RedemptionId::generate(),
            patient_id: patient_id.clone(),
            benefit_id: benefit_id.clone(),
            token_spent: token_cost,
            created_at: Utc::now(),
            status: RedemptionStatus::Pending,
            reason: None,
            tx_hash: None,
        };

        self.ctx.store.transaction(|txn| {
            let id = redemption.id.as_bytes();
            txn.put(Table::Redemptions, id.to_vec(), &redemption)?;
            txn.put(
                Table::Indices,
                index_key(BY_PATIENT, patient_id.as_str(), id),
                &redemption.id,
            )?;
            audit::append(
                txn,
                actor,
                Transition {
                    action: "redemption.create",
                    resource: ResourceRef::new(ResourceKind::Redemption, redemption.id),
                    before: None,
                    after: Some(RedemptionStatus::Pending.as_str()),
                },
            )
            .map(|_| ())
        })?;

        self.check_and_burn(actor, redemption).await
    }

    /// Drive a non-terminal redemption to completion
    ///
    /// Uses the original burn key, so a burn that landed before a lost
    /// receipt is not repeated.
    pub async fn resume(
        &self,
        actor: &Actor,
        redemption_id: RedemptionId,
    ) -> Result<Processed<BenefitRedemption>> {
        let redemption = self.get(redemption_id)?;
        self.ctx.authorize(
            actor,
            Permission::RedeemHT,
            &Scope::patient(redemption.patient_id.clone()),
        )?;

        match redemption.status {
            RedemptionStatus::Completed | RedemptionStatus::Rejected => {
                Ok(Processed::AlreadyProcessed(redemption))
            }
            RedemptionStatus::Pending => self.check_and_burn(actor, redemption).await.map(Processed::Applied),
            RedemptionStatus::Approved => self.burn(actor, redemption).await.map(Processed::Applied),
        }
    }

    async fn check_and_burn(&self, actor: &Actor, redemption: BenefitRedemption) -> Result<BenefitRedemption> {
        if let Some(reason) = self.catalog_refusal(&redemption) {
            return self.reject(actor, redemption.id, reason);
        }

        let available = self.ledger.balance_of(&redemption.patient_id)?.ht_balance;
        if available < redemption.token_spent {
            let reason = Error::InsufficientBalance {
                required: redemption.token_spent,
                available,
            }
            .to_string();
            return self.reject(actor, redemption.id, reason);
        }

        let approved = self.update(actor, redemption.id, "redemption.approve", |r| r.approve())?;
        self.burn(actor, approved).await
    }

    /// Why the catalog refuses this redemption, if it does
    fn catalog_refusal(&self, redemption: &BenefitRedemption) -> Option<String> {
        match self.ctx.config.benefit(&redemption.benefit_id) {
            None => Some(format!("unknown benefit {}", redemption.benefit_id)),
            Some(benefit) if redemption.token_spent < benefit.min_ht_cost => Some(format!(
                "benefit {} costs at least {} HT, offered {}",
                redemption.benefit_id, benefit.min_ht_cost, redemption.token_spent
            )),
            Some(_) => None,
        }
    }

    async fn burn(&self, actor: &Actor, redemption: BenefitRedemption) -> Result<BenefitRedemption> {
        let request = ChainRequest::ht_burn(redemption.id, &redemption.patient_id, redemption.token_spent);

        let chain_tx = match self.ctx.submit(&request).await {
            Ok(chain_tx) => chain_tx,
            Err(Error::Reverted(reason)) => return self.reject(actor, redemption.id, reason),
            // Outcome unknown: stays Approved for `resume`
            Err(err) => return Err(err),
        };

        let completed = self.ctx.store.transaction(|txn| {
            let mut current: BenefitRedemption =
                txn.require(Table::Redemptions, redemption.id.as_bytes(), "Redemption", redemption.id)?;
            if current.status == RedemptionStatus::Completed {
                return Ok(current);
            }

            ledger::burn_in(
                txn,
                &current.patient_id,
                TokenKind::HT,
                current.token_spent,
                Reference::Redemption(current.id),
                &chain_tx,
            )?;
            current.complete(chain_tx.clone())?;
            txn.put(Table::Redemptions, current.id.as_bytes().to_vec(), &current)?;
            audit::append(
                txn,
                actor,
                Transition {
                    action: "redemption.complete",
                    resource: ResourceRef::new(ResourceKind::Redemption, current.id),
                    before: Some(RedemptionStatus::Approved.as_str()),
                    after: Some(RedemptionStatus::Completed.as_str()),
                },
            )?;
            Ok(current)
        })?;

        self.ctx.metrics.record_redemption("completed");
        self.ctx.metrics.record_burn(TokenKind::HT, completed.token_spent);
        tracing::info!(
            redemption_id = %completed.id,
            patient_id = %completed.patient_id,
            benefit_id = %completed.benefit_id,
            amount = completed.token_spent,
            "Redemption completed"
        );
        self.ctx.emit(LifecycleEvent::RedemptionCompleted {
            redemption_id: completed.id,
            patient_id: completed.patient_id.clone(),
            benefit_id: completed.benefit_id.clone(),
            amount: completed.token_spent,
        });

        Ok(completed)
    }

    fn reject(&self, actor: &Actor, redemption_id: RedemptionId, reason: String) -> Result<BenefitRedemption> {
        let rejected = self.update(actor, redemption_id, "redemption.reject", |r| r.reject(reason.clone()))?;

        self.ctx.metrics.record_redemption("rejected");
        tracing::warn!(
            redemption_id = %redemption_id,
            patient_id = %rejected.patient_id,
            reason = %reason,
            "Redemption rejected"
        );
        self.ctx.emit(LifecycleEvent::RedemptionRejected {
            redemption_id,
            patient_id: rejected.patient_id.clone(),
            reason,
        });

        Ok(rejected)
    }

    fn update<F>(&self, actor: &Actor, redemption_id: RedemptionId, action: &str, apply: F) -> Result<BenefitRedemption>
    where
        F: Fn(&mut BenefitRedemption) -> Result<()>,
    {
        self.ctx.store.transaction(|txn| {
            let mut redemption: BenefitRedemption =
                txn.require(Table::Redemptions, redemption_id.as_bytes(), "Redemption", redemption_id)?;
            let before = redemption.status;
            apply(&mut redemption)?;

            txn.put(Table::Redemptions, redemption_id.as_bytes().to_vec(), &redemption)?;
            audit::append(
                txn,
                actor,
                Transition {
                    action,
                    resource: ResourceRef::new(ResourceKind::Redemption, redemption_id),
                    before: Some(before.as_str()),
                    after: Some(redemption.status.as_str()),
                },
            )?;
            Ok(redemption)
        })
    }

    /// Look up a redemption
    pub fn get(&self, redemption_id: RedemptionId) -> Result<BenefitRedemption> {
        self.ctx
            .store
            .load(Table::Redemptions, redemption_id.as_bytes())?
            .ok_or_else(|| Error::not_found("Redemption", redemption_id))
    }

    /// Every redemption attempt of a patient, oldest first
    pub fn history(&self, patient_id: &PatientId) -> Result<Vec<BenefitRedemption>> {
        let ids: Vec<RedemptionId> = self
            .ctx
            .store
            .scan(Table::Indices, &index_prefix(BY_PATIENT, patient_id.as_str()))?;
        ids.into_iter().map(|id| self.get(id)).collect()
    }

    /// HT spent on completed redemptions
    pub fn total_redeemed(&self, patient_id: &PatientId) -> Result<TokenAmount> {
        self.history(patient_id)?
            .iter()
            .filter(|r| r.status == RedemptionStatus::Completed)
            .try_fold(0u64, |total, r| {
                total
                    .checked_add(r.token_spent)
                    .ok_or_else(|| Error::InvariantViolation("redeemed total overflow".into()))
            })
    }

    /// Benefit catalog with eligibility for the patient's HT balance
    pub fn available_benefits(&self, patient_id: &PatientId) -> Result<Vec<BenefitAvailability>> {
        let balance = self.ledger.balance_of(patient_id)?.ht_balance;
        Ok(self
            .ctx
            .config
            .benefits
            .iter()
            .map(|benefit| BenefitAvailability {
                benefit: benefit.clone(),
                eligible: balance >= benefit.min_ht_cost,
            })
            .collect())
    }
}
