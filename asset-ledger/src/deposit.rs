//! Deposit lifecycle
//!
//! ```text
//! Submitted -> Pending -> Approved -> TokensMinted
//!                     \-> Rejected
//! ```
//!
//! `Rejected` and `TokensMinted` are terminal. The state is private to this
//! module; the transition methods on [`Deposit`] are the only way to change
//! it, and each one refuses to run from the wrong state.

use crate::audit::{self, ResourceKind, ResourceRef, Transition};
use crate::events::LifecycleEvent;
use crate::ledger::TokenLedger;
use crate::permissions::{Permission, Scope};
use crate::platform::Context;
use crate::storage::{index_key, index_prefix, Table};
use crate::types::{
    Actor, ActorId, AssetType, BankId, DepositId, HospitalId, PatientId, Processed, TokenAmount,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const BY_HOSPITAL: &str = "deposit_h";
const BY_PATIENT: &str = "deposit_p";

/// Deposit status without payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepositStatus {
    /// Received, awaiting intake
    Submitted,
    /// Awaiting review
    Pending,
    /// Verified; tokens not yet minted
    Approved,
    /// Refused (terminal)
    Rejected,
    /// AT credited (terminal)
    TokensMinted,
}

impl DepositStatus {
    /// Stable name
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Submitted => "submitted",
            DepositStatus::Pending => "pending",
            DepositStatus::Approved => "approved",
            DepositStatus::Rejected => "rejected",
            DepositStatus::TokensMinted => "tokens_minted",
        }
    }
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deposit state with the data each state carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepositState {
    /// Received, awaiting intake
    Submitted,
    /// Awaiting review
    Pending,
    /// Verified
    Approved {
        /// Approver
        approved_by: ActorId,
        /// Time
        at: DateTime<Utc>,
    },
    /// Refused
    Rejected {
        /// Rejecting actor
        rejected_by: ActorId,
        /// Reason
        reason: String,
        /// Time
        at: DateTime<Utc>,
    },
    /// AT credited
    TokensMinted {
        /// Approver
        approved_by: ActorId,
        /// AT minted
        tokens_generated: TokenAmount,
        /// Time
        at: DateTime<Utc>,
    },
}

impl DepositState {
    /// Status without payload
    pub fn status(&self) -> DepositStatus {
        match self {
            DepositState::Submitted => DepositStatus::Submitted,
            DepositState::Pending => DepositStatus::Pending,
            DepositState::Approved { .. } => DepositStatus::Approved,
            DepositState::Rejected { .. } => DepositStatus::Rejected,
            DepositState::TokensMinted { .. } => DepositStatus::TokensMinted,
        }
    }
}

/// Physical-asset deposit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    /// Deposit id, also the AT mint idempotency key
    pub id: DepositId,
    /// Depositing patient
    pub patient_id: PatientId,
    /// Receiving hospital
    pub hospital_id: HospitalId,
    /// Bank holding the asset in custody, if any
    pub custodian_bank_id: Option<BankId>,
    /// Asset kind
    pub asset_type: AssetType,
    /// Free-text description
    pub description: String,
    /// Declared value
    pub estimated_value: Decimal,
    /// Submission time
    pub submitted_at: DateTime<Utc>,
    state: DepositState,
}

impl Deposit {
    /// Current state
    pub fn state(&self) -> &DepositState {
        &self.state
    }

    /// Current status
    pub fn status(&self) -> DepositStatus {
        self.state.status()
    }

    /// Approver, once approved
    pub fn approved_by(&self) -> Option<&ActorId> {
        match &self.state {
            DepositState::Approved { approved_by, .. }
            | DepositState::TokensMinted { approved_by, .. } => Some(approved_by),
            _ => None,
        }
    }

    /// Rejection reason, once rejected
    pub fn rejection_reason(&self) -> Option<&str> {
        match &self.state {
            DepositState::Rejected { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// AT minted, once minted
    pub fn tokens_generated(&self) -> Option<TokenAmount> {
        match &self.state {
            DepositState::TokensMinted {
                tokens_generated, ..
            } => Some(*tokens_generated),
            _ => None,
        }
    }

    fn scope(&self) -> Scope {
        Scope::hospital(self.hospital_id.clone()).with_bank(self.custodian_bank_id.clone())
    }

    fn expect_status(&self, expected: DepositStatus) -> Result<()> {
        if self.status() == expected {
            Ok(())
        } else {
            Err(Error::InvalidTransition(format!(
                "deposit {} is {}, expected {}",
                self.id,
                self.status(),
                expected
            )))
        }
    }

    fn confirm_intake(&mut self) -> Result<()> {
        self.expect_status(DepositStatus::Submitted)?;
        self.state = DepositState::Pending;
        Ok(())
    }

    fn approve(&mut self, approved_by: ActorId) -> Result<()> {
        self.expect_status(DepositStatus::Pending)?;
        self.state = DepositState::Approved {
            approved_by,
            at: Utc::now(),
        };
        Ok(())
    }

    fn reject(&mut self, rejected_by: ActorId, reason: String) -> Result<()> {
        self.expect_status(DepositStatus::Pending)?;
        self.state = DepositState::Rejected {
            rejected_by,
            reason,
            at: Utc::now(),
        };
        Ok(())
    }

    fn mark_minted(&mut self, tokens_generated: TokenAmount) -> Result<()> {
        let approved_by = match &self.state {
            DepositState::Approved { approved_by, .. } => approved_by.clone(),
            _ => {
                return Err(Error::InvalidTransition(format!(
                    "deposit {} is {}, expected approved",
                    self.id,
                    self.status()
                )))
            }
        };
        self.state = DepositState::TokensMinted {
            approved_by,
            tokens_generated,
            at: Utc::now(),
        };
        Ok(())
    }
}

/// Deposit submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRequest {
    /// Receiving hospital
    pub hospital_id: HospitalId,
    /// Custodian bank, if the asset is held by a bank
    pub custodian_bank_id: Option<BankId>,
    /// Asset kind
    pub asset_type: AssetType,
    /// Free-text description
    pub description: String,
    /// Declared value
    pub estimated_value: Decimal,
}

/// Deposit lifecycle service
#[derive(Clone)]
pub struct DepositLifecycle {
    ctx: Arc<Context>,
    ledger: TokenLedger,
}

impl DepositLifecycle {
    pub(crate) fn new(ctx: Arc<Context>, ledger: TokenLedger) -> Self {
        Self { ctx, ledger }
    }

    /// Submit a deposit; hospital intake moves it straight to `Pending`
    pub fn submit(
        &self,
        actor: &Actor,
        patient_id: &PatientId,
        request: DepositRequest,
    ) -> Result<Deposit> {
        self.ctx.authorize(
            actor,
            Permission::SubmitDeposit,
            &Scope::patient(patient_id.clone()),
        )?;

        if request.estimated_value <= Decimal::ZERO {
            return Err(Error::InvalidInput(format!(
                "estimated value must be positive, got {}",
                request.estimated_value
            )));
        }
        if self.ctx.config.tokenomics.at_for_value(request.estimated_value)? == 0 {
            return Err(Error::InvalidInput(format!(
                "estimated value {} is worth less than one AT",
                request.estimated_value
            )));
        }

        let submitted = Deposit {
            id: DepositId::generate(),
            patient_id: patient_id.clone(),
            hospital_id: request.hospital_id,
            custodian_bank_id: request.custodian_bank_id,
            asset_type: request.asset_type,
            description: request.description,
            estimated_value: request.estimated_value,
            submitted_at: Utc::now(),
            state: DepositState::Submitted,
        };
        let resource = ResourceRef::new(ResourceKind::Deposit, submitted.id);

        let deposit = self.ctx.store.transaction(|txn| {
            let mut deposit = submitted.clone();
            audit::append(
                txn,
                actor,
                Transition {
                    action: "deposit.submit",
                    resource: resource.clone(),
                    before: None,
                    after: Some(DepositStatus::Submitted.as_str()),
                },
            )?;

            deposit.confirm_intake()?;
            audit::append(
                txn,
                actor,
                Transition {
                    action: "deposit.intake",
                    resource: resource.clone(),
                    before: Some(DepositStatus::Submitted.as_str()),
                    after: Some(DepositStatus::Pending.as_str()),
                },
            )?;

            let id = deposit.id.as_bytes();
            txn.put(Table::Deposits, id.to_vec(), &deposit)?;
            txn.put(
                Table::Indices,
                index_key(BY_HOSPITAL, deposit.hospital_id.as_str(), id),
                &deposit.id,
            )?;
            txn.put(
                Table::Indices,
                index_key(BY_PATIENT, deposit.patient_id.as_str(), id),
                &deposit.id,
            )?;
            Ok(deposit)
        })?;

        self.ctx.metrics.record_deposit("submitted");
        tracing::info!(
            deposit_id = %deposit.id,
            patient_id = %deposit.patient_id,
            hospital_id = %deposit.hospital_id,
            value = %deposit.estimated_value,
            "Deposit submitted"
        );
        self.ctx.emit(LifecycleEvent::DepositSubmitted {
            deposit_id: deposit.id,
            patient_id: deposit.patient_id.clone(),
            hospital_id: deposit.hospital_id.clone(),
        });

        Ok(deposit)
    }

    /// Approve a pending deposit
    pub fn approve(&self, actor: &Actor, deposit_id: DepositId) -> Result<Deposit> {
        let deposit = self.get(deposit_id)?;
        self.ctx
            .authorize(actor, Permission::ApproveDeposit, &deposit.scope())?;

        let deposit = self.transition(actor, deposit_id, "deposit.approve", |deposit| {
            deposit.approve(actor.id.clone())
        })?;

        self.ctx.metrics.record_deposit("approved");
        tracing::info!(deposit_id = %deposit_id, approved_by = %actor.id, "Deposit approved");
        self.ctx.emit(LifecycleEvent::DepositApproved {
            deposit_id,
            hospital_id: deposit.hospital_id.clone(),
            approved_by: actor.id.clone(),
        });

        Ok(deposit)
    }

    /// Reject a pending deposit
    pub fn reject(
        &self,
        actor: &Actor,
        deposit_id: DepositId,
        reason: impl Into<String>,
    ) -> Result<Deposit> {
        let reason = reason.into();
        let deposit = self.get(deposit_id)?;
        self.ctx
            .authorize(actor, Permission::ApproveDeposit, &deposit.scope())?;

        if reason.trim().is_empty() {
            return Err(Error::InvalidInput("rejection reason is required".to_string()));
        }

        let deposit = self.transition(actor, deposit_id, "deposit.reject", |deposit| {
            deposit.reject(actor.id.clone(), reason.clone())
        })?;

        self.ctx.metrics.record_deposit("rejected");
        tracing::info!(deposit_id = %deposit_id, rejected_by = %actor.id, reason = %reason, "Deposit rejected");
        self.ctx.emit(LifecycleEvent::DepositRejected {
            deposit_id,
            hospital_id: deposit.hospital_id.clone(),
            reason,
        });

        Ok(deposit)
    }

    /// Mint AT for an approved deposit
    ///
    /// Safe to retry: a deposit whose tokens were already credited resolves
    /// to `AlreadyProcessed` with the original amount, and nothing is
    /// credited twice.
    pub async fn mint_from_deposit(
        &self,
        actor: &Actor,
        deposit_id: DepositId,
    ) -> Result<Processed<Deposit>> {
        let deposit = self.get(deposit_id)?;
        self.ctx
            .authorize(actor, Permission::MintAT, &deposit.scope())?;

        match deposit.status() {
            DepositStatus::TokensMinted => return Ok(Processed::AlreadyProcessed(deposit)),
            DepositStatus::Approved => {}
            _ => deposit.expect_status(DepositStatus::Approved)?,
        }

        let amount = self
            .ctx
            .config
            .tokenomics
            .at_for_value(deposit.estimated_value)?;

        let mut minted: Option<Deposit> = None;
        let mut transitioned = false;
        let outcome = self
            .ledger
            .mint_at_with(deposit_id, &deposit.patient_id, amount, |txn, record| {
                let mut current: Deposit =
                    txn.require(Table::Deposits, deposit_id.as_bytes(), "Deposit", deposit_id)?;
                transitioned = false;

                if current.status() == DepositStatus::Approved {
                    current.mark_minted(record.amount_at)?;
                    txn.put(Table::Deposits, deposit_id.as_bytes().to_vec(), &current)?;
                    audit::append(
                        txn,
                        actor,
                        Transition {
                            action: "deposit.mint",
                            resource: ResourceRef::new(ResourceKind::Deposit, deposit_id),
                            before: Some(DepositStatus::Approved.as_str()),
                            after: Some(DepositStatus::TokensMinted.as_str()),
                        },
                    )?;
                    transitioned = true;
                } else {
                    current.expect_status(DepositStatus::TokensMinted)?;
                }

                minted = Some(current);
                Ok(())
            })
            .await?;

        let minted = minted
            .ok_or_else(|| Error::InvariantViolation("mint completed without deposit".into()))?;
        let tokens = outcome.get().amount_at;

        if transitioned {
            self.ctx.metrics.record_deposit("minted");
            tracing::info!(
                deposit_id = %deposit_id,
                patient_id = %minted.patient_id,
                tokens,
                reconciled = !outcome.is_applied(),
                "Deposit tokens minted"
            );
            self.ctx.emit(LifecycleEvent::TokensMinted {
                deposit_id,
                patient_id: minted.patient_id.clone(),
                amount: tokens,
            });
        }

        Ok(outcome.map(|_| minted))
    }

    /// Look up a deposit
    pub fn get(&self, deposit_id: DepositId) -> Result<Deposit> {
        self.ctx
            .store
            .load(Table::Deposits, deposit_id.as_bytes())?
            .ok_or_else(|| Error::not_found("Deposit", deposit_id))
    }

    /// Deposits received by a hospital, oldest first
    pub fn list_by_hospital(&self, hospital_id: &HospitalId) -> Result<Vec<Deposit>> {
        self.list(BY_HOSPITAL, hospital_id.as_str())
    }

    /// Deposits made by a patient, oldest first
    pub fn list_by_patient(&self, patient_id: &PatientId) -> Result<Vec<Deposit>> {
        self.list(BY_PATIENT, patient_id.as_str())
    }

    fn list(&self, kind: &str, owner: &str) -> Result<Vec<Deposit>> {
        let ids: Vec<DepositId> = self
            .ctx
            .store
            .scan(Table::Indices, &index_prefix(kind, owner))?;
        ids.into_iter().map(|id| self.get(id)).collect()
    }

    fn transition<F>(
        &self,
        actor: &Actor,
        deposit_id: DepositId,
        action: &str,
        apply: F,
    ) -> Result<Deposit>
    where
        F: Fn(&mut Deposit) -> Result<()>,
    {
        self.ctx.store.transaction(|txn| {
            let mut deposit: Deposit =
                txn.require(Table::Deposits, deposit_id.as_bytes(), "Deposit", deposit_id)?;
            let before = deposit.status();
            apply(&mut deposit)?;

            txn.put(Table::Deposits, deposit_id.as_bytes().to_vec(), &deposit)?;
            audit::append(
                txn,
                actor,
                Transition {
                    action,
                    resource: ResourceRef::new(ResourceKind::Deposit, deposit_id),
                    before: Some(before.as_str()),
                    after: Some(deposit.status().as_str()),
                },
            )?;
            Ok(deposit)
        })
    }
}
