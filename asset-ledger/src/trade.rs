//! Trade and profit distribution
//!
//! A hospital records the outcome of trading AT from its pool. Profit is
//! converted to an HT pool at the configured rate and split across
//! recipients with [`allocate_largest_remainder`], so nothing is created
//! or lost to rounding.
//!
//! ```text
//! Recorded -> Distributing{plan} -> Distributed{distribution}
//! Recorded ----------(loss)------> Distributed{empty}
//! ```
//!
//! The plan is persisted before any HT is minted. A failure part way
//! through leaves the trade `Distributing`; the next call reuses the same
//! plan and the chain drops mints it has already seen, so every recipient
//! is credited exactly once.

use crate::audit::{self, ResourceKind, ResourceRef, Transition};
use crate::chain::ChainRequest;
use crate::distribution::allocate_largest_remainder;
use crate::events::LifecycleEvent;
use crate::ledger::{self, Reference};
use crate::permissions::{Permission, Scope};
use crate::platform::Context;
use crate::storage::{index_key, index_prefix, Table, Transaction};
use crate::types::{Actor, ActorId, HospitalId, PatientId, Processed, TokenAmount, TokenKind, TradeId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

const BY_HOSPITAL: &str = "trade_h";

/// HT credited for one trade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfitDistribution {
    /// Source trade
    pub trade_id: TradeId,
    /// HT per recipient, in request order
    pub recipients: Vec<(PatientId, TokenAmount)>,
    /// Sum of `recipients`
    pub total_distributed: TokenAmount,
}

impl ProfitDistribution {
    fn empty(trade_id: TradeId) -> Self {
        Self {
            trade_id,
            recipients: Vec::new(),
            total_distributed: 0,
        }
    }
}

/// Trade state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeState {
    /// Not yet distributed
    Recorded,
    /// Plan fixed, HT minting in flight
    Distributing {
        /// Requested weights
        weights: Vec<(PatientId, u64)>,
        /// Fixed allocation
        plan: ProfitDistribution,
    },
    /// Done (terminal)
    Distributed {
        /// Applied allocation
        distribution: ProfitDistribution,
    },
}

impl TradeState {
    fn name(&self) -> &'static str {
        match self {
            TradeState::Recorded => "recorded",
            TradeState::Distributing { .. } => "distributing",
            TradeState::Distributed { .. } => "distributed",
        }
    }
}

/// Recorded trading outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Trade id, also the distribution idempotency key
    pub id: TradeId,
    /// Hospital whose pool was traded
    pub hospital_id: HospitalId,
    /// Pooled AT invested
    pub invested_at: TokenAmount,
    /// Profit, negative for a loss
    pub profit: Decimal,
    /// Recording actor
    pub recorded_by: ActorId,
    /// Recording time
    pub recorded_at: DateTime<Utc>,
    /// Pool contributions when the trade was recorded
    pub contributions: BTreeMap<PatientId, TokenAmount>,
    state: TradeState,
}

impl Trade {
    /// Current state
    pub fn state(&self) -> &TradeState {
        &self.state
    }

    /// Whether profit has been distributed
    pub fn distributed(&self) -> bool {
        matches!(self.state, TradeState::Distributed { .. })
    }

    fn begin(&mut self, weights: Vec<(PatientId, u64)>, plan: ProfitDistribution) -> Result<()> {
        match self.state {
            TradeState::Recorded => {
                self.state = TradeState::Distributing { weights, plan };
                Ok(())
            }
            _ => Err(Error::InvalidTransition(format!(
                "trade {} is {}, expected recorded",
                self.id,
                self.state.name()
            ))),
        }
    }

    fn finish(&mut self, distribution: ProfitDistribution) -> Result<()> {
        match self.state {
            TradeState::Distributed { .. } => Err(Error::InvalidTransition(format!(
                "trade {} already distributed",
                self.id
            ))),
            _ => {
                self.state = TradeState::Distributed { distribution };
                Ok(())
            }
        }
    }
}

/// Trade and distribution engine
#[derive(Clone)]
pub struct TradeEngine {
    ctx: Arc<Context>,
}

impl TradeEngine {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Record a trade against the hospital's AT pool
    pub fn record_trade(
        &self,
        actor: &Actor,
        hospital_id: &HospitalId,
        invested_at: TokenAmount,
        profit: Decimal,
    ) -> Result<Trade> {
        self.ctx
            .authorize(actor, Permission::RecordTrade, &Scope::hospital(hospital_id.clone()))?;

        if invested_at == 0 {
            return Err(Error::InvalidInput("invested AT must be positive".to_string()));
        }

        let trade_id = TradeId::generate();
        let trade = self.ctx.store.transaction(|txn| {
            let pool = ledger::pool_in(txn, hospital_id)?;
            if invested_at > pool.at_pool {
                return Err(Error::InsufficientBalance {
                    required: invested_at,
                    available: pool.at_pool,
                });
            }

            let trade = Trade {
                id: trade_id,
                hospital_id: hospital_id.clone(),
                invested_at,
                profit,
                recorded_by: actor.id.clone(),
                recorded_at: Utc::now(),
                contributions: pool.contributions,
                state: TradeState::Recorded,
            };

            txn.put(Table::Trades, trade_id.as_bytes().to_vec(), &trade)?;
            txn.put(
                Table::Indices,
                index_key(BY_HOSPITAL, hospital_id.as_str(), trade_id.as_bytes()),
                &trade_id,
            )?;
            audit::append(
                txn,
                actor,
                Transition {
                    action: "trade.record",
                    resource: ResourceRef::new(ResourceKind::Trade, trade_id),
                    before: None,
                    after: Some(trade.state.name()),
                },
            )?;
            Ok(trade)
        })?;

        self.ctx.metrics.trades.inc();
        tracing::info!(
            trade_id = %trade_id,
            hospital_id = %hospital_id,
            invested_at,
            profit = %profit,
            "Trade recorded"
        );
        self.ctx.emit(LifecycleEvent::TradeRecorded {
            trade_id,
            hospital_id: hospital_id.clone(),
            invested_at,
            profit,
        });

        Ok(trade)
    }

    /// Distribute a trade's profit as HT, weighted per recipient
    ///
    /// A loss (or a profit worth less than one HT) marks the trade
    /// distributed with nothing credited. Repeating the call after success
    /// resolves to `AlreadyProcessed` with the original distribution.
    pub async fn distribute_profit(
        &self,
        actor: &Actor,
        trade_id: TradeId,
        recipients: Vec<(PatientId, u64)>,
    ) -> Result<Processed<ProfitDistribution>> {
        let trade = self.get(trade_id)?;
        self.ctx.authorize(
            actor,
            Permission::DistributeProfit,
            &Scope::hospital(trade.hospital_id.clone()),
        )?;

        if let TradeState::Distributed { distribution } = &trade.state {
            return Ok(Processed::AlreadyProcessed(distribution.clone()));
        }

        let pool_ht = self.ctx.config.tokenomics.ht_for_profit(trade.profit)?;
        if pool_ht == 0 {
            return self.close_without_profit(actor, &trade);
        }

        validate_recipients(&recipients)?;

        let plan = match self.fix_plan(actor, trade_id, pool_ht, &recipients)? {
            Plan::Done(distribution) => return Ok(Processed::AlreadyProcessed(distribution)),
            Plan::Pending(plan) => plan,
        };

        // Chain first; a failure here leaves the trade Distributing
        let mut receipts = Vec::with_capacity(plan.recipients.len());
        for (patient, amount) in plan.recipients.iter().filter(|(_, amount)| *amount > 0) {
            let chain_tx = self
                .ctx
                .submit(&ChainRequest::ht_mint(trade_id, patient, *amount))
                .await?;
            receipts.push((patient.clone(), *amount, chain_tx));
        }

        let outcome = self.ctx.store.transaction(|txn| {
            let mut trade: Trade = load_trade(txn, trade_id)?;
            if let TradeState::Distributed { distribution } = &trade.state {
                return Ok(Processed::AlreadyProcessed(distribution.clone()));
            }

            for (patient, amount, chain_tx) in &receipts {
                ledger::mint_in(txn, patient, TokenKind::HT, *amount, Reference::Trade(trade_id), chain_tx)?;
            }
            trade.finish(plan.clone())?;

            txn.put(Table::Trades, trade_id.as_bytes().to_vec(), &trade)?;
            txn.put(Table::Distributions, trade_id.as_bytes().to_vec(), &plan)?;
            audit::append(
                txn,
                actor,
                Transition {
                    action: "trade.distribute",
                    resource: ResourceRef::new(ResourceKind::Trade, trade_id),
                    before: Some("distributing"),
                    after: Some("distributed"),
                },
            )?;
            Ok(Processed::Applied(plan.clone()))
        })?;

        if let Processed::Applied(distribution) = &outcome {
            self.ctx.metrics.distributions.inc();
            self.ctx
                .metrics
                .record_mint(TokenKind::HT, distribution.total_distributed);
            tracing::info!(
                trade_id = %trade_id,
                total = distribution.total_distributed,
                recipients = distribution.recipients.len(),
                "Profit distributed"
            );
            self.ctx.emit(LifecycleEvent::ProfitDistributed {
                trade_id,
                hospital_id: trade.hospital_id.clone(),
                total: distribution.total_distributed,
                recipients: distribution.recipients.len(),
            });
        }

        Ok(outcome)
    }

    /// Distribute using the pool contributions captured with the trade
    pub async fn distribute_by_pool_share(
        &self,
        actor: &Actor,
        trade_id: TradeId,
    ) -> Result<Processed<ProfitDistribution>> {
        let trade = self.get(trade_id)?;
        let weights = trade.contributions.into_iter().collect();
        self.distribute_profit(actor, trade_id, weights).await
    }

    /// Look up a trade
    pub fn get(&self, trade_id: TradeId) -> Result<Trade> {
        self.ctx
            .store
            .load(Table::Trades, trade_id.as_bytes())?
            .ok_or_else(|| Error::not_found("Trade", trade_id))
    }

    /// Trades of a hospital, oldest first
    pub fn list_by_hospital(&self, hospital_id: &HospitalId) -> Result<Vec<Trade>> {
        let ids: Vec<TradeId> = self
            .ctx
            .store
            .scan(Table::Indices, &index_prefix(BY_HOSPITAL, hospital_id.as_str()))?;
        ids.into_iter().map(|id| self.get(id)).collect()
    }

    /// Distribution of a trade, once applied
    pub fn distribution(&self, trade_id: TradeId) -> Result<Option<ProfitDistribution>> {
        self.ctx.store.load(Table::Distributions, trade_id.as_bytes())
    }

    fn close_without_profit(&self, actor: &Actor, trade: &Trade) -> Result<Processed<ProfitDistribution>> {
        let trade_id = trade.id;
        let outcome = self.ctx.store.transaction(|txn| {
            let mut current = load_trade(txn, trade_id)?;
            if let TradeState::Distributed { distribution } = &current.state {
                return Ok(Processed::AlreadyProcessed(distribution.clone()));
            }

            let before = current.state.name();
            let empty = ProfitDistribution::empty(trade_id);
            current.finish(empty.clone())?;
            txn.put(Table::Trades, trade_id.as_bytes().to_vec(), &current)?;
            txn.put(Table::Distributions, trade_id.as_bytes().to_vec(), &empty)?;
            audit::append(
                txn,
                actor,
                Transition {
                    action: "trade.close",
                    resource: ResourceRef::new(ResourceKind::Trade, trade_id),
                    before: Some(before),
                    after: Some("distributed"),
                },
            )?;
            Ok(Processed::Applied(empty))
        })?;

        if outcome.is_applied() {
            tracing::info!(trade_id = %trade_id, profit = %trade.profit, "Trade closed without distribution");
            self.ctx.emit(LifecycleEvent::ProfitDistributed {
                trade_id,
                hospital_id: trade.hospital_id.clone(),
                total: 0,
                recipients: 0,
            });
        }
        Ok(outcome)
    }

    fn fix_plan(
        &self,
        actor: &Actor,
        trade_id: TradeId,
        pool_ht: TokenAmount,
        weights: &[(PatientId, u64)],
    ) -> Result<Plan> {
        self.ctx.store.transaction(|txn| {
            let mut trade = load_trade(txn, trade_id)?;
            match &trade.state {
                TradeState::Distributed { distribution } => Ok(Plan::Done(distribution.clone())),
                TradeState::Distributing {
                    weights: fixed,
                    plan,
                } => {
                    if fixed.as_slice() != weights {
                        return Err(Error::InvalidInput(format!(
                            "trade {} is already distributing to a different recipient set",
                            trade_id
                        )));
                    }
                    Ok(Plan::Pending(plan.clone()))
                }
                TradeState::Recorded => {
                    let plan = build_plan(trade_id, pool_ht, weights)?;
                    trade.begin(weights.to_vec(), plan.clone())?;
                    txn.put(Table::Trades, trade_id.as_bytes().to_vec(), &trade)?;
                    audit::append(
                        txn,
                        actor,
                        Transition {
                            action: "trade.plan",
                            resource: ResourceRef::new(ResourceKind::Trade, trade_id),
                            before: Some("recorded"),
                            after: Some("distributing"),
                        },
                    )?;
                    Ok(Plan::Pending(plan))
                }
            }
        })
    }
}

enum Plan {
    Done(ProfitDistribution),
    Pending(ProfitDistribution),
}

fn load_trade(txn: &Transaction<'_>, trade_id: TradeId) -> Result<Trade> {
    txn.require(Table::Trades, trade_id.as_bytes(), "Trade", trade_id)
}

fn validate_recipients(recipients: &[(PatientId, u64)]) -> Result<()> {
    if recipients.is_empty() {
        return Err(Error::InvalidInput("no recipients".to_string()));
    }
    let mut seen = HashSet::new();
    for (patient, _) in recipients {
        if !seen.insert(patient) {
            return Err(Error::InvalidInput(format!("duplicate recipient {}", patient)));
        }
    }
    Ok(())
}

fn build_plan(trade_id: TradeId, pool_ht: TokenAmount, weights: &[(PatientId, u64)]) -> Result<ProfitDistribution> {
    let raw: Vec<u64> = weights.iter().map(|(_, weight)| *weight).collect();
    let shares = allocate_largest_remainder(pool_ht, &raw)?;

    let total_distributed: TokenAmount = shares.iter().sum();
    if total_distributed != pool_ht {
        return Err(Error::InvariantViolation(format!(
            "allocated {} of {} HT",
            total_distributed, pool_ht
        )));
    }

    Ok(ProfitDistribution {
        trade_id,
        recipients: weights
            .iter()
            .map(|(patient, _)| patient.clone())
            .zip(shares)
            .collect(),
        total_distributed,
    })
}
