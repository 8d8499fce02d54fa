//! Lifecycle notifications
//!
//! Events are emitted only after the transition they describe has
//! committed. Delivery is the subscriber's concern.

use crate::types::{
    ActorId, AllocationId, BenefitId, DepositId, HospitalId, PatientId, RedemptionId, TokenAmount,
    TradeId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Committed lifecycle transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Deposit accepted for review
    DepositSubmitted {
        /// Deposit
        deposit_id: DepositId,
        /// Patient
        patient_id: PatientId,
        /// Hospital
        hospital_id: HospitalId,
    },
    /// Deposit approved
    DepositApproved {
        /// Deposit
        deposit_id: DepositId,
        /// Hospital
        hospital_id: HospitalId,
        /// Approver
        approved_by: ActorId,
    },
    /// Deposit rejected
    DepositRejected {
        /// Deposit
        deposit_id: DepositId,
        /// Hospital
        hospital_id: HospitalId,
        /// Reason
        reason: String,
    },
    /// AT credited for a deposit
    TokensMinted {
        /// Deposit
        deposit_id: DepositId,
        /// Patient
        patient_id: PatientId,
        /// Amount
        amount: TokenAmount,
    },
    /// Patient AT moved into a hospital pool
    PoolAllocated {
        /// Allocation key
        allocation_id: AllocationId,
        /// Patient
        patient_id: PatientId,
        /// Hospital
        hospital_id: HospitalId,
        /// Amount
        amount: TokenAmount,
    },
    /// Patient AT moved out of a hospital pool
    PoolReleased {
        /// Allocation key
        allocation_id: AllocationId,
        /// Patient
        patient_id: PatientId,
        /// Hospital
        hospital_id: HospitalId,
        /// Amount
        amount: TokenAmount,
    },
    /// Trading outcome recorded
    TradeRecorded {
        /// Trade
        trade_id: TradeId,
        /// Hospital
        hospital_id: HospitalId,
        /// AT invested
        invested_at: TokenAmount,
        /// Profit
        profit: Decimal,
    },
    /// HT credited for a trade
    ProfitDistributed {
        /// Trade
        trade_id: TradeId,
        /// Hospital
        hospital_id: HospitalId,
        /// HT credited
        total: TokenAmount,
        /// Recipient count
        recipients: usize,
    },
    /// HT burned for a benefit
    RedemptionCompleted {
        /// Redemption
        redemption_id: RedemptionId,
        /// Patient
        patient_id: PatientId,
        /// Benefit
        benefit_id: BenefitId,
        /// Amount
        amount: TokenAmount,
    },
    /// Redemption refused
    RedemptionRejected {
        /// Redemption
        redemption_id: RedemptionId,
        /// Patient
        patient_id: PatientId,
        /// Reason
        reason: String,
    },
}

impl LifecycleEvent {
    /// Event name
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::DepositSubmitted { .. } => "deposit_submitted",
            LifecycleEvent::DepositApproved { .. } => "deposit_approved",
            LifecycleEvent::DepositRejected { .. } => "deposit_rejected",
            LifecycleEvent::TokensMinted { .. } => "tokens_minted",
            LifecycleEvent::PoolAllocated { .. } => "pool_allocated",
            LifecycleEvent::PoolReleased { .. } => "pool_released",
            LifecycleEvent::TradeRecorded { .. } => "trade_recorded",
            LifecycleEvent::ProfitDistributed { .. } => "profit_distributed",
            LifecycleEvent::RedemptionCompleted { .. } => "redemption_completed",
            LifecycleEvent::RedemptionRejected { .. } => "redemption_rejected",
        }
    }
}

/// Sink for committed lifecycle events
pub trait Notifier: Send + Sync {
    /// Hand off an event; must not block
    fn notify(&self, event: LifecycleEvent);
}

/// Fan-out notifier on a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl BroadcastNotifier {
    /// Create with a per-subscriber buffer of `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// New subscriber; sees events sent after this call
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, event: LifecycleEvent) {
        let name = event.name();
        // No subscribers is not an error
        if self.sender.send(event).is_err() {
            tracing::trace!(event = name, "No event subscribers");
        } else {
            tracing::debug!(event = name, "Event published");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let notifier = BroadcastNotifier::default();
        let mut rx = notifier.subscribe();

        let deposit_id = DepositId::generate();
        notifier.notify(LifecycleEvent::TokensMinted {
            deposit_id,
            patient_id: PatientId::new("p-1"),
            amount: 10_000,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "tokens_minted");
        assert!(matches!(
            event,
            LifecycleEvent::TokensMinted { amount: 10_000, .. }
        ));
    }

    #[test]
    fn test_notify_without_subscribers() {
        let notifier = BroadcastNotifier::new(4);
        notifier.notify(LifecycleEvent::DepositRejected {
            deposit_id: DepositId::generate(),
            hospital_id: HospitalId::new("A"),
            reason: "forged certificate".into(),
        });
    }

    #[test]
    fn test_json_tagging() {
        let event = LifecycleEvent::RedemptionRejected {
            redemption_id: RedemptionId::generate(),
            patient_id: PatientId::new("p-1"),
            reason: "insufficient".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "redemption_rejected");
        assert_eq!(json["patient_id"], "p-1");
    }
}
