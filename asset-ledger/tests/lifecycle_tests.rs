//! End-to-end tests over the public API
//!
//! Deposit → AT mint → pool → trade → HT distribution → redemption, plus
//! the retry and authorization guarantees at each step.

use asset_ledger::chain::{ChainAccount, Fault};
use asset_ledger::storage::MemoryStore;
use asset_ledger::{
    Actor, AllocationId, AssetType, BenefitId, BroadcastNotifier, Config, DepositRequest,
    DepositStatus, Error, HospitalId, InMemoryChain, LifecycleEvent, PatientId, Platform,
    RedemptionStatus, TokenKind,
};
use rust_decimal_macros::dec;
use std::sync::Arc;

struct Harness {
    platform: Platform,
    chain: Arc<InMemoryChain>,
    notifier: Arc<BroadcastNotifier>,
}

fn harness() -> Harness {
    let chain = Arc::new(InMemoryChain::new());
    let notifier = Arc::new(BroadcastNotifier::default());
    let platform = Platform::new(
        Config::default(),
        Arc::new(MemoryStore::new()),
        chain.clone(),
        notifier.clone(),
    )
    .unwrap();
    Harness {
        platform,
        chain,
        notifier,
    }
}

fn admin(hospital: &str) -> Actor {
    Actor::hospital_admin(format!("admin-{}", hospital), HospitalId::new(hospital))
}

fn deposit_request(hospital: &str) -> DepositRequest {
    DepositRequest {
        hospital_id: HospitalId::new(hospital),
        custodian_bank_id: None,
        asset_type: AssetType::RealEstate,
        description: "Apartment title deed".to_string(),
        estimated_value: dec!(10000),
    }
}

/// Submit, approve and mint a 10000-value deposit for `patient`
async fn funded_patient(platform: &Platform, patient: &str, hospital: &str) {
    let deposit = platform
        .deposits
        .submit(
            &Actor::patient(patient),
            &PatientId::new(patient),
            deposit_request(hospital),
        )
        .unwrap();
    platform.deposits.approve(&admin(hospital), deposit.id).unwrap();
    platform
        .deposits
        .mint_from_deposit(&admin(hospital), deposit.id)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_full_tokenization_lifecycle() {
    let Harness {
        platform,
        chain,
        notifier,
    } = harness();
    let mut events = notifier.subscribe();
    let hospital = HospitalId::new("A");
    let p1 = PatientId::new("p-1");
    let p2 = PatientId::new("p-2");

    funded_patient(&platform, "p-1", "A").await;
    funded_patient(&platform, "p-2", "A").await;
    assert_eq!(platform.ledger.balance_of(&p1).unwrap().at_balance, 10_000);

    // Both patients back the pool
    for (patient, amount) in [("p-1", 3_000), ("p-2", 2_000)] {
        platform
            .ledger
            .allocate_to_pool(
                &Actor::patient(patient),
                AllocationId::generate(),
                &hospital,
                amount,
            )
            .await
            .unwrap();
    }
    assert_eq!(platform.ledger.pool(&hospital).unwrap().at_pool, 5_000);
    assert_eq!(
        chain.balance(&ChainAccount::HospitalPool(hospital.clone()), TokenKind::AT),
        5_000
    );

    let trade = platform
        .trades
        .record_trade(&admin("A"), &hospital, 5_000, dec!(1000))
        .unwrap();
    let distribution = platform
        .trades
        .distribute_profit(&admin("A"), trade.id, vec![(p1.clone(), 60), (p2.clone(), 40)])
        .await
        .unwrap()
        .into_inner();
    assert_eq!(distribution.total_distributed, 1_000);
    assert_eq!(platform.ledger.balance_of(&p1).unwrap().ht_balance, 600);
    assert_eq!(platform.ledger.balance_of(&p2).unwrap().ht_balance, 400);

    let redemption = platform
        .redemptions
        .redeem(
            &Actor::patient("p-1"),
            &p1,
            &BenefitId::new("INSURANCE"),
            600,
        )
        .await
        .unwrap();
    assert_eq!(redemption.status(), RedemptionStatus::Completed);
    assert_eq!(platform.ledger.balance_of(&p1).unwrap().ht_balance, 0);
    assert_eq!(platform.redemptions.total_redeemed(&p1).unwrap(), 600);

    let report = platform.check_conservation().unwrap();
    assert_eq!(report.at_in_accounts + report.at_in_pools, 20_000);
    assert_eq!(report.ht_in_accounts, 400);
    assert!(platform.verify_audit_chain().unwrap().entries > 0);

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert_eq!(names.iter().filter(|n| **n == "tokens_minted").count(), 2);
    assert!(names.contains(&"pool_allocated"));
    assert!(names.contains(&"trade_recorded"));
    assert!(names.contains(&"profit_distributed"));
    assert_eq!(names.last(), Some(&"redemption_completed"));
}

#[tokio::test]
async fn test_mint_twice_credits_once() {
    let Harness { platform, chain, .. } = harness();
    let p1 = PatientId::new("p-1");
    let deposit = platform
        .deposits
        .submit(&Actor::patient("p-1"), &p1, deposit_request("A"))
        .unwrap();
    platform.deposits.approve(&admin("A"), deposit.id).unwrap();

    let first = platform
        .deposits
        .mint_from_deposit(&admin("A"), deposit.id)
        .await
        .unwrap();
    let second = platform
        .deposits
        .mint_from_deposit(&admin("A"), deposit.id)
        .await
        .unwrap();

    assert!(first.is_applied());
    assert!(!second.is_applied());
    assert_eq!(second.into_inner().status(), DepositStatus::TokensMinted);
    assert_eq!(platform.ledger.balance_of(&p1).unwrap().at_balance, 10_000);
    assert_eq!(chain.balance(&ChainAccount::Patient(p1), TokenKind::AT), 10_000);
    assert_eq!(chain.receipt_count(), 1);
}

#[tokio::test]
async fn test_mint_retry_after_lost_receipt() {
    let Harness { platform, chain, .. } = harness();
    let p1 = PatientId::new("p-1");
    let deposit = platform
        .deposits
        .submit(&Actor::patient("p-1"), &p1, deposit_request("A"))
        .unwrap();
    platform.deposits.approve(&admin("A"), deposit.id).unwrap();

    chain.push_fault(Fault::LostReceipt);
    let err = platform
        .deposits
        .mint_from_deposit(&admin("A"), deposit.id)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(platform.ledger.balance_of(&p1).unwrap().at_balance, 0);
    assert_eq!(
        platform.deposits.get(deposit.id).unwrap().status(),
        DepositStatus::Approved
    );

    platform
        .deposits
        .mint_from_deposit(&admin("A"), deposit.id)
        .await
        .unwrap();
    assert_eq!(platform.ledger.balance_of(&p1).unwrap().at_balance, 10_000);
    assert_eq!(chain.balance(&ChainAccount::Patient(p1), TokenKind::AT), 10_000);
    platform.check_conservation().unwrap();
}

#[tokio::test]
async fn test_distribute_twice_credits_once() {
    let Harness { platform, .. } = harness();
    let hospital = HospitalId::new("A");
    let p1 = PatientId::new("p-1");
    funded_patient(&platform, "p-1", "A").await;
    platform
        .ledger
        .allocate_to_pool(&Actor::patient("p-1"), AllocationId::generate(), &hospital, 5_000)
        .await
        .unwrap();
    let trade = platform
        .trades
        .record_trade(&admin("A"), &hospital, 5_000, dec!(1000))
        .unwrap();

    let weights = vec![(p1.clone(), 1)];
    let first = platform
        .trades
        .distribute_profit(&admin("A"), trade.id, weights.clone())
        .await
        .unwrap();
    let second = platform
        .trades
        .distribute_profit(&admin("A"), trade.id, weights)
        .await
        .unwrap();

    assert!(first.is_applied());
    assert!(!second.is_applied());
    assert_eq!(first.into_inner(), second.into_inner());
    assert_eq!(platform.ledger.balance_of(&p1).unwrap().ht_balance, 1_000);
}

#[tokio::test]
async fn test_short_balance_redemption_is_rejected() {
    let Harness { platform, .. } = harness();
    let hospital = HospitalId::new("A");
    let p1 = PatientId::new("p-1");
    funded_patient(&platform, "p-1", "A").await;
    platform
        .ledger
        .allocate_to_pool(&Actor::patient("p-1"), AllocationId::generate(), &hospital, 1_000)
        .await
        .unwrap();
    let trade = platform
        .trades
        .record_trade(&admin("A"), &hospital, 1_000, dec!(100))
        .unwrap();
    platform
        .trades
        .distribute_by_pool_share(&admin("A"), trade.id)
        .await
        .unwrap();
    assert_eq!(platform.ledger.balance_of(&p1).unwrap().ht_balance, 100);

    let redemption = platform
        .redemptions
        .redeem(
            &Actor::patient("p-1"),
            &p1,
            &BenefitId::new("CHECKUP"),
            150,
        )
        .await
        .unwrap();

    assert_eq!(redemption.status(), RedemptionStatus::Rejected);
    assert_eq!(platform.ledger.balance_of(&p1).unwrap().ht_balance, 100);
    assert_eq!(platform.redemptions.history(&p1).unwrap().len(), 1);
}

#[tokio::test]
async fn test_cross_hospital_approval_is_denied() {
    let Harness { platform, notifier, .. } = harness();
    let mut events = notifier.subscribe();
    let deposit = platform
        .deposits
        .submit(
            &Actor::patient("p-1"),
            &PatientId::new("p-1"),
            deposit_request("B"),
        )
        .unwrap();

    let err = platform.deposits.approve(&admin("A"), deposit.id).unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
    assert_eq!(
        platform.deposits.get(deposit.id).unwrap().status(),
        DepositStatus::Pending
    );
    assert_eq!(platform.metrics().permission_denials.get(), 1);

    // Only the submission was published
    let event = events.try_recv().unwrap();
    assert!(matches!(event, LifecycleEvent::DepositSubmitted { .. }));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_staff_cannot_approve_other_hospital_in_any_status() {
    let Harness { platform, .. } = harness();
    let staff = Actor::hospital_staff("staff-a", HospitalId::new("A"));
    let deposit = platform
        .deposits
        .submit(
            &Actor::patient("p-1"),
            &PatientId::new("p-1"),
            deposit_request("B"),
        )
        .unwrap();

    let assert_denied = |expected: DepositStatus| {
        let err = platform.deposits.approve(&staff, deposit.id).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
        assert_eq!(platform.deposits.get(deposit.id).unwrap().status(), expected);
    };

    assert_denied(DepositStatus::Pending);

    platform.deposits.approve(&admin("B"), deposit.id).unwrap();
    assert_denied(DepositStatus::Approved);

    platform
        .deposits
        .mint_from_deposit(&admin("B"), deposit.id)
        .await
        .unwrap();
    assert_denied(DepositStatus::TokensMinted);

    assert_eq!(platform.metrics().permission_denials.get(), 3);
}

#[tokio::test]
async fn test_reverted_mint_leaves_deposit_approved() {
    let Harness { platform, chain, .. } = harness();
    let p1 = PatientId::new("p-1");
    let deposit = platform
        .deposits
        .submit(&Actor::patient("p-1"), &p1, deposit_request("A"))
        .unwrap();
    platform.deposits.approve(&admin("A"), deposit.id).unwrap();

    chain.push_fault(Fault::Revert("paused".to_string()));
    let err = platform
        .deposits
        .mint_from_deposit(&admin("A"), deposit.id)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Reverted(_)));
    assert_eq!(
        platform.deposits.get(deposit.id).unwrap().status(),
        DepositStatus::Approved
    );
    assert_eq!(platform.ledger.supply().unwrap().at_minted, 0);
}
