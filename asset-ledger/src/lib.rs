//! Asset Ledger
//!
//! Tokenization ledger for patient-deposited healthcare assets:
//! - Deposit lifecycle with role/scope authorization
//! - Asset Token (AT) minting against approved deposits
//! - Hospital trading pools and Health Token (HT) profit distribution
//! - Benefit redemption that burns HT
//! - Hash-chained audit trail and token conservation checks
//!
//! Every balance-affecting call to the external chain carries an
//! idempotency key and is confirmed before the local commit, so a retried
//! operation never credits or debits twice.
//!
//! # Example
//!
//! ```no_run
//! use asset_ledger::{Actor, Config, DepositRequest, AssetType, HospitalId, BankId, PatientId, Platform};
//! use rust_decimal::Decimal;
//!
//! # async fn run() -> asset_ledger::Result<()> {
//! let platform = Platform::in_memory(Config::default())?;
//! let patient = Actor::patient("p-1");
//! let deposit = platform.deposits.submit(
//!     &patient,
//!     &PatientId::new("p-1"),
//!     DepositRequest {
//!         hospital_id: HospitalId::new("A"),
//!         custodian_bank_id: Some(BankId::new("bank-1")),
//!         asset_type: AssetType::RealEstate,
//!         description: "Title deed".into(),
//!         estimated_value: Decimal::from(10_000),
//!     },
//! )?;
//! # let _ = deposit;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod audit;
pub mod chain;
pub mod config;
pub mod deposit;
pub mod distribution;
pub mod error;
pub mod events;
pub mod ledger;
pub mod metrics;
pub mod permissions;
pub mod platform;
pub mod redemption;
pub mod storage;
pub mod trade;
pub mod types;

pub use chain::{ChainClient, ChainOutcome, ChainRequest, InMemoryChain};
pub use config::Config;
pub use deposit::{Deposit, DepositLifecycle, DepositRequest, DepositStatus};
pub use distribution::allocate_largest_remainder;
pub use error::{Error, Result};
pub use events::{BroadcastNotifier, LifecycleEvent, Notifier};
pub use ledger::{ConservationReport, TokenLedger};
pub use permissions::{Decision, Permission, Scope};
pub use platform::Platform;
pub use redemption::{BenefitRedemption, RedemptionEngine, RedemptionStatus};
pub use trade::{ProfitDistribution, Trade, TradeEngine};
pub use types::*;
