//! Metrics collection for observability
//!
//! Prometheus collectors registered on a per-instance [`Registry`], so
//! several ledgers (or tests) in one process never collide.
//!
//! # Metrics
//!
//! - `asset_ledger_deposits_total{outcome}` - Deposit transitions
//! - `asset_ledger_tokens_minted_total{token}` - AT/HT minted
//! - `asset_ledger_tokens_burned_total{token}` - AT/HT burned
//! - `asset_ledger_trades_total` - Trades recorded
//! - `asset_ledger_distributions_total` - Profit distributions applied
//! - `asset_ledger_redemptions_total{outcome}` - Redemptions by outcome
//! - `asset_ledger_permission_denials_total` - Denied requests
//! - `asset_ledger_chain_failures_total` - Failed or unknown chain calls
//! - `asset_ledger_chain_call_duration_seconds` - Chain call latency

use crate::types::{TokenAmount, TokenKind};
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Deposit transitions by outcome
    pub deposits: IntCounterVec,

    /// Tokens minted by kind
    pub tokens_minted: IntCounterVec,

    /// Tokens burned by kind
    pub tokens_burned: IntCounterVec,

    /// Trades recorded
    pub trades: IntCounter,

    /// Distributions applied
    pub distributions: IntCounter,

    /// Redemptions by outcome
    pub redemptions: IntCounterVec,

    /// Denied authorization requests
    pub permission_denials: IntCounter,

    /// Chain calls that failed, timed out or returned no receipt
    pub chain_failures: IntCounter,

    /// Chain call latency
    pub chain_call_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let deposits = IntCounterVec::new(
            Opts::new("asset_ledger_deposits_total", "Deposit transitions by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(deposits.clone()))?;

        let tokens_minted = IntCounterVec::new(
            Opts::new("asset_ledger_tokens_minted_total", "Tokens minted"),
            &["token"],
        )?;
        registry.register(Box::new(tokens_minted.clone()))?;

        let tokens_burned = IntCounterVec::new(
            Opts::new("asset_ledger_tokens_burned_total", "Tokens burned"),
            &["token"],
        )?;
        registry.register(Box::new(tokens_burned.clone()))?;

        let trades = IntCounter::new("asset_ledger_trades_total", "Trades recorded")?;
        registry.register(Box::new(trades.clone()))?;

        let distributions = IntCounter::new(
            "asset_ledger_distributions_total",
            "Profit distributions applied",
        )?;
        registry.register(Box::new(distributions.clone()))?;

        let redemptions = IntCounterVec::new(
            Opts::new("asset_ledger_redemptions_total", "Redemptions by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(redemptions.clone()))?;

        let permission_denials = IntCounter::new(
            "asset_ledger_permission_denials_total",
            "Denied authorization requests",
        )?;
        registry.register(Box::new(permission_denials.clone()))?;

        let chain_failures = IntCounter::new(
            "asset_ledger_chain_failures_total",
            "Failed or unknown chain calls",
        )?;
        registry.register(Box::new(chain_failures.clone()))?;

        let chain_call_duration = Histogram::with_opts(
            HistogramOpts::new(
                "asset_ledger_chain_call_duration_seconds",
                "Chain call latency",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 5.0]),
        )?;
        registry.register(Box::new(chain_call_duration.clone()))?;

        Ok(Self {
            deposits,
            tokens_minted,
            tokens_burned,
            trades,
            distributions,
            redemptions,
            permission_denials,
            chain_failures,
            chain_call_duration,
            registry,
        })
    }

    /// Record a deposit transition (`submitted`, `approved`, `rejected`, `minted`)
    pub fn record_deposit(&self, outcome: &str) {
        self.deposits.with_label_values(&[outcome]).inc();
    }

    /// Record a mint
    pub fn record_mint(&self, token: TokenKind, amount: TokenAmount) {
        self.tokens_minted
            .with_label_values(&[token.symbol()])
            .inc_by(amount);
    }

    /// Record a burn
    pub fn record_burn(&self, token: TokenKind, amount: TokenAmount) {
        self.tokens_burned
            .with_label_values(&[token.symbol()])
            .inc_by(amount);
    }

    /// Record a redemption outcome (`completed`, `rejected`)
    pub fn record_redemption(&self, outcome: &str) {
        self.redemptions.with_label_values(&[outcome]).inc();
    }

    /// Record a chain call
    pub fn record_chain_call(&self, duration_seconds: f64, failed: bool) {
        self.chain_call_duration.observe(duration_seconds);
        if failed {
            self.chain_failures.inc();
        }
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instances_do_not_collide() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.trades.inc();
        assert_eq!(a.trades.get(), 1);
        assert_eq!(b.trades.get(), 0);
    }

    #[test]
    fn test_record_mint_by_token() {
        let metrics = Metrics::new().unwrap();
        metrics.record_mint(TokenKind::AT, 10_000);
        metrics.record_mint(TokenKind::HT, 600);
        assert_eq!(metrics.tokens_minted.with_label_values(&["AT"]).get(), 10_000);
        assert_eq!(metrics.tokens_minted.with_label_values(&["HT"]).get(), 600);
        assert!(!metrics.registry().gather().is_empty());
    }
}
