//! Service wiring
//!
//! [`Platform`] owns the collaborators (store, chain, notifier) and hands
//! one shared [`Context`] to each engine. Nothing here is global: two
//! platforms in one process are fully independent.

use crate::audit::{self, AuditEntry, AuditReport, ResourceRef};
use crate::chain::{submit_bounded, ChainClient, ChainRequest, InMemoryChain};
use crate::deposit::DepositLifecycle;
use crate::events::{BroadcastNotifier, LifecycleEvent, Notifier};
use crate::ledger::{ConservationReport, TokenLedger};
use crate::metrics::Metrics;
use crate::permissions::{Authorizer, Decision, Permission, Scope};
use crate::redemption::RedemptionEngine;
use crate::storage::{MemoryStore, Store};
use crate::trade::TradeEngine;
use crate::types::Actor;
use crate::{Config, Result};
use std::sync::Arc;

/// State shared by every engine
pub(crate) struct Context {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) chain: Arc<dyn ChainClient>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) authorizer: Authorizer,
    pub(crate) metrics: Metrics,
    pub(crate) config: Config,
}

impl Context {
    /// Gate for every mutating operation
    pub(crate) fn authorize(&self, actor: &Actor, permission: Permission, scope: &Scope) -> Result<()> {
        let decision = self.authorizer.authorize(actor, permission, scope);
        if let Decision::Denied(reason) = &decision {
            self.metrics.permission_denials.inc();
            tracing::warn!(
                actor = %actor.id,
                role = %actor.role,
                permission = %permission,
                reason = %reason,
                "Permission denied"
            );
        }
        decision.into_result()
    }

    /// Bounded chain call
    pub(crate) async fn submit(&self, request: &ChainRequest) -> Result<String> {
        submit_bounded(
            &*self.chain,
            request,
            self.config.chain.call_timeout(),
            &self.metrics,
        )
        .await
    }

    /// Publish a committed transition
    pub(crate) fn emit(&self, event: LifecycleEvent) {
        self.notifier.notify(event);
    }

    #[cfg(test)]
    pub(crate) fn for_tests(store: Arc<dyn Store>, chain: Arc<dyn ChainClient>) -> Self {
        Self {
            store,
            chain,
            notifier: Arc::new(BroadcastNotifier::default()),
            authorizer: Authorizer::default(),
            metrics: Metrics::new().unwrap(),
            config: Config::default(),
        }
    }
}

/// The ledger core: deposits, balances, trades and redemptions
#[derive(Clone)]
pub struct Platform {
    /// Deposit lifecycle
    pub deposits: DepositLifecycle,
    /// Token ledger
    pub ledger: TokenLedger,
    /// Trade and distribution engine
    pub trades: TradeEngine,
    /// Redemption engine
    pub redemptions: RedemptionEngine,
    ctx: Arc<Context>,
}

impl Platform {
    /// Wire the engines over the given collaborators
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;

        let authorizer = Authorizer::new(config.permissions.clone().unwrap_or_default());
        let ctx = Arc::new(Context {
            store,
            chain,
            notifier,
            authorizer,
            metrics: Metrics::new()?,
            config,
        });

        let ledger = TokenLedger::new(ctx.clone());
        tracing::info!(
            service = %ctx.config.service_name,
            version = %ctx.config.service_version,
            "Asset ledger initialized"
        );

        Ok(Self {
            deposits: DepositLifecycle::new(ctx.clone(), ledger.clone()),
            trades: TradeEngine::new(ctx.clone()),
            redemptions: RedemptionEngine::new(ctx.clone(), ledger.clone()),
            ledger,
            ctx,
        })
    }

    /// In-memory store, in-memory chain and a broadcast notifier
    pub fn in_memory(config: Config) -> Result<Self> {
        Self::in_memory_with_chain(config).map(|(platform, _)| platform)
    }

    /// Like [`Platform::in_memory`], also returning the chain for inspection
    pub fn in_memory_with_chain(config: Config) -> Result<(Self, Arc<InMemoryChain>)> {
        let chain = Arc::new(InMemoryChain::new());
        let platform = Self::new(
            config,
            Arc::new(MemoryStore::new()),
            chain.clone(),
            Arc::new(BroadcastNotifier::default()),
        )?;
        Ok((platform, chain))
    }

    /// RocksDB store under `config.data_dir`
    #[cfg(feature = "rocksdb")]
    pub fn open(
        config: Config,
        chain: Arc<dyn ChainClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let store = Arc::new(crate::storage::RocksStore::open(&config)?);
        Self::new(config, store, chain, notifier)
    }

    /// Evaluate a permission without performing anything
    pub fn authorize(&self, actor: &Actor, permission: Permission, scope: &Scope) -> Decision {
        self.ctx.authorizer.authorize(actor, permission, scope)
    }

    /// Audit entries of one resource, oldest first
    pub fn audit_trail(&self, resource: &ResourceRef) -> Result<Vec<AuditEntry>> {
        audit::trail(&*self.ctx.store, resource)
    }

    /// Verify the audit hash chain end to end
    pub fn verify_audit_chain(&self) -> Result<AuditReport> {
        audit::verify_chain(&*self.ctx.store)
    }

    /// Check global token conservation
    pub fn check_conservation(&self) -> Result<ConservationReport> {
        self.ledger.check_conservation()
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.ctx.metrics
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &Arc<Context> {
        &self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::PermissionTable;
    use crate::types::{HospitalId, PatientId, Role};
    use std::collections::BTreeMap;

    #[test]
    fn test_platforms_are_independent() {
        let a = Platform::in_memory(Config::default()).unwrap();
        let b = Platform::in_memory(Config::default()).unwrap();
        let outsider = Actor::hospital_staff("staff-b", HospitalId::new("B"));

        assert!(a
            .context()
            .authorize(&outsider, Permission::ApproveDeposit, &Scope::hospital(HospitalId::new("A")))
            .is_err());
        assert_eq!(a.metrics().permission_denials.get(), 1);
        assert_eq!(b.metrics().permission_denials.get(), 0);
    }

    #[test]
    fn test_injected_permission_table() {
        let mut config = Config::default();
        config.permissions = Some(PermissionTable::new(BTreeMap::from([(
            Role::Patient,
            [Permission::ViewOwnProfile].into_iter().collect(),
        )])));
        let platform = Platform::in_memory(config).unwrap();
        let patient = Actor::patient("p-1");

        let decision = platform.authorize(
            &patient,
            Permission::SubmitDeposit,
            &Scope::patient(PatientId::new("p-1")),
        );
        assert!(!decision.is_allowed());
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let mut config = Config::default();
        config.benefits.clear();
        assert!(Platform::in_memory(config).is_err());
    }
}
