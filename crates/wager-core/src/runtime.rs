use crate::admin::AdminTools;
use crate::balance::BalanceAccessor;
use crate::dispute::DisputeHandler;
use crate::error::WagerError;
use crate::events::{EventBus, EventSink};
use crate::integrity::IntegrityMonitor;
use crate::lifecycle::{BetLifecycleManager, CashOutPricer, PlacementPolicy};
use crate::odds::OddsSource;
use crate::pricing::{PricingConfig, PricingEngine};
use crate::regulatory::{RegulatoryConfig, RegulatoryController};
use crate::store::{connect_store, StorageConfig, WagerResult, WagerStore};
use std::sync::Arc;
use tracing::info;

/// Wager engine configuration.
#[derive(Debug, Clone)]
pub struct WagerEngineConfig {
    pub storage: StorageConfig,
    pub pricing: PricingConfig,
    pub placement: PlacementPolicy,
    /// Bound on re-runs of a unit of work after a ledger sequence conflict.
    pub max_commit_attempts: u32,
    pub regulatory: RegulatoryConfig,
    pub currency: String,
}

impl Default for WagerEngineConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,
            pricing: PricingConfig::default(),
            placement: PlacementPolicy::default(),
            max_commit_attempts: 4,
            regulatory: RegulatoryConfig::default(),
            currency: "USD".to_string(),
        }
    }
}

/// Optional collaborators wired in before the engine starts.
pub struct WagerEngineBuilder {
    config: WagerEngineConfig,
    store: Option<Arc<dyn WagerStore>>,
    odds: Option<Arc<dyn OddsSource>>,
    cash_out: Option<Arc<dyn CashOutPricer>>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl WagerEngineBuilder {
    /// Use an already connected store instead of `config.storage`.
    pub fn store(mut self, store: Arc<dyn WagerStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn odds_source(mut self, odds: Arc<dyn OddsSource>) -> Self {
        self.odds = Some(odds);
        self
    }

    pub fn cash_out_pricer(mut self, pricer: Arc<dyn CashOutPricer>) -> Self {
        self.cash_out = Some(pricer);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub async fn build(self) -> WagerResult<WagerEngine> {
        let config = self.config;
        if config.max_commit_attempts == 0 {
            return Err(WagerError::validation("max_commit_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&config.regulatory.escrow_fraction) {
            return Err(WagerError::validation("escrow fraction must be within [0, 1]"));
        }

        let store = match self.store {
            Some(store) => store,
            None => connect_store(&config.storage).await?,
        };
        let float = store
            .ensure_platform_float(config.regulatory.initial_platform_float)
            .await?;

        let events = EventBus::new();
        for sink in self.sinks {
            events.register(sink);
        }

        let attempts = config.max_commit_attempts;
        let balances = BalanceAccessor::new(store.clone(), config.currency.clone(), attempts);
        let mut lifecycle = BetLifecycleManager::new(
            store.clone(),
            PricingEngine::new(config.pricing.clone()),
            config.placement.clone(),
            events.clone(),
            attempts,
        );
        if let Some(odds) = self.odds {
            lifecycle = lifecycle.with_odds_source(odds);
        }
        if let Some(pricer) = self.cash_out {
            lifecycle = lifecycle.with_cash_out_pricer(pricer);
        }
        let disputes = DisputeHandler::new(store.clone(), events.clone(), attempts);
        let regulatory =
            RegulatoryController::new(store.clone(), config.regulatory.clone(), events.clone());
        let integrity = IntegrityMonitor::new(store.clone(), events.clone());
        let admin = AdminTools::new(
            store.clone(),
            balances.clone(),
            lifecycle.clone(),
            disputes.clone(),
            regulatory.clone(),
            integrity.clone(),
        );

        info!(
            backend = store.backend_label(),
            platform_float = float,
            sinks = ?events.sink_names(),
            "wager engine ready"
        );
        Ok(WagerEngine {
            store,
            events,
            balances,
            lifecycle,
            disputes,
            regulatory,
            integrity,
            admin,
            config,
        })
    }
}

/// Wires every component over one shared store and event bus.
#[derive(Clone)]
pub struct WagerEngine {
    store: Arc<dyn WagerStore>,
    events: EventBus,
    balances: BalanceAccessor,
    lifecycle: BetLifecycleManager,
    disputes: DisputeHandler,
    regulatory: RegulatoryController,
    integrity: IntegrityMonitor,
    admin: AdminTools,
    config: WagerEngineConfig,
}

impl WagerEngine {
    pub fn builder(config: WagerEngineConfig) -> WagerEngineBuilder {
        WagerEngineBuilder {
            config,
            store: None,
            odds: None,
            cash_out: None,
            sinks: Vec::new(),
        }
    }

    pub async fn bootstrap(config: WagerEngineConfig) -> WagerResult<Self> {
        Self::builder(config).build().await
    }

    pub fn register_event_sink(&self, sink: Arc<dyn EventSink>) {
        self.events.register(sink);
    }

    pub fn store(&self) -> &Arc<dyn WagerStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn balances(&self) -> &BalanceAccessor {
        &self.balances
    }

    pub fn lifecycle(&self) -> &BetLifecycleManager {
        &self.lifecycle
    }

    pub fn disputes(&self) -> &DisputeHandler {
        &self.disputes
    }

    pub fn regulatory(&self) -> &RegulatoryController {
        &self.regulatory
    }

    pub fn integrity(&self) -> &IntegrityMonitor {
        &self.integrity
    }

    pub fn admin(&self) -> &AdminTools {
        &self.admin
    }

    pub fn config(&self) -> &WagerEngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_seeds_platform_float_once() {
        let mut config = WagerEngineConfig::default();
        config.regulatory.initial_platform_float = 50_000;
        let engine = WagerEngine::bootstrap(config.clone()).await.unwrap();
        assert_eq!(engine.store().platform_float().await.unwrap(), 50_000);

        config.regulatory.initial_platform_float = 1;
        let again = WagerEngine::builder(config)
            .store(engine.store().clone())
            .build()
            .await
            .unwrap();
        assert_eq!(again.store().platform_float().await.unwrap(), 50_000);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = WagerEngineConfig {
            max_commit_attempts: 0,
            ..WagerEngineConfig::default()
        };
        assert!(WagerEngine::bootstrap(config).await.is_err());
    }
}
