use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    chain::ChainClient,
    config::Settings,
    error::{AppError, AppResult},
    health::HealthMonitor,
    jobs::{CheckBalancesJob, JobScheduler, LedgerRefreshJob},
    ledger::{BalanceLedger, BalanceStore, InMemoryBalanceStore, PgBalanceStore},
    planner::{BalanceSources, RebalancePlanner},
    providers::{BridgeApi, BridgeProvider, ProviderRouter, Strategy},
    rebalance::{InMemoryRebalanceStore, PgRebalanceStore, RebalanceStore},
    rejections::{InMemoryRejectionStore, PgRejectionStore, RejectionRecorder, RejectionStore},
    settlement::{FulfillmentTrigger, IntentRegistry, IntentSource, NegativeIntentProvider},
};

/// Persistence backends shared by every component
#[derive(Clone)]
pub struct Stores {
    pub balances: Arc<dyn BalanceStore>,
    pub rebalances: Arc<dyn RebalanceStore>,
    pub rejections: Arc<dyn RejectionStore>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            balances: Arc::new(PgBalanceStore::new(pool.clone())),
            rebalances: Arc::new(PgRebalanceStore::new(pool.clone())),
            rejections: Arc::new(PgRejectionStore::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            balances: Arc::new(InMemoryBalanceStore::new()),
            rebalances: Arc::new(InMemoryRebalanceStore::new()),
            rejections: Arc::new(InMemoryRejectionStore::new()),
        }
    }
}

/// Contract-facing pieces the negative-intent provider drives
#[derive(Clone)]
pub struct IntentCollaborators {
    pub intent_source: Arc<dyn IntentSource>,
    pub fulfillment: Arc<dyn FulfillmentTrigger>,
}

/// External integrations. Strategies without a collaborator are not
/// registered and fail routing with `Unsupported`.
#[derive(Clone)]
pub struct Collaborators {
    pub chain: Arc<dyn ChainClient>,
    pub bridges: Vec<(Strategy, Arc<dyn BridgeApi>)>,
    pub negative_intents: Option<IntentCollaborators>,
}

/// Fully wired rebalancer service
pub struct Rebalancer {
    ledger: Arc<BalanceLedger>,
    router: Arc<ProviderRouter>,
    planner: Arc<RebalancePlanner>,
    health: Arc<HealthMonitor>,
    intent_registry: Option<Arc<IntentRegistry>>,
    ledger_refresh: Arc<LedgerRefreshJob>,
    check_balances: Arc<CheckBalancesJob>,
    scheduler: JobScheduler,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

pub async fn connect_database(settings: &Settings) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(settings.database.max_connections)
        .acquire_timeout(Duration::from_secs(settings.database.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&settings.database_url)
        .await?;

    info!(
        "✓ Database pool configured: {} max connections",
        settings.database.max_connections
    );

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}

impl Rebalancer {
    pub fn new(settings: &Settings, stores: Stores, collaborators: Collaborators) -> AppResult<Self> {
        info!("Initializing rebalancer components ...");

        let ledger_wallet = settings.ledger_wallet()?;
        let wallet_tokens = settings.wallet_token_configs()?;
        let ledger_tokens = match wallet_tokens.get(&ledger_wallet) {
            Some(tokens) => tokens.clone(),
            None => settings.token_configs()?,
        };
        info!(
            "✅ Tokens configured for {} wallets ({} on the ledger wallet)",
            wallet_tokens.len(),
            ledger_tokens.len()
        );

        let ledger = Arc::new(BalanceLedger::new(stores.balances.clone()));
        let recorder = RejectionRecorder::new(stores.rejections.clone());

        info!("⚙️  Registering rebalance providers...");
        let mut router = ProviderRouter::new(settings.router_config()?, recorder.clone());

        for (strategy, api) in &collaborators.bridges {
            if *strategy == Strategy::NegativeIntent {
                return Err(AppError::Config(
                    "NegativeIntent is not a bridge strategy".to_string(),
                ));
            }
            router.register_provider(Arc::new(BridgeProvider::new(
                *strategy,
                api.clone(),
                collaborators.chain.clone(),
            )));
            info!("✅ {} provider registered", strategy);
        }

        let intent_registry = match &collaborators.negative_intents {
            Some(intents) => {
                let registry = Arc::new(IntentRegistry::new());
                router.register_provider(Arc::new(NegativeIntentProvider::new(
                    settings.negative_intent_config()?,
                    collaborators.chain.clone(),
                    intents.intent_source.clone(),
                    intents.fulfillment.clone(),
                    registry.clone(),
                )));
                info!("✅ {} provider registered", Strategy::NegativeIntent);
                Some(registry)
            }
            None => {
                warn!("⚠️  No intent source configured - NegativeIntent disabled");
                None
            }
        };

        let router = Arc::new(router);
        let planner = Arc::new(RebalancePlanner::new(
            router.clone(),
            stores.rebalances.clone(),
            BalanceSources {
                ledger: ledger.clone(),
                ledger_wallet,
                chain: collaborators.chain.clone(),
            },
            recorder,
            settings.planner_config(),
        ));
        let health = Arc::new(HealthMonitor::new(stores.rebalances, stores.rejections));
        info!("✅ Planner and health monitor initialized");

        let ledger_refresh = Arc::new(LedgerRefreshJob::new(
            ledger.clone(),
            collaborators.chain,
            ledger_wallet,
            &ledger_tokens,
        ));
        let check_balances = Arc::new(CheckBalancesJob::new(planner.clone(), wallet_tokens));
        let scheduler = JobScheduler::new(
            settings.schedule_config()?,
            ledger_refresh.clone(),
            check_balances.clone(),
        );

        Ok(Self {
            ledger,
            router,
            planner,
            health,
            intent_registry,
            ledger_refresh,
            check_balances,
            scheduler,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Starts the recurring jobs (runs in background). Calling it again
    /// while running is a no-op.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            warn!("⚠️  Rebalancer already started");
            return;
        }
        *handles = self.scheduler.start();
        info!("🚀 Rebalancer started: {} recurring jobs", handles.len());
    }

    pub fn shutdown(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        info!("🛑 Rebalancer stopped: {} jobs aborted", handles.len());
    }

    pub fn is_running(&self) -> bool {
        self.handles.lock().iter().any(|h| !h.is_finished())
    }

    pub fn ledger(&self) -> &Arc<BalanceLedger> {
        &self.ledger
    }

    pub fn router(&self) -> &Arc<ProviderRouter> {
        &self.router
    }

    pub fn planner(&self) -> &Arc<RebalancePlanner> {
        &self.planner
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn intent_registry(&self) -> Option<&Arc<IntentRegistry>> {
        self.intent_registry.as_ref()
    }

    pub fn ledger_refresh(&self) -> &Arc<LedgerRefreshJob> {
        &self.ledger_refresh
    }

    pub fn check_balances(&self) -> &Arc<CheckBalancesJob> {
        &self.check_balances
    }
}

impl Drop for Rebalancer {
    fn drop(&mut self) {
        for handle in self.handles.get_mut().drain(..) {
            handle.abort();
        }
    }
}
