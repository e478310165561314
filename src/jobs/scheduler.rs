// Job scheduler - drives the recurring rebalancer cycles
//
// - Ledger refresh: RPC balance snapshots for the tracked wallet
// - Check balances: analyze, plan and execute per configured wallet
//
// A failing cycle is logged and the loop waits for the next tick.

use std::future::Future;
use std::sync::Arc;

use alloy_primitives::Address;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use super::{CheckBalancesJob, LedgerRefreshJob};
use crate::error::AppResult;

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub ledger_refresh_interval: Duration,
    pub check_balances_interval: Duration,
    pub check_balances_enabled: bool,
    /// Wallets the check-balances cycle rebalances
    pub wallets: Vec<Address>,
}

pub struct JobScheduler {
    config: ScheduleConfig,
    ledger_refresh: Arc<LedgerRefreshJob>,
    check_balances: Arc<CheckBalancesJob>,
}

impl JobScheduler {
    pub fn new(
        config: ScheduleConfig,
        ledger_refresh: Arc<LedgerRefreshJob>,
        check_balances: Arc<CheckBalancesJob>,
    ) -> Self {
        Self {
            config,
            ledger_refresh,
            check_balances,
        }
    }

    /// Start every enabled cycle (runs in background)
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);

        let refresh = self.ledger_refresh.clone();
        handles.push(spawn_recurring(
            "ledger-refresh",
            self.config.ledger_refresh_interval,
            move || {
                let refresh = refresh.clone();
                async move { refresh.run().await.map(|_| ()) }
            },
        ));

        if self.config.check_balances_enabled {
            let job = self.check_balances.clone();
            let wallets = Arc::new(self.config.wallets.clone());
            handles.push(spawn_recurring(
                "check-balances",
                self.config.check_balances_interval,
                move || {
                    let job = job.clone();
                    let wallets = wallets.clone();
                    async move {
                        for wallet in wallets.iter() {
                            if let Err(e) = job.run(*wallet).await {
                                error!("❌ Check-balances failed for {}: {:?}", wallet, e);
                            }
                        }
                        Ok(())
                    }
                },
            ));
        } else {
            info!("⏸️  Check-balances cycle disabled");
        }

        handles
    }
}

/// Runs `task` every `period`, first tick immediately. Errors never stop
/// the loop.
pub fn spawn_recurring<F, Fut>(name: &'static str, period: Duration, task: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = AppResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("⏰ {} scheduled every {}s", name, period.as_secs());

        loop {
            ticker.tick().await;
            info!("🔄 Starting {} cycle", name);

            match task().await {
                Ok(()) => info!("✓ {} cycle completed", name),
                Err(e) => error!("❌ {} cycle failed: {:?}", name, e),
            }
        }
    })
}
