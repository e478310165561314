use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::Address;
use tracing::{info, instrument, warn};

use crate::analysis::{TokenAnalysis, TokenConfig};
use crate::error::{AppResult, ErrorKind};
use crate::ledger::BalanceKey;
use crate::planner::RebalancePlanner;
use crate::providers::RebalanceQuote;

/// What one check-balances cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckBalancesReport {
    pub deficits: usize,
    pub groups: usize,
    pub quotes: usize,
    pub completed: usize,
    pub failed: usize,
    /// Deficits nothing could be done for, with the reason
    pub skipped: Vec<(BalanceKey, String)>,
}

/// Analyze, plan, store and execute for one wallet
pub struct CheckBalancesJob {
    planner: Arc<RebalancePlanner>,
    tokens: HashMap<Address, Vec<TokenConfig>>,
}

impl CheckBalancesJob {
    pub fn new(planner: Arc<RebalancePlanner>, tokens: HashMap<Address, Vec<TokenConfig>>) -> Self {
        Self { planner, tokens }
    }

    /// Deficits are served largest first. Surplus consumed by one plan is
    /// not offered to the next deficit in the same cycle.
    #[instrument(skip(self))]
    pub async fn run(&self, wallet: Address) -> AppResult<CheckBalancesReport> {
        let Some(tokens) = self.tokens.get(&wallet) else {
            warn!("⚠️  No tokens configured for {}, skipping", wallet);
            return Ok(CheckBalancesReport::default());
        };
        let groups = self.planner.analyze_wallet(wallet, tokens).await?;
        let mut report = CheckBalancesReport {
            deficits: groups.deficit.len(),
            ..Default::default()
        };

        if groups.deficit.is_empty() {
            info!("✓ No deficits for {}", wallet);
            return Ok(report);
        }

        let mut surplus = groups.surplus;
        for deficit in &groups.deficit {
            let quotes = match self.planner.plan(wallet, deficit, &surplus).await {
                Ok(quotes) => quotes,
                Err(e) if e.kind() == ErrorKind::Infeasible => {
                    warn!("⚠️  Cannot rebalance {}: {}", deficit.key(), e);
                    report.skipped.push((deficit.key(), e.to_string()));
                    continue;
                }
                Err(e) => return Err(e),
            };

            if quotes.is_empty() {
                report
                    .skipped
                    .push((deficit.key(), "insufficient surplus".to_string()));
                continue;
            }

            consume_surplus(&mut surplus, &quotes);
            let records = self.planner.store_rebalancing(wallet, &quotes).await?;
            let summary = self.planner.execute_group(wallet, &records).await?;

            report.groups += 1;
            report.quotes += quotes.len();
            report.completed += summary.completed;
            report.failed += summary.failed.len();
        }

        info!(
            "🏁 Check-balances for {}: {} deficits, {} groups, {} completed, {} failed, {} skipped",
            wallet,
            report.deficits,
            report.groups,
            report.completed,
            report.failed,
            report.skipped.len()
        );
        Ok(report)
    }
}

/// Deducts quoted input amounts from the remaining surplus set
fn consume_surplus(surplus: &mut Vec<TokenAnalysis>, quotes: &[RebalanceQuote]) {
    for quote in quotes {
        let key = quote.token_in.key();
        if let Some(analysis) = surplus.iter_mut().find(|a| a.key() == key) {
            analysis.diff = analysis.diff.saturating_sub(quote.amount_in);
        }
    }
    surplus.retain(|analysis| !analysis.diff.is_zero());
}
