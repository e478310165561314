//! Turns one deficit token plus a set of surplus tokens into an ordered
//! list of quotes. Same-chain moves are tried first; cross-chain
//! candidates only cover what same-chain could not.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::analysis::{classify, group_by_state, AnalysisGroups, Thresholds, TokenAnalysis, TokenConfig};
use crate::chain::{ChainClient, ChainId};
use crate::error::{AppError, AppResult, PlanningError, StrategyError};
use crate::ledger::{BalanceKey, BalanceLedger, TokenAddress};
use crate::providers::{ProviderRouter, QuoteToken, RebalanceQuote};
use crate::rebalance::{RebalanceRecord, RebalanceStatus, RebalanceStore};
use crate::rejections::{NewQuoteRejection, RejectionReason, RejectionRecorder};
use crate::units::{normalize_decimals, to_base_units};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub thresholds: Thresholds,
    /// Smallest swap worth quoting, in whole units of the deficit token
    pub min_trade_amount: Decimal,
}

/// Result of running a planned group through the providers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub completed: usize,
    /// `(rebalance_job_id, error)` per failed execution
    pub failed: Vec<(String, String)>,
}

struct Candidate<'a> {
    analysis: &'a TokenAnalysis,
    /// Surplus left after pending reservations, in the candidate's units
    available: U256,
}

impl Candidate<'_> {
    fn available_in(&self, decimals: u8) -> U256 {
        normalize_decimals(self.available, self.analysis.config.decimals, decimals)
    }
}

struct Fill {
    quotes: Vec<RebalanceQuote>,
    filled: U256,
}

/// Where wallet balances are read from. The ledger only tracks
/// `ledger_wallet`; every other wallet is read from the chain.
#[derive(Clone)]
pub struct BalanceSources {
    pub ledger: Arc<BalanceLedger>,
    pub ledger_wallet: Address,
    pub chain: Arc<dyn ChainClient>,
}

pub struct RebalancePlanner {
    router: Arc<ProviderRouter>,
    rebalances: Arc<dyn RebalanceStore>,
    balances: BalanceSources,
    rejections: RejectionRecorder,
    config: PlannerConfig,
}

impl RebalancePlanner {
    pub fn new(
        router: Arc<ProviderRouter>,
        rebalances: Arc<dyn RebalanceStore>,
        balances: BalanceSources,
        rejections: RejectionRecorder,
        config: PlannerConfig,
    ) -> Self {
        Self {
            router,
            rebalances,
            balances,
            rejections,
            config,
        }
    }

    /// Classifies every configured token from `wallet`'s balances plus what
    /// is already in flight towards it. Tokens without a balance are skipped.
    #[instrument(skip(self, tokens))]
    pub async fn analyze_wallet(&self, wallet: Address, tokens: &[TokenConfig]) -> AppResult<AnalysisGroups> {
        let incoming = self.rebalances.pending_incoming(wallet).await?;
        let balances = if wallet == self.balances.ledger_wallet {
            self.ledger_balances(tokens).await?
        } else {
            self.chain_balances(wallet, tokens).await
        };
        let mut analyses = Vec::with_capacity(tokens.len());

        for config in tokens {
            let key = config.key();
            let Some(balance) = balances.get(&key).copied() else {
                warn!("⚠️  No balance for {} held by {}, skipping analysis", key, wallet);
                continue;
            };

            let arriving = incoming.get(&key).copied().unwrap_or_default();
            if !arriving.is_zero() {
                debug!("{} has {} incoming from pending rebalances", key, arriving);
            }
            analyses.push(classify(
                config,
                balance.saturating_add(arriving),
                &self.config.thresholds,
            ));
        }

        let groups = group_by_state(analyses);
        info!(
            "📊 Wallet analysis: {} surplus, {} in range, {} deficit",
            groups.surplus.len(),
            groups.in_range.len(),
            groups.deficit.len()
        );
        Ok(groups)
    }

    async fn ledger_balances(&self, tokens: &[TokenConfig]) -> AppResult<HashMap<BalanceKey, U256>> {
        let mut balances = HashMap::with_capacity(tokens.len());
        for config in tokens {
            let key = config.key();
            if let Some(current) = self.balances.ledger.current_balance(&key, None).await? {
                balances.insert(key, current.balance);
            }
        }
        Ok(balances)
    }

    /// Live balances for a wallet the ledger does not track. A chain that
    /// fails to answer leaves its tokens out of the analysis.
    async fn chain_balances(&self, wallet: Address, tokens: &[TokenConfig]) -> HashMap<BalanceKey, U256> {
        let mut per_chain: BTreeMap<ChainId, (Vec<Address>, bool)> = BTreeMap::new();
        for config in tokens {
            let entry = per_chain.entry(config.chain_id).or_default();
            match config.token {
                TokenAddress::Token(address) => entry.0.push(address),
                TokenAddress::Native => entry.1 = true,
            }
        }

        let chain = &self.balances.chain;
        let mut balances = HashMap::with_capacity(tokens.len());
        for (chain_id, (erc20s, native)) in per_chain {
            if !erc20s.is_empty() {
                match chain.multicall_balances(chain_id, wallet, &erc20s).await {
                    Ok(read) => {
                        for (token, balance) in read {
                            balances.insert(BalanceKey::new(chain_id, token), balance.balance);
                        }
                    }
                    Err(e) => error!("❌ Token balance read for {} on {} failed: {}", wallet, chain_id, e),
                }
            }
            if native {
                match chain.get_balance(chain_id, wallet).await {
                    Ok(read) => {
                        balances.insert(BalanceKey::native(chain_id), read.balance);
                    }
                    Err(e) => error!("❌ Native balance read for {} on {} failed: {}", wallet, chain_id, e),
                }
            }
        }
        balances
    }

    /// Quotes surplus into `deficit` towards its target, stopping once the
    /// lower edge of the target band is reached. An empty plan means
    /// nothing can be done this cycle.
    #[instrument(skip(self, deficit, surplus), fields(deficit = %deficit.key()))]
    pub async fn plan(
        &self,
        wallet: Address,
        deficit: &TokenAnalysis,
        surplus: &[TokenAnalysis],
    ) -> AppResult<Vec<RebalanceQuote>> {
        if surplus.is_empty() {
            info!("No surplus tokens available for {}", deficit.key());
            return Ok(Vec::new());
        }

        let reserved = self.rebalances.pending_reserved(wallet).await?;
        let candidates: Vec<Candidate<'_>> = surplus
            .iter()
            .filter(|analysis| analysis.key() != deficit.key())
            .map(|analysis| {
                let held = reserved.get(&analysis.key()).copied().unwrap_or_default();
                if !held.is_zero() {
                    debug!("{} has {} reserved by pending rebalances", analysis.key(), held);
                }
                Candidate {
                    analysis,
                    available: analysis.diff.saturating_sub(held),
                }
            })
            .collect();

        let (same_chain, _): (Vec<&Candidate<'_>>, Vec<&Candidate<'_>>) = candidates
            .iter()
            .partition(|c| c.analysis.chain_id() == deficit.chain_id());

        let phase_one = self
            .fill(wallet, deficit, same_chain, deficit.balance)
            .await?;
        if phase_one.filled >= deficit.target_band.min {
            info!("✅ Same-chain surplus covers {}", deficit.key());
            return Ok(phase_one.quotes);
        }

        let quoted: HashSet<BalanceKey> = phase_one.quotes.iter().map(|q| q.token_in.key()).collect();
        let remaining: Vec<&Candidate<'_>> = candidates
            .iter()
            .filter(|c| !quoted.contains(&c.analysis.key()))
            .collect();

        let phase_two = self.fill(wallet, deficit, remaining, phase_one.filled).await?;
        let mut quotes = phase_one.quotes;
        quotes.extend(phase_two.quotes);

        info!(
            "🧮 Planned {} quotes for {} (balance {} -> {}, band min {})",
            quotes.len(),
            deficit.key(),
            deficit.balance,
            phase_two.filled,
            deficit.target_band.min
        );
        Ok(quotes)
    }

    async fn fill(
        &self,
        wallet: Address,
        deficit: &TokenAnalysis,
        mut candidates: Vec<&Candidate<'_>>,
        starting_balance: U256,
    ) -> AppResult<Fill> {
        let target_min = deficit.target_band.min;
        let target = deficit.config.target_balance;
        let decimals = deficit.config.decimals;
        let mut filled = starting_balance;
        let mut quotes = Vec::new();

        if candidates.is_empty() || filled >= target_min {
            return Ok(Fill { quotes, filled });
        }

        // Surplus must cover the whole distance to target, not only to the band
        let need = target.saturating_sub(filled);
        let total = candidates
            .iter()
            .fold(U256::ZERO, |acc, c| acc.saturating_add(c.available_in(decimals)));
        if total < need {
            info!(
                "Surplus {} cannot cover the {} needed by {}",
                total,
                need,
                deficit.key()
            );
            return Ok(Fill { quotes, filled });
        }

        candidates.sort_by_key(|c| Reverse(c.available_in(decimals)));
        let min_trade = to_base_units(self.config.min_trade_amount, decimals);
        let deficit_token = deficit.to_quote_token();

        for candidate in candidates {
            if filled >= target_min {
                break;
            }

            let source = candidate.analysis;
            let remaining = normalize_decimals(
                target.saturating_sub(filled),
                decimals,
                source.config.decimals,
            );
            let swap_amount = remaining.min(candidate.available);

            if swap_amount.is_zero() {
                warn!("⚠️  Skipping {}: nothing left after reservations", source.key());
                continue;
            }
            if normalize_decimals(swap_amount, source.config.decimals, decimals) < min_trade {
                debug!("Skipping {}: swap {} below minimum trade", source.key(), swap_amount);
                continue;
            }

            let source_token = source.to_quote_token();
            match self
                .router
                .get_quote(wallet, &source_token, &deficit_token, swap_amount)
                .await
            {
                Ok(quote) => {
                    filled = filled.saturating_add(quote.amount_out);
                    quotes.push(quote);
                }
                Err(e @ AppError::Strategy(StrategyError::NoRoute { .. })) => return Err(e),
                Err(e) => {
                    warn!("⚠️  Quote {} -> {} failed: {}", source.key(), deficit.key(), e);
                    self.record_failure(wallet, &source_token, &deficit_token, swap_amount, &e)
                        .await;
                }
            }
        }

        Ok(Fill { quotes, filled })
    }

    async fn record_failure(
        &self,
        wallet: Address,
        token_in: &QuoteToken,
        token_out: &QuoteToken,
        amount: U256,
        error: &AppError,
    ) {
        let strategy = match error {
            AppError::Strategy(StrategyError::ProviderFailed { strategy, .. })
            | AppError::Strategy(StrategyError::Unsupported(strategy)) => Some(*strategy),
            _ => self
                .router
                .select_strategies(wallet)
                .ok()
                .and_then(|strategies| strategies.first().copied()),
        };
        let Some(strategy) = strategy else {
            return;
        };

        self.rejections
            .record(NewQuoteRejection {
                rebalance_id: Uuid::new_v4().to_string(),
                strategy,
                reason: RejectionReason::ProviderError,
                token_in: token_in.clone(),
                token_out: token_out.clone(),
                swap_amount: amount,
                details: Some(serde_json::json!({ "error": error.to_string() })),
                wallet: Some(wallet),
            })
            .await;
    }

    /// Persists a plan as one PENDING group. Quotes moving nothing are
    /// dropped. A partially persisted group is cancelled so it holds no
    /// reservations.
    #[instrument(skip(self, quotes), fields(quotes = quotes.len()))]
    pub async fn store_rebalancing(
        &self,
        wallet: Address,
        quotes: &[RebalanceQuote],
    ) -> AppResult<Vec<RebalanceRecord>> {
        let valid: Vec<RebalanceQuote> = quotes
            .iter()
            .filter(|quote| {
                let keep = !quote.amount_in.is_zero() && !quote.amount_out.is_zero();
                if !keep {
                    warn!(
                        "⚠️  Skipping invalid {} quote (in {}, out {})",
                        quote.strategy, quote.amount_in, quote.amount_out
                    );
                }
                keep
            })
            .cloned()
            .collect();

        if valid.is_empty() {
            return Ok(Vec::new());
        }

        let group_id = Uuid::new_v4().to_string();
        match self
            .rebalances
            .create_batch(wallet, &valid, Some(group_id.clone()))
            .await
        {
            Ok(records) => {
                info!("💾 Stored {} rebalances in group {}", records.len(), group_id);
                Ok(records)
            }
            Err(e) => {
                let cancelled = self.rebalances.cancel_group(&group_id).await?;
                warn!(
                    "⚠️  Group {} only partially stored, cancelled {} records: {}",
                    group_id, cancelled, e
                );
                Err(e)
            }
        }
    }

    /// Executes every PENDING record of a group concurrently and settles
    /// each record's status from its own outcome. Every status write is
    /// attempted; failed writes are reported together afterwards.
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn execute_group(&self, wallet: Address, records: &[RebalanceRecord]) -> AppResult<ExecutionSummary> {
        let pending: Vec<&RebalanceRecord> = records
            .iter()
            .filter(|record| record.status == RebalanceStatus::Pending)
            .collect();

        let outcomes = join_all(pending.iter().map(|record| async move {
            let quote = record.to_quote();
            (record, self.router.execute(wallet, &quote).await)
        }))
        .await;

        let total = outcomes.len();
        let mut unsaved = 0;
        let mut summary = ExecutionSummary::default();
        for (record, outcome) in outcomes {
            let job_id = &record.rebalance_job_id;
            let status = match outcome {
                Ok(receipt) => {
                    info!(
                        "✅ Rebalance {} executed via {} ({:?})",
                        job_id, receipt.strategy, receipt.transaction_hash
                    );
                    summary.completed += 1;
                    RebalanceStatus::Completed
                }
                Err(e) => {
                    warn!("❌ Rebalance {} via {} failed: {}", job_id, record.strategy, e);
                    summary.failed.push((job_id.clone(), e.to_string()));
                    RebalanceStatus::Failed
                }
            };
            if let Err(e) = self.rebalances.update_status(job_id, status).await {
                error!("❌ Could not mark rebalance {} as {:?}: {}", job_id, status, e);
                unsaved += 1;
            }
        }

        if unsaved > 0 {
            return Err(PlanningError::StatusPersist {
                failed: unsaved,
                total,
            }
            .into());
        }
        Ok(summary)
    }
}
