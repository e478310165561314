use super::models::*;
use super::repository::BalanceStore;
use crate::chain::{ChainClient, ChainId};
use crate::error::{AppError, AppResult};
use alloy_primitives::{Address, U256};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

const NATIVE_DECIMALS: u8 = 18;

/// Counts reported by a refresh cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub token_updates: usize,
    pub native_updates: usize,
    pub failures: usize,
}

/// Event-sourced balance ledger: periodic RPC snapshots reconciled with
/// the incremental change log.
pub struct BalanceLedger {
    store: Arc<dyn BalanceStore>,
}

impl BalanceLedger {
    pub fn new(store: Arc<dyn BalanceStore>) -> Self {
        Self { store }
    }

    /// Conditional write: applies only when no snapshot exists or the new
    /// block is strictly newer. Losing a creation race is not an error.
    #[instrument(skip(self, snapshot), fields(key = %snapshot.key, block = snapshot.block_number))]
    pub async fn upsert_snapshot(&self, snapshot: NewSnapshot) -> AppResult<SnapshotUpsert> {
        if let Some(updated) = self.store.update_snapshot_if_newer(&snapshot).await? {
            debug!("Snapshot advanced to block {}", updated.block_number);
            return Ok(SnapshotUpsert::Updated(updated));
        }

        if let Some(existing) = self.store.find_snapshot(&snapshot.key).await? {
            debug!(
                "Snapshot at block {} not older than {}, skipping",
                existing.block_number, snapshot.block_number
            );
            return Ok(SnapshotUpsert::Unchanged(existing));
        }

        if let Some(created) = self.store.insert_snapshot(&snapshot).await? {
            info!("📒 Created balance snapshot for {}", snapshot.key);
            return Ok(SnapshotUpsert::Created(created));
        }

        // Another refresher created the key between our read and insert
        if let Some(updated) = self.store.update_snapshot_if_newer(&snapshot).await? {
            return Ok(SnapshotUpsert::Updated(updated));
        }
        self.store
            .find_snapshot(&snapshot.key)
            .await?
            .map(SnapshotUpsert::Unchanged)
            .ok_or_else(|| AppError::NotFound(format!("Balance snapshot {}", snapshot.key)))
    }

    /// Appends a transfer to the change log. Returns `None` for a
    /// `(transaction_hash, log_index)` already recorded.
    #[instrument(skip(self, change), fields(key = %change.key(), tx = %change.transaction_hash))]
    pub async fn record_change(&self, change: NewBalanceChange) -> AppResult<Option<BalanceChange>> {
        let stored = self.store.insert_change(&change).await?;
        if stored.is_none() {
            debug!("Duplicate balance change log {} ignored", change.log_index);
        }
        Ok(stored)
    }

    /// Snapshot plus the net of every change at or after `at_block`
    /// (default: the snapshot's own block).
    pub async fn current_balance(
        &self,
        key: &BalanceKey,
        at_block: Option<u64>,
    ) -> AppResult<Option<CurrentBalance>> {
        let Some(read) = self.store.snapshot_with_changes(key, at_block).await? else {
            return Ok(None);
        };
        let totals = read.totals;

        let gross = read.snapshot_balance.saturating_add(totals.incoming);
        let balance = match gross.checked_sub(totals.outgoing) {
            Some(balance) => balance,
            None => {
                warn!(
                    "⚠️  Net balance for {} went negative (snapshot {}, in {}, out {}), clamping to 0",
                    key, read.snapshot_balance, totals.incoming, totals.outgoing
                );
                U256::ZERO
            }
        };

        Ok(Some(CurrentBalance {
            balance,
            block_number: read.block_number,
        }))
    }

    pub async fn latest_snapshots(&self, chain_id: ChainId) -> AppResult<Vec<BalanceSnapshot>> {
        self.store.snapshots_for_chain(chain_id).await
    }

    /// One multicall for the token list plus one native read, each routed
    /// through `upsert_snapshot`. Per-key failures are logged and counted.
    #[instrument(skip(self, client, tokens), fields(wallet = %wallet))]
    pub async fn refresh_from_chain(
        &self,
        client: &dyn ChainClient,
        chain_id: ChainId,
        wallet: Address,
        tokens: &[Address],
    ) -> AppResult<RefreshSummary> {
        let mut summary = RefreshSummary::default();

        if !tokens.is_empty() {
            let balances = client.multicall_balances(chain_id, wallet, tokens).await?;
            for token in tokens {
                let Some(balance) = balances.get(token) else {
                    warn!("No multicall result for {} on chain {}", token, chain_id);
                    summary.failures += 1;
                    continue;
                };
                let snapshot = NewSnapshot {
                    key: BalanceKey::new(chain_id, *token),
                    balance: balance.balance,
                    block_number: balance.block_number,
                    block_hash: balance.block_hash,
                    decimals: balance.decimals,
                    symbol: balance.symbol.clone(),
                    name: balance.name.clone(),
                };
                match self.upsert_snapshot(snapshot).await {
                    Ok(_) => summary.token_updates += 1,
                    Err(e) => {
                        error!("❌ Token snapshot update failed for {}: {:?}", token, e);
                        summary.failures += 1;
                    }
                }
            }
        }

        match client.get_balance(chain_id, wallet).await {
            Ok(native) => {
                let snapshot = NewSnapshot {
                    key: BalanceKey::native(chain_id),
                    balance: native.balance,
                    block_number: native.block_number,
                    block_hash: native.block_hash,
                    decimals: NATIVE_DECIMALS,
                    symbol: "NATIVE".to_string(),
                    name: "Native".to_string(),
                };
                match self.upsert_snapshot(snapshot).await {
                    Ok(_) => summary.native_updates += 1,
                    Err(e) => {
                        error!("❌ Native snapshot update failed on {}: {:?}", chain_id, e);
                        summary.failures += 1;
                    }
                }
            }
            Err(e) => {
                error!("❌ Native balance read failed on {}: {:?}", chain_id, e);
                summary.failures += 1;
            }
        }

        info!(
            "✅ Ledger refresh on chain {}: {} token, {} native, {} failed",
            chain_id, summary.token_updates, summary.native_updates, summary.failures
        );
        Ok(summary)
    }
}
