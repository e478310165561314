use super::models::*;
use super::repository::BalanceStore;
use crate::error::AppResult;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use uuid::Uuid;

/// Process-local ledger storage with the same uniqueness and CAS rules as
/// the Postgres store
pub struct InMemoryBalanceStore {
    snapshots: tokio::sync::RwLock<HashMap<BalanceKey, BalanceSnapshot>>,
    changes: tokio::sync::RwLock<Vec<BalanceChange>>,
}

impl InMemoryBalanceStore {
    pub fn new() -> Self {
        Self {
            snapshots: tokio::sync::RwLock::new(HashMap::new()),
            changes: tokio::sync::RwLock::new(Vec::new()),
        }
    }

    pub async fn change_count(&self) -> usize {
        self.changes.read().await.len()
    }
}

impl Default for InMemoryBalanceStore {
    fn default() -> Self {
        Self::new()
    }
}

fn materialize(snapshot: &NewSnapshot) -> BalanceSnapshot {
    BalanceSnapshot {
        chain_id: snapshot.key.chain_id,
        token: snapshot.key.token,
        balance: snapshot.balance,
        block_number: snapshot.block_number,
        block_hash: snapshot.block_hash,
        decimals: snapshot.decimals,
        symbol: snapshot.symbol.clone(),
        name: snapshot.name.clone(),
        updated_at: Utc::now(),
    }
}

#[async_trait]
impl BalanceStore for InMemoryBalanceStore {
    async fn find_snapshot(&self, key: &BalanceKey) -> AppResult<Option<BalanceSnapshot>> {
        Ok(self.snapshots.read().await.get(key).cloned())
    }

    async fn update_snapshot_if_newer(
        &self,
        snapshot: &NewSnapshot,
    ) -> AppResult<Option<BalanceSnapshot>> {
        let mut snapshots = self.snapshots.write().await;
        match snapshots.get_mut(&snapshot.key) {
            Some(stored) if stored.block_number < snapshot.block_number => {
                *stored = materialize(snapshot);
                Ok(Some(stored.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn insert_snapshot(&self, snapshot: &NewSnapshot) -> AppResult<Option<BalanceSnapshot>> {
        let mut snapshots = self.snapshots.write().await;
        if snapshots.contains_key(&snapshot.key) {
            return Ok(None);
        }
        let created = materialize(snapshot);
        snapshots.insert(snapshot.key, created.clone());
        Ok(Some(created))
    }

    async fn snapshots_for_chain(&self, chain_id: u64) -> AppResult<Vec<BalanceSnapshot>> {
        let snapshots = self.snapshots.read().await;
        let mut result: Vec<BalanceSnapshot> = snapshots
            .values()
            .filter(|s| s.chain_id == chain_id)
            .cloned()
            .collect();
        result.sort_by_key(|s| s.token);
        Ok(result)
    }

    async fn insert_change(&self, change: &NewBalanceChange) -> AppResult<Option<BalanceChange>> {
        let mut changes = self.changes.write().await;
        let duplicate = changes.iter().any(|c| {
            c.change.transaction_hash == change.transaction_hash
                && c.change.log_index == change.log_index
        });
        if duplicate {
            return Ok(None);
        }
        let stored = BalanceChange {
            id: Uuid::new_v4(),
            change: change.clone(),
            created_at: Utc::now(),
        };
        changes.push(stored.clone());
        Ok(Some(stored))
    }

    async fn snapshot_with_changes(
        &self,
        key: &BalanceKey,
        at_block: Option<u64>,
    ) -> AppResult<Option<SnapshotTotals>> {
        // Both guards held so the pair is read as of one instant
        let snapshots = self.snapshots.read().await;
        let changes = self.changes.read().await;

        let Some(snapshot) = snapshots.get(key) else {
            return Ok(None);
        };
        let from_block = at_block.unwrap_or(snapshot.block_number);
        let totals = changes
            .iter()
            .filter(|c| c.change.key() == *key && c.change.block_number >= from_block)
            .fold(ChangeTotals::default(), |mut totals, c| {
                match c.change.direction {
                    ChangeDirection::Incoming => {
                        totals.incoming = totals.incoming.saturating_add(c.change.amount)
                    }
                    ChangeDirection::Outgoing => {
                        totals.outgoing = totals.outgoing.saturating_add(c.change.amount)
                    }
                }
                totals
            });

        Ok(Some(SnapshotTotals {
            snapshot_balance: snapshot.balance,
            block_number: snapshot.block_number,
            totals,
        }))
    }
}
