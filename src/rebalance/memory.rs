use super::models::*;
use super::repository::RebalanceStore;
use crate::error::{AppError, AppResult, PlanningError};
use crate::ledger::BalanceKey;
use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

/// Process-local rebalance storage keyed by record id
pub struct InMemoryRebalanceStore {
    records: tokio::sync::RwLock<HashMap<Uuid, RebalanceRecord>>,
    failing_inserts: AtomicUsize,
    failing_updates: AtomicUsize,
}

impl InMemoryRebalanceStore {
    pub fn new() -> Self {
        Self {
            records: tokio::sync::RwLock::new(HashMap::new()),
            failing_inserts: AtomicUsize::new(0),
            failing_updates: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` inserts fail, for exercising partial batches
    pub fn fail_next_inserts(&self, count: usize) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_status_updates(&self, count: usize) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    pub async fn all(&self) -> Vec<RebalanceRecord> {
        let mut records: Vec<RebalanceRecord> =
            self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Rewrites `updated_at`, for backdating history
    pub async fn set_updated_at(&self, rebalance_job_id: &str, at: DateTime<Utc>) {
        let mut records = self.records.write().await;
        if let Some(record) = records
            .values_mut()
            .find(|r| r.rebalance_job_id == rebalance_job_id)
        {
            record.updated_at = at;
        }
    }

    async fn pending_sums(
        &self,
        wallet: Address,
        side: impl Fn(&RebalanceRecord) -> (BalanceKey, U256),
    ) -> Reservations {
        let records = self.records.read().await;
        sum_by_key(
            records
                .values()
                .filter(|r| r.wallet == wallet && r.status == RebalanceStatus::Pending)
                .map(side),
        )
    }
}

impl Default for InMemoryRebalanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RebalanceStore for InMemoryRebalanceStore {
    async fn insert_record(&self, record: &RebalanceRecord) -> AppResult<RebalanceRecord> {
        let should_fail = self
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(AppError::Internal("simulated insert failure".to_string()));
        }

        let mut records = self.records.write().await;
        if records
            .values()
            .any(|r| r.rebalance_job_id == record.rebalance_job_id)
        {
            return Err(AppError::InvalidInput(format!(
                "Duplicate rebalance job id {}",
                record.rebalance_job_id
            )));
        }
        records.insert(record.id, record.clone());
        Ok(record.clone())
    }

    async fn update_status(
        &self,
        rebalance_job_id: &str,
        status: RebalanceStatus,
    ) -> AppResult<RebalanceRecord> {
        let should_fail = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(AppError::Internal("simulated status update failure".to_string()));
        }

        let mut records = self.records.write().await;
        let record = records
            .values_mut()
            .find(|r| r.rebalance_job_id == rebalance_job_id)
            .ok_or_else(|| AppError::NotFound(format!("Rebalance {}", rebalance_job_id)))?;

        if record.status == RebalanceStatus::Pending {
            record.status = status;
            record.updated_at = Utc::now();
            return Ok(record.clone());
        }
        if record.status == status {
            return Ok(record.clone());
        }
        Err(PlanningError::TerminalRecord(rebalance_job_id.to_string()).into())
    }

    async fn pending_reserved(&self, wallet: Address) -> AppResult<Reservations> {
        Ok(self
            .pending_sums(wallet, |r| (r.token_in.key(), r.amount_in))
            .await)
    }

    async fn pending_incoming(&self, wallet: Address) -> AppResult<Reservations> {
        Ok(self
            .pending_sums(wallet, |r| (r.token_out.key(), r.amount_out))
            .await)
    }

    async fn find_by_group(&self, group_id: &str) -> AppResult<Vec<RebalanceRecord>> {
        let records = self.records.read().await;
        let mut group: Vec<RebalanceRecord> = records
            .values()
            .filter(|r| r.group_id.as_deref() == Some(group_id))
            .cloned()
            .collect();
        group.sort_by_key(|r| r.created_at);
        Ok(group)
    }

    async fn cancel_group(&self, group_id: &str) -> AppResult<u64> {
        let mut records = self.records.write().await;
        let now = Utc::now();
        let mut cancelled = 0;
        for record in records.values_mut().filter(|r| {
            r.group_id.as_deref() == Some(group_id) && r.status == RebalanceStatus::Pending
        }) {
            record.status = RebalanceStatus::Failed;
            record.updated_at = now;
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn recent_success_count(&self, window_minutes: i64) -> AppResult<u64> {
        let since = Utc::now() - Duration::minutes(window_minutes);
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| r.status == RebalanceStatus::Completed && r.updated_at >= since)
            .count() as u64)
    }
}
