use super::models::*;
use super::repository::RejectionStore;
use crate::error::AppResult;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

pub struct InMemoryRejectionStore {
    records: tokio::sync::RwLock<Vec<QuoteRejectionRecord>>,
}

impl InMemoryRejectionStore {
    pub fn new() -> Self {
        Self {
            records: tokio::sync::RwLock::new(Vec::new()),
        }
    }

    pub async fn all(&self) -> Vec<QuoteRejectionRecord> {
        self.records.read().await.clone()
    }

    /// Inserts a record with an explicit timestamp (backdated history)
    pub async fn insert_at(
        &self,
        rejection: NewQuoteRejection,
        created_at: chrono::DateTime<Utc>,
    ) -> QuoteRejectionRecord {
        let record = QuoteRejectionRecord {
            id: Uuid::new_v4(),
            rejection,
            created_at,
        };
        self.records.write().await.push(record.clone());
        record
    }
}

impl Default for InMemoryRejectionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RejectionStore for InMemoryRejectionStore {
    async fn insert(&self, rejection: &NewQuoteRejection) -> AppResult<QuoteRejectionRecord> {
        Ok(self.insert_at(rejection.clone(), Utc::now()).await)
    }

    async fn recent_rejection_count(&self, window_minutes: i64) -> AppResult<u64> {
        let since = Utc::now() - Duration::minutes(window_minutes);
        let records = self.records.read().await;
        Ok(records.iter().filter(|r| r.created_at >= since).count() as u64)
    }
}
