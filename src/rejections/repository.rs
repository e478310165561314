use super::models::*;
use crate::error::{AppError, AppResult};
use crate::units::to_numeric;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[async_trait]
pub trait RejectionStore: Send + Sync {
    async fn insert(&self, rejection: &NewQuoteRejection) -> AppResult<QuoteRejectionRecord>;

    /// Rejections created within the last `window_minutes`
    async fn recent_rejection_count(&self, window_minutes: i64) -> AppResult<u64>;
}

pub struct PgRejectionStore {
    pub pool: PgPool,
}

impl PgRejectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RejectionStore for PgRejectionStore {
    async fn insert(&self, rejection: &NewQuoteRejection) -> AppResult<QuoteRejectionRecord> {
        let (id, created_at): (Uuid, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO quote_rejections (
                id, rebalance_id, strategy, reason, token_in, token_out,
                swap_amount, details, wallet_address
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&rejection.rebalance_id)
        .bind(rejection.strategy.as_str())
        .bind(rejection.reason)
        .bind(serde_json::to_value(&rejection.token_in)?)
        .bind(serde_json::to_value(&rejection.token_out)?)
        .bind(to_numeric(rejection.swap_amount))
        .bind(&rejection.details)
        .bind(rejection.wallet.map(|w| w.to_string().to_lowercase()))
        .fetch_one(&self.pool)
        .await?;

        Ok(QuoteRejectionRecord {
            id,
            rejection: rejection.clone(),
            created_at,
        })
    }

    async fn recent_rejection_count(&self, window_minutes: i64) -> AppResult<u64> {
        let since = Utc::now() - Duration::minutes(window_minutes);
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM quote_rejections WHERE created_at >= $1")
                .bind(since)
                .fetch_one(&self.pool)
                .await?;

        u64::try_from(count).map_err(|_| AppError::Internal(format!("negative count {}", count)))
    }
}
