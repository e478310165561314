use super::models::*;
use crate::error::{AppError, AppResult, PlanningError};
use crate::ledger::{BalanceKey, TokenAddress};
use crate::providers::{QuoteToken, RebalanceQuote};
use crate::units::{decimal_to_numeric, from_numeric, numeric_to_decimal, to_numeric};
use alloy_primitives::Address;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::{BigDecimal, Json};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Rebalance persistence
///
/// INVARIANTS:
/// - `rebalance_job_id` is unique
/// - status only moves PENDING -> COMPLETED | FAILED
/// - reservation totals are aggregated on every call, never cached
#[async_trait]
pub trait RebalanceStore: Send + Sync {
    /// Persists a fully-built record as given
    async fn insert_record(&self, record: &RebalanceRecord) -> AppResult<RebalanceRecord>;

    /// Moves a PENDING record to a terminal status. Repeating the same
    /// terminal status is a no-op, any other transition is rejected.
    async fn update_status(
        &self,
        rebalance_job_id: &str,
        status: RebalanceStatus,
    ) -> AppResult<RebalanceRecord>;

    async fn pending_reserved(&self, wallet: Address) -> AppResult<Reservations>;

    async fn pending_incoming(&self, wallet: Address) -> AppResult<Reservations>;

    async fn find_by_group(&self, group_id: &str) -> AppResult<Vec<RebalanceRecord>>;

    /// Fails every PENDING record of the group, returning how many moved
    async fn cancel_group(&self, group_id: &str) -> AppResult<u64>;

    /// COMPLETED records whose last update falls inside the window
    async fn recent_success_count(&self, window_minutes: i64) -> AppResult<u64>;

    /// Builds a PENDING record from structured input and persists it
    async fn create(&self, input: CreateRebalance) -> AppResult<RebalanceRecord> {
        info!(
            "💾 Persisting rebalance {} {} -> {} (group {:?})",
            input.strategy, input.token_in, input.token_out, input.group_id
        );
        self.insert_record(&RebalanceRecord::pending(input)).await
    }

    /// Sequential so the failure count is deterministic. Successes stay
    /// persisted even when the batch as a whole reports an error.
    async fn create_batch(
        &self,
        wallet: Address,
        quotes: &[RebalanceQuote],
        group_id: Option<String>,
    ) -> AppResult<Vec<RebalanceRecord>> {
        let group_id = group_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        info!(
            "📦 Creating batch of {} rebalances for {} (group {})",
            quotes.len(),
            wallet,
            group_id
        );

        let mut created = Vec::with_capacity(quotes.len());
        let mut failed = 0usize;

        for quote in quotes {
            let input = CreateRebalance::from_quote(wallet, quote, Some(group_id.clone()));
            match self.create(input).await {
                Ok(record) => created.push(record),
                Err(e) => {
                    error!("❌ Failed to persist rebalance in group {}: {:?}", group_id, e);
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(PlanningError::BatchPersist {
                failed,
                total: quotes.len(),
            }
            .into());
        }

        info!("✅ Stored {} rebalances in group {}", created.len(), group_id);
        Ok(created)
    }
}

#[derive(FromRow)]
struct RebalanceRow {
    id: Uuid,
    rebalance_job_id: String,
    wallet_address: String,
    token_in: Json<QuoteToken>,
    token_out: Json<QuoteToken>,
    amount_in: BigDecimal,
    amount_out: BigDecimal,
    slippage: BigDecimal,
    strategy: String,
    group_id: Option<String>,
    context: serde_json::Value,
    status: RebalanceStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RebalanceRow> for RebalanceRecord {
    type Error = AppError;

    fn try_from(row: RebalanceRow) -> Result<Self, Self::Error> {
        Ok(RebalanceRecord {
            id: row.id,
            rebalance_job_id: row.rebalance_job_id,
            wallet: Address::from_str(&row.wallet_address)
                .map_err(|_| AppError::InvalidInput(format!("wallet {}", row.wallet_address)))?,
            token_in: row.token_in.0,
            token_out: row.token_out.0,
            amount_in: from_numeric(&row.amount_in)?,
            amount_out: from_numeric(&row.amount_out)?,
            slippage: numeric_to_decimal(&row.slippage),
            strategy: row.strategy.parse()?,
            group_id: row.group_id,
            context: row.context,
            status: row.status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const REBALANCE_COLUMNS: &str = "id, rebalance_job_id, wallet_address, token_in, token_out, \
     amount_in, amount_out, slippage, strategy, group_id, context, status, created_at, updated_at";

fn wallet_key(wallet: Address) -> String {
    wallet.to_string().to_lowercase()
}

pub struct PgRebalanceStore {
    pub pool: PgPool,
}

impl PgRebalanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_by_job_id(&self, rebalance_job_id: &str) -> AppResult<Option<RebalanceRecord>> {
        let row = sqlx::query_as::<_, RebalanceRow>(&format!(
            "SELECT {} FROM rebalances WHERE rebalance_job_id = $1",
            REBALANCE_COLUMNS
        ))
        .bind(rebalance_job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RebalanceRecord::try_from).transpose()
    }

    async fn pending_sums(&self, wallet: Address, side: &str) -> AppResult<Reservations> {
        // `side` is one of two fixed column prefixes, never caller input
        let query = format!(
            r#"
            SELECT token_{side}_chain_id, token_{side}_address, SUM(amount_{side})
            FROM rebalances
            WHERE wallet_address = $1 AND status = 'pending' AND amount_{side} > 0
            GROUP BY token_{side}_chain_id, token_{side}_address
            "#,
            side = side
        );
        let rows: Vec<(i64, String, BigDecimal)> = sqlx::query_as(&query)
            .bind(wallet_key(wallet))
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (chain_id, token, amount) in rows {
            let token: TokenAddress = token.parse()?;
            entries.push((BalanceKey::new(chain_id as u64, token), from_numeric(&amount)?));
        }
        Ok(sum_by_key(entries))
    }
}

#[async_trait]
impl RebalanceStore for PgRebalanceStore {
    async fn insert_record(&self, record: &RebalanceRecord) -> AppResult<RebalanceRecord> {
        let row = sqlx::query_as::<_, RebalanceRow>(&format!(
            r#"
            INSERT INTO rebalances (
                id, rebalance_job_id, wallet_address, token_in, token_out,
                token_in_chain_id, token_in_address, token_out_chain_id, token_out_address,
                amount_in, amount_out, slippage, strategy, group_id, context, status,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            RETURNING {}
            "#,
            REBALANCE_COLUMNS
        ))
        .bind(record.id)
        .bind(&record.rebalance_job_id)
        .bind(wallet_key(record.wallet))
        .bind(Json(&record.token_in))
        .bind(Json(&record.token_out))
        .bind(record.token_in.chain_id as i64)
        .bind(record.token_in.token.to_string())
        .bind(record.token_out.chain_id as i64)
        .bind(record.token_out.token.to_string())
        .bind(to_numeric(record.amount_in))
        .bind(to_numeric(record.amount_out))
        .bind(decimal_to_numeric(record.slippage))
        .bind(record.strategy.as_str())
        .bind(&record.group_id)
        .bind(&record.context)
        .bind(record.status)
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await?;

        RebalanceRecord::try_from(row)
    }

    async fn update_status(
        &self,
        rebalance_job_id: &str,
        status: RebalanceStatus,
    ) -> AppResult<RebalanceRecord> {
        let row = sqlx::query_as::<_, RebalanceRow>(&format!(
            r#"
            UPDATE rebalances
            SET status = $2, updated_at = NOW()
            WHERE rebalance_job_id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            REBALANCE_COLUMNS
        ))
        .bind(rebalance_job_id)
        .bind(status)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return RebalanceRecord::try_from(row);
        }

        match self.find_by_job_id(rebalance_job_id).await? {
            Some(existing) if existing.status == status => Ok(existing),
            Some(existing) => {
                warn!(
                    "Refusing {:?} for rebalance {} already {:?}",
                    status, rebalance_job_id, existing.status
                );
                Err(PlanningError::TerminalRecord(rebalance_job_id.to_string()).into())
            }
            None => Err(AppError::NotFound(format!("Rebalance {}", rebalance_job_id))),
        }
    }

    async fn pending_reserved(&self, wallet: Address) -> AppResult<Reservations> {
        self.pending_sums(wallet, "in").await
    }

    async fn pending_incoming(&self, wallet: Address) -> AppResult<Reservations> {
        self.pending_sums(wallet, "out").await
    }

    async fn find_by_group(&self, group_id: &str) -> AppResult<Vec<RebalanceRecord>> {
        let rows = sqlx::query_as::<_, RebalanceRow>(&format!(
            "SELECT {} FROM rebalances WHERE group_id = $1 ORDER BY created_at",
            REBALANCE_COLUMNS
        ))
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RebalanceRecord::try_from).collect()
    }

    async fn cancel_group(&self, group_id: &str) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE rebalances
            SET status = 'failed', updated_at = NOW()
            WHERE group_id = $1 AND status = 'pending'
            "#,
        )
        .bind(group_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn recent_success_count(&self, window_minutes: i64) -> AppResult<u64> {
        let since = Utc::now() - Duration::minutes(window_minutes);
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM rebalances WHERE status = 'completed' AND updated_at >= $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }
}
