use super::models::*;
use crate::error::{AppResult, LedgerError};
use crate::units::{from_numeric, to_numeric};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::BigDecimal;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use uuid::Uuid;

/// Persistence contract for snapshots and the change log.
///
/// INVARIANTS:
/// - at most one snapshot per (chain, token)
/// - `update_snapshot_if_newer` is a compare-and-swap on block number
/// - change events are unique on (transaction_hash, log_index)
/// - `snapshot_with_changes` reads the snapshot and aggregates the change
///   log in one consistent read inside the store
#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn find_snapshot(&self, key: &BalanceKey) -> AppResult<Option<BalanceSnapshot>>;

    /// Returns `None` when no row exists or the stored block is not older.
    async fn update_snapshot_if_newer(
        &self,
        snapshot: &NewSnapshot,
    ) -> AppResult<Option<BalanceSnapshot>>;

    /// Returns `None` when another writer created the key first.
    async fn insert_snapshot(&self, snapshot: &NewSnapshot) -> AppResult<Option<BalanceSnapshot>>;

    async fn snapshots_for_chain(&self, chain_id: u64) -> AppResult<Vec<BalanceSnapshot>>;

    /// Returns `None` for a duplicate (transaction_hash, log_index).
    async fn insert_change(&self, change: &NewBalanceChange) -> AppResult<Option<BalanceChange>>;

    /// `None` without a snapshot. Changes count from `at_block`, or from
    /// the snapshot's own block when absent.
    async fn snapshot_with_changes(
        &self,
        key: &BalanceKey,
        at_block: Option<u64>,
    ) -> AppResult<Option<SnapshotTotals>>;
}

#[derive(FromRow)]
struct SnapshotRow {
    chain_id: i64,
    token_address: String,
    balance: BigDecimal,
    block_number: i64,
    block_hash: String,
    decimals: i16,
    symbol: String,
    name: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SnapshotRow> for BalanceSnapshot {
    type Error = LedgerError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        Ok(BalanceSnapshot {
            chain_id: row.chain_id as u64,
            token: row.token_address.parse()?,
            balance: from_numeric(&row.balance)?,
            block_number: row.block_number as u64,
            block_hash: parse_hash(&row.block_hash)?,
            decimals: row.decimals as u8,
            symbol: row.symbol,
            name: row.name,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct ChangeRow {
    id: Uuid,
    chain_id: i64,
    token_address: String,
    amount: BigDecimal,
    direction: ChangeDirection,
    block_number: i64,
    block_hash: String,
    transaction_hash: String,
    log_index: i64,
    from_address: Option<String>,
    to_address: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ChangeRow> for BalanceChange {
    type Error = LedgerError;

    fn try_from(row: ChangeRow) -> Result<Self, Self::Error> {
        Ok(BalanceChange {
            id: row.id,
            change: NewBalanceChange {
                chain_id: row.chain_id as u64,
                token: row.token_address.parse()?,
                amount: from_numeric(&row.amount)?,
                direction: row.direction,
                block_number: row.block_number as u64,
                block_hash: parse_hash(&row.block_hash)?,
                transaction_hash: parse_hash(&row.transaction_hash)?,
                log_index: row.log_index as u64,
                from: row.from_address.as_deref().map(parse_address).transpose()?,
                to: row.to_address.as_deref().map(parse_address).transpose()?,
            },
            created_at: row.created_at,
        })
    }
}

fn parse_hash(raw: &str) -> Result<B256, LedgerError> {
    B256::from_str(raw).map_err(|_| LedgerError::InvalidAmount(format!("bad hash {}", raw)))
}

fn parse_address(raw: &str) -> Result<Address, LedgerError> {
    Address::from_str(raw).map_err(|_| LedgerError::InvalidTokenAddress(raw.to_string()))
}

const SNAPSHOT_COLUMNS: &str = "chain_id, token_address, balance, block_number, block_hash, \
     decimals, symbol, name, updated_at";

/// Postgres-backed balance ledger storage
pub struct PgBalanceStore {
    pub pool: PgPool,
}

impl PgBalanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BalanceStore for PgBalanceStore {
    async fn find_snapshot(&self, key: &BalanceKey) -> AppResult<Option<BalanceSnapshot>> {
        let row = sqlx::query_as::<_, SnapshotRow>(&format!(
            "SELECT {} FROM balance_snapshots WHERE chain_id = $1 AND token_address = $2",
            SNAPSHOT_COLUMNS
        ))
        .bind(key.chain_id as i64)
        .bind(key.token.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(BalanceSnapshot::try_from).transpose()?)
    }

    async fn update_snapshot_if_newer(
        &self,
        snapshot: &NewSnapshot,
    ) -> AppResult<Option<BalanceSnapshot>> {
        // The block_number predicate makes this a CAS: concurrent refreshers
        // can never move a snapshot backwards.
        let row = sqlx::query_as::<_, SnapshotRow>(&format!(
            r#"
            UPDATE balance_snapshots
            SET balance = $3, block_number = $4, block_hash = $5,
                decimals = $6, symbol = $7, name = $8, updated_at = NOW()
            WHERE chain_id = $1 AND token_address = $2 AND block_number < $4
            RETURNING {}
            "#,
            SNAPSHOT_COLUMNS
        ))
        .bind(snapshot.key.chain_id as i64)
        .bind(snapshot.key.token.to_string())
        .bind(to_numeric(snapshot.balance))
        .bind(snapshot.block_number as i64)
        .bind(snapshot.block_hash.to_string())
        .bind(snapshot.decimals as i16)
        .bind(&snapshot.symbol)
        .bind(&snapshot.name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(BalanceSnapshot::try_from).transpose()?)
    }

    async fn insert_snapshot(&self, snapshot: &NewSnapshot) -> AppResult<Option<BalanceSnapshot>> {
        let row = sqlx::query_as::<_, SnapshotRow>(&format!(
            r#"
            INSERT INTO balance_snapshots
                (chain_id, token_address, balance, block_number, block_hash, decimals, symbol, name)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (chain_id, token_address) DO NOTHING
            RETURNING {}
            "#,
            SNAPSHOT_COLUMNS
        ))
        .bind(snapshot.key.chain_id as i64)
        .bind(snapshot.key.token.to_string())
        .bind(to_numeric(snapshot.balance))
        .bind(snapshot.block_number as i64)
        .bind(snapshot.block_hash.to_string())
        .bind(snapshot.decimals as i16)
        .bind(&snapshot.symbol)
        .bind(&snapshot.name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(BalanceSnapshot::try_from).transpose()?)
    }

    async fn snapshots_for_chain(&self, chain_id: u64) -> AppResult<Vec<BalanceSnapshot>> {
        let rows = sqlx::query_as::<_, SnapshotRow>(&format!(
            "SELECT {} FROM balance_snapshots WHERE chain_id = $1 ORDER BY token_address",
            SNAPSHOT_COLUMNS
        ))
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        let snapshots = rows
            .into_iter()
            .map(BalanceSnapshot::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(snapshots)
    }

    async fn insert_change(&self, change: &NewBalanceChange) -> AppResult<Option<BalanceChange>> {
        let row = sqlx::query_as::<_, ChangeRow>(
            r#"
            INSERT INTO balance_changes (
                id, chain_id, token_address, amount, direction, block_number,
                block_hash, transaction_hash, log_index, from_address, to_address
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (transaction_hash, log_index) DO NOTHING
            RETURNING
                id, chain_id, token_address, amount, direction, block_number,
                block_hash, transaction_hash, log_index, from_address, to_address, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(change.chain_id as i64)
        .bind(change.token.to_string())
        .bind(to_numeric(change.amount))
        .bind(change.direction)
        .bind(change.block_number as i64)
        .bind(change.block_hash.to_string())
        .bind(change.transaction_hash.to_string())
        .bind(change.log_index as i64)
        .bind(change.from.map(|a| a.to_string().to_lowercase()))
        .bind(change.to.map(|a| a.to_string().to_lowercase()))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(BalanceChange::try_from).transpose()?)
    }

    async fn snapshot_with_changes(
        &self,
        key: &BalanceKey,
        at_block: Option<u64>,
    ) -> AppResult<Option<SnapshotTotals>> {
        // Single statement so a concurrent refresh cannot slip between the
        // snapshot read and the change sums
        let row: Option<(BigDecimal, i64, BigDecimal, BigDecimal)> = sqlx::query_as(
            r#"
            SELECT
                s.balance,
                s.block_number,
                COALESCE(SUM(c.amount) FILTER (WHERE c.direction = 'incoming'), 0) AS incoming,
                COALESCE(SUM(c.amount) FILTER (WHERE c.direction = 'outgoing'), 0) AS outgoing
            FROM balance_snapshots s
            LEFT JOIN balance_changes c
                ON c.chain_id = s.chain_id
                AND c.token_address = s.token_address
                AND c.block_number >= COALESCE($3::BIGINT, s.block_number)
            WHERE s.chain_id = $1 AND s.token_address = $2
            GROUP BY s.balance, s.block_number
            "#,
        )
        .bind(key.chain_id as i64)
        .bind(key.token.to_string())
        .bind(at_block.map(|block| block as i64))
        .fetch_optional(&self.pool)
        .await?;

        let Some((balance, block_number, incoming, outgoing)) = row else {
            return Ok(None);
        };
        Ok(Some(SnapshotTotals {
            snapshot_balance: from_numeric(&balance)?,
            block_number: block_number as u64,
            totals: ChangeTotals {
                incoming: from_numeric(&incoming)?,
                outgoing: from_numeric(&outgoing)?,
            },
        }))
    }
}
