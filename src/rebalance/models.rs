use alloy_primitives::{Address, U256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::Type;
use std::collections::HashMap;
use uuid::Uuid;

use crate::ledger::BalanceKey;
use crate::providers::{QuoteToken, RebalanceQuote, Strategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "rebalance_status", rename_all = "lowercase")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RebalanceStatus {
    Pending,
    Completed,
    Failed,
}

impl RebalanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RebalanceStatus::Pending)
    }
}

/// Σ amounts of PENDING records per `chainId:token`
pub type Reservations = HashMap<BalanceKey, U256>;

/// Structured input for a single new rebalance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRebalance {
    pub rebalance_job_id: Option<String>,
    pub wallet: Address,
    pub token_in: QuoteToken,
    pub token_out: QuoteToken,
    pub amount_in: U256,
    pub amount_out: U256,
    pub slippage: Decimal,
    pub strategy: Strategy,
    pub group_id: Option<String>,
    pub context: serde_json::Value,
}

impl CreateRebalance {
    pub fn from_quote(wallet: Address, quote: &RebalanceQuote, group_id: Option<String>) -> Self {
        Self {
            rebalance_job_id: quote.id.clone(),
            wallet,
            token_in: quote.token_in.clone(),
            token_out: quote.token_out.clone(),
            amount_in: quote.amount_in,
            amount_out: quote.amount_out,
            slippage: quote.slippage,
            strategy: quote.strategy,
            group_id,
            context: quote.context.clone(),
        }
    }
}

/// Persisted rebalance. Immutable once COMPLETED or FAILED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceRecord {
    pub id: Uuid,
    pub rebalance_job_id: String,
    pub wallet: Address,
    pub token_in: QuoteToken,
    pub token_out: QuoteToken,
    pub amount_in: U256,
    pub amount_out: U256,
    pub slippage: Decimal,
    pub strategy: Strategy,
    pub group_id: Option<String>,
    pub context: serde_json::Value,
    pub status: RebalanceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RebalanceRecord {
    /// New PENDING record; the job id falls back to a fresh uuid
    pub fn pending(input: CreateRebalance) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        Self {
            id,
            rebalance_job_id: input.rebalance_job_id.unwrap_or_else(|| id.to_string()),
            wallet: input.wallet,
            token_in: input.token_in,
            token_out: input.token_out,
            amount_in: input.amount_in,
            amount_out: input.amount_out,
            slippage: input.slippage,
            strategy: input.strategy,
            group_id: input.group_id,
            context: input.context,
            status: RebalanceStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn to_quote(&self) -> RebalanceQuote {
        RebalanceQuote {
            id: Some(self.rebalance_job_id.clone()),
            token_in: self.token_in.clone(),
            token_out: self.token_out.clone(),
            amount_in: self.amount_in,
            amount_out: self.amount_out,
            slippage: self.slippage,
            strategy: self.strategy,
            context: self.context.clone(),
        }
    }
}

/// Sums positive amounts per key, skipping zero legs
pub fn sum_by_key(entries: impl IntoIterator<Item = (BalanceKey, U256)>) -> Reservations {
    let mut totals = Reservations::new();
    for (key, amount) in entries {
        if amount.is_zero() {
            continue;
        }
        let entry = totals.entry(key).or_insert(U256::ZERO);
        *entry = entry.saturating_add(amount);
    }
    totals
}
