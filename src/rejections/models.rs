use alloy_primitives::{Address, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;
use uuid::Uuid;

use crate::providers::{QuoteToken, Strategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "rejection_reason", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionReason {
    HighSlippage,
    ProviderError,
    InsufficientLiquidity,
    Timeout,
}

/// Rejected quote, written for diagnostics and health only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewQuoteRejection {
    pub rebalance_id: String,
    pub strategy: Strategy,
    pub reason: RejectionReason,
    pub token_in: QuoteToken,
    pub token_out: QuoteToken,
    pub swap_amount: U256,
    pub details: Option<serde_json::Value>,
    pub wallet: Option<Address>,
}

/// Append-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRejectionRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub rejection: NewQuoteRejection,
    pub created_at: DateTime<Utc>,
}
