pub mod bridge;
pub mod router;
#[cfg(test)]
pub mod testing;

pub use bridge::{BridgeApi, BridgeProvider, BridgeQuote};
pub use router::ProviderRouter;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::chain::ChainId;
use crate::error::{AppError, AppResult};
use crate::ledger::{BalanceKey, TokenAddress};

/// Named, pluggable rebalancing rail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    LiFi,
    #[serde(rename = "CCTP")]
    Cctp,
    #[serde(rename = "CCTPV2")]
    CctpV2,
    #[serde(rename = "CCTPLiFi")]
    CctpLiFi,
    WarpRoute,
    Relay,
    Stargate,
    Squid,
    Everclear,
    NegativeIntent,
}

impl Strategy {
    pub const ALL: [Strategy; 10] = [
        Strategy::LiFi,
        Strategy::Cctp,
        Strategy::CctpV2,
        Strategy::CctpLiFi,
        Strategy::WarpRoute,
        Strategy::Relay,
        Strategy::Stargate,
        Strategy::Squid,
        Strategy::Everclear,
        Strategy::NegativeIntent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::LiFi => "LiFi",
            Strategy::Cctp => "CCTP",
            Strategy::CctpV2 => "CCTPV2",
            Strategy::CctpLiFi => "CCTPLiFi",
            Strategy::WarpRoute => "WarpRoute",
            Strategy::Relay => "Relay",
            Strategy::Stargate => "Stargate",
            Strategy::Squid => "Squid",
            Strategy::Everclear => "Everclear",
            Strategy::NegativeIntent => "NegativeIntent",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Strategy::ALL
            .iter()
            .copied()
            .find(|strategy| strategy.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| AppError::InvalidInput(format!("Unknown strategy: {}", s)))
    }
}

/// One side of a quote: where the token lives, what the wallet holds and
/// what it should hold. Persisted as-is on rebalance and rejection records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteToken {
    pub chain_id: ChainId,
    pub token: TokenAddress,
    pub decimals: u8,
    pub symbol: String,
    pub balance: U256,
    pub target_balance: U256,
}

impl QuoteToken {
    pub fn key(&self) -> BalanceKey {
        BalanceKey {
            chain_id: self.chain_id,
            token: self.token,
        }
    }
}

impl fmt::Display for QuoteToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}({})", self.chain_id, self.token, self.symbol)
    }
}

/// A priced move produced by a provider. `context` is strategy-specific.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceQuote {
    pub id: Option<String>,
    pub token_in: QuoteToken,
    pub token_out: QuoteToken,
    pub amount_in: U256,
    pub amount_out: U256,
    pub slippage: Decimal,
    pub strategy: Strategy,
    pub context: serde_json::Value,
}

impl RebalanceQuote {
    pub fn is_same_chain(&self) -> bool {
        self.token_in.chain_id == self.token_out.chain_id
    }
}

/// Outcome of a provider execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReceipt {
    pub strategy: Strategy,
    pub transaction_hash: Option<B256>,
    pub details: serde_json::Value,
}

/// Rebalance rail implemented once per strategy
///
/// INVARIANTS:
/// - `get_quote` never moves funds
/// - `execute` only accepts quotes this provider produced
#[async_trait]
pub trait RebalanceProvider: Send + Sync {
    fn strategy(&self) -> Strategy;

    async fn get_quote(
        &self,
        token_in: &QuoteToken,
        token_out: &QuoteToken,
        amount: U256,
        quote_id: &str,
    ) -> AppResult<RebalanceQuote>;

    async fn execute(&self, wallet: Address, quote: &RebalanceQuote) -> AppResult<ExecutionReceipt>;
}
