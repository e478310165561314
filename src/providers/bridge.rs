use super::{ExecutionReceipt, QuoteToken, RebalanceProvider, RebalanceQuote, Strategy};
use crate::chain::ChainClient;
use crate::error::{AppResult, StrategyError};
use crate::units::{normalize_decimals, ratio};
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument};

/// Price returned by a third-party rail
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeQuote {
    pub amount_out: U256,
    /// Rail-specific payload needed again at submission time
    pub payload: serde_json::Value,
}

/// Transport to one external bridge or aggregator (LiFi, CCTP, Relay...).
/// Wire formats stay behind this trait.
#[async_trait]
pub trait BridgeApi: Send + Sync {
    async fn quote(
        &self,
        token_in: &QuoteToken,
        token_out: &QuoteToken,
        amount: U256,
    ) -> AppResult<BridgeQuote>;

    /// Signs and broadcasts the source-chain transaction
    async fn submit(&self, wallet: Address, quote: &RebalanceQuote) -> AppResult<B256>;
}

/// `1 - amount_out / amount_in` after aligning decimals, floored at zero
pub fn quote_slippage(token_in: &QuoteToken, token_out: &QuoteToken, amount_in: U256, amount_out: U256) -> Decimal {
    let out_in_input_units = normalize_decimals(amount_out, token_out.decimals, token_in.decimals);
    let received = ratio(out_in_input_units, amount_in);
    (Decimal::ONE - received).max(Decimal::ZERO)
}

/// Generic [`RebalanceProvider`] for every rail reachable through a
/// [`BridgeApi`]
pub struct BridgeProvider {
    strategy: Strategy,
    api: Arc<dyn BridgeApi>,
    chain: Arc<dyn ChainClient>,
}

impl BridgeProvider {
    pub fn new(strategy: Strategy, api: Arc<dyn BridgeApi>, chain: Arc<dyn ChainClient>) -> Self {
        Self {
            strategy,
            api,
            chain,
        }
    }
}

#[async_trait]
impl RebalanceProvider for BridgeProvider {
    fn strategy(&self) -> Strategy {
        self.strategy
    }

    async fn get_quote(
        &self,
        token_in: &QuoteToken,
        token_out: &QuoteToken,
        amount: U256,
        quote_id: &str,
    ) -> AppResult<RebalanceQuote> {
        if amount.is_zero() {
            return Err(StrategyError::InsufficientLiquidity(format!(
                "{} cannot quote a zero amount",
                self.strategy
            ))
            .into());
        }

        let bridge_quote = self.api.quote(token_in, token_out, amount).await?;
        if bridge_quote.amount_out.is_zero() {
            return Err(StrategyError::InsufficientLiquidity(format!(
                "{} returned no output for {} -> {}",
                self.strategy, token_in, token_out
            ))
            .into());
        }

        Ok(RebalanceQuote {
            id: Some(quote_id.to_string()),
            token_in: token_in.clone(),
            token_out: token_out.clone(),
            amount_in: amount,
            amount_out: bridge_quote.amount_out,
            slippage: quote_slippage(token_in, token_out, amount, bridge_quote.amount_out),
            strategy: self.strategy,
            context: bridge_quote.payload,
        })
    }

    #[instrument(skip(self, quote), fields(strategy = %self.strategy))]
    async fn execute(&self, wallet: Address, quote: &RebalanceQuote) -> AppResult<ExecutionReceipt> {
        let tx_hash = self.api.submit(wallet, quote).await?;
        let receipt = self
            .chain
            .wait_for_receipt(quote.token_in.chain_id, tx_hash)
            .await?;

        if !receipt.is_success() {
            return Err(StrategyError::ProviderFailed {
                strategy: self.strategy,
                message: format!("transaction {} reverted", tx_hash),
            }
            .into());
        }

        info!(
            "✅ {} transfer {} confirmed in block {}",
            self.strategy, tx_hash, receipt.block_number
        );
        Ok(ExecutionReceipt {
            strategy: self.strategy,
            transaction_hash: Some(tx_hash),
            details: serde_json::json!({ "blockNumber": receipt.block_number }),
        })
    }
}
