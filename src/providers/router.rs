use super::{ExecutionReceipt, QuoteToken, RebalanceProvider, RebalanceQuote, Strategy};
use crate::error::{AppError, AppResult, StrategyError};
use crate::rejections::{NewQuoteRejection, RejectionReason, RejectionRecorder};
use alloy_primitives::{Address, U256};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Which strategies a wallet may use, and the quote acceptance bound
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// The crowd-liquidity pool wallet, restricted to `pool_strategies`
    pub pool_wallet: Option<Address>,
    pub pool_strategies: Vec<Strategy>,
    pub default_strategies: Vec<Strategy>,
    pub max_quote_slippage: Decimal,
}

/// Routes quote requests and executions to the registered providers.
///
/// Strategies are tried in configured order and the first acceptable
/// quote wins.
pub struct ProviderRouter {
    providers: HashMap<Strategy, Arc<dyn RebalanceProvider>>,
    config: RouterConfig,
    rejections: RejectionRecorder,
}

impl ProviderRouter {
    pub fn new(config: RouterConfig, rejections: RejectionRecorder) -> Self {
        Self {
            providers: HashMap::new(),
            config,
            rejections,
        }
    }

    /// Only call this during wiring
    pub fn register_provider(&mut self, provider: Arc<dyn RebalanceProvider>) {
        info!("Registering rebalance provider: {}", provider.strategy());
        self.providers.insert(provider.strategy(), provider);
    }

    pub fn registered_strategies(&self) -> Vec<Strategy> {
        self.providers.keys().copied().collect()
    }

    pub fn supports(&self, strategy: Strategy) -> bool {
        self.providers.contains_key(&strategy)
    }

    pub fn select_strategies(&self, wallet: Address) -> AppResult<Vec<Strategy>> {
        let (wallet_type, strategies) = if self.config.pool_wallet == Some(wallet) {
            ("crowd-liquidity-pool", &self.config.pool_strategies)
        } else {
            ("eco-wallet", &self.config.default_strategies)
        };

        if strategies.is_empty() {
            return Err(StrategyError::NoStrategiesConfigured(wallet_type.to_string()).into());
        }
        Ok(strategies.clone())
    }

    #[instrument(skip(self, token_in, token_out), fields(token_in = %token_in, token_out = %token_out))]
    pub async fn get_quote(
        &self,
        wallet: Address,
        token_in: &QuoteToken,
        token_out: &QuoteToken,
        amount: U256,
    ) -> AppResult<RebalanceQuote> {
        let strategies = self.select_strategies(wallet)?;
        let quote_id = Uuid::new_v4().to_string();

        info!(
            "🔎 Quoting {} {} -> {} across {:?}",
            amount, token_in, token_out, strategies
        );

        for strategy in strategies {
            let quote = match self.quote_strategy(strategy, token_in, token_out, amount, &quote_id).await {
                Ok(quote) => quote,
                Err(e) => {
                    error!("❌ Unable to get quote from {}: {}", strategy, e);
                    self.reject(
                        &quote_id,
                        strategy,
                        RejectionReason::ProviderError,
                        wallet,
                        token_in,
                        token_out,
                        amount,
                        serde_json::json!({ "error": e.to_string() }),
                    )
                    .await;
                    continue;
                }
            };

            if quote.slippage > self.config.max_quote_slippage {
                let rejected = StrategyError::SlippageTooHigh {
                    slippage: quote.slippage.to_string(),
                    max: self.config.max_quote_slippage.to_string(),
                };
                warn!("⚠️  {} quote rejected: {}", strategy, rejected);
                self.reject(
                    &quote_id,
                    strategy,
                    RejectionReason::HighSlippage,
                    wallet,
                    token_in,
                    token_out,
                    amount,
                    serde_json::json!({
                        "error": rejected.to_string(),
                        "slippage": quote.slippage.to_string(),
                        "maxQuoteSlippage": self.config.max_quote_slippage.to_string(),
                        "amountIn": quote.amount_in.to_string(),
                        "amountOut": quote.amount_out.to_string(),
                    }),
                )
                .await;
                continue;
            }

            info!(
                "✅ {} quote accepted: {} -> {} (slippage {})",
                strategy, quote.amount_in, quote.amount_out, quote.slippage
            );
            return Ok(quote);
        }

        Err(StrategyError::NoRoute {
            token_in: token_in.to_string(),
            token_out: token_out.to_string(),
        }
        .into())
    }

    async fn quote_strategy(
        &self,
        strategy: Strategy,
        token_in: &QuoteToken,
        token_out: &QuoteToken,
        amount: U256,
        quote_id: &str,
    ) -> AppResult<RebalanceQuote> {
        let provider = self
            .providers
            .get(&strategy)
            .ok_or(StrategyError::Unsupported(strategy))?;

        let mut quote = provider.get_quote(token_in, token_out, amount, quote_id).await?;
        if quote.strategy != strategy {
            return Err(AppError::Internal(format!(
                "{} provider returned a {} quote",
                strategy, quote.strategy
            )));
        }
        quote.id.get_or_insert_with(|| quote_id.to_string());
        Ok(quote)
    }

    /// Dispatches on `quote.strategy`. An unregistered strategy is a wiring
    /// bug and is never retried.
    #[instrument(skip(self, quote), fields(strategy = %quote.strategy, quote_id = ?quote.id))]
    pub async fn execute(&self, wallet: Address, quote: &RebalanceQuote) -> AppResult<ExecutionReceipt> {
        let provider = self
            .providers
            .get(&quote.strategy)
            .ok_or(StrategyError::Unsupported(quote.strategy))?;

        info!(
            "🚀 Executing {} rebalance {} -> {} for {}",
            quote.strategy, quote.token_in, quote.token_out, wallet
        );
        provider.execute(wallet, quote).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn reject(
        &self,
        quote_id: &str,
        strategy: Strategy,
        reason: RejectionReason,
        wallet: Address,
        token_in: &QuoteToken,
        token_out: &QuoteToken,
        amount: U256,
        details: serde_json::Value,
    ) {
        self.rejections
            .record(NewQuoteRejection {
                rebalance_id: quote_id.to_string(),
                strategy,
                reason,
                token_in: token_in.clone(),
                token_out: token_out.clone(),
                swap_amount: amount,
                details: Some(details),
                wallet: Some(wallet),
            })
            .await;
    }
}
