use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use rust_decimal::Decimal;

use super::bridge::quote_slippage;
use super::{ExecutionReceipt, QuoteToken, RebalanceProvider, RebalanceQuote, Strategy};
use crate::error::{AppResult, StrategyError};
use crate::ledger::BalanceKey;
use crate::units::{mul_fraction, normalize_decimals};

/// Quotes at a fixed output rate per source token. Sources without a rate
/// fail to quote.
pub struct RateProvider {
    strategy: Strategy,
    default_rate: Option<Decimal>,
    rates: HashMap<BalanceKey, Decimal>,
    failing_executions: HashSet<BalanceKey>,
    quotes: AtomicUsize,
    executions: AtomicUsize,
}

impl RateProvider {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            default_rate: None,
            rates: HashMap::new(),
            failing_executions: HashSet::new(),
            quotes: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
        }
    }

    pub fn with_default_rate(mut self, rate: Decimal) -> Self {
        self.default_rate = Some(rate);
        self
    }

    pub fn with_rate(mut self, source: BalanceKey, rate: Decimal) -> Self {
        self.rates.insert(source, rate);
        self
    }

    pub fn failing_execution(mut self, source: BalanceKey) -> Self {
        self.failing_executions.insert(source);
        self
    }

    pub fn quote_calls(&self) -> usize {
        self.quotes.load(Ordering::SeqCst)
    }

    pub fn execute_calls(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RebalanceProvider for RateProvider {
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
        self.quotes.fetch_add(1, Ordering::SeqCst);
        let rate = self
            .rates
            .get(&token_in.key())
            .copied()
            .or(self.default_rate)
            .ok_or_else(|| StrategyError::ProviderFailed {
                strategy: self.strategy,
                message: format!("no route from {}", token_in),
            })?;

        let amount_out = mul_fraction(
            normalize_decimals(amount, token_in.decimals, token_out.decimals),
            rate,
        );
        Ok(RebalanceQuote {
            id: Some(quote_id.to_string()),
            token_in: token_in.clone(),
            token_out: token_out.clone(),
            amount_in: amount,
            amount_out,
            slippage: quote_slippage(token_in, token_out, amount, amount_out),
            strategy: self.strategy,
            context: serde_json::json!({ "rate": rate }),
        })
    }

    async fn execute(&self, _wallet: Address, quote: &RebalanceQuote) -> AppResult<ExecutionReceipt> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if self.failing_executions.contains(&quote.token_in.key()) {
            return Err(StrategyError::ProviderFailed {
                strategy: self.strategy,
                message: "transaction reverted".to_string(),
            }
            .into());
        }
        Ok(ExecutionReceipt {
            strategy: self.strategy,
            transaction_hash: Some(B256::repeat_byte(0x42)),
            details: serde_json::Value::Null,
        })
    }
}
