use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::intent::{FulfillmentTrigger, Intent, IntentSource, IntentSourceConfig};
use super::registry::{IntentRegistry, NegativeIntentContext, SettlementStage};
use crate::chain::{ChainClient, ChainId, ChainLog, EventFilter, EventSubscription};
use crate::error::{AppResult, SettlementError, StrategyError};
use crate::providers::{ExecutionReceipt, QuoteToken, RebalanceProvider, RebalanceQuote, Strategy};
use crate::units::{mul_fraction, normalize_decimals};

pub const INTENT_PROVEN_EVENT: &str = "IntentProven";

#[derive(Debug, Clone)]
pub struct NegativeIntentConfig {
    /// The only wallet allowed to publish rebalancing intents
    pub pool_wallet: Address,
    /// Signer that publishes and funds intents; reward refunds go back to it
    pub creator: Address,
    /// Loss accepted per intent, e.g. 0.05
    pub rebalancing_percentage: Decimal,
    pub proof_timeout: Duration,
    pub backfill_blocks: u64,
    pub reward_deadline_secs: u64,
    pub sources: HashMap<ChainId, IntentSourceConfig>,
}

/// Rebalances by publishing intents that pay the fulfiller less than they
/// spend, then watching for the proof and reclaiming the escrowed reward.
pub struct NegativeIntentProvider {
    config: NegativeIntentConfig,
    chain: Arc<dyn ChainClient>,
    intent_source: Arc<dyn IntentSource>,
    fulfillment: Arc<dyn FulfillmentTrigger>,
    registry: Arc<IntentRegistry>,
}

impl NegativeIntentProvider {
    pub fn new(
        config: NegativeIntentConfig,
        chain: Arc<dyn ChainClient>,
        intent_source: Arc<dyn IntentSource>,
        fulfillment: Arc<dyn FulfillmentTrigger>,
        registry: Arc<IntentRegistry>,
    ) -> Self {
        Self {
            config,
            chain,
            intent_source,
            fulfillment,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<IntentRegistry> {
        &self.registry
    }

    fn intent_source_for(&self, chain_id: ChainId) -> AppResult<&IntentSourceConfig> {
        self.config
            .sources
            .get(&chain_id)
            .ok_or_else(|| SettlementError::MissingIntentSource(chain_id).into())
    }

    /// Everything after the publish transaction. Errors leave the context
    /// registered for the caller to mark as failed.
    async fn settle(
        &self,
        quote: &RebalanceQuote,
        source: &IntentSourceConfig,
        intent: &Intent,
        intent_hash: B256,
        publish_tx: B256,
    ) -> AppResult<ExecutionReceipt> {
        let source_chain = quote.token_in.chain_id;
        let destination_chain = quote.token_out.chain_id;

        let receipt = self.chain.wait_for_receipt(source_chain, publish_tx).await?;
        if !receipt.is_success() {
            return Err(SettlementError::PublishReverted(publish_tx).into());
        }
        info!(
            "📣 Rebalancing intent {} published in block {} (tx {})",
            intent_hash, receipt.block_number, publish_tx
        );

        self.registry.advance(&intent_hash, SettlementStage::Watching)?;
        let proof = self.wait_for_proof(source_chain, source, intent_hash).await?;
        self.registry
            .advance_with(&intent_hash, SettlementStage::Proven, |context| {
                context.proof_tx = Some(proof.transaction_hash)
            })?;

        self.registry.advance(&intent_hash, SettlementStage::Fulfilling)?;
        let fulfillment_tx = match self
            .fulfillment
            .trigger(intent_hash, destination_chain, self.config.pool_wallet)
            .await
        {
            Ok(tx) => {
                info!("🚚 Fulfillment for intent {} triggered: {}", intent_hash, tx);
                Some(tx)
            }
            Err(e) => {
                error!(
                    "❌ Failed to trigger fulfillment for intent {}: {:?}",
                    intent_hash, e
                );
                None
            }
        };

        self.registry
            .advance_with(&intent_hash, SettlementStage::Withdrawing, |context| {
                context.fulfillment_tx = fulfillment_tx
            })?;
        let withdrawal_tx = self.intent_source.withdraw_reward(source, intent).await?;
        let withdrawal = self.chain.wait_for_receipt(source_chain, withdrawal_tx).await?;
        if !withdrawal.is_success() {
            return Err(SettlementError::WithdrawalReverted {
                intent_hash,
                tx_hash: withdrawal_tx,
            }
            .into());
        }
        self.registry
            .advance_with(&intent_hash, SettlementStage::Done, |context| {
                context.withdrawal_tx = Some(withdrawal_tx)
            })?;

        info!(
            "✅ Negative intent {} settled, reward withdrawn in block {}",
            intent_hash, withdrawal.block_number
        );
        Ok(ExecutionReceipt {
            strategy: Strategy::NegativeIntent,
            transaction_hash: Some(publish_tx),
            details: json!({
                "intentHash": intent_hash,
                "proofTransactionHash": proof.transaction_hash,
                "fulfillmentTransactionHash": fulfillment_tx,
                "withdrawalTransactionHash": withdrawal_tx,
            }),
        })
    }

    /// Races the live subscription and a historical backfill against the
    /// proof timeout. The subscription is released on every path.
    #[instrument(skip(self, source), fields(intent_hash = %intent_hash))]
    async fn wait_for_proof(
        &self,
        chain_id: ChainId,
        source: &IntentSourceConfig,
        intent_hash: B256,
    ) -> AppResult<ChainLog> {
        let filter = EventFilter::new(source.source_address, INTENT_PROVEN_EVENT)
            .with_arg("_hash", intent_hash);

        let mut subscription = self
            .chain
            .watch_event(chain_id, filter.clone())
            .await
            .map_err(|e| SettlementError::WatchFailed {
                intent_hash,
                message: e.to_string(),
            })?;
        info!("👀 Waiting for IntentProven on chain {}", chain_id);

        let outcome = tokio::time::timeout(
            self.config.proof_timeout,
            self.first_proof(chain_id, &filter, &mut subscription, intent_hash),
        )
        .await;
        subscription.unsubscribe();

        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "⏰ IntentProven not observed within {}s, watcher released",
                    self.config.proof_timeout.as_secs()
                );
                Err(SettlementError::ProofTimeout {
                    intent_hash,
                    timeout_secs: self.config.proof_timeout.as_secs(),
                }
                .into())
            }
        }
    }

    async fn first_proof(
        &self,
        chain_id: ChainId,
        filter: &EventFilter,
        subscription: &mut EventSubscription,
        intent_hash: B256,
    ) -> AppResult<ChainLog> {
        let backfill = self.backfill(chain_id, filter);
        tokio::pin!(backfill);
        let mut backfill_done = false;

        loop {
            tokio::select! {
                event = subscription.next() => {
                    return match event {
                        Some(Ok(log)) => {
                            info!("🔔 IntentProven observed in block {}", log.block_number);
                            Ok(log)
                        }
                        Some(Err(e)) => Err(SettlementError::WatchFailed {
                            intent_hash,
                            message: e.to_string(),
                        }
                        .into()),
                        None => Err(SettlementError::WatchFailed {
                            intent_hash,
                            message: "event stream closed".to_string(),
                        }
                        .into()),
                    };
                }
                result = &mut backfill, if !backfill_done => {
                    backfill_done = true;
                    match result {
                        Ok(Some(log)) => {
                            info!("🔎 IntentProven found in history at block {}", log.block_number);
                            return Ok(log);
                        }
                        Ok(None) => debug!("No historical IntentProven, waiting on subscription"),
                        Err(e) => warn!("⚠️ IntentProven backfill failed: {:?}", e),
                    }
                }
            }
        }
    }

    /// Catches a proof emitted before the subscription was live
    async fn backfill(&self, chain_id: ChainId, filter: &EventFilter) -> AppResult<Option<ChainLog>> {
        let head = self.chain.block_number(chain_id).await?;
        let from = head.saturating_sub(self.config.backfill_blocks);
        let logs = self
            .chain
            .get_past_events(chain_id, filter, from, head)
            .await?;
        Ok(logs.into_iter().next())
    }
}

#[async_trait]
impl RebalanceProvider for NegativeIntentProvider {
    fn strategy(&self) -> Strategy {
        Strategy::NegativeIntent
    }

    async fn get_quote(
        &self,
        token_in: &QuoteToken,
        token_out: &QuoteToken,
        amount: U256,
        quote_id: &str,
    ) -> AppResult<RebalanceQuote> {
        if amount.is_zero() {
            return Err(StrategyError::InsufficientLiquidity(
                "negative intent for a zero amount".to_string(),
            )
            .into());
        }

        let percentage = self.config.rebalancing_percentage;
        let amount_out = mul_fraction(
            normalize_decimals(amount, token_in.decimals, token_out.decimals),
            Decimal::ONE - percentage,
        );

        Ok(RebalanceQuote {
            id: Some(quote_id.to_string()),
            token_in: token_in.clone(),
            token_out: token_out.clone(),
            amount_in: amount,
            amount_out,
            slippage: percentage,
            strategy: Strategy::NegativeIntent,
            context: json!({
                "rebalancingPercentage": percentage,
                "intentHash": null,
            }),
        })
    }

    #[instrument(skip(self, quote), fields(quote_id = ?quote.id))]
    async fn execute(&self, wallet: Address, quote: &RebalanceQuote) -> AppResult<ExecutionReceipt> {
        if wallet != self.config.pool_wallet {
            return Err(SettlementError::UnauthorizedWallet(wallet.to_string()).into());
        }

        let comparable_out = normalize_decimals(
            quote.amount_out,
            quote.token_out.decimals,
            quote.token_in.decimals,
        );
        if comparable_out >= quote.amount_in {
            return Err(SettlementError::NotLossMaking {
                amount_in: quote.amount_in,
                amount_out: quote.amount_out,
            }
            .into());
        }

        let source = self.intent_source_for(quote.token_in.chain_id)?;
        let intent = Intent::rebalancing(
            quote,
            source,
            self.config.creator,
            self.config.pool_wallet,
            self.config.reward_deadline_secs,
        )?;

        info!(
            "🚀 Publishing rebalancing intent {} -> {} (in {}, out {})",
            quote.token_in, quote.token_out, quote.amount_in, quote.amount_out
        );
        let published = self.intent_source.publish_and_fund(source, &intent).await?;
        let intent_hash = published.intent_hash;
        self.registry.register(NegativeIntentContext::published(
            intent_hash,
            quote.id.clone(),
            quote.token_in.chain_id,
            quote.token_out.chain_id,
            published.transaction_hash,
        ));

        match self
            .settle(quote, source, &intent, intent_hash, published.transaction_hash)
            .await
        {
            Ok(receipt) => {
                self.registry.complete(&intent_hash);
                Ok(receipt)
            }
            Err(e) => {
                error!("❌ Negative intent {} failed: {}", intent_hash, e);
                self.registry.mark_failed(&intent_hash, &e.to_string());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChainClient;
    use crate::error::AppError;
    use crate::ledger::TokenAddress;
    use crate::settlement::intent::{erc20_transfer, PublishedIntent};
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PUBLISH_TX: B256 = B256::repeat_byte(0xa1);
    const WITHDRAW_TX: B256 = B256::repeat_byte(0xa2);
    const INTENT_HASH: B256 = B256::repeat_byte(0x1f);

    #[derive(Default)]
    struct RecordingIntentSource {
        published: Mutex<Vec<Intent>>,
        withdrawals: AtomicUsize,
    }

    #[async_trait]
    impl IntentSource for RecordingIntentSource {
        async fn publish_and_fund(
            &self,
            _source: &IntentSourceConfig,
            intent: &Intent,
        ) -> AppResult<PublishedIntent> {
            self.published.lock().push(intent.clone());
            Ok(PublishedIntent {
                transaction_hash: PUBLISH_TX,
                intent_hash: INTENT_HASH,
            })
        }

        async fn withdraw_reward(&self, _source: &IntentSourceConfig, _intent: &Intent) -> AppResult<B256> {
            self.withdrawals.fetch_add(1, Ordering::SeqCst);
            Ok(WITHDRAW_TX)
        }
    }

    struct CountingTrigger {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl FulfillmentTrigger for CountingTrigger {
        async fn trigger(&self, _hash: B256, _chain: ChainId, _pool: Address) -> AppResult<B256> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AppError::Internal("signer unavailable".to_string()));
            }
            Ok(B256::repeat_byte(0xf0))
        }
    }

    struct Harness {
        chain: Arc<MockChainClient>,
        source: Arc<RecordingIntentSource>,
        trigger: Arc<CountingTrigger>,
        provider: Arc<NegativeIntentProvider>,
    }

    fn pool() -> Address {
        Address::repeat_byte(0x99)
    }

    fn creator() -> Address {
        Address::repeat_byte(0x77)
    }

    fn harness(fail_trigger: bool) -> Harness {
        let chain = Arc::new(MockChainClient::new());
        let source = Arc::new(RecordingIntentSource::default());
        let trigger = Arc::new(CountingTrigger {
            calls: AtomicUsize::new(0),
            fail: fail_trigger,
        });
        let config = NegativeIntentConfig {
            pool_wallet: pool(),
            creator: creator(),
            rebalancing_percentage: dec!(0.05),
            proof_timeout: Duration::from_secs(300),
            backfill_blocks: 1_000,
            reward_deadline_secs: 5_400,
            sources: HashMap::from([(
                10,
                IntentSourceConfig {
                    chain_id: 10,
                    source_address: Address::repeat_byte(0x50),
                    inbox: Address::repeat_byte(0x51),
                    provers: vec![Address::repeat_byte(0x52)],
                },
            )]),
        };
        let provider = Arc::new(NegativeIntentProvider::new(
            config,
            chain.clone(),
            source.clone(),
            trigger.clone(),
            Arc::new(IntentRegistry::new()),
        ));
        Harness {
            chain,
            source,
            trigger,
            provider,
        }
    }

    fn token(chain_id: u64, decimals: u8) -> QuoteToken {
        QuoteToken {
            chain_id,
            token: TokenAddress::Token(Address::repeat_byte(chain_id as u8)),
            decimals,
            symbol: "USDC".to_string(),
            balance: U256::ZERO,
            target_balance: U256::ZERO,
        }
    }

    fn loss_quote(amount_in: u64, amount_out: u64) -> RebalanceQuote {
        RebalanceQuote {
            id: Some("q-1".to_string()),
            token_in: token(10, 6),
            token_out: token(8453, 6),
            amount_in: U256::from(amount_in),
            amount_out: U256::from(amount_out),
            slippage: dec!(0.05),
            strategy: Strategy::NegativeIntent,
            context: serde_json::Value::Null,
        }
    }

    fn proof_log(block_number: u64) -> ChainLog {
        ChainLog {
            address: Address::repeat_byte(0x50),
            event_name: INTENT_PROVEN_EVENT.to_string(),
            block_number,
            transaction_hash: B256::repeat_byte(0x77),
            log_index: 0,
        }
    }

    #[tokio::test]
    async fn test_quote_applies_loss_percentage() {
        let h = harness(false);
        let quote = h
            .provider
            .get_quote(&token(10, 6), &token(56, 18), U256::from(1_000_000u64), "q-9")
            .await
            .unwrap();

        assert_eq!(quote.amount_out, U256::from(950_000_000_000_000_000u128));
        assert_eq!(quote.slippage, dec!(0.05));
        assert_eq!(quote.context["rebalancingPercentage"], json!(dec!(0.05)));
    }

    #[tokio::test]
    async fn test_proof_event_beats_timeout() {
        let h = harness(false);
        let provider = h.provider.clone();
        let task = tokio::spawn(async move { provider.execute(pool(), &loss_quote(1_000, 950)).await });

        h.chain.wait_for_watchers(1).await;
        h.chain.emit(proof_log(5_001));

        let receipt = task.await.unwrap().unwrap();
        assert_eq!(receipt.transaction_hash, Some(PUBLISH_TX));
        assert_eq!(receipt.details["withdrawalTransactionHash"], json!(WITHDRAW_TX));
        assert_eq!(h.chain.unsubscribes(), 1);
        assert_eq!(h.trigger.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.source.withdrawals.load(Ordering::SeqCst), 1);
        assert!(h.provider.registry().is_empty());

        let published = h.source.published.lock();
        assert_eq!(published[0].reward.creator, creator());
        assert_eq!(published[0].route.calls[0].data, erc20_transfer(pool(), U256::from(1_000u64)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_without_fulfillment() {
        let h = harness(false);
        let err = h
            .provider
            .execute(pool(), &loss_quote(1_000, 950))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AppError::Settlement(SettlementError::ProofTimeout { timeout_secs: 300, .. })
        ));
        assert_eq!(h.trigger.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.source.withdrawals.load(Ordering::SeqCst), 0);
        assert_eq!(h.chain.unsubscribes(), 1);

        let failed = h.provider.registry().failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].intent_hash, INTENT_HASH);
        assert!(failed[0].error.as_deref().unwrap().contains("IntentProven"));
    }

    #[tokio::test]
    async fn test_backfill_finds_earlier_proof() {
        let h = harness(false);
        h.chain.push_past_event(proof_log(4_500));

        h.provider
            .execute(pool(), &loss_quote(1_000, 950))
            .await
            .unwrap();

        assert_eq!(h.chain.past_event_ranges(), vec![(4_000, 5_000)]);
        assert_eq!(h.chain.unsubscribes(), 1);
        assert!(h.provider.registry().is_empty());
    }

    #[tokio::test]
    async fn test_non_loss_intent_is_rejected_before_submission() {
        let h = harness(false);
        for (amount_in, amount_out) in [(1_000, 1_000), (1_000, 1_200)] {
            let err = h
                .provider
                .execute(pool(), &loss_quote(amount_in, amount_out))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                AppError::Settlement(SettlementError::NotLossMaking { .. })
            ));
        }
        assert!(h.source.published.lock().is_empty());
        assert!(h.provider.registry().is_empty());
    }

    #[tokio::test]
    async fn test_only_pool_wallet_may_execute() {
        let h = harness(false);
        let err = h
            .provider
            .execute(Address::repeat_byte(0x01), &loss_quote(1_000, 950))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Settlement(SettlementError::UnauthorizedWallet(_))
        ));
        assert!(h.source.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_publish_revert_fails_before_watching() {
        let h = harness(false);
        h.chain.revert_transaction(PUBLISH_TX);

        let err = h
            .provider
            .execute(pool(), &loss_quote(1_000, 950))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AppError::Settlement(SettlementError::PublishReverted(tx)) if tx == PUBLISH_TX
        ));
        assert_eq!(h.chain.watch_calls(), 0);
        assert_eq!(
            h.provider.registry().get(&INTENT_HASH).unwrap().stage,
            SettlementStage::Failed
        );
    }

    #[tokio::test]
    async fn test_withdrawal_revert_is_fatal() {
        let h = harness(false);
        h.chain.push_past_event(proof_log(4_900));
        h.chain.revert_transaction(WITHDRAW_TX);

        let err = h
            .provider
            .execute(pool(), &loss_quote(1_000, 950))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AppError::Settlement(SettlementError::WithdrawalReverted { .. })
        ));
        let context = h.provider.registry().get(&INTENT_HASH).unwrap();
        assert_eq!(context.stage, SettlementStage::Failed);
        assert_eq!(context.fulfillment_tx, Some(B256::repeat_byte(0xf0)));
    }

    #[tokio::test]
    async fn test_fulfillment_failure_does_not_fail_settlement() {
        let h = harness(true);
        h.chain.push_past_event(proof_log(4_900));

        let receipt = h
            .provider
            .execute(pool(), &loss_quote(1_000, 950))
            .await
            .unwrap();

        assert_eq!(h.trigger.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.source.withdrawals.load(Ordering::SeqCst), 1);
        assert!(receipt.details["fulfillmentTransactionHash"].is_null());
    }

    #[tokio::test]
    async fn test_watch_error_fails_settlement() {
        let h = harness(false);
        let provider = h.provider.clone();
        let task = tokio::spawn(async move { provider.execute(pool(), &loss_quote(1_000, 950)).await });

        h.chain.wait_for_watchers(1).await;
        h.chain.fail_watchers("websocket dropped");

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            AppError::Settlement(SettlementError::WatchFailed { .. })
        ));
        assert_eq!(h.chain.unsubscribes(), 1);
        assert_eq!(h.trigger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_intent_source() {
        let h = harness(false);
        let mut quote = loss_quote(1_000, 950);
        quote.token_in = token(42161, 6);
        assert!(matches!(
            h.provider.execute(pool(), &quote).await,
            Err(AppError::Settlement(SettlementError::MissingIntentSource(42161)))
        ));
    }
}
