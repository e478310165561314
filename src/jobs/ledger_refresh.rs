use std::collections::BTreeMap;
use std::sync::Arc;

use alloy_primitives::Address;
use tracing::{error, info, instrument};

use crate::analysis::TokenConfig;
use crate::chain::{ChainClient, ChainId};
use crate::error::AppResult;
use crate::ledger::{BalanceLedger, RefreshSummary};

/// Re-reads every configured token of the tracked wallet from RPC
pub struct LedgerRefreshJob {
    ledger: Arc<BalanceLedger>,
    chain: Arc<dyn ChainClient>,
    wallet: Address,
    tokens_by_chain: BTreeMap<ChainId, Vec<Address>>,
}

impl LedgerRefreshJob {
    pub fn new(
        ledger: Arc<BalanceLedger>,
        chain: Arc<dyn ChainClient>,
        wallet: Address,
        tokens: &[TokenConfig],
    ) -> Self {
        let mut tokens_by_chain: BTreeMap<ChainId, Vec<Address>> = BTreeMap::new();
        for config in tokens {
            let erc20s = tokens_by_chain.entry(config.chain_id).or_default();
            if let Some(address) = config.token.address() {
                erc20s.push(address);
            }
        }
        Self {
            ledger,
            chain,
            wallet,
            tokens_by_chain,
        }
    }

    pub fn chains(&self) -> Vec<ChainId> {
        self.tokens_by_chain.keys().copied().collect()
    }

    /// A chain whose RPC is down is counted as a failure and does not stop
    /// the other chains.
    #[instrument(skip(self), fields(wallet = %self.wallet))]
    pub async fn run(&self) -> AppResult<RefreshSummary> {
        let mut total = RefreshSummary::default();

        for (chain_id, tokens) in &self.tokens_by_chain {
            match self
                .ledger
                .refresh_from_chain(self.chain.as_ref(), *chain_id, self.wallet, tokens)
                .await
            {
                Ok(summary) => {
                    total.token_updates += summary.token_updates;
                    total.native_updates += summary.native_updates;
                    total.failures += summary.failures;
                }
                Err(e) => {
                    error!("❌ Ledger refresh failed on chain {}: {:?}", chain_id, e);
                    total.failures += tokens.len() + 1;
                }
            }
        }

        info!(
            "🔄 Ledger refresh complete: {} token, {} native, {} failed",
            total.token_updates, total.native_updates, total.failures
        );
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChainClient;
    use crate::ledger::{BalanceKey, InMemoryBalanceStore, TokenAddress};
    use alloy_primitives::U256;

    fn config(chain_id: ChainId, token: TokenAddress) -> TokenConfig {
        TokenConfig {
            chain_id,
            token,
            decimals: 6,
            symbol: "USDC".to_string(),
            min_balance: U256::ZERO,
            target_balance: U256::from(1_000u64),
            max_balance: U256::from(2_000u64),
        }
    }

    #[tokio::test]
    async fn test_refreshes_every_configured_chain() {
        let wallet = Address::repeat_byte(0x11);
        let usdc_op = Address::repeat_byte(0x0a);
        let chain = Arc::new(MockChainClient::new());
        chain.set_token(10, usdc_op, 750, 6, 40);
        chain.set_native(10, wallet, 1_000, 40);
        chain.set_native(8453, wallet, 2_000, 41);

        let ledger = Arc::new(BalanceLedger::new(Arc::new(InMemoryBalanceStore::new())));
        let job = LedgerRefreshJob::new(
            ledger.clone(),
            chain,
            wallet,
            &[
                config(10, TokenAddress::Token(usdc_op)),
                config(8453, TokenAddress::Native),
                config(1, TokenAddress::Native),
            ],
        );
        assert_eq!(job.chains(), vec![1, 10, 8453]);

        let summary = job.run().await.unwrap();
        assert_eq!(summary.token_updates, 1);
        assert_eq!(summary.native_updates, 2);
        // chain 1 has no native balance in the mock
        assert_eq!(summary.failures, 1);

        let usdc = ledger
            .current_balance(&BalanceKey::new(10, usdc_op), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(usdc.balance, U256::from(750u64));
    }
}
