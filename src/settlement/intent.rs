use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::chain::ChainId;
use crate::error::{AppResult, SettlementError};
use crate::ledger::TokenAddress;
use crate::providers::RebalanceQuote;

/// `transfer(address,uint256)`
const ERC20_TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// Intent-protocol deployment on one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentSourceConfig {
    pub chain_id: ChainId,
    pub source_address: Address,
    pub inbox: Address,
    pub provers: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAmount {
    pub token: Address,
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub target: Address,
    pub data: Bytes,
    pub value: U256,
}

/// What the fulfiller must do on the destination chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub salt: B256,
    pub source: ChainId,
    pub destination: ChainId,
    pub inbox: Address,
    pub tokens: Vec<TokenAmount>,
    pub calls: Vec<Call>,
}

/// What the fulfiller is paid on the source chain once proven
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reward {
    pub creator: Address,
    pub prover: Address,
    /// Unix seconds
    pub deadline: u64,
    pub native_value: U256,
    pub tokens: Vec<TokenAmount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub route: Route,
    pub reward: Reward,
}

impl Intent {
    /// Builds a loss-making intent for `quote`: the fulfiller delivers
    /// `amount_in` of the input token to `pool` and is rewarded with
    /// `amount_out` of the output token.
    pub fn rebalancing(
        quote: &RebalanceQuote,
        source: &IntentSourceConfig,
        creator: Address,
        pool: Address,
        deadline_secs: u64,
    ) -> AppResult<Self> {
        let prover = source.provers.first().copied().ok_or_else(|| {
            SettlementError::InvalidContext(format!(
                "no prover configured for chain {}",
                source.chain_id
            ))
        })?;

        let (route_tokens, call) = match quote.token_in.token {
            TokenAddress::Token(token) => (
                vec![TokenAmount {
                    token,
                    amount: quote.amount_in,
                }],
                Call {
                    target: token,
                    data: erc20_transfer(pool, quote.amount_in),
                    value: U256::ZERO,
                },
            ),
            TokenAddress::Native => (
                Vec::new(),
                Call {
                    target: pool,
                    data: Bytes::new(),
                    value: quote.amount_in,
                },
            ),
        };

        let (native_value, reward_tokens) = match quote.token_out.token {
            TokenAddress::Token(token) => (
                U256::ZERO,
                vec![TokenAmount {
                    token,
                    amount: quote.amount_out,
                }],
            ),
            TokenAddress::Native => (quote.amount_out, Vec::new()),
        };

        let deadline = Utc::now().timestamp().max(0) as u64 + deadline_secs;

        Ok(Self {
            route: Route {
                salt: random_salt(),
                source: quote.token_in.chain_id,
                destination: quote.token_out.chain_id,
                inbox: source.inbox,
                tokens: route_tokens,
                calls: vec![call],
            },
            reward: Reward {
                creator,
                prover,
                deadline,
                native_value,
                tokens: reward_tokens,
            },
        })
    }
}

pub fn random_salt() -> B256 {
    B256::from(rand::random::<[u8; 32]>())
}

/// ABI-encoded `transfer(to, amount)` calldata
pub fn erc20_transfer(to: Address, amount: U256) -> Bytes {
    let mut data = Vec::with_capacity(68);
    data.extend_from_slice(&ERC20_TRANSFER_SELECTOR);
    data.extend_from_slice(B256::left_padding_from(to.as_slice()).as_slice());
    data.extend_from_slice(&amount.to_be_bytes::<32>());
    data.into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedIntent {
    pub transaction_hash: B256,
    pub intent_hash: B256,
}

/// The intent-protocol contracts on the source chain. Hashing and signing
/// belong to the implementation.
#[async_trait]
pub trait IntentSource: Send + Sync {
    /// Publishes and fully funds the reward escrow
    async fn publish_and_fund(
        &self,
        source: &IntentSourceConfig,
        intent: &Intent,
    ) -> AppResult<PublishedIntent>;

    /// Claims the escrowed reward back for a proven intent
    async fn withdraw_reward(&self, source: &IntentSourceConfig, intent: &Intent) -> AppResult<B256>;
}

/// Off-chain action that gets the destination-side transfer executed
#[async_trait]
pub trait FulfillmentTrigger: Send + Sync {
    async fn trigger(
        &self,
        intent_hash: B256,
        destination_chain_id: ChainId,
        pool_wallet: Address,
    ) -> AppResult<B256>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{QuoteToken, Strategy};
    use rust_decimal_macros::dec;

    fn quote(token_in: TokenAddress, token_out: TokenAddress) -> RebalanceQuote {
        let side = |chain_id, token| QuoteToken {
            chain_id,
            token,
            decimals: 6,
            symbol: "USDC".to_string(),
            balance: U256::ZERO,
            target_balance: U256::ZERO,
        };
        RebalanceQuote {
            id: Some("q-1".to_string()),
            token_in: side(10, token_in),
            token_out: side(8453, token_out),
            amount_in: U256::from(1_000u64),
            amount_out: U256::from(950u64),
            slippage: dec!(0.05),
            strategy: Strategy::NegativeIntent,
            context: serde_json::Value::Null,
        }
    }

    fn source(provers: Vec<Address>) -> IntentSourceConfig {
        IntentSourceConfig {
            chain_id: 10,
            source_address: Address::repeat_byte(0x50),
            inbox: Address::repeat_byte(0x51),
            provers,
        }
    }

    #[test]
    fn test_rebalancing_intent_layout() {
        let usdc_op = Address::repeat_byte(0x0a);
        let usdc_base = Address::repeat_byte(0x0b);
        let pool = Address::repeat_byte(0x99);
        let intent = Intent::rebalancing(
            &quote(TokenAddress::Token(usdc_op), TokenAddress::Token(usdc_base)),
            &source(vec![Address::repeat_byte(0x01), Address::repeat_byte(0x02)]),
            pool,
            pool,
            5_400,
        )
        .unwrap();

        assert_eq!(intent.route.source, 10);
        assert_eq!(intent.route.destination, 8453);
        assert_eq!(intent.route.tokens[0].amount, U256::from(1_000u64));
        assert_eq!(intent.route.calls[0].target, usdc_op);
        assert_eq!(intent.route.calls[0].data, erc20_transfer(pool, U256::from(1_000u64)));
        assert_eq!(intent.reward.prover, Address::repeat_byte(0x01));
        assert_eq!(intent.reward.tokens[0].token, usdc_base);
        assert!(intent.reward.deadline >= Utc::now().timestamp() as u64 + 5_390);
    }

    #[test]
    fn test_native_sides_use_value() {
        let pool = Address::repeat_byte(0x99);
        let intent = Intent::rebalancing(
            &quote(TokenAddress::Native, TokenAddress::Native),
            &source(vec![Address::repeat_byte(0x01)]),
            pool,
            pool,
            60,
        )
        .unwrap();

        assert!(intent.route.tokens.is_empty());
        assert_eq!(intent.route.calls[0].target, pool);
        assert_eq!(intent.route.calls[0].value, U256::from(1_000u64));
        assert_eq!(intent.reward.native_value, U256::from(950u64));
    }

    #[test]
    fn test_missing_prover_is_rejected() {
        let result = Intent::rebalancing(
            &quote(TokenAddress::Native, TokenAddress::Native),
            &source(Vec::new()),
            Address::ZERO,
            Address::ZERO,
            60,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_transfer_calldata() {
        let data = erc20_transfer(Address::repeat_byte(0xff), U256::from(1u64));
        assert_eq!(data.len(), 68);
        assert_eq!(&data[..4], &ERC20_TRANSFER_SELECTOR);
        assert_eq!(data[4 + 11], 0);
        assert_eq!(data[4 + 12], 0xff);
        assert_eq!(data[67], 1);
        assert_ne!(random_salt(), random_salt());
    }
}
