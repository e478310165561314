use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::*;
use crate::error::{AppError, AppResult};

/// Scriptable in-process chain used by the unit tests
pub struct MockChainClient {
    native: Mutex<HashMap<(ChainId, Address), OnchainBalance>>,
    tokens: Mutex<HashMap<(ChainId, Address), TokenBalance>>,
    /// Per-holder overrides of `tokens`
    held_tokens: Mutex<HashMap<(ChainId, Address, Address), TokenBalance>>,
    reverted: Mutex<Vec<B256>>,
    past_events: Mutex<Vec<ChainLog>>,
    watchers: Mutex<Vec<mpsc::Sender<AppResult<ChainLog>>>>,
    head: AtomicU64,
    watch_calls: AtomicUsize,
    unsubscribes: Arc<AtomicUsize>,
    past_event_ranges: Mutex<Vec<(u64, u64)>>,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self {
            native: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            held_tokens: Mutex::new(HashMap::new()),
            reverted: Mutex::new(Vec::new()),
            past_events: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
            head: AtomicU64::new(5_000),
            watch_calls: AtomicUsize::new(0),
            unsubscribes: Arc::new(AtomicUsize::new(0)),
            past_event_ranges: Mutex::new(Vec::new()),
        }
    }

    pub fn set_native(&self, chain_id: ChainId, owner: Address, balance: u64, block: u64) {
        self.native.lock().insert(
            (chain_id, owner),
            OnchainBalance {
                balance: U256::from(balance),
                block_number: block,
                block_hash: B256::with_last_byte(block as u8),
            },
        );
    }

    pub fn set_token(&self, chain_id: ChainId, token: Address, balance: u64, decimals: u8, block: u64) {
        self.tokens
            .lock()
            .insert((chain_id, token), token_balance(token, balance, decimals, block));
    }

    /// Balance of `token` seen only when `owner` is queried
    pub fn set_token_for(
        &self,
        chain_id: ChainId,
        owner: Address,
        token: Address,
        balance: u64,
        decimals: u8,
        block: u64,
    ) {
        self.held_tokens.lock().insert(
            (chain_id, owner, token),
            token_balance(token, balance, decimals, block),
        );
    }

    pub fn revert_transaction(&self, transaction_hash: B256) {
        self.reverted.lock().push(transaction_hash);
    }

    pub fn push_past_event(&self, log: ChainLog) {
        self.past_events.lock().push(log);
    }

    /// Delivers a log to every live watcher.
    pub fn emit(&self, log: ChainLog) {
        for sender in self.watchers.lock().iter() {
            let _ = sender.try_send(Ok(log.clone()));
        }
    }

    pub fn fail_watchers(&self, message: &str) {
        for sender in self.watchers.lock().iter() {
            let _ = sender.try_send(Err(AppError::Chain(message.to_string())));
        }
    }

    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn past_event_ranges(&self) -> Vec<(u64, u64)> {
        self.past_event_ranges.lock().clone()
    }

    /// Yields until `count` watchers have been registered.
    pub async fn wait_for_watchers(&self, count: usize) {
        while self.watch_calls() < count {
            tokio::task::yield_now().await;
        }
    }
}

fn token_balance(token: Address, balance: u64, decimals: u8, block: u64) -> TokenBalance {
    TokenBalance {
        token,
        balance: U256::from(balance),
        decimals,
        symbol: "USDC".to_string(),
        name: "USD Coin".to_string(),
        block_number: block,
        block_hash: B256::with_last_byte(block as u8),
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn get_balance(&self, chain_id: ChainId, address: Address) -> AppResult<OnchainBalance> {
        self.native
            .lock()
            .get(&(chain_id, address))
            .cloned()
            .ok_or_else(|| AppError::Chain(format!("no native balance on {}", chain_id)))
    }

    async fn multicall_balances(
        &self,
        chain_id: ChainId,
        owner: Address,
        tokens: &[Address],
    ) -> AppResult<HashMap<Address, TokenBalance>> {
        let held = self.held_tokens.lock();
        let stored = self.tokens.lock();
        Ok(tokens
            .iter()
            .filter_map(|token| {
                held.get(&(chain_id, owner, *token))
                    .or_else(|| stored.get(&(chain_id, *token)))
                    .map(|b| (*token, b.clone()))
            })
            .collect())
    }

    async fn block_number(&self, _chain_id: ChainId) -> AppResult<u64> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn wait_for_receipt(
        &self,
        _chain_id: ChainId,
        transaction_hash: B256,
    ) -> AppResult<TransactionReceipt> {
        let status = if self.reverted.lock().contains(&transaction_hash) {
            ReceiptStatus::Reverted
        } else {
            ReceiptStatus::Success
        };
        Ok(TransactionReceipt {
            transaction_hash,
            status,
            block_number: self.head.load(Ordering::SeqCst),
        })
    }

    async fn watch_event(
        &self,
        _chain_id: ChainId,
        _filter: EventFilter,
    ) -> AppResult<EventSubscription> {
        let (tx, rx) = mpsc::channel(8);
        self.watchers.lock().push(tx);
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        let unsubscribes = self.unsubscribes.clone();
        Ok(EventSubscription::new(rx, move || {
            unsubscribes.fetch_add(1, Ordering::SeqCst);
        }))
    }

    async fn get_past_events(
        &self,
        _chain_id: ChainId,
        filter: &EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> AppResult<Vec<ChainLog>> {
        self.past_event_ranges.lock().push((from_block, to_block));
        Ok(self
            .past_events
            .lock()
            .iter()
            .filter(|log| {
                log.event_name == filter.event_name
                    && log.block_number >= from_block
                    && log.block_number <= to_block
            })
            .cloned()
            .collect())
    }
}
