//! Contracts for the blockchain collaborators this crate consumes. Concrete
//! RPC clients live outside the crate; everything here is driven through
//! these traits.

#[cfg(test)]
pub mod mock;

use std::collections::HashMap;
use std::fmt;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::AppResult;

pub type ChainId = u64;

/// Native balance as observed at a specific block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnchainBalance {
    pub balance: U256,
    pub block_number: u64,
    pub block_hash: B256,
}

/// ERC20 balance plus the metadata the ledger snapshots alongside it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBalance {
    pub token: Address,
    pub balance: U256,
    pub decimals: u8,
    pub symbol: String,
    pub name: String,
    pub block_number: u64,
    pub block_hash: B256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    Success,
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    pub status: ReceiptStatus,
    pub block_number: u64,
}

impl TransactionReceipt {
    pub fn is_success(&self) -> bool {
        self.status == ReceiptStatus::Success
    }
}

/// Contract event filter: emitter, event name and indexed-argument values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub address: Address,
    pub event_name: String,
    pub args: HashMap<String, B256>,
}

impl EventFilter {
    pub fn new(address: Address, event_name: impl Into<String>) -> Self {
        Self {
            address,
            event_name: event_name.into(),
            args: HashMap::new(),
        }
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: B256) -> Self {
        self.args.insert(name.into(), value);
        self
    }
}

/// A decoded log matching an [`EventFilter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLog {
    pub address: Address,
    pub event_name: String,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
}

/// Releases a live subscription exactly once, either explicitly or on drop.
pub struct WatchGuard {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchGuard {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Returns false when the watcher had already been released.
    pub fn release(&mut self) -> bool {
        match self.unsubscribe.take() {
            Some(unsubscribe) => {
                unsubscribe();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.unsubscribe.is_some()
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchGuard")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Live event stream. Dropping it unsubscribes.
#[derive(Debug)]
pub struct EventSubscription {
    events: mpsc::Receiver<AppResult<ChainLog>>,
    guard: WatchGuard,
}

impl EventSubscription {
    pub fn new(
        events: mpsc::Receiver<AppResult<ChainLog>>,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            guard: WatchGuard::new(unsubscribe),
        }
    }

    /// `None` once the producer side has gone away.
    pub async fn next(&mut self) -> Option<AppResult<ChainLog>> {
        self.events.recv().await
    }

    pub fn unsubscribe(mut self) -> bool {
        self.guard.release()
    }
}

/// Raw chain access (balance reads, receipts, logs). Transaction
/// submission is owned by the protocol-specific collaborators.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_balance(&self, chain_id: ChainId, address: Address) -> AppResult<OnchainBalance>;

    async fn multicall_balances(
        &self,
        chain_id: ChainId,
        owner: Address,
        tokens: &[Address],
    ) -> AppResult<HashMap<Address, TokenBalance>>;

    async fn block_number(&self, chain_id: ChainId) -> AppResult<u64>;

    async fn wait_for_receipt(
        &self,
        chain_id: ChainId,
        transaction_hash: B256,
    ) -> AppResult<TransactionReceipt>;

    async fn watch_event(
        &self,
        chain_id: ChainId,
        filter: EventFilter,
    ) -> AppResult<EventSubscription>;

    async fn get_past_events(
        &self,
        chain_id: ChainId,
        filter: &EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> AppResult<Vec<ChainLog>>;
}
