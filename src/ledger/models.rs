use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::Type;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::chain::ChainId;
use crate::error::LedgerError;

/// Token identifier inside a chain: the native asset or an ERC20 contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TokenAddress {
    Native,
    Token(Address),
}

impl TokenAddress {
    pub fn is_native(&self) -> bool {
        matches!(self, TokenAddress::Native)
    }

    pub fn address(&self) -> Option<Address> {
        match self {
            TokenAddress::Native => None,
            TokenAddress::Token(address) => Some(*address),
        }
    }
}

impl fmt::Display for TokenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenAddress::Native => write!(f, "native"),
            // Lowercase so keys built from checksummed input still collide
            TokenAddress::Token(address) => write!(f, "{}", address.to_string().to_lowercase()),
        }
    }
}

impl FromStr for TokenAddress {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("native") {
            return Ok(TokenAddress::Native);
        }
        Address::from_str(s)
            .map(TokenAddress::Token)
            .map_err(|_| LedgerError::InvalidTokenAddress(s.to_string()))
    }
}

impl From<Address> for TokenAddress {
    fn from(address: Address) -> Self {
        TokenAddress::Token(address)
    }
}

impl Serialize for TokenAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TokenAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Ledger key: one snapshot per (chain, token)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BalanceKey {
    pub chain_id: ChainId,
    pub token: TokenAddress,
}

impl BalanceKey {
    pub fn new(chain_id: ChainId, token: impl Into<TokenAddress>) -> Self {
        Self {
            chain_id,
            token: token.into(),
        }
    }

    pub fn native(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            token: TokenAddress::Native,
        }
    }
}

/// `chainId:tokenAddress`, the same shape used for reservation maps
impl fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain_id, self.token)
    }
}

/// Last balance read from RPC for a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub chain_id: ChainId,
    pub token: TokenAddress,
    pub balance: U256,
    pub block_number: u64,
    pub block_hash: B256,
    pub decimals: u8,
    pub symbol: String,
    pub name: String,
    pub updated_at: DateTime<Utc>,
}

impl BalanceSnapshot {
    pub fn key(&self) -> BalanceKey {
        BalanceKey {
            chain_id: self.chain_id,
            token: self.token,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSnapshot {
    pub key: BalanceKey,
    pub balance: U256,
    pub block_number: u64,
    pub block_hash: B256,
    pub decimals: u8,
    pub symbol: String,
    pub name: String,
}

/// Outcome of a conditional snapshot write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotUpsert {
    Created(BalanceSnapshot),
    Updated(BalanceSnapshot),
    /// Stored snapshot was at the same or a newer block
    Unchanged(BalanceSnapshot),
}

impl SnapshotUpsert {
    pub fn snapshot(&self) -> &BalanceSnapshot {
        match self {
            SnapshotUpsert::Created(s) | SnapshotUpsert::Updated(s) | SnapshotUpsert::Unchanged(s) => s,
        }
    }

    pub fn applied(&self) -> bool {
        !matches!(self, SnapshotUpsert::Unchanged(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "balance_direction", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChangeDirection {
    Incoming,
    Outgoing,
}

/// Incremental transfer observed by a watch service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBalanceChange {
    pub chain_id: ChainId,
    pub token: TokenAddress,
    pub amount: U256,
    pub direction: ChangeDirection,
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub log_index: u64,
    pub from: Option<Address>,
    pub to: Option<Address>,
}

impl NewBalanceChange {
    pub fn key(&self) -> BalanceKey {
        BalanceKey {
            chain_id: self.chain_id,
            token: self.token,
        }
    }
}

/// Append-only, never mutated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChange {
    pub id: Uuid,
    #[serde(flatten)]
    pub change: NewBalanceChange,
    pub created_at: DateTime<Utc>,
}

/// Sums of the change log for a key from some block onwards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeTotals {
    pub incoming: U256,
    pub outgoing: U256,
}

/// Snapshot balance and the change sums after it, read together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotTotals {
    pub snapshot_balance: U256,
    pub block_number: u64,
    pub totals: ChangeTotals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentBalance {
    pub balance: U256,
    pub block_number: u64,
}
