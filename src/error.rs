use alloy_primitives::{B256, U256};
use thiserror::Error;

use crate::providers::Strategy;

/// Top-level error type for the entire rebalancer
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("Strategy error: {0}")]
    Strategy(#[from] StrategyError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Coarse classification used by callers (schedulers, health) to decide
/// whether to retry, ignore or escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// RPC/store hiccup, retried by the job's next cycle
    Transient,
    /// Nothing can be done this cycle (no route, no surplus)
    Infeasible,
    /// A single strategy failed
    Provider,
    /// On-chain settlement step failed, needs re-plan or an operator
    Protocol,
    /// Caller bug, never retried
    Programming,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Database(_) | AppError::Chain(_) => ErrorKind::Transient,
            AppError::Migration(_) | AppError::Config(_) => ErrorKind::Programming,
            AppError::Ledger(_) => ErrorKind::Transient,
            AppError::Planning(PlanningError::StatusPersist { .. }) => ErrorKind::Transient,
            AppError::Planning(_) => ErrorKind::Infeasible,
            AppError::Strategy(StrategyError::NoRoute { .. }) => ErrorKind::Infeasible,
            AppError::Strategy(StrategyError::Unsupported(_))
            | AppError::Strategy(StrategyError::NoStrategiesConfigured(_)) => {
                ErrorKind::Programming
            }
            AppError::Strategy(_) => ErrorKind::Provider,
            AppError::Settlement(SettlementError::NotLossMaking { .. })
            | AppError::Settlement(SettlementError::UnauthorizedWallet(_)) => {
                ErrorKind::Programming
            }
            AppError::Settlement(_) => ErrorKind::Protocol,
            AppError::Internal(_) | AppError::NotFound(_) | AppError::InvalidInput(_) => {
                ErrorKind::Programming
            }
        }
    }
}

/// Balance ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Stored amount is not a valid unsigned integer: {0}")]
    InvalidAmount(String),

    #[error("Invalid token address: {0}")]
    InvalidTokenAddress(String),
}

/// Rebalance planning errors
#[derive(Error, Debug)]
pub enum PlanningError {
    #[error("{failed} out of {total} rebalances failed to persist")]
    BatchPersist { failed: usize, total: usize },

    #[error("Rebalance {0} is already in a terminal state")]
    TerminalRecord(String),

    #[error("{failed} out of {total} rebalance statuses failed to persist")]
    StatusPersist { failed: usize, total: usize },
}

/// Strategy / provider routing errors
#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("Unable to get quote for route {token_in} -> {token_out}")]
    NoRoute { token_in: String, token_out: String },

    #[error("Strategy not supported: {0}")]
    Unsupported(Strategy),

    #[error("No strategies configured for wallet type: {0}")]
    NoStrategiesConfigured(String),

    #[error("Quote slippage {slippage} exceeds maximum allowed {max}")]
    SlippageTooHigh { slippage: String, max: String },

    #[error("Provider {strategy} failed: {message}")]
    ProviderFailed { strategy: Strategy, message: String },

    #[error("Insufficient liquidity for {0}")]
    InsufficientLiquidity(String),
}

/// Negative intent settlement errors
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Rebalancing intent must have amountOut < amountIn (in {amount_in}, out {amount_out})")]
    NotLossMaking { amount_in: U256, amount_out: U256 },

    #[error("Rebalancing intents can only be executed by the pool wallet, got {0}")]
    UnauthorizedWallet(String),

    #[error("No intent source configured for chain {0}")]
    MissingIntentSource(u64),

    #[error("Intent publish transaction {0} reverted")]
    PublishReverted(B256),

    #[error("IntentProven event not detected for {intent_hash} after {timeout_secs}s")]
    ProofTimeout { intent_hash: B256, timeout_secs: u64 },

    #[error("Proof watcher for {intent_hash} failed: {message}")]
    WatchFailed { intent_hash: B256, message: String },

    #[error("Reward withdrawal {tx_hash} for intent {intent_hash} reverted")]
    WithdrawalReverted { intent_hash: B256, tx_hash: B256 },

    #[error("Invalid negative intent context: {0}")]
    InvalidContext(String),
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Internal(format!("Serialization error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
