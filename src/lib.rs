//! Cross-chain settlement-liquidity rebalancer.
//!
//! Balances are snapshotted per chain and token, classified against target
//! bands, and deficits are refilled from surplus through pluggable bridge
//! and swap providers or through deliberately loss-making intents.

pub mod analysis;
pub mod bootstrap;
pub mod chain;
pub mod config;
pub mod error;
pub mod health;
pub mod jobs;
pub mod ledger;
pub mod planner;
pub mod providers;
pub mod rebalance;
pub mod rejections;
pub mod settlement;
pub mod telemetry;
pub mod units;

pub use bootstrap::{connect_database, Collaborators, IntentCollaborators, Rebalancer, Stores};
pub use config::Settings;
pub use error::{AppError, AppResult, ErrorKind};
