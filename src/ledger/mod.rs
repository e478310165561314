pub mod memory;
pub mod models;
pub mod repository;
pub mod service;

pub use memory::InMemoryBalanceStore;
pub use models::*;
pub use repository::{BalanceStore, PgBalanceStore};
pub use service::{BalanceLedger, RefreshSummary};
