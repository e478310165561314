//! Recurring cycles: RPC balance refresh and the check-balances rebalance
//! pass. Both are idempotent so at-least-once scheduling is safe.

pub mod check_balances;
pub mod ledger_refresh;
pub mod scheduler;

pub use check_balances::{CheckBalancesJob, CheckBalancesReport};
pub use ledger_refresh::LedgerRefreshJob;
pub use scheduler::{JobScheduler, ScheduleConfig};
