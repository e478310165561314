pub mod memory;
pub mod models;
pub mod repository;

pub use memory::InMemoryRejectionStore;
pub use models::*;
pub use repository::{PgRejectionStore, RejectionStore};

use std::sync::Arc;
use tracing::{info, warn};

/// Write-only front of the rejection store. Persistence failures are
/// logged and dropped so they never reach the quoting path.
#[derive(Clone)]
pub struct RejectionRecorder {
    store: Arc<dyn RejectionStore>,
}

impl RejectionRecorder {
    pub fn new(store: Arc<dyn RejectionStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, rejection: NewQuoteRejection) {
        info!(
            "📝 Persisting quote rejection {:?} for {} ({} -> {})",
            rejection.reason, rejection.strategy, rejection.token_in, rejection.token_out
        );

        if let Err(e) = self.store.insert(&rejection).await {
            warn!(
                "⚠️  Failed to persist quote rejection {} ({}): {:?}",
                rejection.rebalance_id, rejection.strategy, e
            );
        }
    }
}
