use std::collections::HashMap;

use alloy_primitives::B256;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chain::ChainId;
use crate::error::{AppError, AppResult, SettlementError};

/// Lifecycle of one negative intent. Declaration order is the only legal
/// forward order; `Failed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStage {
    Created,
    Publishing,
    Published,
    Watching,
    Proven,
    Fulfilling,
    Withdrawing,
    Done,
    Failed,
}

impl SettlementStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SettlementStage::Done | SettlementStage::Failed)
    }

    pub fn can_advance_to(&self, next: SettlementStage) -> bool {
        !self.is_terminal() && (next == SettlementStage::Failed || next > *self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegativeIntentContext {
    pub intent_hash: B256,
    pub quote_id: Option<String>,
    pub source_chain_id: ChainId,
    pub destination_chain_id: ChainId,
    pub publish_tx: B256,
    pub proof_tx: Option<B256>,
    pub fulfillment_tx: Option<B256>,
    pub withdrawal_tx: Option<B256>,
    pub stage: SettlementStage,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NegativeIntentContext {
    pub fn published(
        intent_hash: B256,
        quote_id: Option<String>,
        source_chain_id: ChainId,
        destination_chain_id: ChainId,
        publish_tx: B256,
    ) -> Self {
        let now = Utc::now();
        Self {
            intent_hash,
            quote_id,
            source_chain_id,
            destination_chain_id,
            publish_tx,
            proof_tx: None,
            fulfillment_tx: None,
            withdrawal_tx: None,
            stage: SettlementStage::Published,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// In-flight negative intents keyed by intent hash. Completed settlements
/// are removed; failed ones stay for diagnosis and manual recovery.
#[derive(Debug, Default)]
pub struct IntentRegistry {
    contexts: Mutex<HashMap<B256, NegativeIntentContext>>,
}

impl IntentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, context: NegativeIntentContext) {
        debug!("📝 Tracking negative intent {}", context.intent_hash);
        self.contexts.lock().insert(context.intent_hash, context);
    }

    pub fn advance(&self, intent_hash: &B256, stage: SettlementStage) -> AppResult<()> {
        self.advance_with(intent_hash, stage, |_| {})
    }

    /// Moves the context forward and applies `update` under the same lock
    pub fn advance_with(
        &self,
        intent_hash: &B256,
        stage: SettlementStage,
        update: impl FnOnce(&mut NegativeIntentContext),
    ) -> AppResult<()> {
        let mut contexts = self.contexts.lock();
        let context = contexts
            .get_mut(intent_hash)
            .ok_or_else(|| AppError::NotFound(format!("negative intent {}", intent_hash)))?;

        if !context.stage.can_advance_to(stage) {
            return Err(SettlementError::InvalidContext(format!(
                "intent {} cannot move from {:?} to {:?}",
                intent_hash, context.stage, stage
            ))
            .into());
        }

        debug!("🔁 Intent {}: {:?} -> {:?}", intent_hash, context.stage, stage);
        context.stage = stage;
        context.updated_at = Utc::now();
        update(context);
        Ok(())
    }

    pub fn mark_failed(&self, intent_hash: &B256, error: &str) {
        let mut contexts = self.contexts.lock();
        match contexts.get_mut(intent_hash) {
            Some(context) => {
                context.stage = SettlementStage::Failed;
                context.error = Some(error.to_string());
                context.updated_at = Utc::now();
            }
            None => warn!("⚠️ Cannot mark unknown intent {} as failed", intent_hash),
        }
    }

    /// Removes a settled intent, returning its final context
    pub fn complete(&self, intent_hash: &B256) -> Option<NegativeIntentContext> {
        self.contexts.lock().remove(intent_hash).map(|mut context| {
            context.stage = SettlementStage::Done;
            context.updated_at = Utc::now();
            context
        })
    }

    pub fn get(&self, intent_hash: &B256) -> Option<NegativeIntentContext> {
        self.contexts.lock().get(intent_hash).cloned()
    }

    pub fn failed(&self) -> Vec<NegativeIntentContext> {
        self.contexts
            .lock()
            .values()
            .filter(|context| context.stage == SettlementStage::Failed)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
