//! Negative-intent settlement: publish a deliberately loss-making intent,
//! wait for its proof, trigger fulfillment and withdraw the reward.

pub mod intent;
pub mod negative_intent;
pub mod registry;

pub use intent::{
    FulfillmentTrigger, Intent, IntentSource, IntentSourceConfig, PublishedIntent, Reward, Route,
};
pub use negative_intent::{NegativeIntentConfig, NegativeIntentProvider, INTENT_PROVEN_EVENT};
pub use registry::{IntentRegistry, NegativeIntentContext, SettlementStage};
