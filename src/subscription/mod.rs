//! Subscription Manager module (§4.3).

pub mod manager;
pub mod types;

pub use manager::{CmProvisioner, SmStatsSnapshot, SubscriptionManager};
pub use types::{
    SmEvent, Selector, SubscribeOutcome, SubscriptionRequest, SubscriptionRow, SubscriptionStatus,
    UnsubscribeOutcome,
};
