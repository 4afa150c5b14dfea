//! Application Services
//!
//! - [`StreamingContext`]: one streaming session and its subscriptions
//! - [`Subscription`]: caller-visible handle for one logical subscription

mod streaming_context;
mod subscription;

pub use streaming_context::{ContextConfig, ContextState, StreamingContext};
pub use subscription::{Subscription, SubscriptionEvent, SubscriptionId};
