//! kadbus publish/subscribe
//!
//! Subscriptions are DHT entries keyed by topic. Publishing resolves the
//! subscribers of a key through the DHT and delivers to each one over the
//! peer transport; deliveries that fail are queued for a later retry.
//!
//! All work runs as events on the queues built by [`pipelines`]:
//! - `subscribe` stores a subscription in the DHT
//! - `publish` finds subscribers, caches correlated requests and delivers
//! - `callback` runs a local subscription's callback for an inbound message
//! - `republish` holds failed publishes until [`pipelines::drain_republish`]

pub mod context;
pub mod error;
pub mod peer;
pub mod pipelines;
pub mod processors;
pub mod waiters;

pub use context::{ActiveContexts, CallbackContext, ContextGuard};
pub use error::{PubSubError, Result};
pub use peer::{DataSource, MessageCache, Peer, SubscriptionCallback};
pub use pipelines::{build_queues, build_registry, drain_republish};
pub use processors::RepublishPolicy;
pub use waiters::{ResponseHandle, ResponseWaiters, SyncResponse};
