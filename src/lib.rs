//! Fanout - durable per-node event notification fan-out
//!
//! Every node of a cluster binds its own durable subscription to a shared
//! event topic, so cache and content invalidation events published by any
//! node reach all others at least once, including nodes that were briefly
//! disconnected while the events were published.

pub mod bus;
pub mod codec;
pub mod config;
pub mod dlq;
pub mod facade;
pub mod identity;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

pub use bus::{BusError, EventHandler, HandlerError, PublishError, StopReport, SubscriberState};
pub use codec::{Event, EventEnvelope};
pub use config::ProviderConfig;
pub use facade::EventProvider;
pub use identity::SubscriptionIdentity;
