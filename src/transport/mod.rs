//! Message transport abstraction.
//!
//! The broker itself (topics, persistence, network, auth) is an external
//! collaborator. This module defines the minimal contract the fan-out layer
//! consumes from it:
//! - durable, named subscriptions on a shared topic
//! - send to a topic
//! - blocking receive with a lease (delivery token)
//! - settle a lease: acknowledge, abandon, or dead-letter
//!
//! Implementations:
//! - `InMemoryTransport`: broker-less, single process (tests, standalone)

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::dlq::DeadLetterReason;

pub mod memory;

pub use memory::{InMemoryBroker, InMemoryTransport};

/// Delivery attempts before dead-lettering when neither the caller nor the
/// transport overrides it.
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur during transport operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transient transport failure: {0}")]
    Transient(String),

    #[error("Permanent transport failure: {0}")]
    Permanent(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Subscription '{0}' is bound by another live consumer")]
    SubscriptionConflict(String),

    #[error("Delivery lease not found: {0}")]
    LeaseLost(String),
}

impl TransportError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::ConnectionLost(_))
    }
}

/// Which messages a subscription receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SubscriptionFilter {
    /// Every message on the topic.
    #[default]
    All,
    /// Only messages whose type tag is in the set.
    TypeTags(BTreeSet<String>),
}

impl SubscriptionFilter {
    /// Check whether a message with this type tag passes the filter.
    pub fn matches(&self, type_tag: &str) -> bool {
        match self {
            Self::All => true,
            Self::TypeTags(tags) => tags.contains(type_tag),
        }
    }
}

/// Options applied when creating or binding a subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    pub filter: SubscriptionFilter,
    /// `None` keeps the existing value, or the transport default for new subscriptions.
    pub max_delivery_count: Option<u32>,
}

/// A live binding to a durable subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    topic: String,
    subscription: String,
    binding: u64,
}

impl SubscriptionHandle {
    pub fn new(topic: impl Into<String>, subscription: impl Into<String>, binding: u64) -> Self {
        Self {
            topic: topic.into(),
            subscription: subscription.into(),
            binding,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Transport-assigned id distinguishing successive bindings.
    pub fn binding(&self) -> u64 {
        self.binding
    }
}

/// Lease on a received message, used to settle it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryToken {
    topic: String,
    subscription: String,
    lock_token: Uuid,
}

impl DeliveryToken {
    pub fn new(topic: impl Into<String>, subscription: impl Into<String>, lock_token: Uuid) -> Self {
        Self {
            topic: topic.into(),
            subscription: subscription.into(),
            lock_token,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn lock_token(&self) -> Uuid {
        self.lock_token
    }
}

/// A message received from a subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: Bytes,
    pub token: DeliveryToken,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
    /// Topic-wide publish sequence number.
    pub sequence: u64,
}

/// A message to send to a topic.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Exposed to the transport for subscription filters.
    pub type_tag: String,
    pub body: Bytes,
}

/// Acknowledgment of an accepted send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendAck {
    pub sequence: u64,
}

/// Interface to the pub/sub broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create the durable subscription if missing and bind to it.
    ///
    /// Returns `SubscriptionConflict` if another live consumer holds the binding.
    async fn create_or_bind_subscription(
        &self,
        topic: &str,
        subscription: &str,
        options: &SubscriptionOptions,
    ) -> Result<SubscriptionHandle>;

    /// Send a message to every subscription of a topic.
    async fn send(&self, topic: &str, message: OutboundMessage) -> Result<SendAck>;

    /// Wait up to `timeout` for the next message. `Ok(None)` on timeout.
    async fn receive(
        &self,
        handle: &SubscriptionHandle,
        timeout: Duration,
    ) -> Result<Option<Delivery>>;

    /// Remove a message from the subscription backlog.
    async fn acknowledge(&self, token: &DeliveryToken) -> Result<()>;

    /// Release a message for redelivery.
    ///
    /// Once the delivery count reaches the subscription's maximum, the
    /// message is moved to the dead-letter path instead.
    async fn abandon(&self, token: &DeliveryToken) -> Result<()>;

    /// Move a message straight to the dead-letter path.
    async fn dead_letter(&self, token: &DeliveryToken, reason: DeadLetterReason) -> Result<()>;

    /// Close a binding. Unsettled messages are released for redelivery;
    /// the subscription and its backlog remain.
    async fn close_subscription(&self, handle: &SubscriptionHandle) -> Result<()>;

    /// Destroy a durable subscription and its backlog.
    async fn delete_subscription(&self, topic: &str, subscription: &str) -> Result<()>;

    /// Whether `SubscriptionFilter::TypeTags` is applied broker-side.
    fn supports_filters(&self) -> bool {
        false
    }

    /// Replace the filter of a bound subscription.
    async fn update_filter(
        &self,
        _handle: &SubscriptionHandle,
        _filter: &SubscriptionFilter,
    ) -> Result<()> {
        Ok(())
    }

    fn default_max_delivery_count(&self) -> u32 {
        DEFAULT_MAX_DELIVERY_COUNT
    }
}
