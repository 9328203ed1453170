//! Event bus: publish and subscribe over a shared topic.
//!
//! This module contains:
//! - `EventHandler` trait: for processing events
//! - `HandlerRegistry`: type tag to ordered handlers, copy-on-write
//! - `Publisher`: sends envelopes with retry
//! - `Subscriber`: durable subscription, receive loop and worker pool
//! - Error taxonomy for the bus layer

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::codec::{CodecError, EventEnvelope};
use crate::config::ConfigError;
use crate::identity::IdentityError;
use crate::transport::TransportError;

pub mod dispatch;
pub mod publisher;
pub mod registry;
pub mod subscriber;

pub use dispatch::{DispatchResult, DispatchStats, DispatchStatsSnapshot, Dispatcher, Settlement};
pub use publisher::Publisher;
pub use registry::HandlerRegistry;
pub use subscriber::{RunningSubscription, StopReport, Subscriber, SubscriberState};

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors surfaced by the provider to application code.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid subscription identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Subscription '{0}' is already bound by another live consumer")]
    SubscriptionConflict(String),

    #[error("Provider already started")]
    AlreadyStarted,

    #[error("Provider not started")]
    NotStarted,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors from a publish call.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Publish gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: usize,
        #[source]
        source: TransportError,
    },

    #[error("Publish rejected: {0}")]
    Rejected(TransportError),

    #[error("Cannot encode event: {0}")]
    Encode(#[from] CodecError),
}

/// Errors returned by event handlers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Cannot decode payload: {0}")]
    Decode(#[from] CodecError),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Handler for processing events from the bus.
///
/// Delivery is at-least-once: a handler may see the same `event_id` more
/// than once and must tolerate it.
pub trait EventHandler: Send + Sync {
    /// Process an event envelope.
    fn handle(
        &self,
        envelope: Arc<EventEnvelope>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

impl<F, Fut> EventHandler for F
where
    F: Fn(Arc<EventEnvelope>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn handle(
        &self,
        envelope: Arc<EventEnvelope>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        Box::pin(self(envelope))
    }
}
