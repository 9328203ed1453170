//! Event provider facade.
//!
//! The only type application code needs: publish events, register handlers,
//! start and stop the node's durable subscription.
//!
//! # Example
//!
//! ```ignore
//! use fanout::config::ProviderConfig;
//! use fanout::facade::EventProvider;
//! use fanout::transport::InMemoryBroker;
//!
//! let broker = InMemoryBroker::new();
//! let provider = EventProvider::new(
//!     ProviderConfig::new("cluster1", "nodeB"),
//!     Arc::new(broker.connect()),
//! )?;
//!
//! provider.on_event(|event: CacheInvalidate| async move {
//!     cache.remove(&event.key);
//!     Ok(())
//! });
//! provider.start().await?;
//!
//! provider.publish_event(&CacheInvalidate { key: "key:42".into() }).await?;
//! ```

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{watch, Mutex};
use tracing::info;

use crate::bus::{
    BusError, DispatchStats, DispatchStatsSnapshot, EventHandler, HandlerError, HandlerRegistry,
    PublishError, Publisher, RunningSubscription, StopReport, Subscriber, SubscriberState,
};
use crate::codec::{Event, EventCodec, EventEnvelope};
use crate::config::ProviderConfig;
use crate::identity::{self, SubscriptionIdentity};
use crate::transport::{SendAck, Transport};

/// A node's connection to the cluster event topic.
pub struct EventProvider {
    config: ProviderConfig,
    identity: SubscriptionIdentity,
    transport: Arc<dyn Transport>,
    codec: Arc<EventCodec>,
    registry: Arc<HandlerRegistry>,
    publisher: Publisher,
    stats: Arc<DispatchStats>,
    state: Arc<watch::Sender<SubscriberState>>,
    running: Mutex<Option<RunningSubscription>>,
}

impl EventProvider {
    /// Create a provider, resolving the subscription identity from config.
    pub fn new(config: ProviderConfig, transport: Arc<dyn Transport>) -> Result<Self, BusError> {
        let identity = identity::resolve(
            &config.cluster_name,
            &config.node_id,
            config.subscription_name_override.as_deref(),
        )?;
        Self::with_identity(config, identity, transport)
    }

    /// Create a provider with an already resolved identity.
    pub fn with_identity(
        config: ProviderConfig,
        identity: SubscriptionIdentity,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, BusError> {
        config.validate()?;

        let codec = Arc::new(EventCodec::new(identity.node_id()));
        let publisher = Publisher::new(transport.clone(), config.topic())
            .with_retry(config.publish_retry.clone());
        let (state, _) = watch::channel(SubscriberState::Created);

        info!(
            cluster = %identity.cluster_name(),
            node = %identity.node_id(),
            subscription = %identity,
            overridden = identity.is_overridden(),
            topic = %config.topic(),
            "Event provider created"
        );

        Ok(Self {
            config,
            identity,
            transport,
            codec,
            registry: Arc::new(HandlerRegistry::new()),
            publisher,
            stats: Arc::new(DispatchStats::default()),
            state: Arc::new(state),
            running: Mutex::new(None),
        })
    }

    pub fn identity(&self) -> &SubscriptionIdentity {
        &self.identity
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn state_changes(&self) -> watch::Receiver<SubscriberState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Publish a typed event to every node of the cluster.
    pub async fn publish_event<E: Event>(&self, event: &E) -> Result<SendAck, BusError> {
        let body = self
            .codec
            .encode_event(event)
            .map_err(PublishError::Encode)?;
        Ok(self.publisher.publish(E::TYPE_TAG, body).await?)
    }

    /// Publish raw payload bytes under a type tag.
    pub async fn publish_raw(
        &self,
        type_tag: &str,
        payload: impl Into<Bytes>,
    ) -> Result<SendAck, BusError> {
        let body = self
            .codec
            .encode(type_tag, payload)
            .map_err(PublishError::Encode)?;
        Ok(self.publisher.publish(type_tag, body).await?)
    }

    /// Register a typed handler. The payload is decoded into `E` first.
    ///
    /// Registrations made after `start()` take effect for later messages.
    pub fn on_event<E, F, Fut>(&self, handler: F)
    where
        E: Event,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on_raw_event(E::TYPE_TAG, move |envelope: Arc<EventEnvelope>| {
            let handler = handler.clone();
            async move {
                let event = envelope.payload_as::<E>()?;
                (*handler)(event).await
            }
        });
    }

    /// Register a handler receiving the whole envelope.
    pub fn on_raw_event(&self, type_tag: &str, handler: impl EventHandler + 'static) {
        self.codec.register_type(type_tag);
        self.registry.register(type_tag, Arc::new(handler));
    }

    /// Bind the durable subscription and start dispatching.
    ///
    /// Fails with `AlreadyStarted` once started, including after `stop()`.
    pub async fn start(&self) -> Result<(), BusError> {
        let mut running = self.running.lock().await;
        if running.is_some() || self.state() != SubscriberState::Created {
            return Err(BusError::AlreadyStarted);
        }

        let subscriber = Subscriber::new(
            self.transport.clone(),
            self.codec.clone(),
            self.config.clone(),
        )
        .with_stats(self.stats.clone())
        .with_state(self.state.clone());

        *running = Some(subscriber.start(&self.identity, self.registry.clone()).await?);
        Ok(())
    }

    /// Stop with the configured drain timeout.
    pub async fn stop(&self) -> Result<StopReport, BusError> {
        self.stop_with_timeout(self.config.drain_timeout()).await
    }

    /// Stop receiving and wait up to `timeout` for in-flight handlers.
    ///
    /// The durable subscription survives; messages published while stopped
    /// are delivered after the next start of this node.
    pub async fn stop_with_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<StopReport, BusError> {
        let running = self.running.lock().await.take();
        match running {
            Some(running) => Ok(running.stop(timeout).await),
            None => Err(BusError::NotStarted),
        }
    }

    /// Permanently retire this node: stop if running, then delete its
    /// durable subscription and backlog.
    pub async fn decommission(&self) -> Result<Option<StopReport>, BusError> {
        let running = self.running.lock().await.take();
        let report = match running {
            Some(running) => Some(running.stop(self.config.drain_timeout()).await),
            None => None,
        };

        self.transport
            .delete_subscription(&self.config.topic(), self.identity.computed_name())
            .await?;
        self.state.send_replace(SubscriberState::Stopped);

        info!(subscription = %self.identity, "Node decommissioned");
        Ok(report)
    }
}
