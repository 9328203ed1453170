//! Shared utilities for integration tests.
//!
//! Builds clusters of providers on one in-memory broker.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fanout::config::{BackoffConfig, ProviderConfig};
use fanout::transport::{InMemoryBroker, InMemoryTransport};
use fanout::{Event, EventProvider};
use serde::{Deserialize, Serialize};

pub const CLUSTER: &str = "cluster1";
pub const TOPIC: &str = "cluster1-events";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInvalidate {
    pub key: String,
}

impl CacheInvalidate {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
        }
    }
}

impl Event for CacheInvalidate {
    const TYPE_TAG: &'static str = "CacheInvalidate";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPublished {
    pub content_id: u64,
}

impl Event for ContentPublished {
    const TYPE_TAG: &'static str = "ContentPublished";
}

/// Fast timings so tests settle quickly.
pub fn node_config(node_id: &str) -> ProviderConfig {
    fanout::utils::bootstrap::init_test_tracing();
    ProviderConfig {
        receive_timeout_ms: 20,
        drain_timeout_ms: 1_000,
        reconnect: BackoffConfig {
            min_delay_ms: 5,
            max_delay_ms: 20,
            max_attempts: None,
            jitter: false,
        },
        publish_retry: BackoffConfig {
            min_delay_ms: 1,
            max_delay_ms: 5,
            max_attempts: Some(3),
            jitter: false,
        },
        ..ProviderConfig::new(CLUSTER, node_id)
    }
}

/// A provider plus its own transport connection.
pub struct TestNode {
    pub provider: EventProvider,
    pub transport: Arc<InMemoryTransport>,
}

impl TestNode {
    pub fn new(broker: &InMemoryBroker, config: ProviderConfig) -> Self {
        let transport = Arc::new(broker.connect());
        let provider = EventProvider::new(config, transport.clone()).unwrap();
        Self {
            provider,
            transport,
        }
    }

    pub fn subscription(&self) -> String {
        self.provider.identity().computed_name().to_string()
    }
}

/// Collects typed events a node handled.
#[derive(Clone)]
pub struct Received<E> {
    events: Arc<Mutex<Vec<E>>>,
}

impl<E: Event + Clone> Received<E> {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register on `provider`, recording every decoded event.
    pub fn attach(&self, provider: &EventProvider) {
        let events = self.events.clone();
        provider.on_event(move |event: E| {
            let events = events.clone();
            async move {
                events.lock().unwrap().push(event);
                Ok::<(), fanout::HandlerError>(())
            }
        });
    }

    pub fn events(&self) -> Vec<E> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

/// Poll until `condition` holds, failing after five seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
