//! fanout-standalone: in-process cluster demo
//!
//! Runs several nodes against one in-memory broker. Each node loads the
//! same configuration, swapping in its own node id, then one node
//! publishes a cache invalidation that every other node logs.
//!
//! ## Configuration
//! - FANOUT_CONFIG / fanout.yaml / FANOUT__* variables: provider settings
//! - FANOUT_LOG: log filter (default: info)
//!
//! Node ids come from the command line (default: nodeA nodeB nodeC).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use fanout::transport::InMemoryBroker;
use fanout::utils::bootstrap::init_tracing;
use fanout::{Event, EventProvider, HandlerError, ProviderConfig};

const DEFAULT_CLUSTER: &str = "standalone";
const DEFAULT_NODES: [&str; 3] = ["nodeA", "nodeB", "nodeC"];
const SETTLE_TIME: Duration = Duration::from_millis(500);

#[derive(Debug, Serialize, Deserialize)]
struct CacheInvalidate {
    key: String,
}

impl Event for CacheInvalidate {
    const TYPE_TAG: &'static str = "CacheInvalidate";
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let base = ProviderConfig::load(None)?;
    let cluster = if base.cluster_name.is_empty() {
        DEFAULT_CLUSTER.to_string()
    } else {
        base.cluster_name.clone()
    };

    let mut node_ids: Vec<String> = std::env::args().skip(1).collect();
    if node_ids.is_empty() {
        node_ids = DEFAULT_NODES.iter().map(|n| n.to_string()).collect();
    }

    let broker = InMemoryBroker::new();
    let mut providers = Vec::with_capacity(node_ids.len());
    for node_id in &node_ids {
        let config = ProviderConfig {
            cluster_name: cluster.clone(),
            node_id: node_id.clone(),
            subscription_name_override: None,
            ..base.clone()
        };
        let provider = EventProvider::new(config, Arc::new(broker.connect()))?;

        let node = node_id.clone();
        provider.on_event(move |event: CacheInvalidate| {
            let node = node.clone();
            async move {
                info!(node = %node, key = %event.key, "Invalidated cache entry");
                Ok::<(), HandlerError>(())
            }
        });
        provider.start().await?;
        providers.push(provider);
    }

    info!(cluster = %cluster, nodes = providers.len(), "fanout-standalone started");

    if let Some(origin) = providers.first() {
        let ack = origin
            .publish_event(&CacheInvalidate {
                key: "demo:1".to_string(),
            })
            .await?;
        info!(sequence = ack.sequence, "Published invalidation");
    }

    tokio::time::sleep(SETTLE_TIME).await;

    for provider in &providers {
        let report = provider.stop().await?;
        let stats = provider.stats();
        info!(
            node = %provider.identity().node_id(),
            received = stats.received,
            acknowledged = stats.acknowledged,
            drained_cleanly = report.drained_cleanly,
            "Node stopped"
        );
    }

    Ok(())
}
