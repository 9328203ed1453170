//! Provider configuration.
//!
//! Loaded from a YAML file and `FANOUT`-prefixed environment variables.
//! Nested keys use `__` in environment names, e.g.
//! `FANOUT__PUBLISH_RETRY__MAX_ATTEMPTS=8`.

use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "fanout.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "FANOUT_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "FANOUT";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "FANOUT_LOG";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// What the dispatcher does with an event whose type has no handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownTypePolicy {
    /// Acknowledge and log at debug level.
    #[default]
    Drop,
    /// Move to the subscription's dead-letter path.
    DeadLetter,
}

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Total attempts including the first. `None` retries forever.
    pub max_attempts: Option<usize>,
    pub jitter: bool,
}

impl BackoffConfig {
    /// Publish retry defaults: 5 attempts, 100ms to 5s.
    pub fn publish() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 5_000,
            max_attempts: Some(5),
            jitter: true,
        }
    }

    /// Reconnect defaults: unbounded, 100ms to 30s.
    pub fn reconnect() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 30_000,
            max_attempts: None,
            jitter: true,
        }
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.min_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "{}.min_delay_ms ({}) exceeds max_delay_ms ({})",
                name, self.min_delay_ms, self.max_delay_ms
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::Invalid(format!(
                "{}.max_attempts must be at least 1",
                name
            )));
        }
        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::publish()
    }
}

/// Configuration for one node's event provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Cluster this node belongs to.
    pub cluster_name: String,
    /// Stable id of this logical node.
    pub node_id: String,
    /// Use this subscription name verbatim instead of deriving one.
    pub subscription_name_override: Option<String>,
    /// Shared topic. Defaults to `{cluster_name}-events`.
    pub topic_name: Option<String>,
    /// Delivery attempts before dead-lettering. Defaults to the transport's.
    pub max_delivery_count: Option<u32>,
    /// Concurrent handler invocations.
    pub worker_pool_size: usize,
    /// Blocking timeout of a single receive call.
    pub receive_timeout_ms: u64,
    /// Time `stop()` waits for in-flight handlers.
    pub drain_timeout_ms: u64,
    pub unknown_type_policy: UnknownTypePolicy,
    /// Ask the transport to filter by registered type tags.
    pub transport_filters: bool,
    /// Acknowledge events published by this node without handling them.
    pub ignore_own_events: bool,
    pub publish_retry: BackoffConfig,
    pub reconnect: BackoffConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            node_id: String::new(),
            subscription_name_override: None,
            topic_name: None,
            max_delivery_count: None,
            worker_pool_size: 4,
            receive_timeout_ms: 1_000,
            drain_timeout_ms: 30_000,
            unknown_type_policy: UnknownTypePolicy::Drop,
            transport_filters: false,
            ignore_own_events: true,
            publish_retry: BackoffConfig::publish(),
            reconnect: BackoffConfig::reconnect(),
        }
    }
}

impl ProviderConfig {
    /// Defaults for a cluster/node pair.
    pub fn new(cluster_name: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `fanout.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: ProviderConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values the type system cannot.
    ///
    /// Cluster and node names are checked when the identity is resolved.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_pool_size == 0 {
            return Err(ConfigError::Invalid(
                "worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.receive_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "receive_timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_delivery_count == Some(0) {
            return Err(ConfigError::Invalid(
                "max_delivery_count must be at least 1".to_string(),
            ));
        }
        if matches!(&self.topic_name, Some(t) if t.is_empty()) {
            return Err(ConfigError::Invalid("topic_name must not be empty".to_string()));
        }
        self.publish_retry.validate("publish_retry")?;
        self.reconnect.validate("reconnect")?;
        Ok(())
    }

    /// Shared topic all nodes of the cluster publish to.
    pub fn topic(&self) -> String {
        self.topic_name
            .clone()
            .unwrap_or_else(|| format!("{}-events", self.cluster_name))
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests;
