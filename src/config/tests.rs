use std::io::Write;

use serial_test::serial;

use super::*;

const ENV_VARS: &[&str] = &[
    CONFIG_ENV_VAR,
    "FANOUT__CLUSTER_NAME",
    "FANOUT__NODE_ID",
    "FANOUT__WORKER_POOL_SIZE",
    "FANOUT__UNKNOWN_TYPE_POLICY",
    "FANOUT__PUBLISH_RETRY__MAX_ATTEMPTS",
];

fn clear_env() {
    for var in ENV_VARS {
        std::env::remove_var(var);
    }
}

fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_defaults() {
    let config = ProviderConfig::new("cluster1", "nodeB");
    assert_eq!(config.worker_pool_size, 4);
    assert_eq!(config.receive_timeout(), Duration::from_secs(1));
    assert_eq!(config.drain_timeout(), Duration::from_secs(30));
    assert_eq!(config.unknown_type_policy, UnknownTypePolicy::Drop);
    assert!(config.ignore_own_events);
    assert!(!config.transport_filters);
    assert_eq!(config.publish_retry.max_attempts, Some(5));
    assert_eq!(config.reconnect.max_attempts, None);
    assert!(config.validate().is_ok());
}

#[test]
fn test_topic_defaults_to_cluster_events() {
    let mut config = ProviderConfig::new("cluster1", "nodeB");
    assert_eq!(config.topic(), "cluster1-events");

    config.topic_name = Some("shared".to_string());
    assert_eq!(config.topic(), "shared");
}

#[test]
fn test_validate_rejects_zero_pool() {
    let config = ProviderConfig {
        worker_pool_size: 0,
        ..ProviderConfig::new("c", "n")
    };
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
}

#[test]
fn test_validate_rejects_inverted_backoff() {
    let mut config = ProviderConfig::new("c", "n");
    config.reconnect.min_delay_ms = 10_000;
    config.reconnect.max_delay_ms = 10;

    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("reconnect.min_delay_ms"));
}

#[test]
fn test_validate_rejects_zero_budgets() {
    let config = ProviderConfig {
        max_delivery_count: Some(0),
        ..ProviderConfig::new("c", "n")
    };
    assert!(config.validate().is_err());

    let mut config = ProviderConfig::new("c", "n");
    config.publish_retry.max_attempts = Some(0);
    assert!(config.validate().is_err());
}

#[test]
#[serial]
fn test_load_from_yaml() {
    clear_env();
    let file = yaml_file(
        r#"
cluster_name: cluster1
node_id: nodeB
subscription_name_override: legacy-sub
worker_pool_size: 2
unknown_type_policy: dead_letter
publish_retry:
  max_attempts: 3
  min_delay_ms: 10
  max_delay_ms: 50
"#,
    );

    let config = ProviderConfig::load(file.path().to_str()).unwrap();
    assert_eq!(config.cluster_name, "cluster1");
    assert_eq!(config.node_id, "nodeB");
    assert_eq!(config.subscription_name_override.as_deref(), Some("legacy-sub"));
    assert_eq!(config.worker_pool_size, 2);
    assert_eq!(config.unknown_type_policy, UnknownTypePolicy::DeadLetter);
    assert_eq!(config.publish_retry.max_attempts, Some(3));
    assert_eq!(config.publish_retry.max_delay(), Duration::from_millis(50));
    // Untouched blocks keep their defaults.
    assert_eq!(config.reconnect, BackoffConfig::reconnect());
}

#[test]
#[serial]
fn test_env_overrides_file() {
    clear_env();
    let file = yaml_file("cluster_name: cluster1\nnode_id: nodeB\nworker_pool_size: 2\n");

    std::env::set_var("FANOUT__NODE_ID", "nodeC");
    std::env::set_var("FANOUT__WORKER_POOL_SIZE", "8");
    std::env::set_var("FANOUT__PUBLISH_RETRY__MAX_ATTEMPTS", "9");

    let config = ProviderConfig::load(file.path().to_str());
    clear_env();
    let config = config.unwrap();

    assert_eq!(config.cluster_name, "cluster1");
    assert_eq!(config.node_id, "nodeC");
    assert_eq!(config.worker_pool_size, 8);
    assert_eq!(config.publish_retry.max_attempts, Some(9));
}

#[test]
#[serial]
fn test_config_env_var_names_file() {
    clear_env();
    let file = yaml_file("cluster_name: fromenv\nnode_id: n1\n");
    std::env::set_var(CONFIG_ENV_VAR, file.path());

    let config = ProviderConfig::load(None);
    clear_env();

    assert_eq!(config.unwrap().cluster_name, "fromenv");
}

#[test]
#[serial]
fn test_missing_explicit_file_fails() {
    clear_env();
    let result = ProviderConfig::load(Some("/nonexistent/fanout-test.yaml"));
    assert!(matches!(result, Err(ConfigError::Load(_))));
}

#[test]
#[serial]
fn test_load_validates() {
    clear_env();
    let file = yaml_file("cluster_name: c\nnode_id: n\nworker_pool_size: 0\n");
    assert!(matches!(
        ProviderConfig::load(file.path().to_str()),
        Err(ConfigError::Invalid(_))
    ));
}
