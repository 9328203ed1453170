use super::*;

#[test]
fn test_resolve_derives_cluster_node_name() {
    let identity = resolve("cluster1", "nodeB", None).unwrap();
    assert_eq!(identity.computed_name(), "cluster1-nodeB");
    assert_eq!(identity.cluster_name(), "cluster1");
    assert_eq!(identity.node_id(), "nodeB");
    assert!(!identity.is_overridden());
}

#[test]
fn test_resolve_is_deterministic() {
    for (cluster, node) in [("c", "n"), ("prod.eu", "web_01"), ("a-b", "c-d")] {
        let first = resolve(cluster, node, None).unwrap();
        let second = resolve(cluster, node, None).unwrap();
        assert_eq!(first, second);
    }
}

#[test]
fn test_distinct_nodes_get_distinct_names() {
    let b = resolve("cluster1", "nodeB", None).unwrap();
    let c = resolve("cluster1", "nodeC", None).unwrap();
    assert_ne!(b.computed_name(), c.computed_name());
}

#[test]
fn test_override_wins_verbatim() {
    let a = resolve("cluster1", "nodeA", Some("cms-web-primary")).unwrap();
    let b = resolve("other", "nodeZ", Some("cms-web-primary")).unwrap();
    assert_eq!(a.computed_name(), "cms-web-primary");
    assert_eq!(b.computed_name(), "cms-web-primary");
    assert!(a.is_overridden());
}

#[test]
fn test_empty_inputs_rejected() {
    assert_eq!(
        resolve("", "node", None),
        Err(IdentityError::Empty {
            field: "cluster_name"
        })
    );
    assert_eq!(
        resolve("cluster", "", None),
        Err(IdentityError::Empty { field: "node_id" })
    );
    assert_eq!(
        resolve("cluster", "node", Some("")),
        Err(IdentityError::Empty {
            field: "subscription_name_override"
        })
    );
}

#[test]
fn test_illegal_characters_rejected() {
    let err = resolve("cluster one", "node", None).unwrap_err();
    assert_eq!(
        err,
        IdentityError::IllegalCharacter {
            field: "cluster_name",
            value: "cluster one".to_string(),
            character: ' ',
        }
    );

    assert!(matches!(
        resolve("cluster", "node/1", None),
        Err(IdentityError::IllegalCharacter { character: '/', .. })
    ));
    assert!(matches!(
        resolve("cluster", "nöde", None),
        Err(IdentityError::IllegalCharacter { .. })
    ));
}

#[test]
fn test_separator_boundaries_rejected() {
    assert!(matches!(
        resolve("-cluster", "node", None),
        Err(IdentityError::BadBoundary { .. })
    ));
    assert!(matches!(
        resolve("cluster", "node.", None),
        Err(IdentityError::BadBoundary { .. })
    ));
}

#[test]
fn test_long_override_rejected() {
    let name = "x".repeat(MAX_SUBSCRIPTION_NAME_LEN + 1);
    assert!(matches!(
        resolve("cluster", "node", Some(&name)),
        Err(IdentityError::TooLong { max: 50, .. })
    ));
}

#[test]
fn test_long_derived_name_is_shortened_stably() {
    let cluster = "c".repeat(45);
    let first = resolve(&cluster, "node-0001", None).unwrap();
    let again = resolve(&cluster, "node-0001", None).unwrap();
    let other = resolve(&cluster, "node-0002", None).unwrap();

    assert_eq!(first.computed_name().len(), MAX_SUBSCRIPTION_NAME_LEN);
    assert_eq!(first.computed_name(), again.computed_name());
    assert_ne!(first.computed_name(), other.computed_name());
    assert!(is_valid_subscription_name(first.computed_name()));
}

#[test]
fn test_is_valid_subscription_name() {
    assert!(is_valid_subscription_name("cluster1-nodeB"));
    assert!(!is_valid_subscription_name("bad name"));
    assert!(!is_valid_subscription_name(&"a".repeat(51)));
}

#[test]
fn test_display_is_computed_name() {
    let identity = resolve("cluster1", "nodeC", None).unwrap();
    assert_eq!(identity.to_string(), "cluster1-nodeC");
}
