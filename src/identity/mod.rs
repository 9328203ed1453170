//! Subscription identity resolution.
//!
//! Every node in a cluster owns one durable subscription on the shared event
//! topic. The subscription name must be:
//! - stable across restarts of the same logical node (queued events survive)
//! - unique across nodes (otherwise two nodes compete for one backlog)
//!
//! Names are derived as `{cluster_name}-{node_id}` unless an explicit
//! override is configured, in which case the override is used verbatim.
//!
//! ## Naming rules
//!
//! Subscription names follow the Azure Service Bus rules:
//! - ASCII letters, digits, `.`, `-`, `_`
//! - start and end with a letter or digit
//! - at most [`MAX_SUBSCRIPTION_NAME_LEN`] characters
//!
//! Derived names over the length limit are shortened to a prefix plus a
//! digest of the full name. Overrides are never rewritten.

use std::fmt;

use sha2::{Digest, Sha256};

/// Maximum subscription name length accepted by the transport.
pub const MAX_SUBSCRIPTION_NAME_LEN: usize = 50;

/// Number of hex digits of the digest appended to shortened names.
const DIGEST_SUFFIX_LEN: usize = 8;

/// Errors that can occur while resolving an identity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} '{value}' contains illegal character '{character}'")]
    IllegalCharacter {
        field: &'static str,
        value: String,
        character: char,
    },

    #[error("{field} '{value}' must start and end with a letter or digit")]
    BadBoundary { field: &'static str, value: String },

    #[error("{field} '{value}' exceeds {max} characters")]
    TooLong {
        field: &'static str,
        value: String,
        max: usize,
    },
}

/// Resolved identity of a node's durable subscription.
///
/// Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionIdentity {
    cluster_name: String,
    node_id: String,
    computed_name: String,
    overridden: bool,
}

impl SubscriptionIdentity {
    /// Logical cluster the node belongs to.
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// This node's identity within the cluster.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Name of the durable subscription.
    pub fn computed_name(&self) -> &str {
        &self.computed_name
    }

    /// Whether the subscription name came from an override rather than derivation.
    pub fn is_overridden(&self) -> bool {
        self.overridden
    }
}

impl fmt::Display for SubscriptionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.computed_name)
    }
}

/// Resolve the subscription identity for a node.
///
/// Pure function: the same inputs always yield the same name.
pub fn resolve(
    cluster_name: &str,
    node_id: &str,
    override_name: Option<&str>,
) -> Result<SubscriptionIdentity, IdentityError> {
    validate_part("cluster_name", cluster_name)?;
    validate_part("node_id", node_id)?;

    let computed_name = match override_name {
        Some(name) => {
            validate_part("subscription_name_override", name)?;
            if name.len() > MAX_SUBSCRIPTION_NAME_LEN {
                return Err(IdentityError::TooLong {
                    field: "subscription_name_override",
                    value: name.to_string(),
                    max: MAX_SUBSCRIPTION_NAME_LEN,
                });
            }
            name.to_string()
        }
        None => derive_name(cluster_name, node_id),
    };

    Ok(SubscriptionIdentity {
        cluster_name: cluster_name.to_string(),
        node_id: node_id.to_string(),
        computed_name,
        overridden: override_name.is_some(),
    })
}

/// Check whether a string is a legal subscription name.
pub fn is_valid_subscription_name(name: &str) -> bool {
    name.len() <= MAX_SUBSCRIPTION_NAME_LEN && validate_part("name", name).is_ok()
}

/// Build the default name, shortening it when it exceeds the limit.
fn derive_name(cluster_name: &str, node_id: &str) -> String {
    let full = format!("{}-{}", cluster_name, node_id);
    if full.len() <= MAX_SUBSCRIPTION_NAME_LEN {
        return full;
    }

    let digest = hex::encode(Sha256::digest(full.as_bytes()));
    let keep = MAX_SUBSCRIPTION_NAME_LEN - DIGEST_SUFFIX_LEN - 1;
    // Inputs are validated ASCII, so byte slicing is on char boundaries.
    let prefix = full[..keep].trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    format!("{}-{}", prefix, &digest[..DIGEST_SUFFIX_LEN])
}

fn validate_part(field: &'static str, value: &str) -> Result<(), IdentityError> {
    if value.is_empty() {
        return Err(IdentityError::Empty { field });
    }

    if let Some(character) = value.chars().find(|c| !is_legal_char(*c)) {
        return Err(IdentityError::IllegalCharacter {
            field,
            value: value.to_string(),
            character,
        });
    }

    let starts_ok = value.starts_with(|c: char| c.is_ascii_alphanumeric());
    let ends_ok = value.ends_with(|c: char| c.is_ascii_alphanumeric());
    if !starts_ok || !ends_ok {
        return Err(IdentityError::BadBoundary {
            field,
            value: value.to_string(),
        });
    }

    Ok(())
}

fn is_legal_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_')
}

#[cfg(test)]
mod tests;
