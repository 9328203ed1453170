//! Dead-letter records.
//!
//! A message leaves normal delivery and lands on its subscription's
//! dead-letter path when:
//! - handlers failed on every attempt up to the delivery budget
//! - the envelope could not be decoded (no retry can fix it)
//! - its type is unknown and the unknown-type policy says dead-letter
//!
//! ## Path Naming
//!
//! Dead-letter paths follow the Service Bus convention:
//! `{topic}/subscriptions/{subscription}/$deadletterqueue`

use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;

use crate::codec::{self, CodecError, EventEnvelope};

/// Suffix identifying the dead-letter sub-queue of a subscription.
pub const DEAD_LETTER_SUFFIX: &str = "$deadletterqueue";

/// Build the dead-letter path for a subscription.
pub fn dead_letter_path(topic: &str, subscription: &str) -> String {
    format!(
        "{}/subscriptions/{}/{}",
        topic, subscription, DEAD_LETTER_SUFFIX
    )
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Handlers failed on every delivery up to the subscription's budget.
    MaxDeliveryCountExceeded { delivery_count: u32 },
    /// The envelope was structurally invalid.
    MalformedEnvelope(String),
    /// No handler is registered for the type tag.
    UnknownType(String),
    /// The payload could not be deserialized.
    Serialization(String),
}

impl DeadLetterReason {
    /// Short machine-readable label, suitable for log fields and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::MaxDeliveryCountExceeded { .. } => "max_delivery_count_exceeded",
            Self::MalformedEnvelope(_) => "malformed_envelope",
            Self::UnknownType(_) => "unknown_type",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<&CodecError> for DeadLetterReason {
    fn from(err: &CodecError) -> Self {
        match err {
            CodecError::MalformedEnvelope(msg) => Self::MalformedEnvelope(msg.clone()),
            CodecError::UnknownType(tag) => Self::UnknownType(tag.clone()),
            CodecError::Serialization { message, .. } => Self::Serialization(message.clone()),
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxDeliveryCountExceeded { delivery_count } => {
                write!(f, "max delivery count exceeded after {} deliveries", delivery_count)
            }
            Self::MalformedEnvelope(msg) => write!(f, "malformed envelope: {}", msg),
            Self::UnknownType(tag) => write!(f, "unknown event type '{}'", tag),
            Self::Serialization(msg) => write!(f, "payload serialization: {}", msg),
        }
    }
}

/// A message parked on a dead-letter path.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub topic: String,
    pub subscription: String,
    /// Original message body, untouched.
    pub body: Bytes,
    pub reason: DeadLetterReason,
    pub delivery_count: u32,
    pub occurred_at: SystemTime,
}

impl DeadLetter {
    /// Decode the original envelope, for inspection or replay.
    pub fn envelope(&self) -> codec::Result<EventEnvelope> {
        codec::decode_envelope(&self.body)
    }

    /// Path this record lives on.
    pub fn path(&self) -> String {
        dead_letter_path(&self.topic, &self.subscription)
    }
}
