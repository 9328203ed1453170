//! Event envelope codec.
//!
//! Every event crossing the topic is wrapped in a protobuf envelope carrying
//! its type tag, origin node, timestamp and a unique event id. Typed
//! payloads are JSON inside the envelope's `payload` bytes, so any number of
//! event kinds can share one topic.
//!
//! Decoding is forward compatible: fields added to the envelope by newer
//! publishers are skipped by protobuf decoding rather than rejected.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};
use std::time::SystemTime;

use bytes::Bytes;
use prost::Message;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors that can occur while encoding or decoding envelopes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Cannot serialize event '{type_tag}': {message}")]
    Serialization { type_tag: String, message: String },

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Unknown event type '{0}'")]
    UnknownType(String),
}

/// A typed event that can travel over the topic.
///
/// # Example
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct CacheInvalidate { key: String }
///
/// impl Event for CacheInvalidate {
///     const TYPE_TAG: &'static str = "CacheInvalidate";
/// }
/// ```
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Tag identifying this event's logical type on the wire.
    const TYPE_TAG: &'static str;
}

/// Protobuf wire form of an envelope.
#[derive(Clone, PartialEq, prost::Message)]
pub struct WireEnvelope {
    #[prost(string, tag = "1")]
    pub type_tag: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: Bytes,
    #[prost(string, tag = "3")]
    pub source_node_id: String,
    #[prost(message, optional, tag = "4")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(string, tag = "5")]
    pub event_id: String,
}

/// A decoded event envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    /// Unique id of the publish, shared by every redelivery of it.
    pub event_id: Uuid,
    /// Logical type of the payload.
    pub type_tag: String,
    /// Opaque payload bytes.
    pub payload: Bytes,
    /// Node that published the event.
    pub source_node_id: String,
    /// When the event was published.
    pub timestamp: SystemTime,
}

impl EventEnvelope {
    /// Decode the payload as a typed event.
    ///
    /// Fails with `UnknownType` if the envelope carries a different tag.
    pub fn payload_as<E: Event>(&self) -> Result<E> {
        if self.type_tag != E::TYPE_TAG {
            return Err(CodecError::UnknownType(self.type_tag.clone()));
        }
        serde_json::from_slice(&self.payload).map_err(|e| CodecError::Serialization {
            type_tag: self.type_tag.clone(),
            message: e.to_string(),
        })
    }
}

/// Encodes outbound envelopes and decodes inbound ones.
///
/// Holds the set of type tags this node understands. Tags may be
/// registered at any time, including while decoding is in progress on
/// other tasks.
pub struct EventCodec {
    source_node_id: String,
    known_types: RwLock<HashSet<String>>,
}

impl EventCodec {
    /// Create a codec stamping outbound envelopes with `source_node_id`.
    pub fn new(source_node_id: impl Into<String>) -> Self {
        Self {
            source_node_id: source_node_id.into(),
            known_types: RwLock::new(HashSet::new()),
        }
    }

    /// Node id written into outbound envelopes.
    pub fn source_node_id(&self) -> &str {
        &self.source_node_id
    }

    /// Register a raw type tag for decoding.
    pub fn register_type(&self, type_tag: impl Into<String>) {
        self.known_types
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(type_tag.into());
    }

    /// Register a typed event for decoding.
    pub fn register<E: Event>(&self) {
        self.register_type(E::TYPE_TAG);
    }

    /// Check whether a tag is registered.
    pub fn is_registered(&self, type_tag: &str) -> bool {
        self.known_types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(type_tag)
    }

    /// Wrap raw payload bytes in an envelope.
    pub fn encode(&self, type_tag: &str, payload: impl Into<Bytes>) -> Result<Bytes> {
        if type_tag.is_empty() {
            return Err(CodecError::Serialization {
                type_tag: String::new(),
                message: "type tag must not be empty".to_string(),
            });
        }

        let wire = WireEnvelope {
            type_tag: type_tag.to_string(),
            payload: payload.into(),
            source_node_id: self.source_node_id.clone(),
            timestamp: Some(prost_types::Timestamp::from(SystemTime::now())),
            event_id: Uuid::new_v4().to_string(),
        };

        Ok(Bytes::from(wire.encode_to_vec()))
    }

    /// Serialize a typed event and wrap it in an envelope.
    pub fn encode_event<E: Event>(&self, event: &E) -> Result<Bytes> {
        let payload = serde_json::to_vec(event).map_err(|e| CodecError::Serialization {
            type_tag: E::TYPE_TAG.to_string(),
            message: e.to_string(),
        })?;
        self.encode(E::TYPE_TAG, payload)
    }

    /// Decode an envelope, requiring its type tag to be registered.
    pub fn decode(&self, bytes: &[u8]) -> Result<EventEnvelope> {
        let envelope = decode_envelope(bytes)?;
        if !self.is_registered(&envelope.type_tag) {
            return Err(CodecError::UnknownType(envelope.type_tag));
        }
        Ok(envelope)
    }
}

/// Decode an envelope without consulting any type registry.
///
/// Validates structure only: a tag, a timestamp and a well-formed event id
/// must be present.
pub fn decode_envelope(bytes: &[u8]) -> Result<EventEnvelope> {
    let wire = WireEnvelope::decode(bytes)
        .map_err(|e| CodecError::MalformedEnvelope(format!("protobuf decode failed: {}", e)))?;

    if wire.type_tag.is_empty() {
        return Err(CodecError::MalformedEnvelope("missing type tag".to_string()));
    }

    let timestamp = wire
        .timestamp
        .ok_or_else(|| CodecError::MalformedEnvelope("missing timestamp".to_string()))
        .and_then(|ts| {
            SystemTime::try_from(ts)
                .map_err(|e| CodecError::MalformedEnvelope(format!("invalid timestamp: {}", e)))
        })?;

    let event_id = Uuid::parse_str(&wire.event_id).map_err(|e| {
        CodecError::MalformedEnvelope(format!("invalid event id '{}': {}", wire.event_id, e))
    })?;

    Ok(EventEnvelope {
        event_id,
        type_tag: wire.type_tag,
        payload: wire.payload,
        source_node_id: wire.source_node_id,
        timestamp,
    })
}
