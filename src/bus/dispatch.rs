//! Handler dispatch.
//!
//! Turns a received message body into a settlement decision:
//! 1. Decode the envelope (malformed → dead-letter)
//! 2. Apply own-event suppression and the unknown-type policy
//! 3. Invoke every registered handler for the tag, in registration order
//! 4. All succeeded → acknowledge; any failed → abandon for redelivery

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, warn};

use super::{EventHandler, HandlerError, HandlerRegistry};
use crate::codec::{CodecError, EventCodec, EventEnvelope};
use crate::config::UnknownTypePolicy;
use crate::dlq::DeadLetterReason;
use crate::transport::{Delivery, Transport};

/// Counters describing what the dispatcher did with received messages.
///
/// `acknowledged` counts every acknowledgment, including dropped unknown
/// types and skipped own events. `dead_lettered` covers explicit
/// dead-letter settlements and abandons on the final permitted delivery,
/// which the transport dead-letters; those are not counted as `abandoned`.
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub received: AtomicU64,
    pub acknowledged: AtomicU64,
    pub abandoned: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub dropped: AtomicU64,
    pub skipped_own: AtomicU64,
    /// Handler failures on the final permitted delivery.
    pub exhausted: AtomicU64,
    /// Settlement calls the transport refused.
    pub settle_failures: AtomicU64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            skipped_own: self.skipped_own.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            settle_failures: self.settle_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `DispatchStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub received: u64,
    pub acknowledged: u64,
    pub abandoned: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub skipped_own: u64,
    pub exhausted: u64,
    pub settle_failures: u64,
}

/// Result of processing a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    /// All handlers succeeded.
    Success,
    /// One or more handlers failed or panicked.
    HandlerFailed,
    /// Message could not be decoded; no retry will help.
    DecodeError(CodecError),
    /// No handler is registered for the tag.
    UnknownType(String),
    /// Published by this node and suppressed.
    OwnEvent,
}

/// What to tell the transport about a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Acknowledge,
    Abandon,
    DeadLetter(DeadLetterReason),
}

/// Where a received body goes next.
pub enum Routed {
    /// Settle without running handlers.
    Settle(DispatchResult),
    /// Run these handlers on the envelope.
    Dispatch {
        envelope: Arc<EventEnvelope>,
        handlers: Vec<Arc<dyn EventHandler>>,
    },
}

/// Dispatch an envelope to handlers, in order.
///
/// Every handler runs even if an earlier one failed. A panicking handler
/// counts as a failure. Returns the failures; empty means all succeeded.
pub async fn dispatch_to_handlers(
    handlers: &[Arc<dyn EventHandler>],
    envelope: &Arc<EventEnvelope>,
) -> Vec<HandlerError> {
    let mut failures = Vec::new();

    for handler in handlers {
        if let Err(e) = invoke(handler.as_ref(), envelope).await {
            error!(
                type_tag = %envelope.type_tag,
                event_id = %envelope.event_id,
                error = %e,
                "Handler failed"
            );
            failures.push(e);
        }
    }

    failures
}

/// The payload error shared by all failures, if every one is a decode error.
///
/// Redelivery cannot fix a payload no handler can read.
fn undecodable_payload(failures: &[HandlerError]) -> Option<CodecError> {
    let mut first = None;
    for failure in failures {
        match failure {
            HandlerError::Decode(e) => {
                first.get_or_insert_with(|| e.clone());
            }
            _ => return None,
        }
    }
    first
}

async fn invoke(
    handler: &dyn EventHandler,
    envelope: &Arc<EventEnvelope>,
) -> Result<(), HandlerError> {
    let future = std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(envelope.clone())))
        .map_err(|panic| HandlerError::Panicked(panic_message(panic.as_ref())))?;

    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|panic| HandlerError::Panicked(panic_message(panic.as_ref())))?
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Decodes, routes and settles messages for one subscription.
pub struct Dispatcher {
    codec: Arc<EventCodec>,
    registry: Arc<HandlerRegistry>,
    unknown_type_policy: UnknownTypePolicy,
    ignore_own_events: bool,
    max_delivery_count: u32,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn new(
        codec: Arc<EventCodec>,
        registry: Arc<HandlerRegistry>,
        max_delivery_count: u32,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self {
            codec,
            registry,
            unknown_type_policy: UnknownTypePolicy::default(),
            ignore_own_events: true,
            max_delivery_count,
            stats,
        }
    }

    pub fn with_unknown_type_policy(mut self, policy: UnknownTypePolicy) -> Self {
        self.unknown_type_policy = policy;
        self
    }

    pub fn with_ignore_own_events(mut self, ignore: bool) -> Self {
        self.ignore_own_events = ignore;
        self
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Decode a body and decide whether handlers need to run.
    pub fn route(&self, body: &[u8]) -> Routed {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let envelope = match self.codec.decode(body) {
            Ok(envelope) => envelope,
            Err(CodecError::UnknownType(tag)) => {
                return Routed::Settle(DispatchResult::UnknownType(tag));
            }
            Err(e) => return Routed::Settle(DispatchResult::DecodeError(e)),
        };

        if self.ignore_own_events && envelope.source_node_id == self.codec.source_node_id() {
            return Routed::Settle(DispatchResult::OwnEvent);
        }

        let handlers = self.registry.handlers_for(&envelope.type_tag);
        if handlers.is_empty() {
            return Routed::Settle(DispatchResult::UnknownType(envelope.type_tag));
        }

        Routed::Dispatch {
            envelope: Arc::new(envelope),
            handlers,
        }
    }

    /// Run handlers and report the outcome.
    ///
    /// A payload every failing handler rejected as undecodable is reported
    /// as a `DecodeError` and dead-lettered without retry.
    pub async fn dispatch(
        &self,
        envelope: &Arc<EventEnvelope>,
        handlers: &[Arc<dyn EventHandler>],
        delivery_count: u32,
    ) -> DispatchResult {
        let failures = dispatch_to_handlers(handlers, envelope).await;
        if failures.is_empty() {
            return DispatchResult::Success;
        }

        if let Some(e) = undecodable_payload(&failures) {
            return DispatchResult::DecodeError(e);
        }

        if delivery_count >= self.max_delivery_count {
            self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
            error!(
                type_tag = %envelope.type_tag,
                event_id = %envelope.event_id,
                delivery_count,
                "Handlers failed on final delivery, event will be dead-lettered"
            );
        }
        DispatchResult::HandlerFailed
    }

    /// Map a dispatch outcome to a transport settlement.
    pub fn settlement(&self, result: &DispatchResult) -> Settlement {
        match result {
            DispatchResult::Success | DispatchResult::OwnEvent => Settlement::Acknowledge,
            DispatchResult::HandlerFailed => Settlement::Abandon,
            DispatchResult::DecodeError(e) => Settlement::DeadLetter(DeadLetterReason::from(e)),
            DispatchResult::UnknownType(tag) => match self.unknown_type_policy {
                UnknownTypePolicy::Drop => Settlement::Acknowledge,
                UnknownTypePolicy::DeadLetter => {
                    Settlement::DeadLetter(DeadLetterReason::UnknownType(tag.clone()))
                }
            },
        }
    }

    /// Settle a delivery with the transport. Failures are logged, never fatal.
    pub async fn settle(&self, transport: &dyn Transport, delivery: &Delivery, result: DispatchResult) {
        match &result {
            DispatchResult::DecodeError(e) => {
                error!(sequence = delivery.sequence, error = %e, "Undecodable message");
            }
            DispatchResult::UnknownType(tag) => {
                debug!(type_tag = %tag, policy = ?self.unknown_type_policy, "No handler for event type");
            }
            DispatchResult::OwnEvent => {
                debug!(sequence = delivery.sequence, "Skipping own event");
            }
            DispatchResult::Success | DispatchResult::HandlerFailed => {}
        }

        let settlement = self.settlement(&result);
        let outcome = match &settlement {
            Settlement::Acknowledge => transport.acknowledge(&delivery.token).await,
            Settlement::Abandon => transport.abandon(&delivery.token).await,
            Settlement::DeadLetter(reason) => {
                transport.dead_letter(&delivery.token, reason.clone()).await
            }
        };

        if let Err(e) = outcome {
            self.stats.settle_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                sequence = delivery.sequence,
                settlement = ?settlement,
                error = %e,
                "Failed to settle message, it will be redelivered"
            );
            return;
        }

        let counter = match (&settlement, &result) {
            (Settlement::Acknowledge, DispatchResult::OwnEvent) => Some(&self.stats.skipped_own),
            (Settlement::Acknowledge, DispatchResult::UnknownType(_)) => Some(&self.stats.dropped),
            _ => None,
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }

        match settlement {
            Settlement::Acknowledge => self.stats.acknowledged.fetch_add(1, Ordering::Relaxed),
            // The transport dead-letters an abandon on the final delivery.
            Settlement::Abandon if delivery.delivery_count >= self.max_delivery_count => {
                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed)
            }
            Settlement::Abandon => self.stats.abandoned.fetch_add(1, Ordering::Relaxed),
            Settlement::DeadLetter(_) => self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Route, dispatch and settle one delivery inline.
    #[tracing::instrument(name = "bus.consume", skip_all, fields(sequence = delivery.sequence))]
    pub async fn process(&self, transport: &dyn Transport, delivery: &Delivery) -> DispatchResult {
        let result = match self.route(&delivery.body) {
            Routed::Settle(result) => result,
            Routed::Dispatch { envelope, handlers } => {
                self.dispatch(&envelope, &handlers, delivery.delivery_count)
                    .await
            }
        };
        self.settle(transport, delivery, result.clone()).await;
        result
    }
}
