//! In-memory transport for standalone mode and tests.
//!
//! `InMemoryBroker` holds topics and durable subscriptions. Each node
//! connects with its own `InMemoryTransport`, which can be disconnected and
//! reconnected independently to simulate network partitions.
//!
//! Semantics mirror a Service Bus topic:
//! - a send is copied into every subscription whose filter matches
//! - subscriptions queue messages while no consumer is bound
//! - receive leases a message; settle it by ack, abandon or dead-letter
//! - abandon past `max_delivery_count` moves the message to dead letters
//! - losing a connection or closing a binding releases its leases in
//!   original order

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Delivery, DeliveryToken, OutboundMessage, Result, SendAck, SubscriptionFilter,
    SubscriptionHandle, SubscriptionOptions, Transport, TransportError,
    DEFAULT_MAX_DELIVERY_COUNT,
};
use crate::dlq::{DeadLetter, DeadLetterReason};
use crate::identity::is_valid_subscription_name;

/// Deadline stand-in for receive timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone)]
struct StoredMessage {
    sequence: u64,
    type_tag: String,
    body: Bytes,
    delivery_count: u32,
    available_at: Option<Instant>,
}

#[derive(Debug)]
struct Lease {
    message: StoredMessage,
    binding: u64,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    id: u64,
    client: u64,
}

#[derive(Debug)]
struct SubscriptionState {
    filter: SubscriptionFilter,
    max_delivery_count: u32,
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<Uuid, Lease>,
    dead_letters: Vec<DeadLetter>,
    binding: Option<Binding>,
    acknowledged: u64,
    notify: Arc<Notify>,
}

impl SubscriptionState {
    fn new(filter: SubscriptionFilter, max_delivery_count: u32) -> Self {
        Self {
            filter,
            max_delivery_count,
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
            dead_letters: Vec::new(),
            binding: None,
            acknowledged: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Put a message back in sequence position.
    fn requeue(&mut self, message: StoredMessage) {
        let pos = self
            .ready
            .iter()
            .position(|m| m.sequence > message.sequence)
            .unwrap_or(self.ready.len());
        self.ready.insert(pos, message);
        self.notify.notify_one();
    }

    /// Return every lease held by `binding` to the ready queue.
    fn release_binding(&mut self, binding: u64) -> usize {
        let tokens: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.binding == binding)
            .map(|(token, _)| *token)
            .collect();

        for token in &tokens {
            if let Some(lease) = self.in_flight.remove(token) {
                self.requeue(lease.message);
            }
        }
        tokens.len()
    }
}

#[derive(Debug, Default)]
struct TopicState {
    subscriptions: BTreeMap<String, SubscriptionState>,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_sequence: u64,
    next_binding: u64,
    topics: HashMap<String, TopicState>,
    connected: HashMap<u64, bool>,
}

impl BrokerState {
    fn is_connected(&self, client: u64) -> bool {
        self.connected.get(&client).copied().unwrap_or(false)
    }

    fn subscription_mut(&mut self, topic: &str, name: &str) -> Result<&mut SubscriptionState> {
        self.topics
            .get_mut(topic)
            .and_then(|t| t.subscriptions.get_mut(name))
            .ok_or_else(|| {
                TransportError::Permanent(format!(
                    "subscription '{}' does not exist on topic '{}'",
                    name, topic
                ))
            })
    }

    fn subscription(&self, topic: &str, name: &str) -> Option<&SubscriptionState> {
        self.topics
            .get(topic)
            .and_then(|t| t.subscriptions.get(name))
    }
}

/// Shared in-process broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_client: Arc<AtomicU64>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a client connection to the broker.
    pub fn connect(&self) -> InMemoryTransport {
        let client = self.next_client.fetch_add(1, Ordering::SeqCst);
        self.lock().connected.insert(client, true);

        debug!(client, "In-memory transport client connected");

        InMemoryTransport {
            broker: self.clone(),
            client,
            send_faults: Mutex::new(VecDeque::new()),
            send_attempts: AtomicU64::new(0),
            default_max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
            redelivery_delay: Duration::ZERO,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check whether a durable subscription exists.
    pub fn subscription_exists(&self, topic: &str, subscription: &str) -> bool {
        self.lock().subscription(topic, subscription).is_some()
    }

    /// Names of all subscriptions on a topic.
    pub fn subscription_names(&self, topic: &str) -> Vec<String> {
        self.lock()
            .topics
            .get(topic)
            .map(|t| t.subscriptions.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Messages waiting for delivery, including leased ones.
    pub fn pending_count(&self, topic: &str, subscription: &str) -> usize {
        self.lock()
            .subscription(topic, subscription)
            .map(|s| s.ready.len() + s.in_flight.len())
            .unwrap_or(0)
    }

    /// Messages currently leased to a consumer.
    pub fn in_flight_count(&self, topic: &str, subscription: &str) -> usize {
        self.lock()
            .subscription(topic, subscription)
            .map(|s| s.in_flight.len())
            .unwrap_or(0)
    }

    /// Messages acknowledged over the subscription's lifetime.
    pub fn acknowledged_count(&self, topic: &str, subscription: &str) -> u64 {
        self.lock()
            .subscription(topic, subscription)
            .map(|s| s.acknowledged)
            .unwrap_or(0)
    }

    /// Snapshot of a subscription's dead-letter path.
    pub fn dead_letters(&self, topic: &str, subscription: &str) -> Vec<DeadLetter> {
        self.lock()
            .subscription(topic, subscription)
            .map(|s| s.dead_letters.clone())
            .unwrap_or_default()
    }
}

/// One client's connection to an `InMemoryBroker`.
pub struct InMemoryTransport {
    broker: InMemoryBroker,
    client: u64,
    send_faults: Mutex<VecDeque<TransportError>>,
    send_attempts: AtomicU64,
    default_max_delivery_count: u32,
    redelivery_delay: Duration,
}

impl InMemoryTransport {
    /// Default delivery budget for subscriptions this client creates.
    pub fn with_max_delivery_count(mut self, count: u32) -> Self {
        self.default_max_delivery_count = count;
        self
    }

    /// Delay before an abandoned message becomes receivable again.
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// The broker this client is attached to.
    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    pub fn is_connected(&self) -> bool {
        self.broker.lock().is_connected(self.client)
    }

    /// Drop the connection. Bindings are released and their leases requeued.
    pub fn disconnect(&self) {
        let mut state = self.broker.lock();
        state.connected.insert(self.client, false);

        let mut released = 0;
        for topic in state.topics.values_mut() {
            for sub in topic.subscriptions.values_mut() {
                if let Some(binding) = sub.binding.filter(|b| b.client == self.client) {
                    sub.binding = None;
                    released += sub.release_binding(binding.id);
                    sub.notify.notify_one();
                }
            }
        }

        info!(client = self.client, released, "In-memory transport disconnected");
    }

    pub fn reconnect(&self) {
        self.broker.lock().connected.insert(self.client, true);
        info!(client = self.client, "In-memory transport reconnected");
    }

    /// Fail the next `count` sends with `error`.
    pub fn inject_send_failures(&self, count: usize, error: TransportError) {
        let mut faults = self.send_faults.lock().unwrap_or_else(PoisonError::into_inner);
        faults.extend(std::iter::repeat(error).take(count));
    }

    /// Number of `send` calls made, failed ones included.
    pub fn send_attempts(&self) -> u64 {
        self.send_attempts.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self, state: &BrokerState) -> Result<()> {
        if state.is_connected(self.client) {
            Ok(())
        } else {
            Err(TransportError::ConnectionLost(format!(
                "client {} is disconnected",
                self.client
            )))
        }
    }

    fn take_lease(&self, state: &mut BrokerState, token: &DeliveryToken) -> Result<Lease> {
        self.ensure_connected(state)?;
        state
            .subscription_mut(token.topic(), token.subscription())?
            .in_flight
            .remove(&token.lock_token())
            .ok_or_else(|| TransportError::LeaseLost(token.lock_token().to_string()))
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn create_or_bind_subscription(
        &self,
        topic: &str,
        subscription: &str,
        options: &SubscriptionOptions,
    ) -> Result<SubscriptionHandle> {
        if !is_valid_subscription_name(subscription) {
            return Err(TransportError::Permanent(format!(
                "invalid subscription name '{}'",
                subscription
            )));
        }

        let mut state = self.broker.lock();
        self.ensure_connected(&state)?;

        let existing_binding = state
            .subscription(topic, subscription)
            .and_then(|s| s.binding);
        if let Some(binding) = existing_binding {
            if state.is_connected(binding.client) {
                return Err(TransportError::SubscriptionConflict(
                    subscription.to_string(),
                ));
            }
        }

        state.next_binding += 1;
        let binding_id = state.next_binding;
        let default_max = self.default_max_delivery_count;

        let sub = state
            .topics
            .entry(topic.to_string())
            .or_default()
            .subscriptions
            .entry(subscription.to_string())
            .or_insert_with(|| {
                info!(topic, subscription, "Created durable subscription");
                SubscriptionState::new(
                    options.filter.clone(),
                    options.max_delivery_count.unwrap_or(default_max),
                )
            });

        sub.filter = options.filter.clone();
        if let Some(max) = options.max_delivery_count {
            sub.max_delivery_count = max;
        }
        sub.binding = Some(Binding {
            id: binding_id,
            client: self.client,
        });

        debug!(
            topic,
            subscription,
            binding = binding_id,
            backlog = sub.ready.len(),
            "Bound subscription"
        );

        Ok(SubscriptionHandle::new(topic, subscription, binding_id))
    }

    async fn send(&self, topic: &str, message: OutboundMessage) -> Result<SendAck> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);

        let fault = self
            .send_faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(err) = fault {
            return Err(err);
        }

        let mut state = self.broker.lock();
        self.ensure_connected(&state)?;

        state.next_sequence += 1;
        let sequence = state.next_sequence;

        let stored = StoredMessage {
            sequence,
            type_tag: message.type_tag,
            body: message.body,
            delivery_count: 0,
            available_at: None,
        };

        let mut fan_out = 0;
        let topic_state = state.topics.entry(topic.to_string()).or_default();
        for sub in topic_state.subscriptions.values_mut() {
            if sub.filter.matches(&stored.type_tag) {
                sub.ready.push_back(stored.clone());
                sub.notify.notify_one();
                fan_out += 1;
            }
        }

        debug!(
            topic,
            sequence,
            type_tag = %stored.type_tag,
            subscriptions = fan_out,
            "Sent message"
        );

        Ok(SendAck { sequence })
    }

    async fn receive(
        &self,
        handle: &SubscriptionHandle,
        timeout: Duration,
    ) -> Result<Option<Delivery>> {
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);

        loop {
            let (notify, wake_at) = {
                let mut state = self.broker.lock();
                self.ensure_connected(&state)?;
                let sub = state.subscription_mut(handle.topic(), handle.subscription())?;

                if sub.binding.map(|b| b.id) != Some(handle.binding()) {
                    return Err(TransportError::ConnectionLost(format!(
                        "binding {} on '{}' was released",
                        handle.binding(),
                        handle.subscription()
                    )));
                }

                let now = Instant::now();
                let available = sub
                    .ready
                    .iter()
                    .position(|m| m.available_at.map_or(true, |at| at <= now));

                match available.and_then(|pos| sub.ready.remove(pos)) {
                    Some(mut message) => {
                        message.delivery_count += 1;
                        message.available_at = None;
                        let lock_token = Uuid::new_v4();
                        let delivery = Delivery {
                            body: message.body.clone(),
                            token: DeliveryToken::new(
                                handle.topic(),
                                handle.subscription(),
                                lock_token,
                            ),
                            delivery_count: message.delivery_count,
                            sequence: message.sequence,
                        };
                        sub.in_flight.insert(
                            lock_token,
                            Lease {
                                message,
                                binding: handle.binding(),
                            },
                        );
                        return Ok(Some(delivery));
                    }
                    None => {
                        // Everything queued is deferred: wake when the earliest comes due.
                        let at = sub
                            .ready
                            .iter()
                            .filter_map(|m| m.available_at)
                            .min()
                            .map_or(deadline, |at| at.min(deadline));
                        (sub.notify.clone(), at)
                    }
                }
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            // Notify stores a permit, so a send between unlock and here still wakes us.
            let _ = tokio::time::timeout_at(wake_at, notify.notified()).await;
        }
    }

    async fn acknowledge(&self, token: &DeliveryToken) -> Result<()> {
        let mut state = self.broker.lock();
        self.take_lease(&mut state, token)?;
        state
            .subscription_mut(token.topic(), token.subscription())?
            .acknowledged += 1;
        Ok(())
    }

    async fn abandon(&self, token: &DeliveryToken) -> Result<()> {
        let mut state = self.broker.lock();
        let mut message = self.take_lease(&mut state, token)?.message;
        let sub = state.subscription_mut(token.topic(), token.subscription())?;

        if message.delivery_count >= sub.max_delivery_count {
            warn!(
                subscription = %token.subscription(),
                sequence = message.sequence,
                delivery_count = message.delivery_count,
                "Delivery budget exhausted, dead-lettering message"
            );
            sub.dead_letters.push(DeadLetter {
                topic: token.topic().to_string(),
                subscription: token.subscription().to_string(),
                body: message.body,
                reason: DeadLetterReason::MaxDeliveryCountExceeded {
                    delivery_count: message.delivery_count,
                },
                delivery_count: message.delivery_count,
                occurred_at: SystemTime::now(),
            });
            return Ok(());
        }

        if !self.redelivery_delay.is_zero() {
            message.available_at = Some(Instant::now() + self.redelivery_delay);
        }
        sub.requeue(message);
        Ok(())
    }

    async fn dead_letter(&self, token: &DeliveryToken, reason: DeadLetterReason) -> Result<()> {
        let mut state = self.broker.lock();
        let message = self.take_lease(&mut state, token)?.message;
        let sub = state.subscription_mut(token.topic(), token.subscription())?;
        sub.dead_letters.push(DeadLetter {
            topic: token.topic().to_string(),
            subscription: token.subscription().to_string(),
            body: message.body,
            reason,
            delivery_count: message.delivery_count,
            occurred_at: SystemTime::now(),
        });
        Ok(())
    }

    async fn close_subscription(&self, handle: &SubscriptionHandle) -> Result<()> {
        let mut state = self.broker.lock();
        let Ok(sub) = state.subscription_mut(handle.topic(), handle.subscription()) else {
            return Ok(());
        };

        if sub.binding.map(|b| b.id) == Some(handle.binding()) {
            sub.binding = None;
            let released = sub.release_binding(handle.binding());
            debug!(
                subscription = %handle.subscription(),
                binding = handle.binding(),
                released,
                "Closed subscription binding"
            );
        }
        Ok(())
    }

    async fn delete_subscription(&self, topic: &str, subscription: &str) -> Result<()> {
        let mut state = self.broker.lock();
        self.ensure_connected(&state)?;

        if let Some(removed) = state
            .topics
            .get_mut(topic)
            .and_then(|t| t.subscriptions.remove(subscription))
        {
            removed.notify.notify_one();
            info!(
                topic,
                subscription,
                dropped = removed.ready.len() + removed.in_flight.len(),
                "Deleted durable subscription"
            );
        }
        Ok(())
    }

    fn supports_filters(&self) -> bool {
        true
    }

    async fn update_filter(
        &self,
        handle: &SubscriptionHandle,
        filter: &SubscriptionFilter,
    ) -> Result<()> {
        let mut state = self.broker.lock();
        self.ensure_connected(&state)?;
        let sub = state.subscription_mut(handle.topic(), handle.subscription())?;
        sub.filter = filter.clone();
        Ok(())
    }

    fn default_max_delivery_count(&self) -> u32 {
        self.default_max_delivery_count
    }
}
