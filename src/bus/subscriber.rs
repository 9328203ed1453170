//! Subscriber: one durable subscription per node.
//!
//! Lifecycle: `Created -> Subscribing -> Active -> Draining -> Stopped`.
//! `Active` falls back to `Subscribing` while a lost connection is re-bound.
//!
//! A single receive loop owns the subscription handle. It acquires a worker
//! permit before each receive, so a saturated pool suspends receiving
//! instead of buffering. Messages of the same type tag are chained: each
//! worker waits for the previous one of its tag before running handlers,
//! which keeps per-tag receive order while different tags run in parallel.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use backon::BackoffBuilder;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::dispatch::{DispatchStats, DispatchStatsSnapshot, Dispatcher, Routed};
use super::{BusError, HandlerRegistry};
use crate::codec::EventCodec;
use crate::config::{BackoffConfig, ProviderConfig};
use crate::identity::SubscriptionIdentity;
use crate::transport::{
    SubscriptionFilter, SubscriptionHandle, SubscriptionOptions, Transport, TransportError,
};
use crate::utils::retry;

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// The receive loop's current binding, shared so `stop` can close it even
/// if the loop never hands it back.
#[derive(Clone, Default)]
struct BindingSlot(Arc<Mutex<Option<SubscriptionHandle>>>);

impl BindingSlot {
    fn set(&self, handle: Option<SubscriptionHandle>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = handle;
    }

    fn take(&self) -> Option<SubscriptionHandle> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Lifecycle state of a node's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// Identity resolved, no transport binding yet.
    Created,
    /// Binding (or re-binding) the durable subscription.
    Subscribing,
    /// Receiving and dispatching.
    Active,
    /// No longer receiving; waiting for in-flight handlers.
    Draining,
    /// Terminal.
    Stopped,
}

impl fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Subscribing => "subscribing",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Outcome of `RunningSubscription::stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    /// Every in-flight handler finished before the timeout.
    pub drained_cleanly: bool,
    /// Handlers aborted at the timeout. Their messages stay unacknowledged.
    pub abandoned: usize,
}

/// Binds a node's durable subscription and starts its receive loop.
pub struct Subscriber {
    transport: Arc<dyn Transport>,
    codec: Arc<EventCodec>,
    config: ProviderConfig,
    stats: Arc<DispatchStats>,
    state: Arc<watch::Sender<SubscriberState>>,
}

impl Subscriber {
    pub fn new(transport: Arc<dyn Transport>, codec: Arc<EventCodec>, config: ProviderConfig) -> Self {
        let (state, _) = watch::channel(SubscriberState::Created);
        Self {
            transport,
            codec,
            config,
            stats: Arc::new(DispatchStats::default()),
            state: Arc::new(state),
        }
    }

    /// Share counters with the caller.
    pub fn with_stats(mut self, stats: Arc<DispatchStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Publish state transitions on a caller-owned channel.
    pub fn with_state(mut self, state: Arc<watch::Sender<SubscriberState>>) -> Self {
        self.state = state;
        self
    }

    /// Bind the subscription named by `identity` and start receiving.
    ///
    /// Fails with `SubscriptionConflict` if another live consumer holds the
    /// name. Transient bind failures are retried on the publish schedule.
    pub async fn start(
        self,
        identity: &SubscriptionIdentity,
        registry: Arc<HandlerRegistry>,
    ) -> Result<RunningSubscription, BusError> {
        let topic = self.config.topic();
        let subscription = identity.computed_name().to_string();
        let use_filters = self.config.transport_filters && self.transport.supports_filters();
        let max_delivery_count = self
            .config
            .max_delivery_count
            .unwrap_or_else(|| self.transport.default_max_delivery_count());

        self.state.send_replace(SubscriberState::Subscribing);

        let applied_version = registry.version();
        let options = subscription_options(&registry, use_filters, self.config.max_delivery_count);
        let handle = match self.bind(&topic, &subscription, &options).await {
            Ok(handle) => handle,
            Err(e) => {
                self.state.send_replace(SubscriberState::Created);
                return Err(e);
            }
        };

        let dispatcher = Dispatcher::new(
            self.codec.clone(),
            registry.clone(),
            max_delivery_count,
            self.stats.clone(),
        )
        .with_unknown_type_policy(self.config.unknown_type_policy)
        .with_ignore_own_events(self.config.ignore_own_events);

        let binding = BindingSlot::default();
        binding.set(Some(handle.clone()));

        let cancel = CancellationToken::new();
        let receive_loop = ReceiveLoop {
            transport: self.transport.clone(),
            dispatcher: Arc::new(dispatcher),
            registry,
            topic: topic.clone(),
            subscription: subscription.clone(),
            max_delivery_count: self.config.max_delivery_count,
            use_filters,
            applied_version,
            pool: Arc::new(Semaphore::new(self.config.worker_pool_size)),
            receive_timeout: self.config.receive_timeout(),
            reconnect: self.config.reconnect.clone(),
            state: self.state.clone(),
            binding: binding.clone(),
            cancel: cancel.clone(),
        };

        self.state.send_replace(SubscriberState::Active);
        info!(
            topic = %topic,
            subscription = %subscription,
            workers = self.config.worker_pool_size,
            transport_filters = use_filters,
            "Subscription active"
        );

        let task = tokio::spawn(receive_loop.run(handle));

        Ok(RunningSubscription {
            topic,
            subscription,
            transport: self.transport,
            task,
            binding,
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
            state: self.state,
            stats: self.stats,
        })
    }

    async fn bind(
        &self,
        topic: &str,
        subscription: &str,
        options: &SubscriptionOptions,
    ) -> Result<SubscriptionHandle, BusError> {
        let backoff = retry::backoff(&self.config.publish_retry).build();
        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            match self
                .transport
                .create_or_bind_subscription(topic, subscription, options)
                .await
            {
                Ok(handle) => return Ok(handle),
                Err(TransportError::SubscriptionConflict(name)) => {
                    error!(
                        subscription = %name,
                        "Subscription name is bound by another live consumer"
                    );
                    return Err(BusError::SubscriptionConflict(name));
                }
                Err(e) if retry::is_retryable(&e) => {
                    warn!(attempt = attempt + 1, error = %e, "Failed to bind subscription, retrying...");
                    last_error = Some(e);
                }
                Err(e) => return Err(BusError::Transport(e)),
            }
        }

        Err(BusError::Transport(last_error.unwrap_or_else(|| {
            TransportError::Transient("no bind attempt was made".to_string())
        })))
    }
}

fn subscription_options(
    registry: &HandlerRegistry,
    use_filters: bool,
    max_delivery_count: Option<u32>,
) -> SubscriptionOptions {
    let filter = if use_filters {
        SubscriptionFilter::TypeTags(registry.type_tags())
    } else {
        SubscriptionFilter::All
    };
    SubscriptionOptions {
        filter,
        max_delivery_count,
    }
}

/// What the receive loop hands back when it exits.
struct LoopExit {
    workers: JoinSet<()>,
}

struct ReceiveLoop {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<HandlerRegistry>,
    topic: String,
    subscription: String,
    max_delivery_count: Option<u32>,
    use_filters: bool,
    applied_version: u64,
    pool: Arc<Semaphore>,
    receive_timeout: Duration,
    reconnect: BackoffConfig,
    state: Arc<watch::Sender<SubscriberState>>,
    binding: BindingSlot,
    cancel: CancellationToken,
}

impl ReceiveLoop {
    async fn run(mut self, handle: SubscriptionHandle) -> LoopExit {
        let mut workers = JoinSet::new();
        let mut lanes: HashMap<String, oneshot::Receiver<()>> = HashMap::new();
        let mut handle = Some(handle);

        loop {
            while workers.try_join_next().is_some() {}

            let Some(current) = handle.as_ref() else {
                match self.rebind().await {
                    Some(rebound) => {
                        self.binding.set(Some(rebound.clone()));
                        handle = Some(rebound);
                        continue;
                    }
                    None => break,
                }
            };

            self.refresh_filter(current).await;

            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = self.pool.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.transport.receive(current, self.receive_timeout) => received,
            };

            let delivery = match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        subscription = %self.subscription,
                        error = %e,
                        "Receive failed, re-binding subscription"
                    );
                    self.state.send_replace(SubscriberState::Subscribing);
                    if let Err(e) = self.transport.close_subscription(current).await {
                        debug!(error = %e, "Closing stale binding failed");
                    }
                    self.binding.set(None);
                    handle = None;
                    continue;
                }
            };

            match self.dispatcher.route(&delivery.body) {
                Routed::Settle(result) => {
                    self.dispatcher
                        .settle(self.transport.as_ref(), &delivery, result)
                        .await;
                    drop(permit);
                }
                Routed::Dispatch { envelope, handlers } => {
                    let previous = lanes.remove(&envelope.type_tag);
                    let (done, lane) = oneshot::channel::<()>();
                    lanes.insert(envelope.type_tag.clone(), lane);

                    let dispatcher = self.dispatcher.clone();
                    let transport = self.transport.clone();
                    let span = info_span!(
                        "bus.consume",
                        type_tag = %envelope.type_tag,
                        event_id = %envelope.event_id,
                        sequence = delivery.sequence,
                        delivery_count = delivery.delivery_count,
                    );

                    workers.spawn(
                        async move {
                            let _permit = permit;
                            if let Some(previous) = previous {
                                let _ = previous.await;
                            }
                            let result = dispatcher
                                .dispatch(&envelope, &handlers, delivery.delivery_count)
                                .await;
                            dispatcher.settle(transport.as_ref(), &delivery, result).await;
                            drop(done);
                        }
                        .instrument(span),
                    );
                }
            }
        }

        debug!(
            subscription = %self.subscription,
            in_flight = workers.len(),
            "Receive loop exited"
        );
        LoopExit { workers }
    }

    /// Re-bind after connection loss. `None` when cancelled or out of attempts.
    async fn rebind(&mut self) -> Option<SubscriptionHandle> {
        let backoff = retry::backoff(&self.reconnect).build();

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let options =
                subscription_options(&self.registry, self.use_filters, self.max_delivery_count);
            let version = self.registry.version();

            let bound = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                bound = self.transport.create_or_bind_subscription(&self.topic, &self.subscription, &options) => bound,
            };

            match bound {
                Ok(handle) => {
                    self.applied_version = version;
                    self.state.send_replace(SubscriberState::Active);
                    info!(
                        subscription = %self.subscription,
                        attempts = attempt + 1,
                        "Subscription re-bound"
                    );
                    return Some(handle);
                }
                Err(e) => {
                    warn!(
                        subscription = %self.subscription,
                        attempt = attempt + 1,
                        error = %e,
                        "Failed to re-bind subscription, retrying after backoff"
                    );
                }
            }
        }

        error!(
            subscription = %self.subscription,
            "Giving up re-binding subscription"
        );
        self.state.send_replace(SubscriberState::Stopped);
        None
    }

    /// Push newly registered tags to a transport-side filter.
    async fn refresh_filter(&mut self, handle: &SubscriptionHandle) {
        if !self.use_filters {
            return;
        }
        let version = self.registry.version();
        if version == self.applied_version {
            return;
        }

        let filter = SubscriptionFilter::TypeTags(self.registry.type_tags());
        match self.transport.update_filter(handle, &filter).await {
            Ok(()) => {
                debug!(subscription = %self.subscription, version, "Updated subscription filter");
                self.applied_version = version;
            }
            Err(e) => warn!(error = %e, "Failed to update subscription filter"),
        }
    }
}

/// A bound subscription with its receive loop running.
///
/// Dropping it without `stop` cancels the receive loop; in-flight handlers
/// are aborted when the loop's task ends.
pub struct RunningSubscription {
    topic: String,
    subscription: String,
    transport: Arc<dyn Transport>,
    task: JoinHandle<LoopExit>,
    binding: BindingSlot,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
    state: Arc<watch::Sender<SubscriberState>>,
    stats: Arc<DispatchStats>,
}

impl fmt::Debug for RunningSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningSubscription")
            .field("topic", &self.topic)
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

impl RunningSubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<SubscriberState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop receiving, drain in-flight handlers, then close the binding.
    ///
    /// Returns within `timeout` plus the time to close the binding. Handlers
    /// still running at the deadline are aborted and their messages are
    /// released back to the subscription unacknowledged.
    pub async fn stop(self, timeout: Duration) -> StopReport {
        let deadline = deadline_after(timeout);
        self.state.send_replace(SubscriberState::Draining);
        info!(subscription = %self.subscription, ?timeout, "Draining subscription");
        self.cancel.cancel();

        let mut task = self.task;
        let (mut workers, mut drained_cleanly) =
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(exit)) => (exit.workers, true),
                Ok(Err(e)) => {
                    error!(error = %e, "Receive loop terminated abnormally");
                    (JoinSet::new(), false)
                }
                Err(_) => {
                    task.abort();
                    warn!("Receive loop did not exit before the drain deadline");
                    (JoinSet::new(), false)
                }
            };

        while !workers.is_empty() {
            match tokio::time::timeout_at(deadline, workers.join_next()).await {
                Ok(Some(Err(e))) if e.is_panic() => error!(error = %e, "Worker panicked"),
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    drained_cleanly = false;
                    break;
                }
            }
        }

        let abandoned = workers.len();
        if abandoned > 0 {
            warn!(
                subscription = %self.subscription,
                abandoned,
                "Drain timeout elapsed, aborting in-flight handlers"
            );
        }
        workers.shutdown().await;

        if let Some(handle) = self.binding.take() {
            if let Err(e) = self.transport.close_subscription(&handle).await {
                warn!(error = %e, "Failed to close subscription binding");
            }
        }

        self.state.send_replace(SubscriberState::Stopped);
        info!(
            subscription = %self.subscription,
            drained_cleanly,
            abandoned,
            "Subscription stopped"
        );

        StopReport {
            drained_cleanly,
            abandoned,
        }
    }
}
