//! Publisher: sends encoded envelopes to the shared topic.
//!
//! Transient transport failures are retried with exponential backoff and
//! jitter; permanent ones are returned immediately. Every attempt is exactly
//! one `send` on the transport.

use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use bytes::Bytes;
use tracing::{debug, error, warn};

use super::PublishError;
use crate::config::BackoffConfig;
use crate::transport::{OutboundMessage, SendAck, Transport, TransportError};
use crate::utils::retry;

/// Sends envelopes to one topic.
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
    topic: String,
    retry: BackoffConfig,
}

impl Publisher {
    pub fn new(transport: Arc<dyn Transport>, topic: impl Into<String>) -> Self {
        Self {
            transport,
            topic: topic.into(),
            retry: BackoffConfig::publish(),
        }
    }

    /// Replace the retry schedule.
    pub fn with_retry(mut self, retry: BackoffConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Send an encoded envelope.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %self.topic, type_tag = %type_tag))]
    pub async fn publish(&self, type_tag: &str, body: Bytes) -> Result<SendAck, PublishError> {
        let backoff = retry::backoff(&self.retry).build();

        let mut attempts = 0;
        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }
            attempts = attempt + 1;

            let message = OutboundMessage {
                type_tag: type_tag.to_string(),
                body: body.clone(),
            };

            match self.transport.send(&self.topic, message).await {
                Ok(ack) => {
                    debug!(sequence = ack.sequence, attempts, "Published event");
                    return Ok(ack);
                }
                Err(e) if retry::is_retryable(&e) => {
                    warn!(attempt = attempts, error = %e, "Publish failed, retrying...");
                    last_error = Some(e);
                }
                Err(e) => {
                    error!(attempt = attempts, error = %e, "Publish rejected by transport");
                    return Err(PublishError::Rejected(e));
                }
            }
        }

        let source = last_error
            .unwrap_or_else(|| TransportError::Transient("no publish attempt was made".to_string()));
        error!(attempts, error = %source, "Publish retries exhausted");
        Err(PublishError::Exhausted { attempts, source })
    }
}
