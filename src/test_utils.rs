//! Test events and handlers shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::bus::{EventHandler, HandlerError};
use crate::codec::{Event, EventEnvelope};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInvalidate {
    pub key: String,
}

impl CacheInvalidate {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
        }
    }
}

impl Event for CacheInvalidate {
    const TYPE_TAG: &'static str = "CacheInvalidate";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPublished {
    pub content_id: u64,
}

impl ContentPublished {
    pub fn new(content_id: u64) -> Self {
        Self { content_id }
    }
}

impl Event for ContentPublished {
    const TYPE_TAG: &'static str = "ContentPublished";
}

/// Records every envelope it sees.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    seen: Arc<Mutex<Vec<Arc<EventEnvelope>>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> Vec<Arc<EventEnvelope>> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl EventHandler for RecordingHandler {
    fn handle(&self, envelope: Arc<EventEnvelope>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let seen = self.seen.clone();
        Box::pin(async move {
            seen.lock().unwrap().push(envelope);
            Ok(())
        })
    }
}

/// Fails the first `failures` calls, then succeeds.
#[derive(Clone)]
pub struct FlakyHandler {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl FlakyHandler {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Never succeeds.
    pub fn always() -> Self {
        Self::new(usize::MAX)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EventHandler for FlakyHandler {
    fn handle(&self, _envelope: Arc<EventEnvelope>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let fail = call < self.failures;
        Box::pin(async move {
            if fail {
                Err(HandlerError::failed(format!("failure {}", call + 1)))
            } else {
                Ok(())
            }
        })
    }
}

/// Sleeps before succeeding.
#[derive(Clone)]
pub struct SlowHandler {
    delay: Duration,
    completed: Arc<AtomicUsize>,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

impl EventHandler for SlowHandler {
    fn handle(&self, _envelope: Arc<EventEnvelope>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let delay = self.delay;
        let completed = self.completed.clone();
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Panics on every call.
pub struct PanickingHandler;

impl EventHandler for PanickingHandler {
    fn handle(&self, _envelope: Arc<EventEnvelope>) -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(async { panic!("handler exploded") })
    }
}
