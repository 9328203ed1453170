//! Handler registrations keyed by type tag.
//!
//! Writers replace the whole map; readers clone an `Arc` to the current
//! map and never observe a partial update. Registrations may happen at any
//! time, including while the subscriber is dispatching.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use super::EventHandler;

type HandlerMap = HashMap<String, Vec<Arc<dyn EventHandler>>>;

/// Type tag to ordered handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Arc<HandlerMap>>,
    version: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `type_tag`. Handlers run in registration order.
    pub fn register(&self, type_tag: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let type_tag = type_tag.into();
        let mut guard = self.handlers.write().unwrap_or_else(PoisonError::into_inner);

        let mut next = HandlerMap::clone(&guard);
        let handlers = next.entry(type_tag.clone()).or_default();
        handlers.push(handler);
        let count = handlers.len();

        *guard = Arc::new(next);
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;

        debug!(type_tag = %type_tag, handlers = count, version, "Registered event handler");
    }

    /// Current registrations.
    pub fn snapshot(&self) -> Arc<HandlerMap> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Handlers for one tag, in registration order.
    pub fn handlers_for(&self, type_tag: &str) -> Vec<Arc<dyn EventHandler>> {
        self.snapshot().get(type_tag).cloned().unwrap_or_default()
    }

    /// Every tag with at least one handler.
    pub fn type_tags(&self) -> BTreeSet<String> {
        self.snapshot().keys().cloned().collect()
    }

    /// Incremented on every registration.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}
