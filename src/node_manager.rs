//! Upstream node pool: an ordered endpoint list, a cursor, and the
//! subscribers to tell when the cursor moves.
//!
//! Failover is cooperative: a rotation synchronously notifies every live
//! subscriber in subscription order, and each subscriber tears down its
//! in-flight work against the old endpoint before resuming on the new one.
//! Subscribers are held weakly; the manager notifies but never owns them.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::AppError;

pub trait NodeSubscriber: Send + Sync {
    fn on_switch(&self, new_endpoint: &str);
    fn name(&self) -> &str;
}

#[derive(Default)]
struct Inner {
    endpoints: Vec<String>,
    cursor: usize,
    subscribers: Vec<Weak<dyn NodeSubscriber>>,
}

#[derive(Default)]
pub struct NodeManager {
    inner: Mutex<Inner>,
    /// Collapses concurrent switch requests into a single rotation until
    /// the caller that completed the rotation re-arms via
    /// [`NodeManager::enable_switch`].
    switch_counter: AtomicI32,
}

impl NodeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the endpoint list. Called once at startup; rejects empty
    /// lists, blank entries and duplicates.
    pub fn set_endpoints(&self, endpoints: Vec<String>) -> Result<(), AppError> {
        if endpoints.is_empty() {
            return Err(AppError::InvalidInput("no endpoint specified".to_string()));
        }
        for (i, endpoint) in endpoints.iter().enumerate() {
            if endpoint.is_empty() {
                return Err(AppError::InvalidInput("blank endpoint".to_string()));
            }
            if endpoints[..i].contains(endpoint) {
                return Err(AppError::InvalidInput(format!(
                    "duplicate endpoint: {endpoint}"
                )));
            }
        }
        let mut inner = self.inner.lock().expect("node manager poisoned");
        tracing::info!(endpoint = %endpoints[0], "initial upstream endpoint");
        inner.endpoints = endpoints;
        inner.cursor = 0;
        Ok(())
    }

    /// The active endpoint.
    pub fn current(&self) -> String {
        let inner = self.inner.lock().expect("node manager poisoned");
        inner.endpoints[inner.cursor].clone()
    }

    pub fn endpoint_count(&self) -> usize {
        self.inner.lock().expect("node manager poisoned").endpoints.len()
    }

    /// Register for switch notifications; idempotent by identity.
    pub fn subscribe(&self, subscriber: &Arc<dyn NodeSubscriber>) {
        let mut inner = self.inner.lock().expect("node manager poisoned");
        let already = inner
            .subscribers
            .iter()
            .any(|existing| existing.ptr_eq(&Arc::downgrade(subscriber)));
        if already {
            tracing::info!(subscriber = subscriber.name(), "already subscribed");
            return;
        }
        inner.subscribers.push(Arc::downgrade(subscriber));
    }

    /// Re-arm the rotation guard. A caller that finished reacting to a
    /// rotation must call this before any further rotation can happen.
    pub fn enable_switch(&self) {
        tracing::info!("switch re-armed");
        self.switch_counter.store(0, Ordering::SeqCst);
    }

    /// Rotate to the next endpoint; a no-op with fewer than two endpoints.
    pub fn request_switch(&self) {
        let counter = self.switch_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if counter > 1 {
            tracing::info!(counter, "switch already in progress");
            return;
        }
        let (new_endpoint, subscribers) = {
            let mut inner = self.inner.lock().expect("node manager poisoned");
            if inner.endpoints.len() <= 1 {
                tracing::warn!("cannot switch, only one endpoint configured");
                return;
            }
            inner.cursor = (inner.cursor + 1) % inner.endpoints.len();
            (
                inner.endpoints[inner.cursor].clone(),
                inner.subscribers.clone(),
            )
        };
        tracing::info!(endpoint = %new_endpoint, subscribers = subscribers.len(), "switching upstream endpoint");
        for weak in subscribers {
            if let Some(subscriber) = weak.upgrade() {
                tracing::info!(subscriber = subscriber.name(), "notifying of switch");
                subscriber.on_switch(&new_endpoint);
            }
        }
    }

    /// Rotate like [`Self::request_switch`] but treat a pool that cannot
    /// fail over as a fatal misconfiguration.
    pub fn force_switch(&self) {
        if self.endpoint_count() <= 1 {
            panic!("cannot switch endpoint, pool has fewer than two entries");
        }
        self.request_switch();
    }
}
