//! In-memory orchestrator collaborators for tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use vlb_id::ServiceKey;

use super::{EndpointResolver, EventSeverity, StatusSink};

/// Endpoint table set up by the test.
#[derive(Debug, Default)]
pub struct StaticEndpoints {
    endpoints: Mutex<HashMap<ServiceKey, Vec<String>>>,
    fail: AtomicBool,
}

impl StaticEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, key: &ServiceKey, backends: &[&str]) {
        self.endpoints
            .lock()
            .await
            .insert(key.clone(), backends.iter().map(|b| b.to_string()).collect());
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EndpointResolver for StaticEndpoints {
    async fn resolve(&self, key: &ServiceKey) -> Result<Vec<String>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("injected endpoint lookup failure");
        }
        Ok(self.endpoints.lock().await.get(key).cloned().unwrap_or_default())
    }
}

/// An event captured by [`RecordingStatusSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub key: ServiceKey,
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
}

/// Status sink that records every call.
#[derive(Debug, Default)]
pub struct RecordingStatusSink {
    addresses: Mutex<BTreeMap<ServiceKey, Ipv4Addr>>,
    finalizers: Mutex<BTreeMap<ServiceKey, BTreeSet<String>>>,
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn address(&self, key: &ServiceKey) -> Option<Ipv4Addr> {
        self.addresses.lock().await.get(key).copied()
    }

    pub async fn has_finalizer(&self, key: &ServiceKey, finalizer: &str) -> bool {
        self.finalizers
            .lock()
            .await
            .get(key)
            .is_some_and(|set| set.contains(finalizer))
    }

    pub async fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().await.clone()
    }

    /// Reasons of events recorded for `key`, in order.
    pub async fn reasons(&self, key: &ServiceKey) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| &e.key == key)
            .map(|e| e.reason.clone())
            .collect()
    }
}

#[async_trait]
impl StatusSink for RecordingStatusSink {
    async fn set_assigned_address(&self, key: &ServiceKey, address: Ipv4Addr) -> Result<()> {
        self.addresses.lock().await.insert(key.clone(), address);
        Ok(())
    }

    async fn clear_assigned_address(&self, key: &ServiceKey) -> Result<()> {
        self.addresses.lock().await.remove(key);
        Ok(())
    }

    async fn add_finalizer(&self, key: &ServiceKey, finalizer: &str) -> Result<()> {
        self.finalizers
            .lock()
            .await
            .entry(key.clone())
            .or_default()
            .insert(finalizer.to_string());
        Ok(())
    }

    async fn remove_finalizer(&self, key: &ServiceKey, finalizer: &str) -> Result<()> {
        if let Some(set) = self.finalizers.lock().await.get_mut(key) {
            set.remove(finalizer);
        }
        Ok(())
    }

    async fn record_event(
        &self,
        key: &ServiceKey,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        self.events.lock().await.push(RecordedEvent {
            key: key.clone(),
            severity,
            reason: reason.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}
