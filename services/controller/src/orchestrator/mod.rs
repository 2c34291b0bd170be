//! Orchestrator-facing collaborators.
//!
//! The controller reads backend endpoints from the orchestrator and writes
//! back status, deletion markers and human-readable events.

use std::net::Ipv4Addr;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vlb_id::ServiceKey;

mod http;
mod memory;

pub use http::{EventItem, EventsResponse, OrchestratorClient};
pub use memory::{RecordedEvent, RecordingStatusSink, StaticEndpoints};

/// Severity of an event attached to a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// Resolves the ready backend addresses of a service.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn resolve(&self, key: &ServiceKey) -> Result<Vec<String>>;
}

/// Writes observable state back to the orchestrator. Every call is
/// idempotent.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn set_assigned_address(&self, key: &ServiceKey, address: Ipv4Addr) -> Result<()>;

    async fn clear_assigned_address(&self, key: &ServiceKey) -> Result<()>;

    async fn add_finalizer(&self, key: &ServiceKey, finalizer: &str) -> Result<()>;

    async fn remove_finalizer(&self, key: &ServiceKey, finalizer: &str) -> Result<()>;

    async fn record_event(
        &self,
        key: &ServiceKey,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}
