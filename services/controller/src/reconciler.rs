//! Service reconciliation engine.
//!
//! One pass drives a single service towards its desired state:
//!
//! ```text
//! Pending ──► Allocating ──► Publishing ──► Verifying ──► Converged
//!    │             │              │
//!    │             └──────────────┴──► Failed (rollback, then requeue or surface)
//!    └──► Deleting ──► Released
//! ```
//!
//! Passes are idempotent. A failed pass is never resumed; the next pass starts
//! over from `Pending` and skips whatever already holds.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use vlb_id::ServiceKey;
use vlb_reconcile::{CompensationLog, Phase, RequeueBackoff};

use crate::error::ControllerError;
use crate::ipam::{normalize_ports, Allocation, AllocationStore};
use crate::orchestrator::{EndpointResolver, EventSeverity, StatusSink};
use crate::publisher::Publisher;
use crate::service::{ServiceEvent, ServiceSpec, FINALIZER};
use crate::vrid::{VridAllocator, VridPair};

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Pause between publishing keepalived and nginx, letting the VIPs come
    /// up before nginx binds them.
    pub settle_delay: Duration,

    /// Delay before retrying a service that has no ready backends.
    pub backend_retry_delay: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(3),
            backend_retry_delay: Duration::from_secs(10),
        }
    }
}

/// Result of one reconciliation pass.
#[derive(Debug)]
pub enum PassOutcome {
    /// Nothing to do for this service.
    Skipped,

    /// The service is served on `address`.
    Converged { address: Ipv4Addr },

    /// All resources of the service were released.
    Released,

    /// Transient failure; run the pass again after `after`.
    Requeue { after: Duration, reason: String },

    /// Terminal failure; wait for a new event.
    Failed { error: ControllerError },
}

/// Side effects to undo when a pass fails after making them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// Release an allocation created during the pass.
    ReleaseAllocation(ServiceKey),

    /// Republish keepalived for the fleet without this owner's address.
    RepublishRedundancy { excluding: ServiceKey },

    /// Remove a service's nginx file.
    RemoveServiceConfig(ServiceKey),
}

/// Transient bookkeeping for one pass.
#[derive(Debug)]
pub struct PassRecord {
    pub key: ServiceKey,
    pub phase: Phase,
    pub ports: Vec<u16>,
    pub allocation: Option<Allocation>,
    pub vrids: Option<VridPair>,
    pub backends: Vec<String>,
    pub compensations: CompensationLog<Compensation>,
}

impl PassRecord {
    fn new(key: ServiceKey, ports: Vec<u16>) -> Self {
        Self {
            key,
            phase: Phase::Pending,
            ports,
            allocation: None,
            vrids: None,
            backends: Vec::new(),
            compensations: CompensationLog::new(),
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!(service = %self.key, from = %self.phase, to = %phase, "phase transition");
        self.phase = phase;
    }
}

/// Drives services to their desired state.
pub struct ServiceReconciler {
    allocations: Arc<AllocationStore>,
    vrids: Arc<VridAllocator>,
    publisher: Arc<Publisher>,
    endpoints: Arc<dyn EndpointResolver>,
    status: Arc<dyn StatusSink>,
    settings: ReconcilerSettings,
    backoff: Mutex<RequeueBackoff>,
    /// Serializes fleet snapshots with keepalived publication so a later
    /// push never carries an older fleet.
    redundancy: Mutex<()>,
}

impl ServiceReconciler {
    pub fn new(
        allocations: Arc<AllocationStore>,
        vrids: Arc<VridAllocator>,
        publisher: Arc<Publisher>,
        endpoints: Arc<dyn EndpointResolver>,
        status: Arc<dyn StatusSink>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            allocations,
            vrids,
            publisher,
            endpoints,
            status,
            settings,
            backoff: Mutex::new(RequeueBackoff::default()),
            redundancy: Mutex::new(()),
        }
    }

    /// Run one pass for the event.
    #[instrument(skip(self, event), fields(service = %event.key()))]
    pub async fn reconcile(&self, event: &ServiceEvent) -> PassOutcome {
        let outcome = match event {
            ServiceEvent::Upserted(spec) => self.reconcile_spec(spec).await,
            ServiceEvent::Deleted(key) => match self.finalize(key, None).await {
                Ok(()) => PassOutcome::Released,
                Err(e) => self.outcome_for_error(key, e, false).await,
            },
            ServiceEvent::Retry(key) => {
                debug!(service = %key, "retry without known state; skipping");
                PassOutcome::Skipped
            }
        };

        if matches!(outcome, PassOutcome::Converged { .. } | PassOutcome::Released) {
            let mut backoff = self.backoff.lock().await;
            backoff.clear(&event.key().to_string());
            backoff.prune();
        }
        outcome
    }

    async fn reconcile_spec(&self, spec: &ServiceSpec) -> PassOutcome {
        let key = &spec.key;

        if spec.deleting || !spec.is_load_balancer() {
            if !spec.has_finalizer() {
                debug!(service = %key, "not managed; skipping");
                return PassOutcome::Skipped;
            }
            return match self.finalize(key, Some(spec)).await {
                Ok(()) => PassOutcome::Released,
                Err(e) => self.outcome_for_error(key, e, true).await,
            };
        }

        let mut pass = PassRecord::new(key.clone(), spec.required_ports());
        match self.converge(spec, &mut pass).await {
            Ok(address) => PassOutcome::Converged { address },
            Err(e) => {
                if !pass.compensations.is_empty() {
                    self.rollback(&mut pass).await;
                }
                pass.enter(Phase::Failed);
                self.outcome_for_error(key, e, true).await
            }
        }
    }

    async fn converge(&self, spec: &ServiceSpec, pass: &mut PassRecord) -> Result<Ipv4Addr, ControllerError> {
        let key = &spec.key;
        info!(service = %key, phase = %pass.phase, ports = ?pass.ports, "reconciling service");

        // The marker goes on before anything is allocated, so a deletion
        // racing this pass still reaches the release path.
        if !spec.has_finalizer() {
            self.status
                .add_finalizer(key, FINALIZER)
                .await
                .map_err(|e| ControllerError::external("add finalizer", e))?;
        }

        pass.enter(Phase::Allocating);
        info!(service = %key, phase = %pass.phase, "allocating address");
        let (held, created) = self.allocations.acquire(key, &pass.ports).await?;
        if created {
            pass.compensations
                .record(Compensation::ReleaseAllocation(key.clone()));
            self.emit(
                key,
                EventSeverity::Normal,
                "IPAllocated",
                &format!("allocated {} for ports {:?}", held.address, held.ports),
            )
            .await;
        }

        let desired = normalize_ports(&pass.ports)?;
        let previous = held.ports.clone();
        let reserved = self.reserve_ports(key, held, &desired).await?;
        let allocation = Allocation {
            ports: desired,
            ..reserved.clone()
        };
        pass.allocation = Some(allocation.clone());

        pass.enter(Phase::Publishing);
        info!(service = %key, phase = %pass.phase, address = %allocation.address, "publishing configuration");
        self.publish(spec, &allocation, created, pass).await?;

        // The appliance now serves the address; nothing left to undo.
        pass.compensations.commit();

        if reserved.ports != allocation.ports {
            // nginx no longer listens on the dropped ports.
            self.allocations.resize(key, &allocation.ports).await?;
        }
        if previous != allocation.ports {
            self.emit(
                key,
                EventSeverity::Normal,
                "PortsChanged",
                &format!("serving ports {:?} on {}", allocation.ports, allocation.address),
            )
            .await;
        }

        pass.enter(Phase::Verifying);
        self.status
            .set_assigned_address(key, allocation.address)
            .await
            .map_err(|e| ControllerError::external("set service status", e))?;

        pass.enter(Phase::Converged);
        info!(service = %key, phase = %pass.phase, address = %allocation.address, "service converged");
        self.emit(
            key,
            EventSeverity::Normal,
            "LoadBalancerReady",
            &format!("serving on {}", allocation.address),
        )
        .await;

        Ok(allocation.address)
    }

    async fn publish(
        &self,
        spec: &ServiceSpec,
        allocation: &Allocation,
        created: bool,
        pass: &mut PassRecord,
    ) -> Result<(), ControllerError> {
        let key = &spec.key;

        let backends = self
            .endpoints
            .resolve(key)
            .await
            .map_err(|e| ControllerError::external("resolve endpoints", e))?;
        if backends.is_empty() {
            return Err(ControllerError::BackendsNotReady(key.clone()));
        }
        pass.backends = backends;

        let vrids = self.vrids.get_or_allocate(self.vrids.tenant()).await?;
        pass.vrids = Some(vrids);

        if created {
            pass.compensations.record(Compensation::RepublishRedundancy {
                excluding: key.clone(),
            });
        }
        let changed = self.publish_fleet(vrids, None).await?;

        if changed && !self.settings.settle_delay.is_zero() {
            debug!(service = %key, delay_ms = self.settings.settle_delay.as_millis() as u64, "waiting for VIPs to settle");
            tokio::time::sleep(self.settings.settle_delay).await;
        }

        // Removal is idempotent, so record before a push that may half-apply.
        if created {
            pass.compensations
                .record(Compensation::RemoveServiceConfig(key.clone()));
        }
        self.publisher
            .publish_service(spec, allocation, &pass.backends)
            .await
            .map_err(|e| ControllerError::external("publish nginx config", e))?;

        Ok(())
    }

    /// Make sure `held` covers `desired` before nginx listens on it. Ports the
    /// service dropped stay reserved until the new config is published.
    async fn reserve_ports(
        &self,
        key: &ServiceKey,
        held: Allocation,
        desired: &[u16],
    ) -> Result<Allocation, ControllerError> {
        let mut widened = held.ports.clone();
        widened.extend_from_slice(desired);
        widened.sort_unstable();
        widened.dedup();
        if widened == held.ports {
            return Ok(held);
        }

        info!(service = %key, held = ?held.ports, desired = ?desired, "port set changed");
        Ok(self.allocations.resize(key, &widened).await?.unwrap_or(held))
    }

    /// Undo the pass's side effects, newest first. Failures are logged and
    /// the remaining steps still run.
    async fn rollback(&self, pass: &mut PassRecord) {
        for action in pass.compensations.unwind() {
            warn!(service = %pass.key, action = ?action, "rolling back");
            let result = match &action {
                Compensation::RemoveServiceConfig(key) => self
                    .publisher
                    .remove_service(key)
                    .await
                    .map_err(|e| ControllerError::external("remove nginx config", e)),
                Compensation::RepublishRedundancy { excluding } => match pass.vrids {
                    Some(vrids) => self.publish_fleet(vrids, Some(excluding)).await.map(|_| ()),
                    None => Ok(()),
                },
                Compensation::ReleaseAllocation(key) => {
                    self.allocations.release(key).await.map(|_| ()).map_err(Into::into)
                }
            };

            if let Err(e) = result {
                error!(service = %pass.key, action = ?action, error = %e, "rollback step failed");
            }
        }
    }

    /// Publish keepalived for the current fleet, optionally leaving out one
    /// owner's address.
    async fn publish_fleet(&self, vrids: VridPair, excluding: Option<&ServiceKey>) -> Result<bool, ControllerError> {
        let _guard = self.redundancy.lock().await;

        let mut fleet: Vec<Ipv4Addr> = self
            .allocations
            .snapshot()
            .await
            .into_iter()
            .filter(|a| Some(&a.owner) != excluding)
            .map(|a| a.address)
            .collect();
        fleet.sort_unstable();
        fleet.dedup();

        self.publisher
            .publish_redundancy(vrids, &fleet)
            .await
            .map_err(|e| ControllerError::external("publish keepalived config", e))
    }

    /// Release everything held for `key`. `spec` is present when the object
    /// still exists in the orchestrator and needs its status and marker
    /// cleaned up.
    async fn finalize(&self, key: &ServiceKey, spec: Option<&ServiceSpec>) -> Result<(), ControllerError> {
        info!(service = %key, phase = %Phase::Deleting, "releasing service");

        let released = self.allocations.release(key).await?;

        self.publisher
            .remove_service(key)
            .await
            .map_err(|e| ControllerError::external("remove nginx config", e))?;

        let vrids = self.vrids.get_or_allocate(self.vrids.tenant()).await?;
        self.publish_fleet(vrids, None).await?;

        if spec.is_some() {
            if let Err(e) = self.status.clear_assigned_address(key).await {
                warn!(service = %key, error = %e, "failed to clear service status");
            }
            self.status
                .remove_finalizer(key, FINALIZER)
                .await
                .map_err(|e| ControllerError::external("remove finalizer", e))?;
        }

        info!(
            service = %key,
            phase = %Phase::Released,
            address = ?released.as_ref().map(|a| a.address),
            "service released"
        );
        if spec.is_some() {
            self.emit(key, EventSeverity::Normal, "Released", "load balancer resources released")
                .await;
        }
        Ok(())
    }

    async fn outcome_for_error(&self, key: &ServiceKey, error: ControllerError, exists: bool) -> PassOutcome {
        if exists {
            self.emit(key, EventSeverity::Warning, error.reason(), &error.to_string())
                .await;
        }

        if !error.is_transient() {
            error!(service = %key, phase = %Phase::Failed, error = %error, "reconciliation failed");
            return PassOutcome::Failed { error };
        }

        let after = match &error {
            ControllerError::BackendsNotReady(_) => self.settings.backend_retry_delay,
            _ => self.backoff.lock().await.next_delay(&key.to_string()),
        };
        warn!(
            service = %key,
            error = %error,
            retry_in_ms = after.as_millis() as u64,
            "reconciliation failed; will retry"
        );
        PassOutcome::Requeue {
            after,
            reason: error.to_string(),
        }
    }

    /// Record an event, logging instead of failing the pass.
    async fn emit(&self, key: &ServiceKey, severity: EventSeverity, reason: &str, message: &str) {
        if let Err(e) = self.status.record_event(key, severity, reason, message).await {
            warn!(service = %key, reason, error = %e, "failed to record event");
        }
    }
}
