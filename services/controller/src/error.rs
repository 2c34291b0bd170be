//! Controller error taxonomy.

use thiserror::Error;
use vlb_id::ServiceKey;
use vlb_networking::PoolError;

use crate::ipam::AllocError;
use crate::vrid::VridError;

/// Errors produced by a reconciliation pass.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The VIP pool specification is malformed.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// VIP or port allocation failed.
    #[error(transparent)]
    Alloc(#[from] AllocError),

    /// Redundancy identifier allocation failed.
    #[error(transparent)]
    Vrid(#[from] VridError),

    /// The service has no ready backends yet.
    #[error("no ready backends for service {0}")]
    BackendsNotReady(ServiceKey),

    /// The appliance or orchestrator could not be reached or rejected a call.
    #[error("{context}: {message}")]
    ExternalUnavailable { context: String, message: String },
}

impl ControllerError {
    /// Wrap a collaborator failure with the operation that was attempted.
    pub fn external(context: impl Into<String>, err: anyhow::Error) -> Self {
        Self::ExternalUnavailable {
            context: context.into(),
            message: format!("{err:#}"),
        }
    }

    /// Whether retrying the same pass later may succeed without operator
    /// intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Pool(_) => false,
            Self::Alloc(e) => e.is_transient(),
            Self::Vrid(e) => e.is_transient(),
            Self::BackendsNotReady(_) | Self::ExternalUnavailable { .. } => true,
        }
    }

    /// Short machine-readable reason attached to service events.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Pool(_) => "InvalidPool",
            Self::Alloc(AllocError::NoCapacity { .. }) => "NoCapacity",
            Self::Alloc(AllocError::InvalidPorts(_)) => "InvalidPorts",
            Self::Alloc(AllocError::PortsUnavailable { .. }) => "PortsUnavailable",
            Self::Alloc(_) => "AllocationFailed",
            Self::Vrid(VridError::NoIdentifiers { .. }) => "NoIdentifiers",
            Self::Vrid(_) => "VRIDAllocationFailed",
            Self::BackendsNotReady(_) => "NoReadyBackends",
            Self::ExternalUnavailable { .. } => "ExternalUnavailable",
        }
    }
}
