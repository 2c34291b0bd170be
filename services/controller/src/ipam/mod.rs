//! VIP and port allocation.
//!
//! Each owning service holds at most one allocation: a single address from the
//! pool plus the set of frontend ports it listens on. Several services may
//! share an address as long as their ports do not overlap. Selection is
//! first-fit in pool order.
//!
//! The allocation list is the only persisted state; the port index is rebuilt
//! from it on load and kept in step under the same lock on every mutation.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use vlb_id::{IdError, ServiceKey};

use crate::store::{RecordStore, ALLOCATIONS_KEY};

mod index;

pub use index::{PortConflict, PortIndex};

// =============================================================================
// Errors
// =============================================================================

/// Allocation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// No pool address has all requested ports free.
    #[error("no address in the pool has ports {ports:?} free for {owner}")]
    NoCapacity { owner: ServiceKey, ports: Vec<u16> },

    /// The owner's address cannot take the new port set because another
    /// service holds one of the ports there.
    #[error("{owner} cannot take port {port} on {address}: held by {holder}")]
    PortsUnavailable {
        owner: ServiceKey,
        address: Ipv4Addr,
        port: u16,
        holder: ServiceKey,
    },

    /// The requested port set is unusable.
    #[error("invalid ports: {0}")]
    InvalidPorts(String),

    /// The durable record could not be written. In-memory state was rolled
    /// back.
    #[error("failed to persist allocations: {0}")]
    Persist(String),

    /// The durable record could not be read or decoded.
    #[error("corrupt allocation record: {0}")]
    Corrupt(String),
}

impl AllocError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Persist(_))
    }
}

// =============================================================================
// Allocation
// =============================================================================

/// An address and port set held by one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AllocationRecord", into = "AllocationRecord")]
pub struct Allocation {
    pub owner: ServiceKey,
    pub address: Ipv4Addr,
    /// Sorted, distinct, non-zero.
    pub ports: Vec<u16>,
}

/// Persisted shape of an allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllocationRecord {
    owner_namespace: String,
    owner_name: String,
    address: Ipv4Addr,
    ports: Vec<u16>,
}

impl TryFrom<AllocationRecord> for Allocation {
    type Error = IdError;

    fn try_from(record: AllocationRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            owner: ServiceKey::new(record.owner_namespace, record.owner_name)?,
            address: record.address,
            ports: record.ports,
        })
    }
}

impl From<Allocation> for AllocationRecord {
    fn from(allocation: Allocation) -> Self {
        Self {
            owner_namespace: allocation.owner.namespace().to_string(),
            owner_name: allocation.owner.name().to_string(),
            address: allocation.address,
            ports: allocation.ports,
        }
    }
}

/// Sort and deduplicate a requested port set.
pub fn normalize_ports(ports: &[u16]) -> Result<Vec<u16>, AllocError> {
    if ports.is_empty() {
        return Err(AllocError::InvalidPorts("no ports requested".to_string()));
    }
    if ports.contains(&0) {
        return Err(AllocError::InvalidPorts("port 0 is not allocatable".to_string()));
    }

    let mut ports = ports.to_vec();
    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}

/// Encode the allocation list in owner order.
pub fn encode_allocations<'a, I>(allocations: I) -> Result<Vec<u8>, AllocError>
where
    I: IntoIterator<Item = &'a Allocation>,
{
    let mut list: Vec<&Allocation> = allocations.into_iter().collect();
    list.sort_by(|a, b| a.owner.cmp(&b.owner));
    serde_json::to_vec_pretty(&list).map_err(|e| AllocError::Persist(e.to_string()))
}

/// Decode a persisted allocation list. An empty record decodes as no
/// allocations.
pub fn decode_allocations(bytes: &[u8]) -> Result<Vec<Allocation>, AllocError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(bytes).map_err(|e| AllocError::Corrupt(e.to_string()))
}

// =============================================================================
// Allocation Store
// =============================================================================

#[derive(Debug)]
struct AllocState {
    pool: Vec<Ipv4Addr>,
    allocations: BTreeMap<ServiceKey, Allocation>,
    index: PortIndex,
}

/// Owns the pool, the allocation set and the port index.
///
/// Every operation holds the store lock for its whole duration, including the
/// durable write, so the index never drifts from the allocation set.
pub struct AllocationStore {
    records: Arc<dyn RecordStore>,
    state: Mutex<AllocState>,
}

impl AllocationStore {
    /// Rebuild the store from its durable record.
    pub async fn load(records: Arc<dyn RecordStore>, pool: Vec<Ipv4Addr>) -> Result<Self, AllocError> {
        let stored = records
            .get(ALLOCATIONS_KEY)
            .await
            .map_err(|e| AllocError::Corrupt(format!("{e:#}")))?;

        let list = match stored {
            Some(bytes) => decode_allocations(&bytes)?,
            None => Vec::new(),
        };

        let mut allocations = BTreeMap::new();
        for allocation in list {
            let normalized = normalize_ports(&allocation.ports)
                .map_err(|e| AllocError::Corrupt(format!("{}: {e}", allocation.owner)))?;
            if normalized != allocation.ports {
                return Err(AllocError::Corrupt(format!(
                    "{}: ports must be sorted and distinct",
                    allocation.owner
                )));
            }
            if allocations.contains_key(&allocation.owner) {
                return Err(AllocError::Corrupt(format!(
                    "duplicate allocation for {}",
                    allocation.owner
                )));
            }
            allocations.insert(allocation.owner.clone(), allocation);
        }

        let index = PortIndex::rebuild(allocations.values())
            .map_err(|conflict| AllocError::Corrupt(conflict.to_string()))?;

        let state = AllocState {
            pool,
            allocations,
            index,
        };
        warn_outside_pool(&state);

        info!(
            allocations = state.allocations.len(),
            pool_size = state.pool.len(),
            "allocation store loaded"
        );

        Ok(Self {
            records,
            state: Mutex::new(state),
        })
    }

    /// Allocate an address for `owner` with all of `ports` free.
    ///
    /// Returns the existing allocation unchanged if the owner already holds
    /// one.
    pub async fn allocate(&self, owner: &ServiceKey, ports: &[u16]) -> Result<Allocation, AllocError> {
        self.acquire(owner, ports).await.map(|(allocation, _)| allocation)
    }

    /// Like [`allocate`](Self::allocate), also reporting whether the
    /// allocation was created by this call.
    #[instrument(skip(self), fields(service = %owner))]
    pub async fn acquire(
        &self,
        owner: &ServiceKey,
        ports: &[u16],
    ) -> Result<(Allocation, bool), AllocError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if let Some(existing) = state.allocations.get(owner) {
            if existing.ports.as_slice() != ports {
                debug!(
                    held = ?existing.ports,
                    requested = ?ports,
                    "owner already holds an allocation; keeping it"
                );
            }
            return Ok((existing.clone(), false));
        }

        let ports = normalize_ports(ports)?;

        let Some(address) = state
            .pool
            .iter()
            .copied()
            .find(|addr| !state.index.conflicts(*addr, &ports))
        else {
            warn!(ports = ?ports, "no capacity left in pool");
            return Err(AllocError::NoCapacity {
                owner: owner.clone(),
                ports,
            });
        };

        let allocation = Allocation {
            owner: owner.clone(),
            address,
            ports,
        };

        if let Err(conflict) = state.index.try_insert(&allocation) {
            // The scan above only yields conflict-free addresses.
            return Err(AllocError::Corrupt(conflict.to_string()));
        }
        state.allocations.insert(owner.clone(), allocation.clone());

        if let Err(e) = self.persist(state).await {
            state.allocations.remove(owner);
            state.index.remove(&allocation);
            return Err(e);
        }

        info!(address = %allocation.address, ports = ?allocation.ports, "allocated");
        Ok((allocation, true))
    }

    /// Change the port set of an existing allocation in place, keeping its
    /// address. Returns `None` when `owner` holds nothing.
    ///
    /// Fails with `PortsUnavailable` and leaves the allocation untouched when
    /// another service holds one of the new ports on the same address.
    #[instrument(skip(self), fields(service = %owner))]
    pub async fn resize(&self, owner: &ServiceKey, ports: &[u16]) -> Result<Option<Allocation>, AllocError> {
        let ports = normalize_ports(ports)?;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(previous) = state.allocations.get(owner).cloned() else {
            return Ok(None);
        };
        if previous.ports == ports {
            return Ok(Some(previous));
        }

        let resized = Allocation {
            ports,
            ..previous.clone()
        };

        state.index.remove(&previous);
        if let Err(conflict) = state.index.try_insert(&resized) {
            if let Err(e) = state.index.try_insert(&previous) {
                warn!(conflict = %e, "failed to restore index after rejected resize");
            }
            warn!(%conflict, "port set change rejected");
            return Err(AllocError::PortsUnavailable {
                owner: owner.clone(),
                address: conflict.address,
                port: conflict.port,
                holder: conflict.holder,
            });
        }
        state.allocations.insert(owner.clone(), resized.clone());

        if let Err(e) = self.persist(state).await {
            state.index.remove(&resized);
            if let Err(conflict) = state.index.try_insert(&previous) {
                warn!(%conflict, "failed to restore index after persist failure");
            }
            state.allocations.insert(owner.clone(), previous);
            return Err(e);
        }

        info!(
            address = %resized.address,
            previous = ?previous.ports,
            ports = ?resized.ports,
            "ports changed"
        );
        Ok(Some(resized))
    }

    /// Release the allocation held by `owner`. Releasing an unknown owner
    /// is a no-op.
    #[instrument(skip(self), fields(service = %owner))]
    pub async fn release(&self, owner: &ServiceKey) -> Result<Option<Allocation>, AllocError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(allocation) = state.allocations.remove(owner) else {
            debug!("no allocation to release");
            return Ok(None);
        };
        state.index.remove(&allocation);

        if let Err(e) = self.persist(state).await {
            if let Err(conflict) = state.index.try_insert(&allocation) {
                warn!(%conflict, "failed to restore index after persist failure");
            }
            state.allocations.insert(owner.clone(), allocation);
            return Err(e);
        }

        info!(address = %allocation.address, ports = ?allocation.ports, "released");
        Ok(Some(allocation))
    }

    pub async fn get(&self, owner: &ServiceKey) -> Option<Allocation> {
        self.state.lock().await.allocations.get(owner).cloned()
    }

    /// Distinct allocated addresses in ascending order.
    pub async fn allocated_addresses(&self) -> Vec<Ipv4Addr> {
        self.state.lock().await.index.addresses().collect()
    }

    /// All allocations, ordered by owner.
    pub async fn snapshot(&self) -> Vec<Allocation> {
        self.state.lock().await.allocations.values().cloned().collect()
    }

    pub async fn pool(&self) -> Vec<Ipv4Addr> {
        self.state.lock().await.pool.clone()
    }

    /// Copy of the port index, for consistency checks.
    pub async fn index(&self) -> PortIndex {
        self.state.lock().await.index.clone()
    }

    /// Replace the pool. Existing allocations are kept even if their address
    /// left the pool.
    pub async fn reload_pool(&self, pool: Vec<Ipv4Addr>) {
        let mut state = self.state.lock().await;
        let previous = state.pool.len();
        state.pool = pool;
        warn_outside_pool(&state);
        info!(previous, pool_size = state.pool.len(), "pool reloaded");
    }

    async fn persist(&self, state: &AllocState) -> Result<(), AllocError> {
        let bytes = encode_allocations(state.allocations.values())?;
        self.records
            .put(ALLOCATIONS_KEY, &bytes)
            .await
            .map_err(|e| AllocError::Persist(format!("{e:#}")))
    }
}

fn warn_outside_pool(state: &AllocState) {
    for allocation in state.allocations.values() {
        if !state.pool.contains(&allocation.address) {
            warn!(
                service = %allocation.owner,
                address = %allocation.address,
                "allocation address is not in the current pool"
            );
        }
    }
}
