//! Address/port occupancy index.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use vlb_id::ServiceKey;

use super::Allocation;

/// Two services claimed the same port on the same address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConflict {
    pub address: Ipv4Addr,
    pub port: u16,
    pub holder: ServiceKey,
    pub claimant: ServiceKey,
}

impl std::fmt::Display for PortConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} claimed by both {} and {}",
            self.address, self.port, self.holder, self.claimant
        )
    }
}

/// Address -> port -> owner. Derived entirely from the allocation list and
/// never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortIndex {
    by_address: BTreeMap<Ipv4Addr, BTreeMap<u16, ServiceKey>>,
}

impl PortIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the index from a full allocation list, rejecting overlapping
    /// claims.
    pub fn rebuild<'a, I>(allocations: I) -> Result<Self, PortConflict>
    where
        I: IntoIterator<Item = &'a Allocation>,
    {
        let mut index = Self::new();
        for allocation in allocations {
            index.try_insert(allocation)?;
        }
        Ok(index)
    }

    /// Whether any of `ports` is already taken on `address`.
    pub fn conflicts(&self, address: Ipv4Addr, ports: &[u16]) -> bool {
        self.by_address
            .get(&address)
            .is_some_and(|taken| ports.iter().any(|p| taken.contains_key(p)))
    }

    /// Claim every port of `allocation`. Nothing is inserted on conflict.
    pub fn try_insert(&mut self, allocation: &Allocation) -> Result<(), PortConflict> {
        if let Some(taken) = self.by_address.get(&allocation.address) {
            for port in &allocation.ports {
                if let Some(holder) = taken.get(port) {
                    return Err(PortConflict {
                        address: allocation.address,
                        port: *port,
                        holder: holder.clone(),
                        claimant: allocation.owner.clone(),
                    });
                }
            }
        }

        let taken = self.by_address.entry(allocation.address).or_default();
        for port in &allocation.ports {
            taken.insert(*port, allocation.owner.clone());
        }
        Ok(())
    }

    /// Drop the ports `allocation` holds. Ports owned by someone else are
    /// left alone, and an address with no ports left disappears.
    pub fn remove(&mut self, allocation: &Allocation) {
        let Some(taken) = self.by_address.get_mut(&allocation.address) else {
            return;
        };

        for port in &allocation.ports {
            if taken.get(port) == Some(&allocation.owner) {
                taken.remove(port);
            }
        }

        if taken.is_empty() {
            self.by_address.remove(&allocation.address);
        }
    }

    /// Owner of a port on an address.
    pub fn owner_of(&self, address: Ipv4Addr, port: u16) -> Option<&ServiceKey> {
        self.by_address.get(&address)?.get(&port)
    }

    /// Addresses with at least one claimed port, in ascending order.
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.by_address.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}
