//! Lock registry
//!
//! Two levels, always taken in this order:
//!
//! 1. one `RwLock` per owner (an organization, or `None` for shared
//!    subnets). Reservations hold it for reading; anything that changes
//!    the owner's hierarchy (create, move, delete, import) holds it for
//!    writing.
//! 2. one `Mutex` per subnet, held across "read reservations, pick, write"
//!    so two callers are never handed the same address.
//!
//! Locks for different subnets never contend. Guards are owned so they can
//! be held across `.await` and dropped with the caller's future.

use dashmap::DashMap;
use ipam_core::{OrgId, SubnetId};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

#[derive(Debug, Default)]
pub(crate) struct LockRegistry {
    owners: DashMap<Option<OrgId>, Arc<RwLock<()>>>,
    subnets: DashMap<SubnetId, Arc<Mutex<()>>>,
}

/// Held while reserving in one subnet
pub(crate) struct SubnetGuard {
    _subnet: OwnedMutexGuard<()>,
    _owner: OwnedRwLockReadGuard<()>,
}

/// Held while changing the hierarchy of one or two owners
pub(crate) struct HierarchyGuard {
    _owners: Vec<OwnedRwLockWriteGuard<()>>,
}

impl LockRegistry {
    fn owner(&self, owner: Option<&OrgId>) -> Arc<RwLock<()>> {
        self.owners.entry(owner.cloned()).or_default().clone()
    }

    fn subnet(&self, id: SubnetId) -> Arc<Mutex<()>> {
        self.subnets.entry(id).or_default().clone()
    }

    pub(crate) async fn read_owner(&self, owner: Option<&OrgId>) -> OwnedRwLockReadGuard<()> {
        self.owner(owner).read_owned().await
    }

    /// Lock the subnet itself while already holding its owner for reading
    pub(crate) async fn lock_subnet(
        &self,
        owner: OwnedRwLockReadGuard<()>,
        id: SubnetId,
    ) -> SubnetGuard {
        let subnet = self.subnet(id).lock_owned().await;
        debug!(subnet = %id, "Acquired subnet lock");
        SubnetGuard {
            _subnet: subnet,
            _owner: owner,
        }
    }

    /// Write-lock every owner in `owners`, in a fixed order
    pub(crate) async fn write_owners(&self, owners: &[Option<&OrgId>]) -> HierarchyGuard {
        let mut sorted: Vec<Option<&OrgId>> = owners.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for owner in sorted {
            guards.push(self.owner(owner).write_owned().await);
        }
        debug!(owners = guards.len(), "Acquired hierarchy lock");
        HierarchyGuard { _owners: guards }
    }

    /// Drop the mutex of a deleted subnet
    pub(crate) fn forget_subnet(&self, id: SubnetId) {
        self.subnets.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_writer_waits_for_reservations() {
        let locks = Arc::new(LockRegistry::default());
        let org = OrgId::from("org_a");

        let reader = locks.read_owner(Some(&org)).await;
        let guard = locks.lock_subnet(reader, SubnetId::new()).await;

        let pending = {
            let locks = locks.clone();
            let org = org.clone();
            tokio::spawn(async move {
                let _guard = locks.write_owners(&[Some(&org)]).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        drop(guard);
        pending.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_subnets_do_not_contend() {
        let locks = LockRegistry::default();
        let org = OrgId::from("org_a");

        let first = locks
            .lock_subnet(locks.read_owner(Some(&org)).await, SubnetId::new())
            .await;
        let second = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock_subnet(locks.read_owner(Some(&org)).await, SubnetId::new()),
        )
        .await;
        assert!(second.is_ok());
        drop(first);
    }

    #[tokio::test]
    async fn test_write_owners_dedups() {
        let locks = LockRegistry::default();
        let org = OrgId::from("org_a");
        let _guard = locks.write_owners(&[Some(&org), None, Some(&org)]).await;
    }
}
