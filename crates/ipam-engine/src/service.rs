//! The IPAM service
//!
//! [`Ipam`] is the single entry point front ends call. Every operation
//! takes the [`Caller`] resolved by the identity layer, authorizes it,
//! takes the locks described in the `locks` module and then delegates to
//! the allocator and hierarchy functions.

use crate::locks::{LockRegistry, SubnetGuard};
use crate::{allocator, hierarchy, tenant};
use ipam_cidr::{AddressCount, Network};
use ipam_core::{
    normalize_description, AddressId, Caller, IpAddress, IpamError, OrgId, Result, Subnet,
    SubnetId,
};
use ipam_store::{Scope, Store, WriteBatch};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::{debug, info};

/// Changes accepted by [`Ipam::update_subnet`]
///
/// The CIDR is immutable. `organization: Some(None)` moves the subnet to
/// the shared pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubnetUpdate {
    pub name: Option<String>,
    pub organization: Option<Option<OrgId>>,
}

/// Largest page [`Ipam::hosts`] returns
pub const MAX_HOSTS_PAGE: usize = 1024;

/// One row of a host listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostEntry {
    pub address: IpAddr,
    pub used: bool,
}

/// Address space accounting for a subnet
///
/// `used` counts reservations in the subnet and in every subnet nested in
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub total: AddressCount,
    pub usable: AddressCount,
    pub used: usize,
    pub available: AddressCount,
}

/// IP address management service
///
/// # Examples
///
/// ```
/// use ipam_core::{Caller, OrgId};
/// use ipam_engine::Ipam;
/// use ipam_store::MemoryStore;
///
/// # async fn example() -> ipam_core::Result<()> {
/// let ipam = Ipam::new(MemoryStore::new());
/// let caller = Caller::member_of(["org_a"]);
///
/// let subnet = ipam
///     .create_subnet(&caller, Some(OrgId::from("org_a")), "10.0.0.0/24", "Office")
///     .await?;
/// let ip = ipam.request_address(&caller, subnet.id, Some("printer".into())).await?;
/// assert_eq!(ip.address.to_string(), "10.0.0.1");
/// # Ok(())
/// # }
/// ```
pub struct Ipam<S> {
    pub(crate) store: S,
    pub(crate) locks: LockRegistry,
}

impl<S: Store> Ipam<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            locks: LockRegistry::default(),
        }
    }

    /// Underlying reservation store
    pub fn store(&self) -> &S {
        &self.store
    }

    // ---- subnets ----

    /// Create a subnet
    ///
    /// # Arguments
    ///
    /// * `organization` - Owner, `None` for a globally shared subnet
    /// * `cidr` - Network in CIDR notation; host bits are cleared
    /// * `name` - Display name; blank falls back to the CIDR
    pub async fn create_subnet(
        &self,
        caller: &Caller,
        organization: Option<OrgId>,
        cidr: &str,
        name: &str,
    ) -> Result<Subnet> {
        tenant::authorize_organization(caller, organization.as_ref())?;
        let network = Network::parse(cidr)?;

        let _guard = self.locks.write_owners(&[organization.as_ref()]).await;
        let peers = self.peers(organization.as_ref())?;
        hierarchy::validate_placement(&network, &peers, None)?;
        self.check_capture(&network, &peers)?;

        let subnet = Subnet::new(network, subnet_name(name, &network), organization);
        self.store
            .commit(WriteBatch::new().put_subnet(subnet.clone()))?;

        info!(
            subnet = %subnet.cidr,
            id = %subnet.id,
            organization = ?subnet.organization,
            "Created subnet"
        );
        Ok(subnet)
    }

    /// Fetch one subnet
    pub async fn subnet(&self, caller: &Caller, id: SubnetId) -> Result<Subnet> {
        self.load_subnet(caller, id)
    }

    /// Every subnet the caller may see, ordered by owner then network
    pub async fn visible_subnets(&self, caller: &Caller) -> Result<Vec<Subnet>> {
        let subnets = self.store.subnets(&Scope::for_caller(caller))?;
        Ok(tenant::visible_subnets(caller, subnets))
    }

    /// Rename a subnet or move it to another owner
    pub async fn update_subnet(
        &self,
        caller: &Caller,
        id: SubnetId,
        update: SubnetUpdate,
    ) -> Result<Subnet> {
        loop {
            let seen = self.load_subnet(caller, id)?;
            let target = update
                .organization
                .clone()
                .unwrap_or_else(|| seen.organization.clone());
            tenant::authorize_organization(caller, target.as_ref())?;

            let _guard = self
                .locks
                .write_owners(&[seen.organization.as_ref(), target.as_ref()])
                .await;
            let current = self.load_subnet(caller, id)?;
            if current.organization != seen.organization {
                continue;
            }

            if target != current.organization {
                let peers = self.peers(target.as_ref())?;
                hierarchy::validate_placement(&current.cidr, &peers, Some(id))?;
                self.check_capture(&current.cidr, &peers)?;
                self.check_nested_reservations(&current, &peers)?;
            }

            let updated = Subnet {
                name: update
                    .name
                    .as_deref()
                    .map(|n| subnet_name(n, &current.cidr))
                    .unwrap_or_else(|| current.name.clone()),
                organization: target,
                ..current
            };
            self.store
                .commit(WriteBatch::new().put_subnet(updated.clone()))?;

            info!(subnet = %updated.cidr, organization = ?updated.organization, "Updated subnet");
            return Ok(updated);
        }
    }

    /// Delete a subnet
    ///
    /// A subnet still holding addresses is only deleted when `cascade` is
    /// set, in which case its addresses go in the same batch. Nested
    /// subnets are kept. Returns the number of addresses removed.
    pub async fn delete_subnet(&self, caller: &Caller, id: SubnetId, cascade: bool) -> Result<usize> {
        loop {
            let seen = self.load_subnet(caller, id)?;
            let _guard = self.locks.write_owners(&[seen.organization.as_ref()]).await;
            let current = self.load_subnet(caller, id)?;
            if current.organization != seen.organization {
                continue;
            }

            let addresses = self.store.addresses(id)?;
            if !addresses.is_empty() && !cascade {
                return Err(IpamError::SubnetNotEmpty {
                    subnet: id,
                    addresses: addresses.len(),
                });
            }

            let mut batch = WriteBatch::new();
            for address in &addresses {
                batch = batch.delete_address(address.id);
            }
            self.store.commit(batch.delete_subnet(id))?;
            self.locks.forget_subnet(id);

            info!(subnet = %current.cidr, removed = addresses.len(), "Deleted subnet");
            return Ok(addresses.len());
        }
    }

    /// Smallest subnet of the same owner strictly containing this one
    pub async fn parent(&self, caller: &Caller, id: SubnetId) -> Result<Option<Subnet>> {
        let subnet = self.load_subnet(caller, id)?;
        let peers = self.peers(subnet.organization.as_ref())?;
        Ok(hierarchy::parent(&subnet.cidr, &peers).cloned())
    }

    /// Subnets of the same owner strictly inside this one, nearest first
    pub async fn children(&self, caller: &Caller, id: SubnetId) -> Result<Vec<Subnet>> {
        let subnet = self.load_subnet(caller, id)?;
        let peers = self.peers(subnet.organization.as_ref())?;
        Ok(hierarchy::children(&subnet.cidr, &peers)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Most specific subnet of `organization` containing `address`
    pub async fn resolve_owning_subnet(
        &self,
        caller: &Caller,
        organization: Option<&OrgId>,
        address: IpAddr,
    ) -> Result<Subnet> {
        tenant::authorize_organization(caller, organization)?;
        let peers = self.peers(organization)?;
        hierarchy::resolve_owning(&peers, address).cloned()
    }

    // ---- addresses ----

    /// Next free address of a subnet, without reserving it
    ///
    /// Ranges of nested subnets are skipped; their addresses belong to
    /// them.
    pub async fn next_available(&self, caller: &Caller, id: SubnetId) -> Result<IpAddr> {
        let subnet = self.load_subnet(caller, id)?;
        self.next_free(&subnet)
    }

    /// Reserve the next free address of a subnet
    ///
    /// Picking and reserving happen under the subnet lock, so concurrent
    /// callers always receive distinct addresses.
    pub async fn request_address(
        &self,
        caller: &Caller,
        id: SubnetId,
        description: Option<String>,
    ) -> Result<IpAddress> {
        let (_guard, subnet) = self.lock_for_reservation(caller, id).await?;
        let address = self.next_free(&subnet)?;
        self.reserve_locked(&subnet, address, description)
    }

    /// Reserve a specific address in a subnet
    pub async fn reserve(
        &self,
        caller: &Caller,
        id: SubnetId,
        address: IpAddr,
        description: Option<String>,
    ) -> Result<IpAddress> {
        let (_guard, subnet) = self.lock_for_reservation(caller, id).await?;
        self.reserve_locked(&subnet, address, description)
    }

    /// Reserve an address in whichever subnet of `organization` owns it
    pub async fn create_address(
        &self,
        caller: &Caller,
        organization: Option<OrgId>,
        address: IpAddr,
        description: Option<String>,
    ) -> Result<IpAddress> {
        tenant::authorize_organization(caller, organization.as_ref())?;
        let owner = self.locks.read_owner(organization.as_ref()).await;
        let peers = self.peers(organization.as_ref())?;
        let subnet = hierarchy::resolve_owning(&peers, address)?.clone();

        let _guard = self.locks.lock_subnet(owner, subnet.id).await;
        self.reserve_locked(&subnet, address, description)
    }

    /// Addresses reserved directly in a subnet, ascending
    pub async fn addresses(&self, caller: &Caller, id: SubnetId) -> Result<Vec<IpAddress>> {
        self.load_subnet(caller, id)?;
        self.store.addresses(id)
    }

    /// Fetch one address
    pub async fn address(&self, caller: &Caller, id: AddressId) -> Result<IpAddress> {
        self.load_address(caller, id).map(|(record, _)| record)
    }

    /// Replace the description of an address
    pub async fn update_description(
        &self,
        caller: &Caller,
        id: AddressId,
        description: Option<String>,
    ) -> Result<IpAddress> {
        let (record, _) = self.load_address(caller, id)?;
        let (_guard, _) = self.lock_for_reservation(caller, record.subnet).await?;
        let (record, _) = self.load_address(caller, id)?;

        let updated = IpAddress {
            description: normalize_description(description),
            ..record
        };
        self.store
            .commit(WriteBatch::new().put_address(updated.clone()))?;
        debug!(address = %updated.address, "Updated description");
        Ok(updated)
    }

    /// Release a reserved address
    pub async fn release_address(&self, caller: &Caller, id: AddressId) -> Result<IpAddress> {
        let (record, _) = self.load_address(caller, id)?;
        let (_guard, subnet) = self.lock_for_reservation(caller, record.subnet).await?;
        let (record, _) = self.load_address(caller, id)?;

        self.store.commit(WriteBatch::new().delete_address(id))?;
        info!(subnet = %subnet.cidr, address = %record.address, "Released address");
        Ok(record)
    }

    /// Page through the usable hosts of a subnet
    ///
    /// `offset` counts from the first usable host. Only the requested page
    /// is generated, so any IPv6 prefix can be listed. `limit` is capped
    /// at [`MAX_HOSTS_PAGE`].
    pub async fn hosts(
        &self,
        caller: &Caller,
        id: SubnetId,
        offset: u128,
        limit: usize,
    ) -> Result<Vec<HostEntry>> {
        let subnet = self.load_subnet(caller, id)?;
        let used = self.used_addresses(&subnet)?;
        Ok(subnet
            .cidr
            .hosts_from(offset)
            .take(limit.min(MAX_HOSTS_PAGE))
            .map(|address| HostEntry {
                address,
                used: used.contains(&address),
            })
            .collect())
    }

    /// Size and occupancy of a subnet
    pub async fn usage(&self, caller: &Caller, id: SubnetId) -> Result<Usage> {
        let subnet = self.load_subnet(caller, id)?;
        let used = self.used_addresses(&subnet)?.len();
        let usable = subnet.cidr.usable_count();
        Ok(Usage {
            total: subnet.cidr.size(),
            usable,
            used,
            available: usable.saturating_sub(used as u128),
        })
    }

    // ---- internals ----

    pub(crate) fn load_subnet(&self, caller: &Caller, id: SubnetId) -> Result<Subnet> {
        match self.store.subnet(id)? {
            Some(subnet) => {
                tenant::authorize(caller, &subnet)?;
                Ok(subnet)
            }
            None => Err(tenant::missing(caller, IpamError::SubnetNotFound(id))),
        }
    }

    fn load_address(&self, caller: &Caller, id: AddressId) -> Result<(IpAddress, Subnet)> {
        let record = self
            .store
            .address(id)?
            .ok_or_else(|| tenant::missing(caller, IpamError::AddressNotFound(id)))?;
        let subnet = self.store.subnet(record.subnet)?.ok_or_else(|| {
            IpamError::Storage(format!(
                "address {} references missing subnet {}",
                id, record.subnet
            ))
        })?;
        tenant::authorize(caller, &subnet)?;
        Ok((record, subnet))
    }

    /// All subnets of one owner
    pub(crate) fn peers(&self, owner: Option<&OrgId>) -> Result<Vec<Subnet>> {
        self.store.subnets(&Scope::Owner(owner.cloned()))
    }

    /// Take the owner read lock and the subnet lock
    ///
    /// Retries if the subnet changed owner between the lookup and the
    /// owner lock.
    async fn lock_for_reservation(
        &self,
        caller: &Caller,
        id: SubnetId,
    ) -> Result<(SubnetGuard, Subnet)> {
        loop {
            let seen = self.load_subnet(caller, id)?;
            let owner = self.locks.read_owner(seen.organization.as_ref()).await;
            let current = self.load_subnet(caller, id)?;
            if current.organization == seen.organization {
                let guard = self.locks.lock_subnet(owner, id).await;
                return Ok((guard, current));
            }
        }
    }

    fn next_free(&self, subnet: &Subnet) -> Result<IpAddr> {
        let reserved: BTreeSet<IpAddr> = self
            .store
            .addresses(subnet.id)?
            .into_iter()
            .map(|a| a.address)
            .collect();
        let peers = self.peers(subnet.organization.as_ref())?;
        let nested: Vec<Network> = hierarchy::children(&subnet.cidr, &peers)
            .into_iter()
            .map(|s| s.cidr)
            .collect();

        debug!(
            subnet = %subnet.cidr,
            reserved = reserved.len(),
            nested = nested.len(),
            "Scanning for next available address"
        );
        allocator::next_available_excluding(&subnet.cidr, &reserved, &nested)
    }

    /// Reserve with the subnet lock already held
    fn reserve_locked(
        &self,
        subnet: &Subnet,
        address: IpAddr,
        description: Option<String>,
    ) -> Result<IpAddress> {
        allocator::check_range(&subnet.cidr, address)?;
        let peers = self.peers(subnet.organization.as_ref())?;
        if let Some(deeper) = hierarchy::deeper_owner(&subnet.cidr, &peers, address) {
            return Err(IpamError::DeeperSubnet {
                address,
                subnet: deeper.cidr,
            });
        }

        let record = IpAddress::new(subnet.id, address, description);
        self.store.insert_address(record.clone())?;
        info!(subnet = %subnet.cidr, address = %address, "Reserved address");
        Ok(record)
    }

    /// Refuse a block that would take over reservations of its containers
    pub(crate) fn check_capture(&self, network: &Network, peers: &[Subnet]) -> Result<()> {
        for ancestor in hierarchy::ancestors(network, peers) {
            let captured = self
                .store
                .addresses(ancestor.id)?
                .into_iter()
                .filter(|a| network.contains(a.address))
                .count();
            if captured > 0 {
                return Err(IpamError::OverlapConflict(format!(
                    "{} would take over {} addresses reserved in {}",
                    network, captured, ancestor.cidr
                )));
            }
        }
        Ok(())
    }

    /// Refuse a move that would leave reservations inside a deeper subnet
    fn check_nested_reservations(&self, subnet: &Subnet, peers: &[Subnet]) -> Result<()> {
        let nested = hierarchy::children(&subnet.cidr, peers);
        if nested.is_empty() {
            return Ok(());
        }
        for address in self.store.addresses(subnet.id)? {
            if let Some(owner) = nested.iter().find(|s| s.cidr.contains(address.address)) {
                return Err(IpamError::OverlapConflict(format!(
                    "{} holds {} which {} already covers",
                    subnet.cidr, address.address, owner.cidr
                )));
            }
        }
        Ok(())
    }

    /// Usable addresses reserved in the subnet or any subnet nested in it
    fn used_addresses(&self, subnet: &Subnet) -> Result<BTreeSet<IpAddr>> {
        let peers = self.peers(subnet.organization.as_ref())?;
        let mut used = BTreeSet::new();
        let mut owners = vec![subnet];
        owners.extend(hierarchy::children(&subnet.cidr, &peers));

        for owner in owners {
            used.extend(
                self.store
                    .addresses(owner.id)?
                    .into_iter()
                    .map(|a| a.address)
                    .filter(|ip| subnet.cidr.is_usable(*ip)),
            );
        }
        Ok(used)
    }
}

/// Trimmed name, or the CIDR when blank
fn subnet_name(name: &str, cidr: &Network) -> String {
    match name.trim() {
        "" => cidr.to_string(),
        trimmed => trimmed.to_string(),
    }
}
