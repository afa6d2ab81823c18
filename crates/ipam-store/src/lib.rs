//! Reservation store for subnets and addresses
//!
//! The engine persists through the [`Store`] trait, which offers exactly the
//! two write primitives allocation correctness depends on:
//!
//! - **insert-if-absent**: [`Store::insert_address`] fails with
//!   `AddressAlreadyReserved` when the subnet already holds the address
//! - **atomic batches**: [`Store::commit`] applies a [`WriteBatch`] fully or
//!   not at all
//!
//! Reads are filtered by an explicit [`Scope`] rather than implicit
//! row-level filtering.
//!
//! # Backends
//!
//! - [`MemoryStore`]: in-process tables, optionally mirrored to a JSON
//!   snapshot file after every commit
//! - `RocksStore` (feature `rocksdb`): RocksDB with one column family per
//!   table plus a `(subnet, address)` index
//!
//! # Examples
//!
//! ```
//! use ipam_cidr::Network;
//! use ipam_core::{IpAddress, Subnet};
//! use ipam_store::{MemoryStore, Store, WriteBatch};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new();
//! let subnet = Subnet::new(Network::parse("10.0.0.0/24")?, "Office", None);
//! store.commit(WriteBatch::new().put_subnet(subnet.clone()))?;
//!
//! let ip = IpAddress::new(subnet.id, "10.0.0.1".parse()?, None);
//! store.insert_address(ip)?;
//!
//! let again = IpAddress::new(subnet.id, "10.0.0.1".parse()?, None);
//! assert!(store.insert_address(again).is_err());
//! # Ok(())
//! # }
//! ```

use ipam_core::{AddressId, Caller, IpAddress, IpamError, OrgId, Subnet, SubnetId};
use std::collections::BTreeSet;
use std::net::IpAddr;
use thiserror::Error;

mod memory;
#[cfg(feature = "rocksdb")]
mod rocks;

pub use memory::MemoryStore;
#[cfg(feature = "rocksdb")]
pub use rocks::RocksStore;

/// Store backend errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database operation failed
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Serialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Persisted data violates an invariant
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Snapshot file I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::SerializationError(err.to_string())
    }
}

impl From<StoreError> for IpamError {
    fn from(err: StoreError) -> Self {
        IpamError::Storage(err.to_string())
    }
}

/// Result type for store operations
pub type Result<T> = ipam_core::Result<T>;

/// Which owners' subnets a read may return
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every subnet
    All,
    /// Subnets owned by any of these organizations
    Organizations(BTreeSet<OrgId>),
    /// Subnets of exactly one owner; `None` selects the shared subnets
    Owner(Option<OrgId>),
}

impl Scope {
    /// Everything the caller may see
    pub fn for_caller(caller: &Caller) -> Self {
        if caller.is_superuser() {
            Scope::All
        } else {
            Scope::Organizations(caller.organizations().clone())
        }
    }

    /// Check whether a subnet owned by `organization` falls in scope
    pub fn admits(&self, organization: Option<&OrgId>) -> bool {
        match self {
            Scope::All => true,
            Scope::Organizations(orgs) => organization.is_some_and(|org| orgs.contains(org)),
            Scope::Owner(owner) => owner.as_ref() == organization,
        }
    }
}

/// One write inside a [`WriteBatch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    PutSubnet(Subnet),
    DeleteSubnet(SubnetId),
    PutAddress(IpAddress),
    DeleteAddress(AddressId),
}

/// Ordered list of writes applied atomically by [`Store::commit`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_subnet(mut self, subnet: Subnet) -> Self {
        self.ops.push(WriteOp::PutSubnet(subnet));
        self
    }

    pub fn delete_subnet(mut self, id: SubnetId) -> Self {
        self.ops.push(WriteOp::DeleteSubnet(id));
        self
    }

    pub fn put_address(mut self, address: IpAddress) -> Self {
        self.ops.push(WriteOp::PutAddress(address));
        self
    }

    pub fn delete_address(mut self, id: AddressId) -> Self {
        self.ops.push(WriteOp::DeleteAddress(id));
        self
    }

    /// Append an op in place
    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Persistent home of subnet and address records
///
/// Implementations must make `commit` all-or-nothing and must reject a
/// `PutAddress` whose `(subnet, address)` pair is held by a different
/// record with `AddressAlreadyReserved`. `DeleteSubnet` on a subnet that
/// still holds addresses fails with `SubnetNotEmpty`.
pub trait Store: Send + Sync {
    /// Subnets in scope, ordered by owner then network
    fn subnets(&self, scope: &Scope) -> Result<Vec<Subnet>>;

    fn subnet(&self, id: SubnetId) -> Result<Option<Subnet>>;

    /// Addresses of a subnet in ascending numeric order
    fn addresses(&self, subnet: SubnetId) -> Result<Vec<IpAddress>>;

    fn address(&self, id: AddressId) -> Result<Option<IpAddress>>;

    /// Reservation of `ip` within `subnet`, if any
    fn find_address(&self, subnet: SubnetId, ip: IpAddr) -> Result<Option<IpAddress>>;

    /// Number of addresses reserved in a subnet
    fn count_addresses(&self, subnet: SubnetId) -> Result<usize> {
        Ok(self.addresses(subnet)?.len())
    }

    /// Apply a batch atomically
    fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// Insert an address unless its subnet already holds it
    fn insert_address(&self, address: IpAddress) -> Result<()> {
        self.commit(WriteBatch::new().put_address(address))
    }
}

impl<T: Store + ?Sized> Store for Box<T> {
    fn subnets(&self, scope: &Scope) -> Result<Vec<Subnet>> {
        (**self).subnets(scope)
    }

    fn subnet(&self, id: SubnetId) -> Result<Option<Subnet>> {
        (**self).subnet(id)
    }

    fn addresses(&self, subnet: SubnetId) -> Result<Vec<IpAddress>> {
        (**self).addresses(subnet)
    }

    fn address(&self, id: AddressId) -> Result<Option<IpAddress>> {
        (**self).address(id)
    }

    fn find_address(&self, subnet: SubnetId, ip: IpAddr) -> Result<Option<IpAddress>> {
        (**self).find_address(subnet, ip)
    }

    fn count_addresses(&self, subnet: SubnetId) -> Result<usize> {
        (**self).count_addresses(subnet)
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        (**self).commit(batch)
    }

    fn insert_address(&self, address: IpAddress) -> Result<()> {
        (**self).insert_address(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_for_caller() {
        assert_eq!(Scope::for_caller(&Caller::superuser()), Scope::All);

        let scope = Scope::for_caller(&Caller::member_of(["org_a"]));
        assert!(scope.admits(Some(&OrgId::from("org_a"))));
        assert!(!scope.admits(Some(&OrgId::from("org_b"))));
        assert!(!scope.admits(None));
    }

    #[test]
    fn test_owner_scope() {
        let shared = Scope::Owner(None);
        assert!(shared.admits(None));
        assert!(!shared.admits(Some(&OrgId::from("org_a"))));

        let org_a = Scope::Owner(Some(OrgId::from("org_a")));
        assert!(org_a.admits(Some(&OrgId::from("org_a"))));
        assert!(!org_a.admits(None));
    }

    #[test]
    fn test_batch_builder() {
        let batch = WriteBatch::new()
            .delete_address(AddressId::new())
            .delete_subnet(SubnetId::new());
        assert_eq!(batch.len(), 2);
        assert!(matches!(batch.ops()[1], WriteOp::DeleteSubnet(_)));
        assert!(WriteBatch::new().is_empty());
    }

    #[test]
    fn test_store_error_converts() {
        let err: IpamError = StoreError::InvalidData("dangling address".into()).into();
        assert_eq!(err.kind(), "storage");
        assert!(err.to_string().contains("dangling address"));
    }
}
