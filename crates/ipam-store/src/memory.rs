//! In-memory store with optional JSON snapshot file

use crate::{Result, Scope, Store, StoreError, WriteBatch, WriteOp};
use ipam_core::{AddressId, IpAddress, IpamError, Subnet, SubnetId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// On-disk snapshot layout
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    subnets: Vec<Subnet>,
    addresses: Vec<IpAddress>,
}

/// Previous value of a row, restored when a batch fails midway
enum Undo {
    Subnet(SubnetId, Option<Subnet>),
    Address(AddressId, Option<IpAddress>),
}

#[derive(Debug, Default)]
struct Tables {
    subnets: BTreeMap<SubnetId, Subnet>,
    addresses: HashMap<AddressId, IpAddress>,
    /// subnet -> address -> record id; the uniqueness index
    index: HashMap<SubnetId, BTreeMap<IpAddr, AddressId>>,
}

impl Tables {
    fn from_snapshot(snapshot: Snapshot) -> std::result::Result<Self, StoreError> {
        let mut tables = Tables::default();
        for subnet in snapshot.subnets {
            tables.subnets.insert(subnet.id, subnet);
        }
        for address in snapshot.addresses {
            if !tables.subnets.contains_key(&address.subnet) {
                return Err(StoreError::InvalidData(format!(
                    "address {} references unknown subnet {}",
                    address.address, address.subnet
                )));
            }
            if tables.holder(address.subnet, address.address).is_some() {
                return Err(StoreError::InvalidData(format!(
                    "address {} reserved twice in subnet {}",
                    address.address, address.subnet
                )));
            }
            tables.set_address(address.id, Some(address));
        }
        Ok(tables)
    }

    fn to_snapshot(&self) -> Snapshot {
        let mut addresses: Vec<IpAddress> = self.addresses.values().cloned().collect();
        addresses.sort_by(|a, b| (a.subnet, a.address).cmp(&(b.subnet, b.address)));
        Snapshot {
            subnets: self.subnets.values().cloned().collect(),
            addresses,
        }
    }

    fn holder(&self, subnet: SubnetId, ip: IpAddr) -> Option<AddressId> {
        self.index.get(&subnet).and_then(|ips| ips.get(&ip)).copied()
    }

    fn set_subnet(&mut self, id: SubnetId, subnet: Option<Subnet>) -> Option<Subnet> {
        match subnet {
            Some(subnet) => self.subnets.insert(id, subnet),
            None => self.subnets.remove(&id),
        }
    }

    /// Replace a row and keep the index in step; returns the previous row
    fn set_address(&mut self, id: AddressId, address: Option<IpAddress>) -> Option<IpAddress> {
        let previous = self.addresses.remove(&id);
        if let Some(prev) = &previous {
            if let Some(ips) = self.index.get_mut(&prev.subnet) {
                if ips.get(&prev.address) == Some(&id) {
                    ips.remove(&prev.address);
                }
                if ips.is_empty() {
                    self.index.remove(&prev.subnet);
                }
            }
        }
        if let Some(address) = address {
            self.index
                .entry(address.subnet)
                .or_default()
                .insert(address.address, id);
            self.addresses.insert(id, address);
        }
        previous
    }

    fn apply(&mut self, op: WriteOp) -> Result<Undo> {
        match op {
            WriteOp::PutSubnet(subnet) => {
                let id = subnet.id;
                Ok(Undo::Subnet(id, self.set_subnet(id, Some(subnet))))
            }
            WriteOp::DeleteSubnet(id) => {
                let held = self.index.get(&id).map_or(0, BTreeMap::len);
                if held > 0 {
                    return Err(IpamError::SubnetNotEmpty {
                        subnet: id,
                        addresses: held,
                    });
                }
                Ok(Undo::Subnet(id, self.set_subnet(id, None)))
            }
            WriteOp::PutAddress(address) => {
                let subnet = self.subnets.get(&address.subnet).ok_or_else(|| {
                    IpamError::Storage(format!(
                        "address {} references unknown subnet {}",
                        address.address, address.subnet
                    ))
                })?;
                if let Some(holder) = self.holder(address.subnet, address.address) {
                    if holder != address.id {
                        return Err(IpamError::AddressAlreadyReserved {
                            address: address.address,
                            subnet: subnet.cidr,
                        });
                    }
                }
                let id = address.id;
                Ok(Undo::Address(id, self.set_address(id, Some(address))))
            }
            WriteOp::DeleteAddress(id) => Ok(Undo::Address(id, self.set_address(id, None))),
        }
    }

    fn revert(&mut self, undo: Vec<Undo>) {
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Subnet(id, previous) => {
                    self.set_subnet(id, previous);
                }
                Undo::Address(id, previous) => {
                    self.set_address(id, previous);
                }
            }
        }
    }
}

/// In-memory store
///
/// Thread-safe with a single `RwLock`; readers never block each other.
/// When opened on a file, every successful commit rewrites the snapshot
/// (write to a temporary file, then rename) before it becomes visible.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// Create an empty, purely in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a snapshot-backed store, creating it on first commit
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use ipam_store::MemoryStore;
    ///
    /// let store = MemoryStore::open("./ipam.json")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> std::result::Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let raw = fs::read(&path)?;
            let snapshot: Snapshot = serde_json::from_slice(&raw)?;
            Tables::from_snapshot(snapshot)?
        } else {
            Tables::default()
        };
        debug!(path = %path.display(), subnets = tables.subnets.len(), "Opened snapshot store");

        Ok(Self {
            tables: RwLock::new(tables),
            path: Some(path),
        })
    }

    /// Snapshot file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn persist(&self, tables: &Tables) -> std::result::Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut file, &tables.to_snapshot())?;
        file.persist(path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }
}

impl Store for MemoryStore {
    fn subnets(&self, scope: &Scope) -> Result<Vec<Subnet>> {
        let tables = self.tables.read();
        let mut subnets: Vec<Subnet> = tables
            .subnets
            .values()
            .filter(|s| scope.admits(s.organization.as_ref()))
            .cloned()
            .collect();
        subnets.sort_by(|a, b| (&a.organization, a.cidr).cmp(&(&b.organization, b.cidr)));
        Ok(subnets)
    }

    fn subnet(&self, id: SubnetId) -> Result<Option<Subnet>> {
        Ok(self.tables.read().subnets.get(&id).cloned())
    }

    fn addresses(&self, subnet: SubnetId) -> Result<Vec<IpAddress>> {
        let tables = self.tables.read();
        let Some(ips) = tables.index.get(&subnet) else {
            return Ok(Vec::new());
        };
        Ok(ips
            .values()
            .filter_map(|id| tables.addresses.get(id).cloned())
            .collect())
    }

    fn address(&self, id: AddressId) -> Result<Option<IpAddress>> {
        Ok(self.tables.read().addresses.get(&id).cloned())
    }

    fn find_address(&self, subnet: SubnetId, ip: IpAddr) -> Result<Option<IpAddress>> {
        let tables = self.tables.read();
        Ok(tables
            .holder(subnet, ip)
            .and_then(|id| tables.addresses.get(&id).cloned()))
    }

    fn count_addresses(&self, subnet: SubnetId) -> Result<usize> {
        Ok(self.tables.read().index.get(&subnet).map_or(0, BTreeMap::len))
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        let ops = batch.len();
        let mut tables = self.tables.write();
        let mut undo = Vec::with_capacity(ops);

        for op in batch.into_ops() {
            match tables.apply(op) {
                Ok(entry) => undo.push(entry),
                Err(err) => {
                    tables.revert(undo);
                    return Err(err);
                }
            }
        }

        if let Err(err) = self.persist(&tables) {
            tables.revert(undo);
            return Err(err.into());
        }

        debug!(ops, "Committed batch");
        Ok(())
    }
}
