//! RocksDB-backed store
//!
//! # Layout
//!
//! - **subnets**: subnet id -> JSON subnet
//! - **addresses**: address id -> JSON address
//! - **address_index**: `subnet id ++ family ++ address` -> address id
//!
//! Index keys are big-endian, so a prefix scan over one subnet yields its
//! addresses in ascending numeric order. Writers are serialized by a
//! mutex so the uniqueness check and the write batch form one step.

use crate::{Result, Scope, Store, StoreError, WriteBatch, WriteOp};
use ipam_cidr::ip_to_bits;
use ipam_core::{AddressId, IpAddress, IpamError, Subnet, SubnetId};
use parking_lot::Mutex;
use rocksdb::{BlockBasedOptions, IteratorMode, Options, DB};
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        StoreError::DatabaseError(err.to_string())
    }
}

/// Column family names
const CF_SUBNETS: &str = "subnets";
const CF_ADDRESSES: &str = "addresses";
const CF_ADDRESS_INDEX: &str = "address_index";

fn index_key(subnet: SubnetId, ip: IpAddr) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.extend_from_slice(subnet.0.as_bytes());
    key.push(if ip.is_ipv4() { 4 } else { 6 });
    key.extend_from_slice(&ip_to_bits(ip).to_be_bytes());
    key
}

fn decode_id(bytes: &[u8]) -> std::result::Result<Uuid, StoreError> {
    Uuid::from_slice(bytes).map_err(|e| StoreError::InvalidData(e.to_string()))
}

/// RocksDB store
pub struct RocksStore {
    db: DB,
    write_lock: Mutex<()>,
}

/// Pending writes of one batch, consulted before the database
#[derive(Default)]
struct Overlay {
    subnets: HashMap<SubnetId, Option<Subnet>>,
    addresses: HashMap<AddressId, Option<IpAddress>>,
    index: HashMap<Vec<u8>, Option<AddressId>>,
}

impl RocksStore {
    /// Open or create a store
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use ipam_store::RocksStore;
    ///
    /// let store = RocksStore::open("./data/ipam")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> std::result::Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(&rocksdb::Cache::new_lru_cache(64 * 1024 * 1024));
        opts.set_block_based_table_factory(&block_opts);

        let db = DB::open_cf(&opts, path, [CF_SUBNETS, CF_ADDRESSES, CF_ADDRESS_INDEX])?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> std::result::Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family {} not found", name)))
    }

    fn load_subnet(&self, id: SubnetId) -> std::result::Result<Option<Subnet>, StoreError> {
        match self.db.get_cf(self.cf(CF_SUBNETS)?, id.0.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_address(&self, id: AddressId) -> std::result::Result<Option<IpAddress>, StoreError> {
        match self.db.get_cf(self.cf(CF_ADDRESSES)?, id.0.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_holder(&self, key: &[u8]) -> std::result::Result<Option<AddressId>, StoreError> {
        match self.db.get_cf(self.cf(CF_ADDRESS_INDEX)?, key)? {
            Some(bytes) => Ok(Some(AddressId(decode_id(&bytes)?))),
            None => Ok(None),
        }
    }

    /// Index keys currently stored for a subnet
    fn index_keys(&self, subnet: SubnetId) -> std::result::Result<Vec<(Vec<u8>, AddressId)>, StoreError> {
        let prefix = subnet.0.as_bytes();
        let mut keys = Vec::new();
        for item in self.db.prefix_iterator_cf(self.cf(CF_ADDRESS_INDEX)?, prefix) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push((key.to_vec(), AddressId(decode_id(&value)?)));
        }
        Ok(keys)
    }

    fn overlay_subnet(&self, overlay: &Overlay, id: SubnetId) -> Result<Option<Subnet>> {
        match overlay.subnets.get(&id) {
            Some(pending) => Ok(pending.clone()),
            None => Ok(self.load_subnet(id)?),
        }
    }

    fn overlay_address(&self, overlay: &Overlay, id: AddressId) -> Result<Option<IpAddress>> {
        match overlay.addresses.get(&id) {
            Some(pending) => Ok(pending.clone()),
            None => Ok(self.load_address(id)?),
        }
    }

    fn overlay_holder(&self, overlay: &Overlay, key: &[u8]) -> Result<Option<AddressId>> {
        match overlay.index.get(key) {
            Some(pending) => Ok(*pending),
            None => Ok(self.load_holder(key)?),
        }
    }

    fn remaining_addresses(&self, overlay: &Overlay, subnet: SubnetId) -> Result<usize> {
        let prefix = subnet.0.as_bytes();
        let mut live: BTreeSet<Vec<u8>> = self
            .index_keys(subnet)?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        for (key, pending) in &overlay.index {
            if key.starts_with(prefix) {
                match pending {
                    Some(_) => live.insert(key.clone()),
                    None => live.remove(key),
                };
            }
        }
        Ok(live.len())
    }

    fn stage(
        &self,
        overlay: &mut Overlay,
        batch: &mut rocksdb::WriteBatch,
        op: WriteOp,
    ) -> Result<()> {
        match op {
            WriteOp::PutSubnet(subnet) => {
                batch.put_cf(
                    self.cf(CF_SUBNETS)?,
                    subnet.id.0.as_bytes(),
                    serde_json::to_vec(&subnet).map_err(StoreError::from)?,
                );
                overlay.subnets.insert(subnet.id, Some(subnet));
            }
            WriteOp::DeleteSubnet(id) => {
                let held = self.remaining_addresses(overlay, id)?;
                if held > 0 {
                    return Err(IpamError::SubnetNotEmpty {
                        subnet: id,
                        addresses: held,
                    });
                }
                batch.delete_cf(self.cf(CF_SUBNETS)?, id.0.as_bytes());
                overlay.subnets.insert(id, None);
            }
            WriteOp::PutAddress(address) => {
                let subnet = self.overlay_subnet(overlay, address.subnet)?.ok_or_else(|| {
                    IpamError::Storage(format!(
                        "address {} references unknown subnet {}",
                        address.address, address.subnet
                    ))
                })?;
                let key = index_key(address.subnet, address.address);
                if let Some(holder) = self.overlay_holder(overlay, &key)? {
                    if holder != address.id {
                        return Err(IpamError::AddressAlreadyReserved {
                            address: address.address,
                            subnet: subnet.cidr,
                        });
                    }
                }
                if let Some(previous) = self.overlay_address(overlay, address.id)? {
                    let old_key = index_key(previous.subnet, previous.address);
                    if old_key != key {
                        batch.delete_cf(self.cf(CF_ADDRESS_INDEX)?, &old_key);
                        overlay.index.insert(old_key, None);
                    }
                }
                batch.put_cf(self.cf(CF_ADDRESS_INDEX)?, &key, address.id.0.as_bytes());
                batch.put_cf(
                    self.cf(CF_ADDRESSES)?,
                    address.id.0.as_bytes(),
                    serde_json::to_vec(&address).map_err(StoreError::from)?,
                );
                overlay.index.insert(key, Some(address.id));
                overlay.addresses.insert(address.id, Some(address));
            }
            WriteOp::DeleteAddress(id) => {
                if let Some(previous) = self.overlay_address(overlay, id)? {
                    let key = index_key(previous.subnet, previous.address);
                    batch.delete_cf(self.cf(CF_ADDRESS_INDEX)?, &key);
                    batch.delete_cf(self.cf(CF_ADDRESSES)?, id.0.as_bytes());
                    overlay.index.insert(key, None);
                    overlay.addresses.insert(id, None);
                }
            }
        }
        Ok(())
    }
}

impl Store for RocksStore {
    fn subnets(&self, scope: &Scope) -> Result<Vec<Subnet>> {
        let mut subnets = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_SUBNETS)?, IteratorMode::Start) {
            let (_, value) = item.map_err(StoreError::from)?;
            let subnet: Subnet = serde_json::from_slice(&value).map_err(StoreError::from)?;
            if scope.admits(subnet.organization.as_ref()) {
                subnets.push(subnet);
            }
        }
        subnets.sort_by(|a, b| (&a.organization, a.cidr).cmp(&(&b.organization, b.cidr)));
        Ok(subnets)
    }

    fn subnet(&self, id: SubnetId) -> Result<Option<Subnet>> {
        Ok(self.load_subnet(id)?)
    }

    fn addresses(&self, subnet: SubnetId) -> Result<Vec<IpAddress>> {
        let mut addresses = Vec::new();
        for (_, id) in self.index_keys(subnet)? {
            if let Some(address) = self.load_address(id)? {
                addresses.push(address);
            }
        }
        Ok(addresses)
    }

    fn address(&self, id: AddressId) -> Result<Option<IpAddress>> {
        Ok(self.load_address(id)?)
    }

    fn find_address(&self, subnet: SubnetId, ip: IpAddr) -> Result<Option<IpAddress>> {
        match self.load_holder(&index_key(subnet, ip))? {
            Some(id) => Ok(self.load_address(id)?),
            None => Ok(None),
        }
    }

    fn count_addresses(&self, subnet: SubnetId) -> Result<usize> {
        Ok(self.index_keys(subnet)?.len())
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        let _guard = self.write_lock.lock();
        let ops = batch.len();
        let mut overlay = Overlay::default();
        let mut staged = rocksdb::WriteBatch::default();

        for op in batch.into_ops() {
            self.stage(&mut overlay, &mut staged, op)?;
        }

        self.db.write(staged).map_err(StoreError::from)?;
        debug!(ops, "Committed batch");
        Ok(())
    }
}
