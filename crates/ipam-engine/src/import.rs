//! Bulk import and export
//!
//! An import is planned completely before anything is written: the
//! subnet declaration and every row are validated, the resulting writes
//! collected into one [`WriteBatch`] and committed atomically. A bad row
//! leaves the store exactly as it was.

use crate::service::Ipam;
use crate::{hierarchy, tenant};
use ipam_core::{normalize_description, Caller, IpAddress, IpamError, OrgId, Result, Subnet, SubnetId};
use ipam_csv::{AddressRow, SubnetDocument};
use ipam_store::{Store, WriteBatch};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::{info, warn};

/// Outcome of a successful import
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    /// Subnet the rows were applied to
    pub subnet: Subnet,
    /// Whether the subnet was created by this import
    pub created_subnet: bool,
    /// Addresses newly reserved
    pub created: usize,
    /// Existing addresses whose description changed
    pub updated: usize,
    /// Metadata lines found between the CIDR and the header
    pub metadata: Vec<String>,
}

impl<S: Store> Ipam<S> {
    /// Apply an import document
    ///
    /// The owner is `organization` when given, else the organization the
    /// document names on its last metadata line, else the caller's only
    /// organization. A document naming a different organization than
    /// `organization` is `Forbidden`, as is any owner the caller may not
    /// write to.
    ///
    /// The declared subnet is reused when the owner already has that
    /// exact block, and created otherwise. Each row then either updates
    /// the description of an existing reservation or reserves the address.
    /// When a document lists an address twice, the last row wins.
    ///
    /// Fails with `ParseError` on a malformed document and with
    /// `ValidationError` when the subnet cannot be placed or a row names
    /// an address outside the subnet, owned by a nested subnet, or already
    /// reserved in a shared subnet.
    pub async fn import_document(
        &self,
        caller: &Caller,
        organization: Option<OrgId>,
        raw: &[u8],
    ) -> Result<ImportReport> {
        let doc = ipam_csv::parse(raw)?;
        let organization = import_owner(caller, organization, &doc)?;
        tenant::authorize_organization(caller, organization.as_ref())?;

        // Rows are checked against shared reservations, so shared subnets
        // must not change until the batch is committed.
        let _guard = self.locks.write_owners(&[organization.as_ref(), None]).await;
        let peers = self.peers(organization.as_ref())?;

        let mut batch = WriteBatch::new();
        let (subnet, created_subnet) = match peers.iter().find(|s| s.cidr == doc.cidr) {
            Some(existing) => (existing.clone(), false),
            None => {
                hierarchy::validate_placement(&doc.cidr, &peers, None)
                    .and_then(|_| self.check_capture(&doc.cidr, &peers))
                    .map_err(|e| IpamError::ValidationError(e.to_string()))?;
                let subnet = Subnet::new(doc.cidr, doc.name.clone(), organization.clone());
                batch = batch.put_subnet(subnet.clone());
                (subnet, true)
            }
        };

        let shared = match organization {
            Some(_) => self.peers(None)?,
            None => Vec::new(),
        };

        let mut created = 0;
        let mut updated = 0;
        for row in latest_rows(&doc).into_values() {
            self.validate_row(&subnet, &peers, &shared, row)?;
            let description = normalize_description(Some(row.description.clone()));

            let existing = if created_subnet {
                None
            } else {
                self.store.find_address(subnet.id, row.address)?
            };
            match existing {
                Some(record) if record.description == description => {}
                Some(record) => {
                    batch = batch.put_address(IpAddress {
                        description,
                        ..record
                    });
                    updated += 1;
                }
                None => {
                    batch = batch.put_address(IpAddress::new(subnet.id, row.address, description));
                    created += 1;
                }
            }
        }

        self.store.commit(batch)?;
        info!(
            subnet = %subnet.cidr,
            created_subnet,
            created,
            updated,
            "Imported subnet document"
        );

        Ok(ImportReport {
            subnet,
            created_subnet,
            created,
            updated,
            metadata: doc.metadata,
        })
    }

    /// Render a subnet and its addresses in the import format
    pub async fn export_subnet(&self, caller: &Caller, id: SubnetId) -> Result<Vec<u8>> {
        let subnet = self.load_subnet(caller, id)?;
        let rows = self
            .store
            .addresses(id)?
            .into_iter()
            .map(|a| AddressRow::new(a.address, a.description.unwrap_or_default()))
            .collect();

        let doc = SubnetDocument {
            name: subnet.name,
            cidr: subnet.cidr,
            metadata: Vec::new(),
            rows,
        };
        Ok(ipam_csv::render(&doc)?)
    }

    fn validate_row(
        &self,
        subnet: &Subnet,
        peers: &[Subnet],
        shared: &[Subnet],
        row: &AddressRow,
    ) -> Result<()> {
        let address = row.address;
        let invalid = |reason: String| IpamError::ValidationError(format!("line {}: {}", row.line, reason));

        if !subnet.cidr.is_usable(address) {
            return Err(invalid(format!(
                "{} is outside the usable range of {}",
                address, subnet.cidr
            )));
        }
        if let Some(deeper) = hierarchy::deeper_owner(&subnet.cidr, peers, address) {
            return Err(invalid(format!(
                "{} belongs to the nested subnet {}",
                address, deeper.cidr
            )));
        }
        for other in shared.iter().filter(|s| s.cidr.contains(address)) {
            if self.store.find_address(other.id, address)?.is_some() {
                return Err(invalid(format!(
                    "{} is already reserved in shared subnet {}",
                    address, other.cidr
                )));
            }
        }
        Ok(())
    }
}

/// Owner an import lands in
fn import_owner(
    caller: &Caller,
    requested: Option<OrgId>,
    doc: &SubnetDocument,
) -> Result<Option<OrgId>> {
    let named = doc.organization().map(OrgId::from);
    match (requested, named) {
        (Some(requested), Some(named)) if requested != named => {
            warn!(
                requested = %requested,
                named = %named,
                "Import document names another organization"
            );
            Err(IpamError::Forbidden)
        }
        (Some(requested), _) => Ok(Some(requested)),
        (None, Some(named)) => Ok(Some(named)),
        (None, None) => Ok(caller.default_organization()),
    }
}

/// Rows keyed by address, keeping the last occurrence
fn latest_rows(doc: &SubnetDocument) -> BTreeMap<IpAddr, &AddressRow> {
    doc.rows.iter().map(|row| (row.address, row)).collect()
}
