//! Tenant scoping
//!
//! Every read or write of a subnet or address passes through [`authorize`]
//! first. A caller outside the owning organization gets `Forbidden`,
//! and so does a regular caller asking for an id that does not exist, so
//! the answer never reveals whether another tenant's record is there.

use ipam_core::{Caller, IpamError, OrgId, Result, Subnet};
use tracing::warn;

/// Allow the call iff the caller is a superuser or a member of the owner
pub fn authorize(caller: &Caller, subnet: &Subnet) -> Result<()> {
    authorize_organization(caller, subnet.organization.as_ref())
}

/// Same decision for data owned by `organization` (`None` = shared)
pub fn authorize_organization(caller: &Caller, organization: Option<&OrgId>) -> Result<()> {
    if caller.can_access(organization) {
        Ok(())
    } else {
        warn!(
            organization = organization.map(|o| o.0.as_str()).unwrap_or("<shared>"),
            "Access denied"
        );
        Err(IpamError::Forbidden)
    }
}

/// Outcome for a lookup that found nothing
///
/// Superusers learn the record is missing; everyone else sees the same
/// `Forbidden` a foreign record would produce.
pub fn missing(caller: &Caller, not_found: IpamError) -> IpamError {
    if caller.is_superuser() {
        not_found
    } else {
        IpamError::Forbidden
    }
}

/// Keep only the subnets the caller may see
pub fn visible_subnets(caller: &Caller, subnets: Vec<Subnet>) -> Vec<Subnet> {
    subnets
        .into_iter()
        .filter(|s| caller.can_access(s.organization.as_ref()))
        .collect()
}
