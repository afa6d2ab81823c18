//! Subnet nesting within one organization
//!
//! The hierarchy is never stored. Every query derives it from the
//! organization's subnet list by interval containment: a subnet's parent
//! is its smallest strict container, its children are the subnets it
//! strictly contains. All functions expect `subnets` to hold the subnets
//! of a single owner.

use ipam_cidr::Network;
use ipam_core::{IpamError, Result, Subnet, SubnetId};
use std::net::IpAddr;

/// Check that `candidate` may join `subnets`
///
/// Nesting in either direction is accepted. A block identical to an
/// existing one, or one that overlaps an existing one without containment,
/// fails with `OverlapConflict`. `ignore` skips a subnet being moved.
pub fn validate_placement(
    candidate: &Network,
    subnets: &[Subnet],
    ignore: Option<SubnetId>,
) -> Result<()> {
    for existing in subnets.iter().filter(|s| Some(s.id) != ignore) {
        if existing.cidr == *candidate {
            return Err(IpamError::OverlapConflict(format!(
                "{} already exists as '{}'",
                candidate, existing.name
            )));
        }
        if existing.cidr.overlaps(candidate)
            && !existing.cidr.contains_network(candidate)
            && !candidate.contains_network(&existing.cidr)
        {
            return Err(IpamError::OverlapConflict(format!(
                "{} partially overlaps {} ('{}')",
                candidate, existing.cidr, existing.name
            )));
        }
    }
    Ok(())
}

/// Most specific subnet containing `address`
///
/// Two subnets of the same block both claiming the address cannot occur
/// while placement is validated, but would fail with `AmbiguousSubnet`.
pub fn resolve_owning(subnets: &[Subnet], address: IpAddr) -> Result<&Subnet> {
    let mut best: Option<&Subnet> = None;
    let mut tied = false;

    for subnet in subnets.iter().filter(|s| s.cidr.contains(address)) {
        match best {
            Some(current) if current.cidr.prefix_len() > subnet.cidr.prefix_len() => {}
            Some(current) if current.cidr.prefix_len() == subnet.cidr.prefix_len() => tied = true,
            _ => {
                best = Some(subnet);
                tied = false;
            }
        }
    }

    match best {
        Some(subnet) if tied => Err(IpamError::AmbiguousSubnet {
            address,
            cidr: subnet.cidr,
        }),
        Some(subnet) => Ok(subnet),
        None => Err(IpamError::NoContainingSubnet(address)),
    }
}

/// Subnets strictly contained in `network`, nearest first
///
/// Ordered by prefix length, then by network address.
pub fn children<'a>(network: &Network, subnets: &'a [Subnet]) -> Vec<&'a Subnet> {
    let mut found: Vec<&Subnet> = subnets
        .iter()
        .filter(|s| network.strictly_contains(&s.cidr))
        .collect();
    found.sort_by_key(|s| (s.cidr.prefix_len(), s.cidr));
    found
}

/// Subnets strictly containing `network`, nearest first
pub fn ancestors<'a>(network: &Network, subnets: &'a [Subnet]) -> Vec<&'a Subnet> {
    let mut found: Vec<&Subnet> = subnets
        .iter()
        .filter(|s| s.cidr.strictly_contains(network))
        .collect();
    found.sort_by_key(|s| std::cmp::Reverse(s.cidr.prefix_len()));
    found
}

/// Smallest subnet strictly containing `network`
pub fn parent<'a>(network: &Network, subnets: &'a [Subnet]) -> Option<&'a Subnet> {
    ancestors(network, subnets).into_iter().next()
}

/// Deepest subnet nested inside `network` that contains `address`
///
/// An address found here belongs to that subnet rather than to `network`.
pub fn deeper_owner<'a>(
    network: &Network,
    subnets: &'a [Subnet],
    address: IpAddr,
) -> Option<&'a Subnet> {
    children(network, subnets)
        .into_iter()
        .filter(|s| s.cidr.contains(address))
        .max_by_key(|s| s.cidr.prefix_len())
}
