//! Address allocation within a single subnet
//!
//! Pure functions over a network and the set of addresses already reserved
//! in it. The scan walks the usable host range in ascending numeric order
//! and jumps over reserved addresses and excluded ranges, so its cost
//! depends on the number of reservations rather than the size of the
//! range. A /64 is as cheap to scan as a /30.

use ipam_cidr::{ip_to_bits, Network};
use ipam_core::{IpamError, Result};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// First usable address of `network` not present in `reserved`
///
/// # Examples
///
/// ```
/// use ipam_cidr::Network;
/// use ipam_engine::allocator::next_available;
/// use std::collections::BTreeSet;
///
/// let net = Network::parse("10.0.0.0/24").unwrap();
/// let reserved: BTreeSet<_> = ["10.0.0.1".parse().unwrap()].into();
/// assert_eq!(next_available(&net, &reserved).unwrap().to_string(), "10.0.0.2");
/// ```
pub fn next_available(network: &Network, reserved: &BTreeSet<IpAddr>) -> Result<IpAddr> {
    next_available_excluding(network, reserved, &[])
}

/// Like [`next_available`], skipping every address inside `excluded`
///
/// Used to leave the ranges of nested subnets to those subnets. Excluded
/// networks of another family or outside `network` have no effect.
pub fn next_available_excluding(
    network: &Network,
    reserved: &BTreeSet<IpAddr>,
    excluded: &[Network],
) -> Result<IpAddr> {
    let (first, last) = network.usable_bounds();
    let exhausted = || IpamError::SubnetExhausted(*network);

    let taken: BTreeSet<u128> = reserved
        .iter()
        .filter(|ip| network.contains(**ip))
        .map(|ip| ip_to_bits(*ip))
        .collect();

    let mut ranges: Vec<(u128, u128)> = excluded
        .iter()
        .filter(|net| network.overlaps(net))
        .map(Network::bounds)
        .collect();
    ranges.sort_unstable();

    let mut cursor = first;
    loop {
        if cursor > last {
            return Err(exhausted());
        }

        if let Some(&(_, end)) = ranges
            .iter()
            .find(|(start, end)| *start <= cursor && cursor <= *end)
        {
            cursor = end.checked_add(1).ok_or_else(exhausted)?;
            continue;
        }

        if taken.contains(&cursor) {
            cursor = cursor.checked_add(1).ok_or_else(exhausted)?;
            continue;
        }

        return Ok(network.family().addr(cursor));
    }
}

/// Check that `address` may be reserved in `network` at all
///
/// Family and usable-range membership are checked; the network and
/// broadcast addresses of IPv4 prefixes shorter than /31 are refused.
pub fn check_range(network: &Network, address: IpAddr) -> Result<()> {
    if network.is_usable(address) {
        Ok(())
    } else {
        Err(IpamError::AddressOutOfRange {
            address,
            subnet: *network,
        })
    }
}

/// Validate an explicit reservation and record it in `reserved`
///
/// Range is checked before uniqueness, so an out-of-range address is
/// reported as such even when it also appears in `reserved`.
pub fn reserve(network: &Network, address: IpAddr, reserved: &mut BTreeSet<IpAddr>) -> Result<()> {
    check_range(network, address)?;
    if !reserved.insert(address) {
        return Err(IpamError::AddressAlreadyReserved {
            address,
            subnet: *network,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Network {
        Network::parse(s).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn set(addrs: &[&str]) -> BTreeSet<IpAddr> {
        addrs.iter().map(|a| ip(a)).collect()
    }

    #[test]
    fn test_first_free_skips_network_address() {
        let n = net("10.0.0.0/24");
        assert_eq!(next_available(&n, &BTreeSet::new()).unwrap(), ip("10.0.0.1"));
        assert_eq!(next_available(&n, &set(&["10.0.0.1"])).unwrap(), ip("10.0.0.2"));
    }

    #[test]
    fn test_fills_gaps_first() {
        let n = net("10.0.0.0/24");
        let reserved = set(&["10.0.0.1", "10.0.0.2", "10.0.0.4"]);
        assert_eq!(next_available(&n, &reserved).unwrap(), ip("10.0.0.3"));
    }

    #[test]
    fn test_point_to_point_uses_both_addresses() {
        let n = net("10.0.0.0/31");
        assert_eq!(next_available(&n, &BTreeSet::new()).unwrap(), ip("10.0.0.0"));
        assert_eq!(next_available(&n, &set(&["10.0.0.0"])).unwrap(), ip("10.0.0.1"));
        assert!(matches!(
            next_available(&n, &set(&["10.0.0.0", "10.0.0.1"])),
            Err(IpamError::SubnetExhausted(_))
        ));
    }

    #[test]
    fn test_host_route() {
        let n = net("192.0.2.7/32");
        assert_eq!(next_available(&n, &BTreeSet::new()).unwrap(), ip("192.0.2.7"));
        assert!(next_available(&n, &set(&["192.0.2.7"])).is_err());
    }

    #[test]
    fn test_ipv6_starts_at_network_address() {
        let n = net("2001:db8::/64");
        assert_eq!(next_available(&n, &BTreeSet::new()).unwrap(), ip("2001:db8::"));
        assert_eq!(next_available(&n, &set(&["2001:db8::"])).unwrap(), ip("2001:db8::1"));
    }

    #[test]
    fn test_whole_ipv6_space() {
        let n = net("::/0");
        let reserved = set(&["::", "::1"]);
        assert_eq!(next_available(&n, &reserved).unwrap(), ip("::2"));
    }

    #[test]
    fn test_top_of_ipv6_space_exhausts_without_overflow() {
        let n = net("ffff:ffff:ffff:ffff:ffff:ffff:ffff:fffe/127");
        let reserved = set(&[
            "ffff:ffff:ffff:ffff:ffff:ffff:ffff:fffe",
            "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff",
        ]);
        assert!(matches!(
            next_available(&n, &reserved),
            Err(IpamError::SubnetExhausted(_))
        ));
    }

    #[test]
    fn test_excluded_ranges_are_jumped() {
        let n = net("10.0.0.0/24");
        let excluded = [net("10.0.0.0/25")];
        assert_eq!(
            next_available_excluding(&n, &BTreeSet::new(), &excluded).unwrap(),
            ip("10.0.0.128")
        );

        let excluded = [net("10.0.0.0/26"), net("10.0.0.64/26")];
        let reserved = set(&["10.0.0.128"]);
        assert_eq!(
            next_available_excluding(&n, &reserved, &excluded).unwrap(),
            ip("10.0.0.129")
        );
    }

    #[test]
    fn test_excluded_ipv6_halves() {
        let n = net("2001:db8::/32");
        let excluded = [net("2001:db8::/33")];
        assert_eq!(
            next_available_excluding(&n, &BTreeSet::new(), &excluded).unwrap(),
            ip("2001:db8:8000::")
        );
    }

    #[test]
    fn test_foreign_reservations_are_ignored() {
        let n = net("10.0.0.0/30");
        let reserved = set(&["10.0.1.1", "2001:db8::1"]);
        assert_eq!(next_available(&n, &reserved).unwrap(), ip("10.0.0.1"));
    }

    #[test]
    fn test_reserve_checks_range_before_uniqueness() {
        let n = net("10.0.0.0/24");
        let mut reserved = set(&["10.0.0.0"]);
        assert!(matches!(
            reserve(&n, ip("10.0.0.0"), &mut reserved),
            Err(IpamError::AddressOutOfRange { .. })
        ));
        assert!(matches!(
            reserve(&n, ip("10.0.0.255"), &mut reserved),
            Err(IpamError::AddressOutOfRange { .. })
        ));
        assert!(matches!(
            reserve(&n, ip("2001:db8::1"), &mut reserved),
            Err(IpamError::AddressOutOfRange { .. })
        ));

        reserve(&n, ip("10.0.0.10"), &mut reserved).unwrap();
        assert!(matches!(
            reserve(&n, ip("10.0.0.10"), &mut reserved),
            Err(IpamError::AddressAlreadyReserved { .. })
        ));
    }

    #[test]
    fn test_allocate_until_exhausted() {
        for cidr in ["10.0.0.0/29", "10.0.0.0/30", "10.0.0.0/31", "10.0.0.0/32", "2001:db8::/125"] {
            let n = net(cidr);
            let usable = n.usable_count().as_u128().unwrap();
            let mut reserved = BTreeSet::new();

            for _ in 0..usable {
                let next = next_available(&n, &reserved).unwrap();
                assert!(n.is_usable(next));
                assert!(!reserved.contains(&next));
                reserve(&n, next, &mut reserved).unwrap();
            }

            assert_eq!(reserved.len() as u128, usable);
            assert!(matches!(
                next_available(&n, &reserved),
                Err(IpamError::SubnetExhausted(_))
            ));
        }
    }
}
