//! CIDR networks for IPv4 and IPv6
//!
//! Provides the address-space arithmetic the allocator builds on:
//! - Parse CIDR notation (e.g., "192.168.0.0/24", "2001:db8::/64")
//! - Containment and overlap tests between networks and addresses
//! - Usable host ranges (IPv4 excludes network/broadcast below /31)
//! - Lazy host iteration that never materializes a range
//! - Overflow-safe range sizes (an IPv6 /0 holds 2^128 addresses)
//!
//! Addresses of both families are held as `u128` internally; IPv4 values
//! occupy the low 32 bits.
//!
//! # Examples
//!
//! ```
//! use ipam_cidr::Network;
//! use std::net::IpAddr;
//!
//! let net = Network::parse("192.168.1.0/24").unwrap();
//! assert_eq!(net.prefix_len(), 24);
//! assert!(net.contains("192.168.1.1".parse::<IpAddr>().unwrap()));
//! assert!(!net.contains("192.168.0.1".parse::<IpAddr>().unwrap()));
//! assert_eq!(net.first_usable().to_string(), "192.168.1.1");
//! ```

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use thiserror::Error;

/// CIDR errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CidrError {
    /// Invalid CIDR notation
    #[error("Invalid CIDR notation: {0}")]
    InvalidNotation(String),

    /// Invalid IP address
    #[error("Invalid IP address: {0}")]
    InvalidIpAddress(String),

    /// Prefix length outside the family's range
    #[error("Invalid prefix length: /{prefix_len} (must be 0-{max})")]
    InvalidPrefixLength { prefix_len: u8, max: u8 },
}

pub type Result<T> = std::result::Result<T, CidrError>;

/// 2^128, the size of the whole IPv6 space
const FULL_V6_SPACE: &str = "340282366920938463463374607431768211456";

/// Address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Family of an address
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// Address width in bits
    pub fn bits(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    /// Largest address value of this family
    fn max_value(self) -> u128 {
        match self {
            Family::V4 => u32::MAX as u128,
            Family::V6 => u128::MAX,
        }
    }

    /// Build an address of this family from its numeric value
    pub fn addr(self, bits: u128) -> IpAddr {
        match self {
            Family::V4 => IpAddr::V4(Ipv4Addr::from(bits as u32)),
            Family::V6 => IpAddr::V6(Ipv6Addr::from(bits)),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "IPv4"),
            Family::V6 => write!(f, "IPv6"),
        }
    }
}

/// Numeric value of an address
pub fn ip_to_bits(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Number of addresses in a range
///
/// Every range below 2^128 is exact; `Full` is the single value that does
/// not fit a `u128` (the whole IPv6 space).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressCount {
    Exact(u128),
    Full,
}

impl AddressCount {
    /// Value as `u128`, `None` for the full IPv6 space
    pub fn as_u128(&self) -> Option<u128> {
        match self {
            AddressCount::Exact(n) => Some(*n),
            AddressCount::Full => None,
        }
    }

    /// Subtract, clamping at zero
    pub fn saturating_sub(self, n: u128) -> Self {
        match self {
            AddressCount::Exact(v) => AddressCount::Exact(v.saturating_sub(n)),
            AddressCount::Full if n == 0 => AddressCount::Full,
            AddressCount::Full => AddressCount::Exact(u128::MAX - (n - 1)),
        }
    }
}

impl fmt::Display for AddressCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressCount::Exact(n) => write!(f, "{}", n),
            AddressCount::Full => f.write_str(FULL_V6_SPACE),
        }
    }
}

// Serialized as a decimal string: JSON consumers cannot hold 2^128.
impl Serialize for AddressCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// CIDR block of either family
///
/// Always normalized: host bits of the network address are zero. Ordering
/// is family, then network address, then prefix length, so a supernet
/// sorts before the subnets that share its first address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Network {
    family: Family,
    /// Network address (host bits cleared)
    network: u128,
    /// Prefix length (0-32 or 0-128)
    prefix_len: u8,
}

impl Network {
    /// Parse CIDR notation string
    ///
    /// Host bits are cleared, so "172.16.0.1/16" parses as "172.16.0.0/16".
    /// IPv6 networks written with an embedded dotted quad are rejected as
    /// mixed-family notation.
    ///
    /// # Examples
    ///
    /// ```
    /// use ipam_cidr::Network;
    ///
    /// let net = Network::parse("10.0.0.0/8").unwrap();
    /// assert_eq!(net.prefix_len(), 8);
    /// assert_eq!(Network::parse("2001:db8::1/32").unwrap().to_string(), "2001:db8::/32");
    /// ```
    pub fn parse(cidr: &str) -> Result<Self> {
        let cidr = cidr.trim();
        let (ip_str, prefix_str) = cidr.split_once('/').ok_or_else(|| {
            CidrError::InvalidNotation(format!("{}: expected address/prefix", cidr))
        })?;

        if prefix_str.is_empty() || !prefix_str.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CidrError::InvalidNotation(format!(
                "Invalid prefix: {}",
                prefix_str
            )));
        }
        let prefix_len: u8 = prefix_str
            .parse()
            .map_err(|_| CidrError::InvalidNotation(format!("Invalid prefix: {}", prefix_str)))?;

        let ip: IpAddr = ip_str
            .parse()
            .map_err(|_| CidrError::InvalidIpAddress(ip_str.to_string()))?;

        if ip.is_ipv6() && ip_str.contains('.') {
            return Err(CidrError::InvalidNotation(format!(
                "{}: mixed IPv4/IPv6 notation",
                cidr
            )));
        }

        Self::new(ip, prefix_len)
    }

    /// Create a network from any address inside it and a prefix length
    pub fn new(ip: IpAddr, prefix_len: u8) -> Result<Self> {
        let family = Family::of(&ip);
        if prefix_len > family.bits() {
            return Err(CidrError::InvalidPrefixLength {
                prefix_len,
                max: family.bits(),
            });
        }

        let mut net = Self {
            family,
            network: 0,
            prefix_len,
        };
        net.network = ip_to_bits(ip) & net.mask_bits();
        Ok(net)
    }

    /// Single-address network (/32 or /128)
    pub fn host(ip: IpAddr) -> Self {
        let family = Family::of(&ip);
        Self {
            family,
            network: ip_to_bits(ip),
            prefix_len: family.bits(),
        }
    }

    /// Address family
    pub fn family(&self) -> Family {
        self.family
    }

    /// Get prefix length
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Number of host bits
    pub fn host_len(&self) -> u8 {
        self.family.bits() - self.prefix_len
    }

    fn host_mask_bits(&self) -> u128 {
        match self.host_len() {
            0 => 0,
            128 => u128::MAX,
            n => (1u128 << n) - 1,
        }
    }

    fn mask_bits(&self) -> u128 {
        self.family.max_value() & !self.host_mask_bits()
    }

    /// Network address
    pub fn network(&self) -> IpAddr {
        self.family.addr(self.network)
    }

    /// Network mask
    pub fn mask(&self) -> IpAddr {
        self.family.addr(self.mask_bits())
    }

    /// Last address of the range (the broadcast address for IPv4)
    pub fn broadcast(&self) -> IpAddr {
        self.family.addr(self.bounds().1)
    }

    /// First and last address of the whole range, as numbers
    pub fn bounds(&self) -> (u128, u128) {
        (self.network, self.network | self.host_mask_bits())
    }

    /// Whether the network and broadcast addresses are withheld from use
    ///
    /// Only IPv4 prefixes shorter than /31 withhold them; /31, /32 and all
    /// of IPv6 use every address.
    pub fn excludes_edges(&self) -> bool {
        self.family == Family::V4 && self.prefix_len < 31
    }

    /// First and last usable host, as numbers
    pub fn usable_bounds(&self) -> (u128, u128) {
        let (first, last) = self.bounds();
        if self.excludes_edges() {
            (first + 1, last - 1)
        } else {
            (first, last)
        }
    }

    /// Get first usable IP
    pub fn first_usable(&self) -> IpAddr {
        self.family.addr(self.usable_bounds().0)
    }

    /// Get last usable IP
    pub fn last_usable(&self) -> IpAddr {
        self.family.addr(self.usable_bounds().1)
    }

    /// First and last usable host
    pub fn host_range(&self) -> (IpAddr, IpAddr) {
        (self.first_usable(), self.last_usable())
    }

    /// Total number of addresses in this block
    pub fn size(&self) -> AddressCount {
        match self.host_len() {
            128 => AddressCount::Full,
            n => AddressCount::Exact(1u128 << n),
        }
    }

    /// Number of usable host addresses
    pub fn usable_count(&self) -> AddressCount {
        if self.excludes_edges() {
            self.size().saturating_sub(2)
        } else {
            self.size()
        }
    }

    /// Check if IP address is in this block
    ///
    /// Addresses of the other family are never contained.
    pub fn contains(&self, ip: IpAddr) -> bool {
        Family::of(&ip) == self.family && self.contains_bits(ip_to_bits(ip))
    }

    fn contains_bits(&self, bits: u128) -> bool {
        bits & self.mask_bits() == self.network
    }

    /// Check if IP address is a usable host of this block
    pub fn is_usable(&self, ip: IpAddr) -> bool {
        if !self.contains(ip) {
            return false;
        }
        let (first, last) = self.usable_bounds();
        let bits = ip_to_bits(ip);
        bits >= first && bits <= last
    }

    /// Check if `other` lies entirely within this block (equal blocks included)
    pub fn contains_network(&self, other: &Network) -> bool {
        self.family == other.family
            && other.prefix_len >= self.prefix_len
            && self.contains_bits(other.network)
    }

    /// Check if `other` lies within this block and is smaller
    pub fn strictly_contains(&self, other: &Network) -> bool {
        self.contains_network(other) && other.prefix_len > self.prefix_len
    }

    /// Check if the two blocks share at least one address
    pub fn overlaps(&self, other: &Network) -> bool {
        if self.family != other.family {
            return false;
        }
        let (a_start, a_end) = self.bounds();
        let (b_start, b_end) = other.bounds();
        a_start <= b_end && b_start <= a_end
    }

    /// Lazy iterator over all addresses in this block
    pub fn iter(&self) -> Hosts {
        let (first, last) = self.bounds();
        Hosts::new(self.family, first, last)
    }

    /// Lazy iterator over the usable hosts of this block
    pub fn hosts(&self) -> Hosts {
        self.hosts_from(0)
    }

    /// Lazy iterator over usable hosts, starting `offset` hosts in
    pub fn hosts_from(&self, offset: u128) -> Hosts {
        let (first, last) = self.usable_bounds();
        match first.checked_add(offset) {
            Some(start) if start <= last => Hosts::new(self.family, start, last),
            _ => Hosts::empty(self.family),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix_len)
    }
}

impl FromStr for Network {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self> {
        Network::parse(s)
    }
}

impl TryFrom<String> for Network {
    type Error = CidrError;

    fn try_from(value: String) -> Result<Self> {
        Network::parse(&value)
    }
}

impl From<Network> for String {
    fn from(value: Network) -> Self {
        value.to_string()
    }
}

/// Iterator over a contiguous run of addresses
///
/// Holds only the cursor, so iterating a /64 costs nothing up front.
#[derive(Debug, Clone)]
pub struct Hosts {
    family: Family,
    next: u128,
    end: u128,
    done: bool,
}

impl Hosts {
    fn new(family: Family, start: u128, end: u128) -> Self {
        Self {
            family,
            next: start,
            end,
            done: start > end,
        }
    }

    fn empty(family: Family) -> Self {
        Self {
            family,
            next: 0,
            end: 0,
            done: true,
        }
    }
}

impl Iterator for Hosts {
    type Item = IpAddr;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let current = self.next;
        if current == self.end {
            self.done = true;
        } else {
            self.next += 1;
        }
        Some(self.family.addr(current))
    }
}
