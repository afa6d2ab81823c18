//! Core types for IPAM (IP Address Management)
//!
//! This crate provides the records and errors shared by every IPAM crate:
//! - [`Subnet`] - a CIDR block owned by an organization
//! - [`IpAddress`] - a single reserved address inside a subnet
//! - [`OrgId`], [`SubnetId`], [`AddressId`] - identifiers
//! - [`Caller`] - the identity every operation is authorized against
//! - [`IpamError`] - error kinds returned to front ends
//!
//! ```
//! use ipam_core::{OrgId, Subnet};
//! use ipam_cidr::Network;
//!
//! let subnet = Subnet::new(
//!     Network::parse("10.0.0.0/24").unwrap(),
//!     "Office",
//!     Some(OrgId::from("org_a")),
//! );
//! assert_eq!(subnet.cidr.to_string(), "10.0.0.0/24");
//! ```

use ipam_cidr::{CidrError, Network};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub mod tenant;

pub use tenant::{Caller, IdentityError};

/// Organization (tenant) identifier
///
/// Opaque to this crate; owned by the external identity system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(pub String);

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrgId {
    fn from(value: &str) -> Self {
        OrgId(value.to_string())
    }
}

impl From<String> for OrgId {
    fn from(value: String) -> Self {
        OrgId(value)
    }
}

/// Subnet identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubnetId(pub Uuid);

impl SubnetId {
    /// Fresh random identifier
    pub fn new() -> Self {
        SubnetId(Uuid::new_v4())
    }
}

impl Default for SubnetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubnetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubnetId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(SubnetId(Uuid::parse_str(s.trim())?))
    }
}

/// IP address record identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressId(pub Uuid);

impl AddressId {
    /// Fresh random identifier
    pub fn new() -> Self {
        AddressId(Uuid::new_v4())
    }
}

impl Default for AddressId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AddressId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AddressId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(AddressId(Uuid::parse_str(s.trim())?))
    }
}

/// A CIDR block owned by an organization
///
/// `organization: None` marks a globally shared subnet. The parent subnet
/// is never stored; it is derived from the organization's other subnets.
/// The CIDR is fixed once the subnet exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: SubnetId,
    pub cidr: Network,
    pub name: String,
    pub organization: Option<OrgId>,
}

impl Subnet {
    /// Create a subnet record with a fresh id
    pub fn new(cidr: Network, name: impl Into<String>, organization: Option<OrgId>) -> Self {
        Self {
            id: SubnetId::new(),
            cidr,
            name: name.into(),
            organization,
        }
    }
}

/// A reserved address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    pub id: AddressId,
    /// Owning subnet (the most specific one containing the address)
    pub subnet: SubnetId,
    #[serde(rename = "ip_address")]
    pub address: IpAddr,
    pub description: Option<String>,
}

impl IpAddress {
    /// Create an address record with a fresh id
    ///
    /// Blank descriptions are stored as `None`.
    pub fn new(subnet: SubnetId, address: IpAddr, description: Option<String>) -> Self {
        Self {
            id: AddressId::new(),
            subnet,
            address,
            description: normalize_description(description),
        }
    }
}

/// Trim a description, mapping blank to `None`
pub fn normalize_description(description: Option<String>) -> Option<String> {
    description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
}

/// Error types for IPAM operations
#[derive(Error, Debug, Clone)]
pub enum IpamError {
    /// CIDR string did not parse to a valid network
    #[error("Invalid CIDR: {0}")]
    InvalidCidr(#[from] CidrError),

    /// Subnet would partially overlap (or duplicate) another of its organization
    #[error("Overlap conflict: {0}")]
    OverlapConflict(String),

    /// Address is not a usable host of the subnet
    #[error("Address {address} is outside the usable range of {subnet}")]
    AddressOutOfRange { address: IpAddr, subnet: Network },

    /// Address already reserved in the subnet
    #[error("Address {address} is already reserved in {subnet}")]
    AddressAlreadyReserved { address: IpAddr, subnet: Network },

    /// No free usable address left
    #[error("Subnet {0} has no available addresses")]
    SubnetExhausted(Network),

    /// No subnet of the organization contains the address
    #[error("No subnet contains {0}")]
    NoContainingSubnet(IpAddr),

    /// Two identical subnets both claim the address
    #[error("Address {address} is claimed by more than one {cidr} subnet")]
    AmbiguousSubnet { address: IpAddr, cidr: Network },

    /// Address is owned by a nested subnet rather than the requested one
    #[error("Address {address} belongs to the more specific subnet {subnet}")]
    DeeperSubnet { address: IpAddr, subnet: Network },

    /// Malformed import document
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Import row or declaration fails allocation rules
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Caller may not access the resource
    #[error("Forbidden")]
    Forbidden,

    /// Subnet does not exist
    #[error("Subnet not found: {0}")]
    SubnetNotFound(SubnetId),

    /// Address record does not exist
    #[error("Address not found: {0}")]
    AddressNotFound(AddressId),

    /// Subnet still holds addresses and deletion was not cascading
    #[error("Subnet {subnet} still holds {addresses} addresses")]
    SubnetNotEmpty { subnet: SubnetId, addresses: usize },

    /// Reservation store failure
    #[error("Storage error: {0}")]
    Storage(String),
}

impl IpamError {
    /// Stable machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            IpamError::InvalidCidr(_) => "invalid_cidr",
            IpamError::OverlapConflict(_) => "overlap_conflict",
            IpamError::AddressOutOfRange { .. } => "address_out_of_range",
            IpamError::AddressAlreadyReserved { .. } => "address_already_reserved",
            IpamError::SubnetExhausted(_) => "subnet_exhausted",
            IpamError::NoContainingSubnet(_) => "no_containing_subnet",
            IpamError::AmbiguousSubnet { .. } => "ambiguous_subnet",
            IpamError::DeeperSubnet { .. } => "deeper_subnet",
            IpamError::ParseError(_) => "parse_error",
            IpamError::ValidationError(_) => "validation_error",
            IpamError::Forbidden => "forbidden",
            IpamError::SubnetNotFound(_) => "subnet_not_found",
            IpamError::AddressNotFound(_) => "address_not_found",
            IpamError::SubnetNotEmpty { .. } => "subnet_not_empty",
            IpamError::Storage(_) => "storage",
        }
    }
}

/// Result type alias for IPAM operations
pub type Result<T> = std::result::Result<T, IpamError>;
