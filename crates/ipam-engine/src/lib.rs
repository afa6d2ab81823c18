//! IPAM allocation engine
//!
//! Organizations own subnets; addresses are reserved from them. This crate
//! holds the parts that must be right:
//!
//! - [`allocator`]: next-free scan and explicit reservation checks
//! - [`hierarchy`]: nesting, placement validation, most-specific subnet
//! - [`tenant`]: the authorization predicate every call passes through
//! - [`Ipam`]: the async service tying them to a [`Store`](ipam_store::Store)
//!   with per-subnet serialization of reservations
//! - bulk import/export of subnet documents ([`Ipam::import_document`],
//!   [`Ipam::export_subnet`])
//!
//! # Examples
//!
//! ```
//! use ipam_core::{Caller, OrgId};
//! use ipam_engine::Ipam;
//! use ipam_store::MemoryStore;
//!
//! # #[tokio::main]
//! # async fn main() -> ipam_core::Result<()> {
//! let ipam = Ipam::new(MemoryStore::new());
//! let caller = Caller::member_of(["org_a"]);
//!
//! let doc = b"Sample Subnet\n10.0.0.0/24\nip address,description\n10.0.0.1,Testing\n";
//! let report = ipam.import_document(&caller, Some(OrgId::from("org_a")), doc).await?;
//! assert_eq!(report.created, 1);
//!
//! let next = ipam.next_available(&caller, report.subnet.id).await?;
//! assert_eq!(next.to_string(), "10.0.0.2");
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod hierarchy;
mod import;
mod locks;
mod service;
pub mod tenant;

pub use import::ImportReport;
pub use service::{HostEntry, Ipam, SubnetUpdate, Usage, MAX_HOSTS_PAGE};
