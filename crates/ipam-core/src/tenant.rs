//! Caller identity
//!
//! The identity resolver outside this system decides who a caller is; this
//! module only carries the answer (organization memberships and superuser
//! standing) and can read it from environment variables for local use.

use crate::OrgId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use thiserror::Error;

/// Comma-separated organization ids the caller belongs to
pub const ORGANIZATIONS_ENV: &str = "IPAM_ORGANIZATIONS";
/// `1`/`true`/`yes` grants superuser standing
pub const SUPERUSER_ENV: &str = "IPAM_SUPERUSER";

/// Identity errors
#[derive(Error, Debug)]
pub enum IdentityError {
    /// Malformed superuser flag
    #[error("Invalid value for IPAM_SUPERUSER: {0}")]
    InvalidFlag(String),
}

/// Authenticated caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    #[serde(default)]
    organizations: BTreeSet<OrgId>,
    #[serde(default)]
    superuser: bool,
}

impl Caller {
    /// Caller with access to every organization
    pub fn superuser() -> Self {
        Self {
            organizations: BTreeSet::new(),
            superuser: true,
        }
    }

    /// Regular caller belonging to the given organizations
    pub fn member_of<I, O>(organizations: I) -> Self
    where
        I: IntoIterator<Item = O>,
        O: Into<OrgId>,
    {
        Self {
            organizations: organizations.into_iter().map(Into::into).collect(),
            superuser: false,
        }
    }

    /// Read the caller from `IPAM_ORGANIZATIONS` and `IPAM_SUPERUSER`
    pub fn from_env() -> Result<Self, IdentityError> {
        Self::from_values(
            env::var(ORGANIZATIONS_ENV).ok().as_deref(),
            env::var(SUPERUSER_ENV).ok().as_deref(),
        )
    }

    /// Build a caller from raw organization list and superuser flag values
    pub fn from_values(
        organizations: Option<&str>,
        superuser: Option<&str>,
    ) -> Result<Self, IdentityError> {
        let organizations = organizations
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|org| !org.is_empty())
            .map(OrgId::from)
            .collect();

        let superuser = match superuser.map(|s| s.trim().to_ascii_lowercase()) {
            None => false,
            Some(flag) => match flag.as_str() {
                "" | "0" | "false" | "no" => false,
                "1" | "true" | "yes" => true,
                _ => return Err(IdentityError::InvalidFlag(flag)),
            },
        };

        Ok(Self {
            organizations,
            superuser,
        })
    }

    /// Grant or drop superuser standing
    pub fn with_superuser(mut self, superuser: bool) -> Self {
        self.superuser = superuser;
        self
    }

    pub fn is_superuser(&self) -> bool {
        self.superuser
    }

    pub fn organizations(&self) -> &BTreeSet<OrgId> {
        &self.organizations
    }

    /// The caller's only organization, if it belongs to exactly one
    ///
    /// Front ends use it when a request names no owner.
    pub fn default_organization(&self) -> Option<OrgId> {
        match self.organizations.len() {
            1 => self.organizations.iter().next().cloned(),
            _ => None,
        }
    }

    /// Check membership in an organization
    pub fn is_member(&self, organization: &OrgId) -> bool {
        self.organizations.contains(organization)
    }

    /// Check access to data owned by `organization`
    ///
    /// Globally shared data (`None`) is reserved to superusers.
    pub fn can_access(&self, organization: Option<&OrgId>) -> bool {
        self.superuser || organization.is_some_and(|org| self.is_member(org))
    }
}
