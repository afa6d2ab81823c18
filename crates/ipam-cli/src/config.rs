//! Runtime configuration
//!
//! Resolved once from the environment and the global flags; flags win.

use anyhow::{Context, Result};
use ipam_core::tenant::{ORGANIZATIONS_ENV, SUPERUSER_ENV};
use ipam_core::Caller;
use std::env;
use std::path::PathBuf;

/// Snapshot file (or RocksDB directory)
pub const DB_ENV: &str = "IPAM_DB";
/// Log filter, `RUST_LOG` syntax
pub const LOG_ENV: &str = "IPAM_LOG";
pub const DEFAULT_DB: &str = "ipam.json";

/// Global flags as parsed by clap
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub db: Option<PathBuf>,
    pub organizations: Vec<String>,
    pub superuser: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db: PathBuf,
    pub caller: Caller,
}

impl Config {
    /// Resolve from the process environment
    pub fn resolve(overrides: &Overrides) -> Result<Self> {
        Self::from_sources(overrides, |key| env::var(key).ok())
    }

    /// Resolve with an explicit environment lookup
    pub fn from_sources<F>(overrides: &Overrides, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let db = overrides
            .db
            .clone()
            .or_else(|| lookup(DB_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB));

        let organizations = if overrides.organizations.is_empty() {
            lookup(ORGANIZATIONS_ENV)
        } else {
            Some(overrides.organizations.join(","))
        };

        let mut caller = Caller::from_values(
            organizations.as_deref(),
            lookup(SUPERUSER_ENV).as_deref(),
        )
        .context("Failed to resolve caller identity")?;
        if overrides.superuser {
            caller = caller.with_superuser(true);
        }

        Ok(Self { db, caller })
    }
}
