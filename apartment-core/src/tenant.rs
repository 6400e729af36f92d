//! Tenant identifiers, tenant resolution and tenant validation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Header the default resolver reads the tenant from.
pub const DEFAULT_TENANT_HEADER: &str = "tenant-id";

/// Longest tenant name accepted by [`TenantPolicy`].
pub const MAX_TENANT_LEN: usize = 64;

/// A logical tenant, mapped 1:1 onto a database or schema.
///
/// The empty string is never a tenant, so a `Tenant` can only be built
/// through [`Tenant::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tenant(String);

impl Tenant {
    /// Returns `None` for the empty string.
    pub fn new<S: Into<String>>(name: S) -> Option<Self> {
        let name = name.into();
        if name.is_empty() {
            None
        } else {
            Some(Self(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Tenant {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Read-only view of the per-request metadata a tenant is resolved from.
///
/// Implemented for plain string maps here; transports implement it for
/// their own header types.
pub trait RequestMetadata {
    fn get(&self, name: &str) -> Option<&str>;
}

impl RequestMetadata for HashMap<String, String> {
    fn get(&self, name: &str) -> Option<&str> {
        HashMap::get(self, name).map(String::as_str)
    }
}

impl RequestMetadata for BTreeMap<String, String> {
    fn get(&self, name: &str) -> Option<&str> {
        BTreeMap::get(self, name).map(String::as_str)
    }
}

impl RequestMetadata for Vec<(String, String)> {
    fn get(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Pulls the tenant out of request metadata.
///
/// A missing tenant is `None`, not an error: anonymous or misconfigured
/// callers are an expected condition. Implementations hold no state and do
/// no I/O.
pub trait TenantResolver: Send + Sync {
    fn resolve(&self, metadata: &dyn RequestMetadata) -> Option<Tenant>;
}

/// Resolves the tenant from a single named field (a header, usually).
#[derive(Debug, Clone)]
pub struct HeaderTenantResolver {
    header: String,
}

impl HeaderTenantResolver {
    pub fn new<S: Into<String>>(header: S) -> Self {
        Self {
            header: header.into(),
        }
    }

    pub fn header(&self) -> &str {
        &self.header
    }
}

impl Default for HeaderTenantResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TENANT_HEADER)
    }
}

impl TenantResolver for HeaderTenantResolver {
    fn resolve(&self, metadata: &dyn RequestMetadata) -> Option<Tenant> {
        metadata.get(&self.header).and_then(Tenant::new)
    }
}

/// Why a resolved tenant was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantRejection {
    TooLong,
    InvalidCharacter(char),
    LeadingHyphen,
    NotAllowed,
}

impl fmt::Display for TenantRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantRejection::TooLong => {
                write!(f, "tenant name longer than {MAX_TENANT_LEN} characters")
            }
            TenantRejection::InvalidCharacter(c) => write!(f, "invalid character {c:?} in tenant name"),
            TenantRejection::LeadingHyphen => f.write_str("tenant name starts with '-'"),
            TenantRejection::NotAllowed => f.write_str("tenant is not in the allow-list"),
        }
    }
}

/// Gate every tenant passes before it is interpolated into a schema switch.
///
/// Names are limited to `[A-Za-z0-9_-]`, at most [`MAX_TENANT_LEN`] long, and
/// must not start with `-`. With an allow-list configured, only listed
/// tenants pass.
#[derive(Debug, Clone, Default)]
pub struct TenantPolicy {
    allowed: Option<HashSet<String>>,
}

impl TenantPolicy {
    /// Charset rules only.
    pub fn permissive() -> Self {
        Self::default()
    }

    pub fn allow_list<I, S>(tenants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: Some(tenants.into_iter().map(Into::into).collect()),
        }
    }

    pub fn is_restricted(&self) -> bool {
        self.allowed.is_some()
    }

    pub fn check(&self, tenant: &Tenant) -> Result<(), TenantRejection> {
        let name = tenant.as_str();
        if name.chars().count() > MAX_TENANT_LEN {
            return Err(TenantRejection::TooLong);
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(TenantRejection::InvalidCharacter(c));
        }
        if name.starts_with('-') {
            return Err(TenantRejection::LeadingHyphen);
        }
        match &self.allowed {
            Some(allowed) if !allowed.contains(name) => Err(TenantRejection::NotAllowed),
            _ => Ok(()),
        }
    }
}
