use std::fmt;

use serde::{Deserialize, Serialize};

use crate::limits::MAX_TENANT_TAG_LEN;

/// Business-line tag on bookings and allocations. Tenants share one physical
/// inventory: the tag scopes reporting queries and nothing else, and in
/// particular is never part of any exclusion key.
///
/// Open set — `TECH` and `TRAINING` are the tags in live use, but new lines
/// of business register no schema change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tenant(String);

pub const TENANT_TECH: &str = "TECH";
pub const TENANT_TRAINING: &str = "TRAINING";

impl Tenant {
    /// Validate and normalize a tenant tag: non-empty, bounded, ASCII
    /// alphanumeric/underscore, uppercased.
    pub fn parse(raw: &str) -> Result<Self, TenantError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TenantError::Empty);
        }
        if trimmed.len() > MAX_TENANT_TAG_LEN {
            return Err(TenantError::TooLong(trimmed.len()));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(TenantError::BadChar);
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
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

impl TryFrom<String> for Tenant {
    type Error = TenantError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Tenant::parse(&value)
    }
}

impl From<Tenant> for String {
    fn from(t: Tenant) -> String {
        t.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantError {
    Empty,
    TooLong(usize),
    BadChar,
}

impl fmt::Display for TenantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantError::Empty => write!(f, "tenant tag is empty"),
            TenantError::TooLong(n) => {
                write!(f, "tenant tag is {n} bytes, max {MAX_TENANT_TAG_LEN}")
            }
            TenantError::BadChar => {
                write!(f, "tenant tag may only contain ASCII letters, digits, underscore")
            }
        }
    }
}

impl std::error::Error for TenantError {}

// ── Tenant-scoped reporting ──────────────────────────────────────
//
// The only place tenancy filters anything. Conflict paths upstream operate
// on the shared physical timelines and never look at the tag.

/// Per-tenant usage rollup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSummary {
    pub tenant: Tenant,
    pub bookings_total: usize,
    pub bookings_active: usize,
    pub allocations_active: usize,
}

impl crate::engine::Engine {
    /// Every booking carrying the tag, newest first.
    pub async fn bookings_for_tenant(&self, tenant: &Tenant) -> Vec<crate::model::Booking> {
        let handles: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for handle in handles {
            let b = handle.read().await;
            if &b.tenant == tenant {
                out.push(b.clone());
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    pub async fn tenant_summary(&self, tenant: &Tenant) -> TenantSummary {
        let mut bookings_total = 0;
        let mut bookings_active = 0;
        let handles: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            let b = handle.read().await;
            if &b.tenant != tenant {
                continue;
            }
            bookings_total += 1;
            if !b.status.is_terminal() {
                bookings_active += 1;
            }
        }

        let mut allocations_active = 0;
        for (_, handle) in self.store.snapshot_handles() {
            let rs = handle.read().await;
            allocations_active += rs.allocations.iter().filter(|a| &a.tenant == tenant).count();
        }

        TenantSummary {
            tenant: tenant.clone(),
            bookings_total,
            bookings_active,
            allocations_active,
        }
    }
}
