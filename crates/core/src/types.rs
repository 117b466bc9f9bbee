use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::identifier::TenantIdentifier;

/// Reference to the isolated data store of one tenant.
///
/// Handles are created once by the partition provisioner and passed
/// explicitly to every component that needs tenant data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PartitionHandle {
    tenant: TenantIdentifier,
    location: String,
}

impl PartitionHandle {
    pub fn new(tenant: TenantIdentifier, location: impl Into<String>) -> Self {
        Self {
            tenant,
            location: location.into(),
        }
    }

    pub fn tenant(&self) -> &TenantIdentifier {
        &self.tenant
    }

    /// Storage specific location, e.g. the partition database path.
    pub fn location(&self) -> &str {
        &self.location
    }
}

/// A fully provisioned tenant workspace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tenant {
    pub identifier: TenantIdentifier,
    pub display_name: String,
    pub partition: PartitionHandle,
    pub created_at: DateTime<Utc>,
}

/// Hostname routed to a tenant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Domain {
    pub id: String,
    pub hostname: String,
    pub tenant: TenantIdentifier,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

/// Canonical form used to store and look up hostnames.
///
/// Surrounding whitespace and a trailing root dot are dropped and ASCII is
/// lowercased. The port, when present, is kept because hostnames are unique
/// including their port. Returns `None` for values that cannot be hosts.
pub fn normalize_hostname(raw: &str) -> Option<String> {
    let value = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    if value.is_empty() || value.starts_with('.') || value.starts_with(':') {
        return None;
    }
    if value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '/' | '\\' | '@' | '?' | '#'))
    {
        return None;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_hostnames() {
        assert_eq!(
            normalize_hostname("  Acme.Example.COM. ").as_deref(),
            Some("acme.example.com")
        );
        assert_eq!(
            normalize_hostname("localhost:8000").as_deref(),
            Some("localhost:8000")
        );
        assert_eq!(normalize_hostname("127.0.0.1").as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn rejects_non_hosts() {
        for raw in ["", "  ", ".", ".example.com", ":8080", "a b.com", "http://acme.com", "user@acme.com"] {
            assert_eq!(normalize_hostname(raw), None, "{raw:?} must be rejected");
        }
    }

    #[test]
    fn partition_handle_serializes_tenant_and_location() {
        let handle = PartitionHandle::new(
            TenantIdentifier::parse("acme").unwrap(),
            "/data/partitions/acme.sqlite",
        );
        let json = serde_json::to_value(&handle).unwrap();
        assert_eq!(json["tenant"], "acme");
        assert_eq!(json["location"], "/data/partitions/acme.sqlite");
    }
}
