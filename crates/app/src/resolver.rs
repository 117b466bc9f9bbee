use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use metrics::counter;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error};

use tenancy_core::{normalize_hostname, PartitionHandle, TenantIdentifier};
use tenancy_storage::{Database, DomainError, TenantError};

use crate::problem::ProblemResponse;
use crate::router::AppState;

/// Maps inbound hostnames to tenant partitions.
///
/// Successful lookups are kept in an append-only routing table. Hostnames
/// are never reassigned between tenants, so cached routes do not go stale.
/// Misses are not cached because a later signup may claim the hostname.
#[derive(Clone)]
pub struct TenantResolver {
    database: Database,
    public_hosts: Arc<HashSet<String>>,
    routes: Arc<RwLock<HashMap<String, PartitionHandle>>>,
}

impl TenantResolver {
    pub fn new<I, S>(database: Database, public_hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let public_hosts = public_hosts
            .into_iter()
            .filter_map(|host| normalize_hostname(host.as_ref()))
            .collect();
        Self {
            database,
            public_hosts: Arc::new(public_hosts),
            routes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the partition that serves `hostname`.
    ///
    /// Configured public hosts route to the `public` tenant. Every other
    /// hostname must be registered in the domain registry.
    pub async fn resolve(&self, hostname: &str) -> Result<PartitionHandle, ResolveError> {
        let host = normalize_hostname(hostname).ok_or(ResolveError::InvalidHost)?;

        if let Some(handle) = self.routes.read().await.get(&host) {
            counter!("tenant_resolve_total", "result" => "cached").increment(1);
            return Ok(handle.clone());
        }

        let result = self.lookup(&host).await;
        match &result {
            Ok(handle) => {
                counter!("tenant_resolve_total", "result" => "resolved").increment(1);
                self.remember(&host, handle).await;
            }
            Err(ResolveError::NotFound) => {
                counter!("tenant_resolve_total", "result" => "not_found").increment(1);
                debug!(stage = "resolver", %host, "no tenant for host");
            }
            Err(err) => {
                counter!("tenant_resolve_total", "result" => "error").increment(1);
                error!(stage = "resolver", %host, error = %err, "tenant lookup failed");
            }
        }
        result
    }

    async fn lookup(&self, host: &str) -> Result<PartitionHandle, ResolveError> {
        let tenant = if self.public_hosts.contains(host) {
            TenantIdentifier::public()
        } else {
            match self.database.domains().resolve(host).await {
                Ok(tenant) => tenant,
                Err(DomainError::NotFound) => return Err(ResolveError::NotFound),
                Err(err) => return Err(ResolveError::Domain(err)),
            }
        };

        match self.database.tenants().get(tenant.as_str()).await {
            Ok(tenant) => Ok(tenant.partition),
            Err(TenantError::NotFound) => Err(ResolveError::NotFound),
            Err(err) => Err(ResolveError::Tenant(err)),
        }
    }

    /// Records a route known to be committed.
    pub async fn remember(&self, hostname: &str, handle: &PartitionHandle) {
        if let Some(host) = normalize_hostname(hostname) {
            self.routes.write().await.insert(host, handle.clone());
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no tenant is registered for this host")]
    NotFound,
    #[error("host header is not a valid hostname")]
    InvalidHost,
    #[error("domain lookup failed: {0}")]
    Domain(DomainError),
    #[error("tenant lookup failed: {0}")]
    Tenant(TenantError),
}

/// Partition of the tenant addressed by the request's `Host` header.
#[derive(Debug, Clone)]
pub struct TenantPartition(pub PartitionHandle);

#[async_trait]
impl FromRequestParts<AppState> for TenantPartition {
    type Rejection = ProblemResponse;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|authority| authority.to_string()))
            .ok_or_else(|| ProblemResponse::bad_request("missing_host", "request has no host"))?;

        state
            .resolver()
            .resolve(&host)
            .await
            .map(TenantPartition)
            .map_err(|err| {
                let problem = match err {
                    ResolveError::NotFound => ProblemResponse::not_found(
                        "tenant_not_found",
                        "no tenant is registered for this host",
                    ),
                    ResolveError::InvalidHost => {
                        ProblemResponse::bad_request("invalid_host", "host header is not a valid hostname")
                    }
                    ResolveError::Domain(_) | ResolveError::Tenant(_) => {
                        ProblemResponse::internal("tenant_lookup_failed")
                    }
                };
                problem.with_host(host)
            })
    }
}
