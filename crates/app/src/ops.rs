use chrono::Utc;
use thiserror::Error;
use tracing::info;

use tenancy_core::{
    normalize_hostname, Domain, IdentifierError, IdentifierPolicy, Tenant, TenantIdentifier,
};
use tenancy_storage::{Database, DomainError, NewDomain, TenantError};

use crate::provisioning::{ProvisionedTenant, ProvisioningError, TenantProvisioner};

pub const PUBLIC_DISPLAY_NAME: &str = "Public Tenant";

/// Operator actions run from the command line against the registry.
pub struct Operator {
    database: Database,
    provisioner: TenantProvisioner,
}

pub enum CreatePublicOutcome {
    Created(ProvisionedTenant),
    AlreadyExists(Tenant),
}

/// Tenant with every hostname routed to it, primary first.
pub struct TenantListing {
    pub tenant: Tenant,
    pub domains: Vec<Domain>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct DevDomain {
    pub hostname: String,
    pub added: bool,
}

impl Operator {
    pub fn new(database: Database, provisioner: TenantProvisioner) -> Self {
        Self {
            database,
            provisioner,
        }
    }

    /// Creates the bootstrap tenant that serves non-customer hosts.
    pub async fn create_public(&self, hostname: &str) -> Result<CreatePublicOutcome, OpsError> {
        let public = TenantIdentifier::public();
        if let Some(existing) = self.find_tenant(&public).await? {
            return Ok(CreatePublicOutcome::AlreadyExists(existing));
        }

        let hostname = parse_hostname(hostname)?;
        match self
            .provisioner
            .provision(&public, PUBLIC_DISPLAY_NAME, &hostname)
            .await
        {
            Ok(created) => {
                info!(stage = "ops", %hostname, "public tenant created");
                Ok(CreatePublicOutcome::Created(created))
            }
            Err(ProvisioningError::IdentifierTaken(_)) => {
                let existing = self.database.tenants().get(public.as_str()).await?;
                Ok(CreatePublicOutcome::AlreadyExists(existing))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Provisions a tenant on an explicit primary hostname.
    ///
    /// Reserved identifiers are allowed here.
    pub async fn create_tenant(
        &self,
        identifier: &str,
        display_name: &str,
        hostname: &str,
    ) -> Result<ProvisionedTenant, OpsError> {
        let identifier = IdentifierPolicy::operator().check(identifier)?;
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(OpsError::EmptyDisplayName);
        }
        let hostname = parse_hostname(hostname)?;

        let created = self
            .provisioner
            .provision(&identifier, display_name, &hostname)
            .await?;
        info!(stage = "ops", tenant = %identifier, %hostname, "tenant created");
        Ok(created)
    }

    pub async fn list_tenants(&self) -> Result<Vec<TenantListing>, OpsError> {
        let tenants = self.database.tenants().list().await?;
        let mut listings = Vec::with_capacity(tenants.len());
        for tenant in tenants {
            let domains = self
                .database
                .domains()
                .list_by_tenant(&tenant.identifier)
                .await?;
            listings.push(TenantListing { tenant, domains });
        }
        Ok(listings)
    }

    /// Routes the usual local development hosts to the public tenant.
    ///
    /// Hostnames that are already registered are left untouched.
    pub async fn add_dev_domains(&self, port: u16) -> Result<Vec<DevDomain>, OpsError> {
        let public = TenantIdentifier::public();
        if self.find_tenant(&public).await?.is_none() {
            return Err(OpsError::PublicMissing);
        }

        let candidates = [
            format!("127.0.0.1:{port}"),
            format!("localhost:{port}"),
            "127.0.0.1".to_string(),
        ];

        let domains = self.database.domains();
        let mut report = Vec::with_capacity(candidates.len());
        for hostname in candidates {
            let added = if domains.exists(&hostname).await? {
                false
            } else {
                match domains
                    .create(&NewDomain {
                        hostname: &hostname,
                        tenant: &public,
                        is_primary: false,
                        created_at: Utc::now(),
                    })
                    .await
                {
                    Ok(_) => true,
                    Err(DomainError::Conflict(_)) => false,
                    Err(err) => return Err(err.into()),
                }
            };
            if added {
                info!(stage = "ops", %hostname, "development domain added");
            }
            report.push(DevDomain { hostname, added });
        }
        Ok(report)
    }

    /// Registers an additional hostname, optionally making it the primary one.
    pub async fn add_domain(
        &self,
        identifier: &str,
        hostname: &str,
        primary: bool,
    ) -> Result<Domain, OpsError> {
        let identifier = IdentifierPolicy::operator().check(identifier)?;
        if self.find_tenant(&identifier).await?.is_none() {
            return Err(OpsError::UnknownTenant(identifier.to_string()));
        }
        let hostname = parse_hostname(hostname)?;

        let domains = self.database.domains();
        let new_domain = NewDomain {
            hostname: &hostname,
            tenant: &identifier,
            is_primary: primary,
            created_at: Utc::now(),
        };
        let domain = if primary {
            domains.create_primary(&new_domain).await?
        } else {
            domains.create(&new_domain).await?
        };

        info!(stage = "ops", tenant = %identifier, %hostname, primary, "domain added");
        Ok(domain)
    }

    async fn find_tenant(&self, identifier: &TenantIdentifier) -> Result<Option<Tenant>, OpsError> {
        match self.database.tenants().get(identifier.as_str()).await {
            Ok(tenant) => Ok(Some(tenant)),
            Err(TenantError::NotFound) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn parse_hostname(raw: &str) -> Result<String, OpsError> {
    normalize_hostname(raw).ok_or_else(|| OpsError::InvalidHostname(raw.to_string()))
}

#[derive(Debug, Error)]
pub enum OpsError {
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(#[from] IdentifierError),
    #[error("'{0}' is not a valid hostname")]
    InvalidHostname(String),
    #[error("display name must not be empty")]
    EmptyDisplayName,
    #[error("public tenant not found, run create-public first")]
    PublicMissing,
    #[error("tenant '{0}' does not exist")]
    UnknownTenant(String),
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
    #[error(transparent)]
    Tenant(#[from] TenantError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}
