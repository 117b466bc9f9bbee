use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use uuid::Uuid;

use tenancy_core::{Domain, TenantIdentifier};

use crate::{to_rfc3339, violation, Violation};

/// Repository mapping hostnames to tenants.
#[derive(Clone)]
pub struct DomainRepository {
    pool: SqlitePool,
}

/// Data required to register a hostname. `hostname` must already be normalized.
pub struct NewDomain<'a> {
    pub hostname: &'a str,
    pub tenant: &'a TenantIdentifier,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

impl DomainRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Registers a hostname inside an existing transaction.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        domain: &NewDomain<'_>,
    ) -> Result<Domain, DomainError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO domains (id, hostname, tenant_identifier, is_primary, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(domain.hostname)
        .bind(domain.tenant.as_str())
        .bind(domain.is_primary)
        .bind(to_rfc3339(domain.created_at))
        .execute(&mut **tx)
        .await
        .map_err(|err| match violation(&err) {
            Some(Violation::Unique(message)) if message.contains("domains.tenant_identifier") => {
                DomainError::PrimaryExists(domain.tenant.to_string())
            }
            Some(Violation::Unique(_)) => DomainError::Conflict(domain.hostname.to_string()),
            Some(Violation::ForeignKey) => DomainError::UnknownTenant(domain.tenant.to_string()),
            None => DomainError::Database(err),
        })?;

        Ok(Domain {
            id,
            hostname: domain.hostname.to_string(),
            tenant: domain.tenant.clone(),
            is_primary: domain.is_primary,
            created_at: domain.created_at,
        })
    }

    /// Registers a hostname in its own transaction.
    pub async fn create(&self, domain: &NewDomain<'_>) -> Result<Domain, DomainError> {
        let mut tx = self.pool.begin().await?;
        let created = self.insert(&mut tx, domain).await?;
        tx.commit().await?;
        Ok(created)
    }

    /// Registers `hostname` as the tenant's primary domain, demoting the
    /// current primary in the same transaction.
    pub async fn create_primary(&self, domain: &NewDomain<'_>) -> Result<Domain, DomainError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE domains SET is_primary = 0 \
             WHERE tenant_identifier = ? AND is_primary = 1",
        )
        .bind(domain.tenant.as_str())
        .execute(&mut *tx)
        .await?;

        let created = self
            .insert(
                &mut tx,
                &NewDomain {
                    is_primary: true,
                    ..*domain
                },
            )
            .await?;
        tx.commit().await?;
        Ok(created)
    }

    /// Returns the tenant owning `hostname`.
    pub async fn resolve(&self, hostname: &str) -> Result<TenantIdentifier, DomainError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT tenant_identifier FROM domains WHERE hostname = ?")
                .bind(hostname)
                .fetch_optional(&self.pool)
                .await?;

        let (identifier,) = row.ok_or(DomainError::NotFound)?;
        TenantIdentifier::parse(&identifier).map_err(|_| DomainError::Corrupt(identifier))
    }

    pub async fn exists(&self, hostname: &str) -> Result<bool, DomainError> {
        let found: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM domains WHERE hostname = ?")
            .bind(hostname)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Lists the hostnames of a tenant, primary first.
    pub async fn list_by_tenant(
        &self,
        tenant: &TenantIdentifier,
    ) -> Result<Vec<Domain>, DomainError> {
        let rows = sqlx::query_as::<_, DomainRow>(
            "SELECT id, hostname, tenant_identifier, is_primary, created_at \
               FROM domains \
              WHERE tenant_identifier = ? \
              ORDER BY is_primary DESC, created_at ASC, rowid ASC",
        )
        .bind(tenant.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DomainRow::into_domain).collect()
    }

    /// Moves the primary flag of the owning tenant to `hostname`.
    pub async fn set_primary(&self, hostname: &str) -> Result<Domain, DomainError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, DomainRow>(
            "SELECT id, hostname, tenant_identifier, is_primary, created_at \
               FROM domains WHERE hostname = ?",
        )
        .bind(hostname)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(DomainError::NotFound)?;

        if !row.is_primary {
            sqlx::query(
                "UPDATE domains SET is_primary = 0 \
                 WHERE tenant_identifier = ? AND is_primary = 1",
            )
            .bind(&row.tenant_identifier)
            .execute(&mut *tx)
            .await?;

            sqlx::query("UPDATE domains SET is_primary = 1 WHERE hostname = ?")
                .bind(hostname)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        let mut domain = row.into_domain()?;
        domain.is_primary = true;
        Ok(domain)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DomainRow {
    id: String,
    hostname: String,
    tenant_identifier: String,
    is_primary: bool,
    created_at: DateTime<Utc>,
}

impl DomainRow {
    fn into_domain(self) -> Result<Domain, DomainError> {
        let tenant = TenantIdentifier::parse(&self.tenant_identifier)
            .map_err(|_| DomainError::Corrupt(self.tenant_identifier.clone()))?;
        Ok(Domain {
            id: self.id,
            hostname: self.hostname,
            tenant,
            is_primary: self.is_primary,
            created_at: self.created_at,
        })
    }
}

/// Errors raised by the domain registry.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("hostname '{0}' is already claimed")]
    Conflict(String),
    #[error("tenant '{0}' already has a primary domain")]
    PrimaryExists(String),
    #[error("tenant '{0}' does not exist")]
    UnknownTenant(String),
    #[error("domain not found")]
    NotFound,
    #[error("stored domain references malformed tenant '{0}'")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
