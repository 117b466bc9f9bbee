use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;

use tenancy_core::{PartitionHandle, Tenant, TenantIdentifier};

use crate::{to_rfc3339, violation, Violation};

/// Repository for the tenant registry.
///
/// Only tenants whose partition has been attached are visible to reads.
/// A row without a partition exists solely inside an uncommitted
/// provisioning transaction.
#[derive(Clone)]
pub struct TenantRepository {
    pool: SqlitePool,
}

/// Data required to register a tenant.
pub struct NewTenant<'a> {
    pub identifier: &'a TenantIdentifier,
    pub display_name: &'a str,
    pub created_at: DateTime<Utc>,
}

impl TenantRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Claims the identifier inside `tx`.
    ///
    /// The insert is atomic: when two transactions race for the same
    /// identifier the loser gets [`TenantError::Conflict`].
    pub async fn create(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        tenant: &NewTenant<'_>,
    ) -> Result<(), TenantError> {
        sqlx::query("INSERT INTO tenants (identifier, display_name, created_at) VALUES (?, ?, ?)")
            .bind(tenant.identifier.as_str())
            .bind(tenant.display_name)
            .bind(to_rfc3339(tenant.created_at))
            .execute(&mut **tx)
            .await
            .map_err(|err| match violation(&err) {
                Some(Violation::Unique(_)) => TenantError::Conflict(tenant.identifier.to_string()),
                _ => TenantError::Database(err),
            })?;
        Ok(())
    }

    /// Records the partition of a tenant created in the same transaction.
    pub async fn attach_partition(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        handle: &PartitionHandle,
    ) -> Result<(), TenantError> {
        let result = sqlx::query(
            "UPDATE tenants SET partition_location = ? \
             WHERE identifier = ? AND partition_location IS NULL",
        )
        .bind(handle.location())
        .bind(handle.tenant().as_str())
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TenantError::PartitionAlreadyAttached(
                handle.tenant().to_string(),
            ));
        }
        Ok(())
    }

    /// Loads a provisioned tenant.
    pub async fn get(&self, identifier: &str) -> Result<Tenant, TenantError> {
        let row = sqlx::query_as::<_, TenantRow>(
            "SELECT identifier, display_name, partition_location, created_at \
               FROM tenants \
              WHERE identifier = ? AND partition_location IS NOT NULL",
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(TenantError::NotFound)?;

        row.into_domain()
    }

    /// Returns `true` when the identifier is claimed by a committed tenant.
    pub async fn exists(&self, identifier: &str) -> Result<bool, TenantError> {
        let found: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM tenants WHERE identifier = ?")
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Lists provisioned tenants in creation order.
    pub async fn list(&self) -> Result<Vec<Tenant>, TenantError> {
        let rows = sqlx::query_as::<_, TenantRow>(
            "SELECT identifier, display_name, partition_location, created_at \
               FROM tenants \
              WHERE partition_location IS NOT NULL \
              ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TenantRow::into_domain).collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TenantRow {
    identifier: String,
    display_name: String,
    partition_location: Option<String>,
    created_at: DateTime<Utc>,
}

impl TenantRow {
    fn into_domain(self) -> Result<Tenant, TenantError> {
        let identifier = TenantIdentifier::parse(&self.identifier)
            .map_err(|_| TenantError::Corrupt(self.identifier.clone()))?;
        let location = self
            .partition_location
            .ok_or_else(|| TenantError::Corrupt(self.identifier.clone()))?;

        Ok(Tenant {
            partition: PartitionHandle::new(identifier.clone(), location),
            identifier,
            display_name: self.display_name,
            created_at: self.created_at,
        })
    }
}

/// Errors raised by the tenant registry.
#[derive(Debug, Error)]
pub enum TenantError {
    #[error("tenant '{0}' already exists")]
    Conflict(String),
    #[error("tenant not found")]
    NotFound,
    #[error("tenant '{0}' already has a partition")]
    PartitionAlreadyAttached(String),
    #[error("stored tenant '{0}' is malformed")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn id(value: &str) -> TenantIdentifier {
        TenantIdentifier::parse(value).expect("valid identifier")
    }

    async fn provision_row(db: &crate::Database, identifier: &str) {
        let identifier = id(identifier);
        let repo = db.tenants();
        let mut tx = db.begin().await.expect("begin");
        repo.create(
            &mut tx,
            &NewTenant {
                identifier: &identifier,
                display_name: "Example",
                created_at: Utc::now(),
            },
        )
        .await
        .expect("create");
        repo.attach_partition(
            &mut tx,
            &PartitionHandle::new(identifier.clone(), format!("/p/{identifier}.sqlite")),
        )
        .await
        .expect("attach");
        tx.commit().await.expect("commit");
    }

    #[tokio::test]
    async fn create_then_get_and_list_in_creation_order() {
        let (db, _dir) = testing::registry().await;
        for name in ["zeta", "acme", "mid"] {
            provision_row(&db, name).await;
        }

        let tenant = db.tenants().get("acme").await.expect("get");
        assert_eq!(tenant.identifier.as_str(), "acme");
        assert_eq!(tenant.partition.location(), "/p/acme.sqlite");
        assert_eq!(tenant.partition.tenant(), &tenant.identifier);

        let listed: Vec<String> = db
            .tenants()
            .list()
            .await
            .expect("list")
            .into_iter()
            .map(|t| t.identifier.to_string())
            .collect();
        assert_eq!(listed, vec!["zeta", "acme", "mid"]);
    }

    #[tokio::test]
    async fn duplicate_identifier_is_a_conflict() {
        let (db, _dir) = testing::registry().await;
        provision_row(&db, "acme").await;

        let identifier = id("acme");
        let mut tx = db.begin().await.expect("begin");
        let err = db
            .tenants()
            .create(
                &mut tx,
                &NewTenant {
                    identifier: &identifier,
                    display_name: "Other",
                    created_at: Utc::now(),
                },
            )
            .await
            .expect_err("duplicate");
        assert!(matches!(err, TenantError::Conflict(value) if value == "acme"));
    }

    #[tokio::test]
    async fn uncommitted_tenants_are_invisible() {
        let (db, _dir) = testing::registry().await;
        let identifier = id("acme");
        let repo = db.tenants();

        let mut tx = db.begin().await.expect("begin");
        repo.create(
            &mut tx,
            &NewTenant {
                identifier: &identifier,
                display_name: "Acme",
                created_at: Utc::now(),
            },
        )
        .await
        .expect("create");
        tx.rollback().await.expect("rollback");

        assert!(matches!(repo.get("acme").await, Err(TenantError::NotFound)));
        assert!(!repo.exists("acme").await.expect("exists"));
    }

    #[tokio::test]
    async fn partition_is_attached_once() {
        let (db, _dir) = testing::registry().await;
        provision_row(&db, "acme").await;

        let mut tx = db.begin().await.expect("begin");
        let err = db
            .tenants()
            .attach_partition(&mut tx, &PartitionHandle::new(id("acme"), "/elsewhere"))
            .await
            .expect_err("partition is immutable");
        assert!(matches!(err, TenantError::PartitionAlreadyAttached(_)));
    }
}
