use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, SqlitePool};
use thiserror::Error;
use tracing::{debug, warn};

use tenancy_core::{PartitionHandle, TenantIdentifier};

use crate::{apply_pragmas, to_rfc3339};

pub const PARTITION_EXTENSION: &str = "sqlite";

/// Creates and removes the isolated data stores backing tenants.
#[async_trait]
pub trait PartitionProvisioner: Send + Sync {
    /// Creates and bootstraps the partition of `tenant`.
    ///
    /// Leftovers of an earlier failed attempt are replaced. On error nothing
    /// is left behind.
    async fn provision(&self, tenant: &TenantIdentifier) -> Result<PartitionHandle, PartitionError>;

    /// Removes a partition whose provisioning transaction did not commit.
    async fn discard(&self, handle: &PartitionHandle) -> Result<(), PartitionError>;
}

/// Partitions stored as one SQLite database file per tenant under `root`.
#[derive(Debug, Clone)]
pub struct SqlitePartitionStore {
    root: PathBuf,
}

impl SqlitePartitionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the tenant's partition under the absolute form of `root`.
    async fn path_for(&self, tenant: &TenantIdentifier) -> Result<PathBuf, PartitionError> {
        let root = tokio::fs::canonicalize(&self.root).await?;
        Ok(root.join(format!("{}.{}", tenant.as_str(), PARTITION_EXTENSION)))
    }

    /// Opens a connection pool on a provisioned partition.
    ///
    /// The partition must exist and must record the same tenant as the handle.
    pub async fn connect(&self, handle: &PartitionHandle) -> Result<Partition, PartitionError> {
        let path = PathBuf::from(handle.location());
        if !tokio::fs::try_exists(&path).await? {
            return Err(PartitionError::Missing(handle.location().to_string()));
        }

        let pool = open_pool(&path, false, 5).await?;
        let owner: Option<(String,)> =
            sqlx::query_as("SELECT tenant_identifier FROM partition_meta LIMIT 1")
                .fetch_optional(&pool)
                .await?;

        match owner {
            Some((owner,)) if owner == handle.tenant().as_str() => Ok(Partition {
                handle: handle.clone(),
                pool,
            }),
            other => {
                pool.close().await;
                Err(PartitionError::OwnerMismatch {
                    expected: handle.tenant().to_string(),
                    found: other.map(|(owner,)| owner),
                })
            }
        }
    }

    async fn bootstrap(&self, tenant: &TenantIdentifier, path: &Path) -> Result<(), PartitionError> {
        let pool = open_pool(path, true, 1).await?;
        let result = async {
            sqlx::migrate!("../../migrations/partition")
                .run(&pool)
                .await
                .map_err(PartitionError::Migration)?;
            sqlx::query("INSERT INTO partition_meta (tenant_identifier, created_at) VALUES (?, ?)")
                .bind(tenant.as_str())
                .bind(to_rfc3339(Utc::now()))
                .execute(&pool)
                .await?;
            Ok::<(), PartitionError>(())
        }
        .await;
        pool.close().await;
        result
    }
}

#[async_trait]
impl PartitionProvisioner for SqlitePartitionStore {
    async fn provision(&self, tenant: &TenantIdentifier) -> Result<PartitionHandle, PartitionError> {
        tokio::fs::create_dir_all(&self.root).await?;

        let path = self.path_for(tenant).await?;
        if tokio::fs::try_exists(&path).await? {
            warn!(stage = "storage", tenant = %tenant, path = %path.display(), "replacing leftover partition");
            remove_database_files(&path).await?;
        }

        if let Err(err) = self.bootstrap(tenant, &path).await {
            if let Err(cleanup) = remove_database_files(&path).await {
                warn!(stage = "storage", tenant = %tenant, error = %cleanup, "failed to clean up partition after bootstrap error");
            }
            return Err(err);
        }

        debug!(stage = "storage", tenant = %tenant, path = %path.display(), "partition provisioned");
        Ok(PartitionHandle::new(
            tenant.clone(),
            path.to_string_lossy().into_owned(),
        ))
    }

    async fn discard(&self, handle: &PartitionHandle) -> Result<(), PartitionError> {
        remove_database_files(Path::new(handle.location())).await?;
        debug!(stage = "storage", tenant = %handle.tenant(), "partition discarded");
        Ok(())
    }
}

/// Open connection pool on one tenant partition.
#[derive(Clone)]
pub struct Partition {
    handle: PartitionHandle,
    pool: SqlitePool,
}

impl Partition {
    pub fn handle(&self) -> &PartitionHandle {
        &self.handle
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn open_pool(path: &Path, create: bool, max_connections: u32) -> Result<SqlitePool, PartitionError> {
    let options = apply_pragmas(
        sqlx::sqlite::SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create),
    );
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Removes a partition database together with its WAL side files.
async fn remove_database_files(path: &Path) -> Result<(), std::io::Error> {
    let base = path.as_os_str().to_owned();
    let mut candidates = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut side = base.clone();
        side.push(suffix);
        candidates.push(PathBuf::from(side));
    }

    for candidate in candidates {
        match tokio::fs::remove_file(&candidate).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Errors raised while creating, removing, or opening partitions.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("partition filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("partition database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to bootstrap partition schema: {0}")]
    Migration(MigrateError),
    #[error("partition '{0}' does not exist")]
    Missing(String),
    #[error("partition belongs to {found:?}, expected '{expected}'")]
    OwnerMismatch {
        expected: String,
        found: Option<String>,
    },
}
