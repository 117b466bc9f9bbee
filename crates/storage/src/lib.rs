use std::{str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Sqlite, SqlitePool, Transaction,
};
use thiserror::Error;

mod domain;
mod partition;
mod tenant;

pub use domain::{DomainError, DomainRepository, NewDomain};
pub use partition::{
    Partition, PartitionError, PartitionProvisioner, SqlitePartitionStore, PARTITION_EXTENSION,
};
pub use tenant::{NewTenant, TenantError, TenantRepository};

/// Top-level handle on the registry database, which holds tenants and domains.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = connect_options(database_url)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/registry`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations/registry")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Begins a transaction spanning several repository calls.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Returns a handle for the tenant registry.
    pub fn tenants(&self) -> TenantRepository {
        TenantRepository::new(self.pool.clone())
    }

    /// Returns a handle for the domain registry.
    pub fn domains(&self) -> DomainRepository {
        DomainRepository::new(self.pool.clone())
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Connection settings shared by the registry and every partition.
///
/// Pragmas are set on the connect options so that each pooled connection
/// carries them, not only the first one.
pub(crate) fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, StorageError> {
    let options = SqliteConnectOptions::from_str(database_url).map_err(StorageError::Connect)?;
    Ok(apply_pragmas(options))
}

pub(crate) fn apply_pragmas(options: SqliteConnectOptions) -> SqliteConnectOptions {
    options
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(5000))
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Constraint violations the repositories translate into domain errors.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Violation {
    /// Unique or primary key violation, carrying SQLite's message
    /// (`UNIQUE constraint failed: table.column`).
    Unique(String),
    ForeignKey,
}

pub(crate) fn violation(err: &sqlx::Error) -> Option<Violation> {
    let sqlx::Error::Database(db_err) = err else {
        return None;
    };
    match db_err.code().as_deref() {
        Some("2067") | Some("1555") => Some(Violation::Unique(db_err.message().to_string())),
        Some("787") => Some(Violation::ForeignKey),
        _ => None,
    }
}

/// Returns `true` when SQLite gave up waiting for a lock (`SQLITE_BUSY` and
/// its extended codes).
pub fn is_busy(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        return false;
    };
    db_err
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| code & 0xff == 5)
}

pub(crate) fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
