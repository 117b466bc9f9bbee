use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use metrics::histogram;
use sqlx::{Sqlite, Transaction};
use thiserror::Error;
use tracing::{error, info, warn};

use tenancy_core::{
    Domain, FieldErrors, IdentifierError, IdentifierPolicy, PartitionHandle, SignupRequest, Tenant,
    TenantIdentifier,
};
use tenancy_storage::{
    is_busy, Database, DomainError, NewDomain, NewTenant, PartitionError, PartitionProvisioner,
    TenantError, TenantRepository,
};

use crate::resolver::TenantResolver;

/// Checks identifiers against the local rules and the tenant registry.
#[derive(Clone)]
pub struct IdentifierValidator {
    tenants: TenantRepository,
    policy: IdentifierPolicy,
}

impl IdentifierValidator {
    pub fn new(tenants: TenantRepository, policy: IdentifierPolicy) -> Self {
        Self { tenants, policy }
    }

    /// Normalizes the candidate and reports the first rule it breaks.
    ///
    /// `Taken` is advisory: the registry insert is what actually settles
    /// races between concurrent signups.
    pub async fn validate(&self, candidate: &str) -> Result<TenantIdentifier, ValidatorError> {
        let identifier = self.policy.check(candidate)?;
        self.ensure_available(identifier).await
    }

    async fn ensure_available(
        &self,
        identifier: TenantIdentifier,
    ) -> Result<TenantIdentifier, ValidatorError> {
        if self.tenants.exists(identifier.as_str()).await? {
            return Err(ValidatorError::Rejected(IdentifierError::Taken(
                identifier.to_string(),
            )));
        }
        Ok(identifier)
    }
}

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error(transparent)]
    Rejected(#[from] IdentifierError),
    #[error("failed to query tenant registry: {0}")]
    Registry(#[from] TenantError),
}

/// Result of a successful provisioning run.
#[derive(Debug, Clone)]
pub struct ProvisionedTenant {
    pub tenant: Tenant,
    pub primary_domain: Domain,
}

/// Workspace created by a public signup, with the validated admin contact.
#[derive(Debug, Clone)]
pub struct SignedUp {
    pub workspace: ProvisionedTenant,
    pub admin_email: String,
    pub admin_name: String,
}

/// Creates tenants together with their partition and primary domain.
///
/// The tenant row, the partition attachment, and the domain row share one
/// registry transaction. The partition is created while that transaction
/// holds the write lock and is discarded if the transaction does not commit,
/// so a failed run leaves no tenant, domain, or partition behind.
#[derive(Clone)]
pub struct TenantProvisioner {
    database: Database,
    partitions: Arc<dyn PartitionProvisioner>,
    resolver: TenantResolver,
    validator: IdentifierValidator,
    base_domain: Arc<str>,
}

impl TenantProvisioner {
    pub fn new(
        database: Database,
        partitions: Arc<dyn PartitionProvisioner>,
        resolver: TenantResolver,
        base_domain: &str,
    ) -> Self {
        let validator = IdentifierValidator::new(database.tenants(), IdentifierPolicy::signup());
        Self {
            database,
            partitions,
            resolver,
            validator,
            base_domain: Arc::from(base_domain),
        }
    }

    pub fn validator(&self) -> &IdentifierValidator {
        &self.validator
    }

    /// Handles a public signup: validation, hostname composition, provisioning.
    pub async fn signup(&self, request: &SignupRequest) -> Result<SignedUp, SignupError> {
        let validated = request
            .validate(IdentifierPolicy::signup())
            .map_err(SignupError::Invalid)?;

        let identifier = match self
            .validator
            .ensure_available(validated.identifier)
            .await
        {
            Ok(identifier) => identifier,
            Err(ValidatorError::Rejected(IdentifierError::Taken(value))) => {
                return Err(SignupError::Conflict(
                    ProvisioningError::IdentifierTaken(value).to_string(),
                ));
            }
            Err(ValidatorError::Rejected(other)) => {
                let mut errors = FieldErrors::new();
                errors.insert("identifier", vec![other.to_string()]);
                return Err(SignupError::Invalid(errors));
            }
            Err(ValidatorError::Registry(err)) => return Err(SignupError::Registry(err)),
        };

        let hostname = identifier.hostname_under(&self.base_domain);
        let workspace = self
            .provision(&identifier, &validated.display_name, &hostname)
            .await
            .map_err(|err| {
                if err.is_conflict() {
                    SignupError::Conflict(err.to_string())
                } else {
                    SignupError::Provisioning(err)
                }
            })?;

        Ok(SignedUp {
            workspace,
            admin_email: validated.admin_email,
            admin_name: validated.admin_name,
        })
    }

    /// Runs the failure-atomic provisioning unit for an already validated identifier.
    ///
    /// `hostname` must be normalized.
    pub async fn provision(
        &self,
        identifier: &TenantIdentifier,
        display_name: &str,
        hostname: &str,
    ) -> Result<ProvisionedTenant, ProvisioningError> {
        let now = Utc::now();
        let mut tx = self.database.begin().await?;

        if let Err(err) = self
            .database
            .tenants()
            .create(
                &mut tx,
                &NewTenant {
                    identifier,
                    display_name,
                    created_at: now,
                },
            )
            .await
        {
            rollback(tx).await;
            return Err(ProvisioningError::from_tenant(err));
        }

        let started = Instant::now();
        let handle = match self.partitions.provision(identifier).await {
            Ok(handle) => handle,
            Err(err) => {
                rollback(tx).await;
                return Err(ProvisioningError::Partition(err));
            }
        };
        histogram!("partition_provision_seconds").record(started.elapsed().as_secs_f64());

        let committed = match self.attach_and_route(&mut tx, &handle, hostname, now).await {
            Ok(domain) => tx.commit().await.map(|_| domain).map_err(ProvisioningError::from),
            Err(err) => {
                rollback(tx).await;
                Err(err)
            }
        };

        let primary_domain = match committed {
            Ok(domain) => domain,
            Err(err) => {
                if let Err(cleanup) = self.partitions.discard(&handle).await {
                    error!(stage = "signup", tenant = %identifier, error = %cleanup, "failed to discard partition of aborted signup");
                }
                return Err(err);
            }
        };

        self.resolver.remember(&primary_domain.hostname, &handle).await;
        info!(stage = "signup", tenant = %identifier, hostname = %primary_domain.hostname, "tenant provisioned");

        Ok(ProvisionedTenant {
            tenant: Tenant {
                identifier: identifier.clone(),
                display_name: display_name.to_string(),
                partition: handle,
                created_at: now,
            },
            primary_domain,
        })
    }

    async fn attach_and_route(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        handle: &PartitionHandle,
        hostname: &str,
        now: DateTime<Utc>,
    ) -> Result<Domain, ProvisioningError> {
        self.database
            .tenants()
            .attach_partition(tx, handle)
            .await
            .map_err(ProvisioningError::from_tenant)?;

        self.database
            .domains()
            .insert(
                tx,
                &NewDomain {
                    hostname,
                    tenant: handle.tenant(),
                    is_primary: true,
                    created_at: now,
                },
            )
            .await
            .map_err(ProvisioningError::from_domain)
    }
}

async fn rollback(tx: Transaction<'static, Sqlite>) {
    if let Err(err) = tx.rollback().await {
        warn!(stage = "signup", error = %err, "registry rollback failed");
    }
}

/// Failures of the provisioning unit.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("identifier '{0}' is already taken")]
    IdentifierTaken(String),
    #[error("hostname '{0}' is already claimed")]
    HostnameTaken(String),
    #[error("partition provisioning failed: {0}")]
    Partition(#[source] PartitionError),
    #[error("tenant registry failure: {0}")]
    Tenant(#[source] TenantError),
    #[error("domain registry failure: {0}")]
    Domain(#[source] DomainError),
    #[error("registry transaction failed: {0}")]
    Transaction(#[from] sqlx::Error),
}

impl ProvisioningError {
    fn from_tenant(err: TenantError) -> Self {
        match err {
            TenantError::Conflict(identifier) => Self::IdentifierTaken(identifier),
            other => Self::Tenant(other),
        }
    }

    fn from_domain(err: DomainError) -> Self {
        match err {
            DomainError::Conflict(hostname) => Self::HostnameTaken(hostname),
            other => Self::Domain(other),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::IdentifierTaken(_) | Self::HostnameTaken(_))
    }

    /// The registry write lock was not granted within the busy timeout.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Tenant(TenantError::Database(err))
            | Self::Domain(DomainError::Database(err))
            | Self::Transaction(err) => is_busy(err),
            _ => false,
        }
    }
}

/// Outcome of a rejected signup, mapped onto HTTP statuses by the handler.
#[derive(Debug, Error)]
pub enum SignupError {
    #[error("validation failed")]
    Invalid(FieldErrors),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Provisioning(ProvisioningError),
    #[error("failed to query tenant registry: {0}")]
    Registry(TenantError),
}

impl SignupError {
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Provisioning(err) => err.is_busy(),
            Self::Registry(TenantError::Database(err)) => is_busy(err),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;
    use tenancy_storage::SqlitePartitionStore;

    struct Fixture {
        database: Database,
        store: SqlitePartitionStore,
        resolver: TenantResolver,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("registry.db").display());
        let database = Database::connect(&url).await.expect("connect");
        database.run_migrations().await.expect("migrations");
        let store = SqlitePartitionStore::new(dir.path().join("partitions"));
        let resolver = TenantResolver::new(database.clone(), Vec::<String>::new());
        Fixture {
            database,
            store,
            resolver,
            _dir: dir,
        }
    }

    fn provisioner(fx: &Fixture, partitions: Arc<dyn PartitionProvisioner>) -> TenantProvisioner {
        TenantProvisioner::new(fx.database.clone(), partitions, fx.resolver.clone(), "example.com")
    }

    fn signup_request(identifier: &str) -> SignupRequest {
        SignupRequest {
            identifier: identifier.to_string(),
            display_name: "Acme Inc".to_string(),
            admin_email: "a@acme.com".to_string(),
            admin_name: "A".to_string(),
        }
    }

    /// Creates the partition like the real store, then fails bootstrap.
    struct FailingPartitions {
        inner: SqlitePartitionStore,
    }

    #[async_trait]
    impl PartitionProvisioner for FailingPartitions {
        async fn provision(
            &self,
            tenant: &TenantIdentifier,
        ) -> Result<PartitionHandle, PartitionError> {
            let handle = self.inner.provision(tenant).await?;
            self.inner.discard(&handle).await?;
            Err(PartitionError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }

        async fn discard(&self, handle: &PartitionHandle) -> Result<(), PartitionError> {
            self.inner.discard(handle).await
        }
    }

    #[tokio::test]
    async fn signup_creates_tenant_partition_and_primary_domain() {
        let fx = fixture().await;
        let service = provisioner(&fx, Arc::new(fx.store.clone()));

        let mut request = signup_request("acme");
        request.admin_email = "  a@acme.com ".to_string();
        request.admin_name = " Ada ".to_string();

        let before = Utc::now();
        let signed_up = service.signup(&request).await.expect("signup");
        let created = &signed_up.workspace;
        assert_eq!(created.primary_domain.hostname, "acme.example.com");
        assert!(created.primary_domain.is_primary);
        assert!(Path::new(created.tenant.partition.location()).exists());
        assert!(created.tenant.created_at >= before && created.tenant.created_at <= Utc::now());
        assert_eq!(signed_up.admin_email, "a@acme.com");
        assert_eq!(signed_up.admin_name, "Ada");

        let stored = fx.database.tenants().get("acme").await.expect("tenant visible");
        assert_eq!(stored.partition, created.tenant.partition);
        assert_eq!(stored.display_name, "Acme Inc");

        let handle = fx.resolver.resolve("acme.example.com").await.expect("resolves");
        assert_eq!(handle, created.tenant.partition);
    }

    #[tokio::test]
    async fn failing_partition_leaves_no_trace() {
        let fx = fixture().await;
        let service = provisioner(
            &fx,
            Arc::new(FailingPartitions {
                inner: fx.store.clone(),
            }),
        );

        let err = service
            .signup(&signup_request("acme"))
            .await
            .expect_err("provisioning fails");
        assert!(matches!(
            err,
            SignupError::Provisioning(ProvisioningError::Partition(_))
        ));

        assert!(matches!(
            fx.database.tenants().get("acme").await,
            Err(TenantError::NotFound)
        ));
        assert!(!fx.database.tenants().exists("acme").await.expect("exists"));
        assert!(matches!(
            fx.database.domains().resolve("acme.example.com").await,
            Err(DomainError::NotFound)
        ));

        // The identifier is still free for a later attempt.
        let retry = provisioner(&fx, Arc::new(fx.store.clone()));
        retry.signup(&signup_request("acme")).await.expect("retry succeeds");
    }

    #[tokio::test]
    async fn hostname_conflict_rolls_back_tenant_and_partition() {
        let fx = fixture().await;
        let service = provisioner(&fx, Arc::new(fx.store.clone()));

        let public = TenantIdentifier::public();
        service
            .provision(&public, "Public Tenant", "localhost")
            .await
            .expect("public tenant");
        fx.database
            .domains()
            .create(&NewDomain {
                hostname: "acme.example.com",
                tenant: &public,
                is_primary: false,
                created_at: Utc::now(),
            })
            .await
            .expect("alias squatting the hostname");

        let err = service
            .signup(&signup_request("acme"))
            .await
            .expect_err("hostname already claimed");
        assert!(matches!(err, SignupError::Conflict(ref msg) if msg.contains("acme.example.com")));

        assert!(matches!(
            fx.database.tenants().get("acme").await,
            Err(TenantError::NotFound)
        ));
        assert!(!fx.store.root().join("acme.sqlite").exists());
    }

    #[tokio::test]
    async fn repeated_signup_is_a_conflict() {
        let fx = fixture().await;
        let service = provisioner(&fx, Arc::new(fx.store.clone()));

        service.signup(&signup_request("acme")).await.expect("first signup");
        let err = service
            .signup(&signup_request("ACME"))
            .await
            .expect_err("second signup");
        assert!(matches!(err, SignupError::Conflict(ref msg) if msg.contains("acme")));
    }

    #[tokio::test]
    async fn concurrent_signups_yield_one_success_and_one_conflict() {
        let fx = fixture().await;
        let service = provisioner(&fx, Arc::new(fx.store.clone()));

        let first = service.clone();
        let second = service.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { first.signup(&signup_request("acme")).await }),
            tokio::spawn(async move { second.signup(&signup_request("acme")).await }),
        );
        let results = [a.expect("task a"), b.expect("task b")];

        let successes = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(SignupError::Conflict(_))))
            .count();
        assert_eq!((successes, conflicts), (1, 1));

        assert_eq!(fx.database.tenants().list().await.expect("list").len(), 1);
        assert_eq!(
            fx.database
                .domains()
                .list_by_tenant(&TenantIdentifier::parse("acme").unwrap())
                .await
                .expect("domains")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn invalid_request_has_no_side_effects() {
        let fx = fixture().await;
        let service = provisioner(&fx, Arc::new(fx.store.clone()));

        let err = service
            .signup(&signup_request("admin"))
            .await
            .expect_err("reserved");
        let SignupError::Invalid(errors) = err else {
            panic!("expected validation failure");
        };
        assert_eq!(errors["identifier"], vec!["the identifier 'admin' is reserved"]);
        assert!(fx.database.tenants().list().await.expect("list").is_empty());
        assert!(!fx.store.root().exists());
    }

    #[tokio::test]
    async fn validator_reports_distinct_reasons() {
        let fx = fixture().await;
        let service = provisioner(&fx, Arc::new(fx.store.clone()));
        service.signup(&signup_request("acme")).await.expect("signup");

        let validator = service.validator();
        let reason = |result: Result<TenantIdentifier, ValidatorError>| match result {
            Err(ValidatorError::Rejected(err)) => err.reason(),
            Ok(_) => "ok",
            Err(ValidatorError::Registry(err)) => panic!("registry error: {err}"),
        };

        assert_eq!(reason(validator.validate("admin").await), "reserved");
        assert_eq!(reason(validator.validate("ab").await), "too_short");
        assert_eq!(reason(validator.validate("Acme!").await), "invalid_format");
        assert_eq!(reason(validator.validate(" ACME ").await), "taken");
        assert_eq!(reason(validator.validate("globex").await), "ok");
    }
}
