use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tracing::error;

use tenancy_storage::{Database, SqlitePartitionStore, TenantError};

use crate::problem::ProblemResponse;
use crate::provisioning::TenantProvisioner;
use crate::resolver::{TenantPartition, TenantResolver};
use crate::{signup, telemetry};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    partitions: SqlitePartitionStore,
    resolver: TenantResolver,
    provisioner: TenantProvisioner,
}

impl AppState {
    pub fn new<S: AsRef<str>>(
        metrics: PrometheusHandle,
        storage: Database,
        partitions: SqlitePartitionStore,
        base_domain: &str,
        public_hosts: &[S],
    ) -> Self {
        let resolver = TenantResolver::new(storage.clone(), public_hosts);
        let provisioner = TenantProvisioner::new(
            storage.clone(),
            Arc::new(partitions.clone()),
            resolver.clone(),
            base_domain,
        );
        Self {
            metrics,
            storage,
            partitions,
            resolver,
            provisioner,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn partitions(&self) -> &SqlitePartitionStore {
        &self.partitions
    }

    pub fn resolver(&self) -> &TenantResolver {
        &self.resolver
    }

    pub fn provisioner(&self) -> &TenantProvisioner {
        &self.provisioner
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/signup", post(signup::create_workspace))
        .route("/check-identifier", get(signup::check_identifier))
        .route("/tenant", get(current_tenant))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[derive(Debug, Serialize)]
struct TenantView {
    identifier: String,
    display_name: String,
    partition: String,
}

/// `GET /tenant`: describes the tenant addressed by the `Host` header.
async fn current_tenant(
    State(state): State<AppState>,
    TenantPartition(handle): TenantPartition,
) -> Result<Json<TenantView>, ProblemResponse> {
    let tenant = state
        .storage()
        .tenants()
        .get(handle.tenant().as_str())
        .await
        .map_err(|err| match err {
            TenantError::NotFound => ProblemResponse::not_found(
                "tenant_not_found",
                format!("tenant '{}' does not exist", handle.tenant()),
            ),
            other => {
                error!(stage = "resolver", tenant = %handle.tenant(), error = %other, "failed to load tenant");
                ProblemResponse::internal("tenant_lookup_failed")
            }
        })?;

    let partition = state.partitions().connect(&handle).await.map_err(|err| {
        error!(stage = "storage", tenant = %handle.tenant(), error = %err, "partition unavailable");
        ProblemResponse::internal("partition_unavailable")
    })?;
    partition.pool().close().await;

    Ok(Json(TenantView {
        identifier: tenant.identifier.to_string(),
        display_name: tenant.display_name,
        partition: handle.location().to_string(),
    }))
}
