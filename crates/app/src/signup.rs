use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use tenancy_core::{FieldErrors, SignupRequest};

use crate::problem::ProblemResponse;
use crate::provisioning::{SignupError, ValidatorError};
use crate::router::AppState;

const CREATED_MESSAGE: &str = "Workspace created successfully!";
const INVALID_MESSAGE: &str = "Validation failed";
const FAILED_MESSAGE: &str = "Failed to create workspace";
const PROVISIONING_FAILED: &str = "workspace provisioning failed";

#[derive(Debug, Serialize)]
struct SignupCreated<'a> {
    success: bool,
    message: &'static str,
    identifier: &'a str,
    display_name: &'a str,
    workspace_url: String,
    admin_email: &'a str,
    admin_name: &'a str,
}

#[derive(Debug, Serialize)]
struct SignupInvalid {
    success: bool,
    message: &'static str,
    errors: FieldErrors,
}

#[derive(Debug, Serialize)]
struct SignupFailed {
    success: bool,
    message: &'static str,
    error: String,
}

fn invalid(errors: FieldErrors) -> Response {
    counter!("signup_total", "result" => "invalid").increment(1);
    let body = SignupInvalid {
        success: false,
        message: INVALID_MESSAGE,
        errors,
    };
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

fn failed(status: StatusCode, error: String) -> Response {
    let body = SignupFailed {
        success: false,
        message: FAILED_MESSAGE,
        error,
    };
    (status, Json(body)).into_response()
}

/// `POST /signup`: creates a workspace with its partition and primary domain.
pub async fn create_workspace(
    State(state): State<AppState>,
    payload: Result<Json<SignupRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let mut errors = FieldErrors::new();
            errors.insert("body", vec![rejection.body_text()]);
            return invalid(errors);
        }
    };

    match state.provisioner().signup(&request).await {
        Ok(signed_up) => {
            counter!("signup_total", "result" => "created").increment(1);
            let workspace = &signed_up.workspace;
            info!(
                stage = "signup",
                tenant = %workspace.tenant.identifier,
                admin_email = %signed_up.admin_email,
                "workspace created"
            );
            let body = SignupCreated {
                success: true,
                message: CREATED_MESSAGE,
                identifier: workspace.tenant.identifier.as_str(),
                display_name: &workspace.tenant.display_name,
                workspace_url: format!("http://{}", workspace.primary_domain.hostname),
                admin_email: &signed_up.admin_email,
                admin_name: &signed_up.admin_name,
            };
            (StatusCode::CREATED, Json(body)).into_response()
        }
        Err(SignupError::Invalid(errors)) => invalid(errors),
        Err(SignupError::Conflict(reason)) => {
            counter!("signup_total", "result" => "conflict").increment(1);
            info!(stage = "signup", identifier = %request.identifier.trim(), %reason, "signup conflict");
            failed(StatusCode::CONFLICT, reason)
        }
        Err(err) => {
            // Registry write lock not granted within the busy timeout.
            let result = if err.is_busy() { "busy" } else { "error" };
            counter!("signup_total", "result" => result).increment(1);
            error!(stage = "signup", identifier = %request.identifier.trim(), result, error = %err, "workspace provisioning failed");
            failed(
                StatusCode::INTERNAL_SERVER_ERROR,
                PROVISIONING_FAILED.to_string(),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    #[serde(default)]
    identifier: Option<String>,
}

#[derive(Debug, Serialize)]
struct Availability {
    available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    identifier: Option<String>,
    message: &'static str,
}

/// `GET /check-identifier?identifier=X`: read-only availability probe.
pub async fn check_identifier(
    State(state): State<AppState>,
    Query(query): Query<CheckQuery>,
) -> Result<Response, ProblemResponse> {
    let candidate = query.identifier.as_deref().map(str::trim).unwrap_or_default();
    if candidate.is_empty() {
        counter!("identifier_checks_total", "result" => "missing").increment(1);
        let body = Availability {
            available: false,
            identifier: None,
            message: "Identifier is required",
        };
        return Ok((StatusCode::BAD_REQUEST, Json(body)).into_response());
    }

    let body = match state.provisioner().validator().validate(candidate).await {
        Ok(identifier) => {
            counter!("identifier_checks_total", "result" => "available").increment(1);
            Availability {
                available: true,
                identifier: Some(identifier.to_string()),
                message: "Available",
            }
        }
        Err(ValidatorError::Rejected(reason)) => {
            counter!("identifier_checks_total", "result" => reason.reason()).increment(1);
            Availability {
                available: false,
                identifier: Some(candidate.to_lowercase()),
                message: reason.availability_message(),
            }
        }
        Err(ValidatorError::Registry(err)) => {
            counter!("identifier_checks_total", "result" => "error").increment(1);
            error!(stage = "signup", identifier = %candidate, error = %err, "identifier check failed");
            return Err(ProblemResponse::internal("identifier_check_failed"));
        }
    };

    Ok((StatusCode::OK, Json(body)).into_response())
}
