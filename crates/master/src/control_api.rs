//! HTTP control endpoints
//!
//! `POST {prefix}/setup`, `POST {prefix}/step`, `POST {prefix}/teardown`.
//! Failures come back as `{type, message}` with the type taken from a
//! fixed taxonomy, so callers can branch without parsing messages.

use crate::config::{BindingType, MasterConfig};
use crate::orchestrator::Master;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use stagehand_common::Error;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;

pub const API_VERSION: u64 = 1;

#[derive(Debug, Deserialize)]
struct SetupRequest {
    version: u64,
    test: SetupTest,
}

#[derive(Debug, Deserialize)]
struct SetupTest {
    id: String,
    scenario: ScenarioRef,
    binding: BindingRef,
}

#[derive(Debug, Deserialize)]
struct ScenarioRef {
    name: String,
}

// The type stays a free-form string here so an unsupported value maps to
// the taxonomy instead of a deserialization rejection.
#[derive(Debug, Deserialize)]
struct BindingRef {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct TestRequest {
    version: u64,
    test: TestRef,
}

#[derive(Debug, Deserialize)]
struct TestRef {
    id: String,
}

struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "type": self.code, "message": self.message })),
        )
            .into_response()
    }
}

pub fn router(master: Arc<Master>) -> Router {
    let prefix = &master.config().endpoints_prefix;
    Router::new()
        .route(&format!("{prefix}/setup"), post(setup))
        .route(&format!("{prefix}/step"), post(step))
        .route(&format!("{prefix}/teardown"), post(teardown))
        .layer(TraceLayer::new_for_http())
        .with_state(master)
}

async fn setup(
    State(master): State<Arc<Master>>,
    Json(request): Json<SetupRequest>,
) -> Result<Response, ApiError> {
    check_version(request.version)?;
    let binding = parse_binding(&request.test.binding.kind, master.config())?;

    let port = master
        .setup(&request.test.id, &request.test.scenario.name, binding)
        .await
        .map_err(api_error)?;

    let binding_json = match binding {
        BindingType::Port => json!({ "port": port }),
        BindingType::Header => json!({
            "header": {
                "name": master.config().binding_header_name,
                "value": request.test.id,
            }
        }),
    };
    let body = json!({
        "test": {
            "binding": binding_json,
            "timeout": master.config().test_duration_timeout,
        }
    });
    Ok((StatusCode::OK, Json(body)).into_response())
}

async fn step(
    State(master): State<Arc<Master>>,
    Json(request): Json<TestRequest>,
) -> Result<StatusCode, ApiError> {
    check_version(request.version)?;
    master.step(&request.test.id).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn teardown(
    State(master): State<Arc<Master>>,
    Json(request): Json<TestRequest>,
) -> Result<StatusCode, ApiError> {
    check_version(request.version)?;
    master.teardown(&request.test.id).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

fn check_version(version: u64) -> Result<(), ApiError> {
    if version != API_VERSION {
        return Err(ApiError {
            status: StatusCode::BAD_REQUEST,
            code: "unsupported-api-version",
            message: format!("API version {version} is not supported"),
        });
    }
    Ok(())
}

fn parse_binding(kind: &str, config: &MasterConfig) -> Result<BindingType, ApiError> {
    let binding = match kind {
        "port" => BindingType::Port,
        "header" => BindingType::Header,
        _ => return Err(unsupported_binding(kind)),
    };
    if !config.allows_binding(binding) {
        return Err(unsupported_binding(kind));
    }
    Ok(binding)
}

fn unsupported_binding(kind: &str) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        code: "unsupported-binding-type",
        message: format!("Binding type \"{kind}\" is not supported"),
    }
}

fn api_error(err: Error) -> ApiError {
    let (status, code) = match &err {
        Error::DuplicateTest { .. } => (StatusCode::BAD_REQUEST, "duplicate-test"),
        Error::ConcurrencyLimit { .. } => (StatusCode::BAD_REQUEST, "test-concurrency-limit"),
        Error::UnknownScenario { .. } => (StatusCode::BAD_REQUEST, "unknown-scenario"),
        Error::UnknownTest { .. } => (StatusCode::BAD_REQUEST, "unknown-test"),
        Error::UnexpectedStep { .. } => (StatusCode::BAD_REQUEST, "unexpected-step"),
        Error::SetupFailed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "setup-failed"),
        Error::StepFailed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "step-failed"),
        Error::TeardownFailed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "teardown-error"),
        other => {
            error!("Unexpected error serving control request: {}", other);
            (StatusCode::INTERNAL_SERVER_ERROR, "unexpected-error")
        }
    };
    ApiError {
        status,
        code,
        message: err.to_string(),
    }
}
