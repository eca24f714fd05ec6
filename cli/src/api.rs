//! JSON control API over a [`HostingService`].

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use nimbus_foundry::{FoundryError, HostingService};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type AppState = Arc<HostingService>;

#[derive(Debug)]
pub struct ApiError(FoundryError);

impl From<FoundryError> for ApiError {
    fn from(e: FoundryError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn status_for(e: &FoundryError) -> StatusCode {
    match e {
        FoundryError::InvalidTargetId(_) => StatusCode::BAD_REQUEST,
        FoundryError::InvalidSpecification(_)
        | FoundryError::MissingBaseUrl
        | FoundryError::ToolExtractionFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        FoundryError::ServerNotFound(_) => StatusCode::NOT_FOUND,
        FoundryError::NotRunning(_)
        | FoundryError::AlreadyRunning(_)
        | FoundryError::AlreadyPaused(_)
        | FoundryError::NotPaused(_) => StatusCode::CONFLICT,
        FoundryError::PortExhaustion(_, _) => StatusCode::SERVICE_UNAVAILABLE,
        FoundryError::HealthCheckFailed(_, _) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(ErrorResponse { error: self.0.to_string() })).into_response()
    }
}

/// `POST /targets/:id` body. `spec` is either the document itself or its
/// JSON/YAML text.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBody {
    #[serde(default)]
    pub name: Option<String>,
    pub spec: Value,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl SubmitBody {
    fn raw_spec(&self) -> Result<Vec<u8>, ApiError> {
        match &self.spec {
            Value::String(text) => Ok(text.clone().into_bytes()),
            other => serde_json::to_vec(other)
                .map_err(|e| FoundryError::InvalidSpecification(e.to_string()).into()),
        }
    }
}

pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/targets", get(list_targets))
        .route(
            "/targets/:id",
            get(target_status).post(submit_target).delete(cleanup_target),
        )
        .route("/targets/:id/:action", post(target_action))
        .with_state(service)
}

async fn list_targets(State(service): State<AppState>) -> Result<Response, ApiError> {
    Ok(Json(service.list().await?).into_response())
}

async fn target_status(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    Ok(Json(service.status(&id).await?).into_response())
}

async fn submit_target(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SubmitBody>,
) -> Result<Response, ApiError> {
    let raw = body.raw_spec()?;
    let name = body.name.clone().unwrap_or_else(|| id.clone());
    let receipt = service
        .submit(&id, &name, &raw, body.base_url.as_deref())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)).into_response())
}

async fn cleanup_target(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    service.cleanup(&id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn target_action(
    State(service): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let record = match action.as_str() {
        "start" => service.start(&id).await?,
        "stop" => service.stop(&id).await?,
        "restart" => service.restart(&id).await?,
        "pause" => service.pause(&id).await?,
        "unpause" => service.unpause(&id).await?,
        "cancel" => {
            let cancelled = service.cancel_generation(&id);
            return Ok(Json(serde_json::json!({ "cancelled": cancelled })).into_response());
        }
        "resume" => {
            service.resume_generation(&id).await?;
            let job = service.pipeline().job(&id);
            return Ok((StatusCode::ACCEPTED, Json(job)).into_response());
        }
        _ => return Ok(StatusCode::NOT_FOUND.into_response()),
    };
    Ok(Json(record).into_response())
}
