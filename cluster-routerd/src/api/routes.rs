use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared::protocol::FILE_PART;
use shared::types::{ModelFormat, ModelServiceKey, ServiceInstance, WatchTarget};
use crate::dispatcher::{ClusterDispatcher, InferenceRequest, InferenceResult};
use crate::error::{DispatchError, MonitorError, RegistryError};
use crate::monitor::ReachabilityMonitor;
use crate::registry::InstanceFilter;

/// Largest accepted upload
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<ClusterDispatcher>,
    pub monitor: ReachabilityMonitor,
}

/// Error response: status code plus `{"error": message}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        let status = match &e {
            DispatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::NoInstanceFound(_) => StatusCode::NOT_FOUND,
            DispatchError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            tracing::error!("Dispatch failed: {}", e);
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<MonitorError> for ApiError {
    fn from(e: MonitorError) -> Self {
        let status = match &e {
            MonitorError::NotWatched(_) => StatusCode::NOT_FOUND,
            MonitorError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        tracing::error!("Registry lookup failed: {}", e);
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: e.to_string(),
        }
    }
}

#[derive(Deserialize)]
pub struct InstanceQuery {
    #[serde(default)]
    pub all: bool,
}

#[derive(Deserialize)]
pub struct WatchRequest {
    pub address: String,
}

#[derive(Serialize, Deserialize)]
pub struct WatchStatus {
    pub name: String,
    pub online: bool,
}

#[derive(Deserialize)]
pub struct IntervalRequest {
    pub seconds: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/models/:model_id/inference", post(run_inference))
        .route("/v1/services/:service/instances", get(get_instances))
        .route("/v1/watch", get(list_targets))
        .route("/v1/watch/:name", put(watch_target).get(get_target).delete(unwatch_target))
        .route("/v1/monitor/interval", put(set_interval))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Multipart fields: `file` (required), `version` (required), `format` or a
/// `model_path` hint, and any other text field as an inference parameter.
async fn run_inference(
    State(state): State<AppState>,
    Path(model_id): Path<u64>,
    mut multipart: Multipart,
) -> Result<Json<InferenceResult>, ApiError> {
    // ids are database keys starting at 1
    if model_id == 0 {
        return Err(ApiError::bad_request("invalid model_id"));
    }

    let mut file: Option<(String, Option<String>, Vec<u8>)> = None;
    let mut version: Option<String> = None;
    let mut format: Option<String> = None;
    let mut model_path: Option<String> = None;
    let mut parameters = HashMap::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();

        if name == FILE_PART {
            let file_name = field.file_name().unwrap_or("upload").to_string();
            let content_type = field.content_type().map(str::to_string);
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(format!("failed to read file: {}", e)))?;
            file = Some((file_name, content_type, data.to_vec()));
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| ApiError::bad_request(format!("failed to read field {}: {}", name, e)))?;

        match name.as_str() {
            "version" => version = Some(value),
            "format" => format = Some(value),
            "model_path" => model_path = Some(value),
            _ => {
                parameters.insert(name, value);
            }
        }
    }

    let version = version
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing field: version"))?;

    let format = match (format, model_path) {
        (Some(format), _) => format
            .parse::<ModelFormat>()
            .map_err(|e| ApiError::bad_request(e.to_string()))?,
        (None, Some(hint)) => ModelFormat::infer_from_path(&hint),
        (None, None) => ModelFormat::Pytorch,
    };

    let content_type = file.as_ref().and_then(|(_, ct, _)| ct.clone());
    let mut request = InferenceRequest::new(None, file.map(|(name, _, data)| (name, data)), parameters)?;
    if let Some(content_type) = content_type {
        request = request.with_content_type(content_type);
    }

    let key = ModelServiceKey::new(model_id, format, version);
    let result = state.dispatcher.dispatch(&key, request).await?;
    Ok(Json(result))
}

async fn get_instances(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Query(params): Query<InstanceQuery>,
) -> Result<Json<Vec<ServiceInstance>>, ApiError> {
    let filter = if params.all { InstanceFilter::All } else { InstanceFilter::HealthyOnly };
    let instances = state
        .dispatcher
        .registry()
        .resolve_instances(&service, filter)
        .await?;
    Ok(Json(instances))
}

async fn list_targets(State(state): State<AppState>) -> Result<Json<Vec<WatchTarget>>, ApiError> {
    Ok(Json(state.monitor.targets().await?))
}

async fn watch_target(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<WatchRequest>,
) -> Result<Json<WatchStatus>, ApiError> {
    if body.address.trim().is_empty() {
        return Err(ApiError::bad_request("address must not be empty"));
    }
    let online = state.monitor.watch(&name, body.address.trim()).await?;
    Ok(Json(WatchStatus { name, online }))
}

async fn get_target(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<WatchStatus>, ApiError> {
    let online = state.monitor.is_online(&name).await?;
    Ok(Json(WatchStatus { name, online }))
}

async fn unwatch_target(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.monitor.unwatch(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_interval(
    State(state): State<AppState>,
    Json(body): Json<IntervalRequest>,
) -> Result<StatusCode, ApiError> {
    if body.seconds == 0 {
        return Err(ApiError::bad_request("seconds must be at least 1"));
    }
    state.monitor.set_interval(Duration::from_secs(body.seconds));
    Ok(StatusCode::NO_CONTENT)
}
