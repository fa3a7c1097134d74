use std::sync::Arc;

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::models::{Links, NotReadyResponse, StatusQuery, StatusResponse, UploadResponse};
use crate::jobs::metrics::render_prometheus;
use crate::jobs::{ArtifactResponse, ConversionPipeline, JobResolver, MetricsRepo};

pub mod error;
pub mod models;

/// Multipart field carrying the uploaded image.
pub const IMAGE_FIELD: &str = "image";

#[derive(Clone)]
pub struct ApiState {
    pub pipeline: ConversionPipeline,
    pub resolver: JobResolver,
    pub metrics: MetricsRepo,
    pub public_base_url: Arc<str>,
}

impl ApiState {
    fn links(&self, id: Uuid) -> Links {
        Links::for_job(&self.public_base_url, id)
    }
}

pub fn router(state: ApiState, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route(
            "/upload",
            post(upload).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/status", get(status))
        .route("/image/:id", get(image))
        .route("/model/:id", get(model))
        // Metrics
        .route("/metrics", get(metrics))
        .route("/metrics/prom", get(metrics_prom))
        // Health
        .route("/health", get(health))
        .fallback(not_found)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn multipart_err(e: MultipartError) -> ApiError {
    match e.status() {
        StatusCode::PAYLOAD_TOO_LARGE => ApiError::PayloadTooLarge(e.body_text()),
        _ => ApiError::BadRequest(format!("malformed multipart body: {}", e.body_text())),
    }
}

/// Pulls the `image` file part out of the body. Other parts are skipped.
async fn read_image_field(
    mut multipart: Multipart,
) -> Result<(Bytes, Option<String>), ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_err)? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        if field.file_name().is_none() {
            return Err(ApiError::BadRequest(format!(
                "field `{IMAGE_FIELD}` must be a file"
            )));
        }
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(multipart_err)?;
        return Ok((bytes, content_type));
    }

    Err(ApiError::BadRequest(format!(
        "missing file field `{IMAGE_FIELD}`"
    )))
}

pub async fn upload(
    State(state): State<ApiState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let multipart = multipart.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let (bytes, content_type) = read_image_field(multipart).await?;

    let handle = state
        .pipeline
        .ingest(bytes, content_type.as_deref())
        .await?;

    let links = state.links(handle.id);
    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            id: handle.id,
            status: handle.state,
            image_url: links.image_url,
            model_url: links.model_url,
        }),
    ))
}

pub async fn status(
    State(state): State<ApiState>,
    Query(q): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let raw = q
        .id
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("query parameter `id` is required".into()))?;
    let id = Uuid::parse_str(raw.trim())
        .map_err(|_| ApiError::BadRequest(format!("`{raw}` is not a valid job id")))?;

    let status = state.resolver.get_status(id).await?;
    Ok(Json(StatusResponse::new(status, state.links(id))))
}

// Path ids that do not parse cannot name a job.
fn path_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound(format!("job {raw} not found")))
}

pub async fn image(
    State(state): State<ApiState>,
    Path(raw): Path<String>,
) -> Result<Response, ApiError> {
    let id = path_id(&raw)?;
    let asset = state.resolver.get_image(id).await?;
    Ok(([(header::CONTENT_TYPE, asset.content_type)], asset.bytes).into_response())
}

pub async fn model(
    State(state): State<ApiState>,
    Path(raw): Path<String>,
) -> Result<Response, ApiError> {
    let id = path_id(&raw)?;
    match state.resolver.get_artifact(id).await? {
        ArtifactResponse::Ready(asset) => {
            Ok(([(header::CONTENT_TYPE, asset.content_type)], asset.bytes).into_response())
        }
        ArtifactResponse::NotReady { state: job_state } => Ok((
            StatusCode::ACCEPTED,
            Json(NotReadyResponse {
                id,
                status: job_state,
            }),
        )
            .into_response()),
        ArtifactResponse::Failed { error } => Err(ApiError::ConversionFailed(error)),
    }
}

pub async fn metrics(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let snapshot = state.metrics.snapshot().await?;
    Ok(Json(snapshot).into_response())
}

pub async fn metrics_prom(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let snapshot = state.metrics.snapshot().await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render_prometheus(&snapshot),
    )
        .into_response())
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn not_found() -> ApiError {
    ApiError::NotFound("no such route".into())
}
