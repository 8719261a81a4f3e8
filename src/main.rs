mod garment;
mod http;
mod idempotency;
mod jobs;
mod llm;
mod media;
mod metrics;
mod models;
mod pipeline;
mod replicate;
mod retry;
mod security;
mod templates;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use garment::{CategoryChoice, Classification, EnhancedListing};
use models::{
    BatchStagingRequest, BatchStagingResponse, CategoryStageRequest, ClassifyStageRequest,
    DescribeStageRequest, EnhanceStageRequest, ErrorBody, StagingRequest, StagingResponse,
    TransformRequest, TransformResponse,
};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use security::{AuthContext, AuthState, require_api_auth};
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;
// metrics macros disabled in demo build
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "restage.api", "server crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let auth_state = AuthState::from_env();
    let pipeline = Pipeline::from_env();
    let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone());
    let openapi_raw = include_str!("../docs/openapi.yaml");
    let openapi: serde_json::Value =
        serde_yaml::from_str(openapi_raw).unwrap_or(serde_json::json!({"openapi":"3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());
    let state = AppState {
        pipeline,
        queue,
        openapi: Arc::new(openapi),
        idempotency: Arc::new(Mutex::new(HashMap::new())),
        prometheus_handle,
        redis,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/transforms", post(create_transform))
        .route("/staging", post(create_staging))
        .route("/staging/batch", post(create_staging_batch))
        .nest(
            "/stages",
            Router::new()
                .route("/classify", post(stage_classify))
                .route("/describe", post(stage_describe))
                .route("/enhance", post(stage_enhance))
                .route("/category", post(stage_category)),
        )
        .nest(
            "/jobs",
            Router::new()
                .route("/transforms", post(enqueue_transform_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "restage.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: jobs::JobQueue,
    openapi: Arc<serde_json::Value>,
    idempotency: Arc<Mutex<HashMap<String, TransformResponse>>>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
///
/// Returns a small JSON payload with `status` and `service`.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "restage-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Pipeline(PipelineError::invalid_input(
                "docs",
                "unauthorized",
            )));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Restage API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

fn body_limit_from_env() -> usize {
    std::env::var("BODY_LIMIT_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(2 * 1024 * 1024)
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(axum::http::StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

/// Run the photo → staged product image pipeline.
///
/// - Method: `POST`
/// - Path: `/transforms`
/// - Auth: `Authorization: Bearer <key>` or `X-Restage-Key: <key>`
/// - Body: `TransformRequest`
/// - Response: `TransformResponse` (staged image + per‑stage transcript)
async fn create_transform(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<TransformRequest>,
) -> Result<Json<TransformResponse>, AppError> {
    crate::metrics::inc_requests("/transforms");
    info!(
        target = "restage.api",
        org_id = %context.org_id,
        api_key = %context.api_key_id,
        "transform pipeline invoked",
    );

    if let Some(key) = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        if let Some(client) = &state.redis {
            if let Some(existing) = idempotency::redis_get(client, &key).await {
                return Ok(Json(existing));
            }
            let response = state.pipeline.run_vision(payload).await?;
            let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(3600);
            idempotency::redis_set(client, &key, &response, ttl).await;
            return Ok(Json(response));
        }
        if let Some(existing) = state.idempotency.lock().await.get(&key).cloned() {
            return Ok(Json(existing));
        }
        let response = state.pipeline.run_vision(payload).await?;
        state.idempotency.lock().await.insert(key, response.clone());
        return Ok(Json(response));
    }

    let response = state.pipeline.run_vision(payload).await?;

    Ok(Json(response))
}

/// Restage one photo without the analysis pass.
///
/// - Method: `POST`
/// - Path: `/staging`
/// - Body: `StagingRequest`
/// - Response: `StagingResponse`
async fn create_staging(
    State(state): State<AppState>,
    Json(payload): Json<StagingRequest>,
) -> Result<Json<StagingResponse>, AppError> {
    crate::metrics::inc_requests("/staging");
    let response = state.pipeline.run_staging(payload).await?;
    Ok(Json(response))
}

/// Restage a set of photos with one shared instruction.
///
/// - Method: `POST`
/// - Path: `/staging/batch`
/// - Body: `BatchStagingRequest`
/// - Response: `BatchStagingResponse` (per-item outcomes, input order kept)
async fn create_staging_batch(
    State(state): State<AppState>,
    Json(payload): Json<BatchStagingRequest>,
) -> Result<Json<BatchStagingResponse>, AppError> {
    crate::metrics::inc_requests("/staging/batch");
    let response = state.pipeline.run_staging_batch(payload).await?;
    Ok(Json(response))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_transform_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<TransformRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/transforms");
    let id = state
        .queue
        .enqueue_transform(payload, context)
        .await
        .map_err(|err| AppError::Pipeline(PipelineError::internal("enqueue", err.error)))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::Pipeline(PipelineError::invalid_input(
            "jobs",
            "invalid_job_id",
        )));
    };
    if let Some(info) = state.queue.get(uuid).await {
        Ok(Json(info))
    } else {
        Err(AppError::Pipeline(PipelineError::invalid_input(
            "jobs",
            "not_found",
        )))
    }
}
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ErrorBody {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
// -------- Stage endpoints (manual granular control) --------
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ClassifyResponse {
    classification: Classification,
}

async fn stage_classify(
    State(state): State<AppState>,
    Json(req): Json<ClassifyStageRequest>,
) -> Result<Json<ClassifyResponse>, AppError> {
    crate::metrics::inc_requests("/stages/classify");
    let classification = state.pipeline.stage_classify(&req).await?;
    Ok(Json(ClassifyResponse { classification }))
}

#[derive(Debug, Serialize)]
struct DescribeResponse {
    description: String,
}

async fn stage_describe(
    State(state): State<AppState>,
    Json(req): Json<DescribeStageRequest>,
) -> Result<Json<DescribeResponse>, AppError> {
    crate::metrics::inc_requests("/stages/describe");
    let description = state.pipeline.stage_describe(&req).await?;
    Ok(Json(DescribeResponse { description }))
}

#[derive(Debug, Serialize)]
struct EnhanceResponse {
    listing: EnhancedListing,
}

async fn stage_enhance(
    State(state): State<AppState>,
    Json(req): Json<EnhanceStageRequest>,
) -> Result<Json<EnhanceResponse>, AppError> {
    crate::metrics::inc_requests("/stages/enhance");
    let listing = state.pipeline.stage_enhance(&req).await?;
    Ok(Json(EnhanceResponse { listing }))
}

#[derive(Debug, Serialize)]
struct CategoryResponse {
    selection: CategoryChoice,
}

async fn stage_category(
    State(state): State<AppState>,
    Json(req): Json<CategoryStageRequest>,
) -> Result<Json<CategoryResponse>, AppError> {
    crate::metrics::inc_requests("/stages/category");
    let selection = state.pipeline.stage_category(&req).await?;
    Ok(Json(CategoryResponse { selection }))
}
