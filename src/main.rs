// Main entry point for the batch background-removal service

use clearcut::{
    core::{config::Config, errors::{ExportError, StartError}, types::{IncomingFile, Quality}},
    engine::{BatchEngine, EngineHandle, EngineOptions},
    services::{ledger, segmentation::OnnxSegmenterProvider, store},
    utils::Metrics,
};

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    engine: EngineHandle,
    metrics: Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new().expect("Failed to load configuration"));

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "clearcut={},ort=off",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== CLEARCUT BATCH ENGINE ===");
    info!(
        "Config: workers={} max_dimension={} images/credit={}",
        config.pool_size(),
        config.max_dimension(),
        config.images_per_credit()
    );

    // Initialize metrics
    let metrics = Metrics::new();

    // Wire collaborators and spawn the engine
    let provider = Arc::new(OnnxSegmenterProvider::from_config(&config));
    let gate = ledger::gate_from_config(&config.ledger)?;
    let result_store = store::store_from_config(&config.storage)?;

    info!("Spawning batch engine...");
    let engine = BatchEngine::spawn(
        EngineOptions::from_config(&config),
        provider,
        gate,
        result_store,
        metrics.clone(),
    )?;

    let state = AppState {
        engine,
        metrics,
    };

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Create router with queue actions and monitoring endpoints
    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/queue", get(queue_snapshot))
        .route("/queue/files", post(add_files))
        .route("/queue/start", post(start_batch))
        .route("/queue/clear", post(clear_queue))
        .route("/queue/archive", get(download_archive))
        .with_state(state)
        .layer(DefaultBodyLimit::max(200 * 1024 * 1024)) // 200MB for large batches
        .layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /               - Root endpoint");
    info!("  GET  /health         - Health check");
    info!("  GET  /metrics        - Prometheus metrics");
    info!("  GET  /stats          - Detailed statistics");
    info!("  GET  /queue          - Queue snapshot and balance");
    info!("  POST /queue/files    - Add images (multipart/form-data)");
    info!("  POST /queue/start    - Start processing queued images");
    info!("  POST /queue/clear    - Clear the queue");
    info!("  GET  /queue/archive  - Download all results as ZIP");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn root() -> &'static str {
    "ClearCut batch background-removal engine"
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let snapshot = state.metrics.snapshot();
    serde_json::to_value(snapshot).map(Json).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serialize metrics: {}", e),
        )
    })
}

/// Queue snapshot plus the current credit balance
async fn queue_snapshot(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    state.metrics.record_endpoint_request("/queue");

    let snapshot = state.engine.snapshot().await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Snapshot failed: {}", e),
        )
    })?;

    // Balance is advisory for the UI; a ledger hiccup must not break the view
    let balance = state.engine.balance().await.ok();

    Ok(Json(serde_json::json!({
        "queue": snapshot,
        "balance": balance,
    })))
}

/// Add images endpoint
///
/// # Request Format:
/// - multipart/form-data
/// - Field "images": One or more image files (PNG/JPEG/WebP)
///
/// # Response:
/// AddReport JSON: accepted count and per-file rejections
async fn add_files(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<clearcut::AddReport>, (StatusCode, String)> {
    state.metrics.record_endpoint_request("/queue/files");

    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e)))?
    {
        if field.name().unwrap_or("") != "images" {
            continue;
        }

        let file_name = field.file_name().unwrap_or("unknown.png").to_string();
        let content_type = field.content_type().map(|s| s.to_string());
        let data = field
            .bytes()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Read error: {}", e)))?;

        files.push(IncomingFile {
            file_name,
            content_type,
            bytes: data.to_vec(),
        });
    }

    if files.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No images provided".to_string()));
    }

    info!("Received {} file(s)", files.len());

    let report = state.engine.add_files(files).await.map_err(|e| {
        error!("Batch add failed: {:?}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Add failed: {}", e),
        )
    })?;

    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct StartQuery {
    quality: Option<String>,
}

/// Start processing everything currently queued
async fn start_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StartQuery>,
) -> Result<Json<clearcut::StartReceipt>, (StatusCode, String)> {
    state.metrics.record_endpoint_request("/queue/start");

    let owner = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let quality = match query.quality.as_deref() {
        Some(raw) => Quality::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("Unknown quality '{}'", raw),
            )
        })?,
        None => Quality::default(),
    };

    let receipt = state.engine.start(owner, quality).await.map_err(|e| {
        let status = match &e {
            StartError::Unauthenticated => StatusCode::UNAUTHORIZED,
            StartError::EmptyQueue => StatusCode::BAD_REQUEST,
            StartError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            StartError::Ledger(_) => StatusCode::BAD_GATEWAY,
            StartError::EngineGone => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, e.to_string())
    })?;

    Ok(Json(receipt))
}

/// Clear the queue
async fn clear_queue(State(state): State<AppState>) -> StatusCode {
    state.metrics.record_endpoint_request("/queue/clear");
    state.engine.clear();
    StatusCode::NO_CONTENT
}

/// Download every finished cutout as one ZIP archive
async fn download_archive(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state.metrics.record_endpoint_request("/queue/archive");

    let archive = state.engine.bundle().await.map_err(|e| {
        let status = match &e {
            ExportError::NothingToExport => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, e.to_string())
    })?;

    Ok((
        StatusCode::OK,
        [
            ("Content-Type", "application/zip"),
            (
                "Content-Disposition",
                "attachment; filename=\"clearcut-results.zip\"",
            ),
        ],
        archive,
    ))
}
