// Main entry point for the sticker generation service

use sticker_workflow::{
    core::{Config, PackagingError, RunError},
    orchestration::{LedgerView, OrchestratorSettings, RunRequest, StartedRun, StickerOrchestrator},
    services::{ArchiveReceipt, DirectoryArchiver, GeminiClient, GenerationClient, StickerCompositor},
    utils::Metrics,
};

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<StickerOrchestrator>,
    archiver: Arc<DirectoryArchiver>,
    metrics: Metrics,
}

type ApiError = (StatusCode, String);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new().context("Failed to load configuration")?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!("sticker_workflow={}", level_name(config.log_level())));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== STICKER WORKFLOW ===");
    info!(
        "Config: models=[{}] strategy={} grid_batch={} parallel_batch={}",
        config.api.image_models.join(", "),
        config.default_strategy,
        config.pacing.grid_batch_size,
        config.pacing.parallel_batch_size
    );

    // Initialize metrics
    let metrics = Metrics::new();

    // Fails on a missing or malformed API key
    let gemini = Arc::new(
        GeminiClient::new(&config.api, Some(metrics.clone())).context("Generation client setup failed")?,
    );
    let generator = Arc::new(GenerationClient::from_config(
        gemini.clone(),
        &config.api,
        Some(metrics.clone()),
    ));

    info!("Loading caption fonts from {}...", config.compositor.fonts_dir);
    let compositor = Arc::new(StickerCompositor::new(config.compositor.clone()));

    let styles = config.style_catalog()?;
    info!("{} styles available", styles.styles().len());

    let orchestrator = Arc::new(StickerOrchestrator::new(
        generator,
        gemini,
        compositor,
        styles,
        config.pacing.clone(),
        OrchestratorSettings::from_config(&config),
        Some(metrics.clone()),
    ));

    let state = AppState {
        orchestrator,
        archiver: Arc::new(DirectoryArchiver::new(&config.packaging.output_dir)),
        metrics,
    };

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/styles", get(styles_endpoint))
        .route("/plan", post(plan_endpoint))
        .route("/runs", post(start_run))
        .route("/runs/cancel", post(cancel_run))
        .route("/runs/reset", post(reset_run))
        .route("/items/:id/regenerate", post(regenerate_item))
        .route("/ledger", get(ledger_endpoint))
        .route("/ledger/changes", get(ledger_changes_endpoint))
        .route("/package", post(package_endpoint))
        .with_state(state)
        .layer(DefaultBodyLimit::max(25 * 1024 * 1024)) // reference photos
        .layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /                        - Root endpoint");
    info!("  GET  /health                  - Health check");
    info!("  GET  /metrics                 - Prometheus metrics");
    info!("  GET  /stats                   - Detailed statistics");
    info!("  GET  /styles                  - Style catalog");
    info!("  POST /plan                    - Generate a caption plan");
    info!("  POST /runs                    - Start a run (multipart/form-data)");
    info!("  POST /runs/cancel             - Cancel the active run");
    info!("  POST /runs/reset              - Reset to setup");
    info!("  POST /items/:id/regenerate    - Regenerate one sticker");
    info!("  GET  /ledger                  - Live run state");
    info!("  GET  /ledger/changes?since=N  - Long-poll for ledger updates");
    info!("  POST /package                 - Bundle finished stickers");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn level_name(level: tracing::Level) -> &'static str {
    match level {
        tracing::Level::TRACE => "trace",
        tracing::Level::DEBUG => "debug",
        tracing::Level::INFO => "info",
        tracing::Level::WARN => "warn",
        tracing::Level::ERROR => "error",
    }
}

/// Map controller errors onto HTTP status codes
fn run_error(e: RunError) -> ApiError {
    let status = match &e {
        RunError::AlreadyRunning(_) => StatusCode::CONFLICT,
        RunError::EmptyPlan | RunError::UnknownStyle(_) | RunError::Reference(_) => StatusCode::BAD_REQUEST,
        RunError::UnknownItem(_) => StatusCode::NOT_FOUND,
        RunError::Planning(inner) | RunError::Fatal(inner) if inner.is_fatal() => StatusCode::UNAUTHORIZED,
        RunError::Planning(inner) if inner.is_quota() => StatusCode::TOO_MANY_REQUESTS,
        RunError::Planning(_) => StatusCode::BAD_GATEWAY,
        RunError::Packaging(PackagingError::NotTerminal(_) | PackagingError::NothingToPackage) => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let message = match &e {
        RunError::Planning(inner) | RunError::Fatal(inner) => inner.user_message(),
        other => other.to_string(),
    };
    if status.is_server_error() {
        error!("Request failed: {:?}", e);
    }
    (status, message)
}

async fn root() -> &'static str {
    "Sticker Workflow - Rust Version"
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "phase": state.orchestrator.phase(),
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
async fn stats_endpoint(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let snapshot = state.metrics.snapshot();
    serde_json::to_value(snapshot).map(Json).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serialize metrics: {}", e),
        )
    })
}

async fn styles_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "styles": state.orchestrator.styles().styles() }))
}

#[derive(Deserialize)]
struct PlanBody {
    count: usize,
    #[serde(default)]
    context: String,
}

async fn plan_endpoint(
    State(state): State<AppState>,
    Json(body): Json<PlanBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let plan = state
        .orchestrator
        .plan(body.count, &body.context)
        .await
        .map_err(run_error)?;
    Ok(Json(serde_json::json!({ "plan": plan })))
}

/// Start a run
///
/// # Request Format:
/// - multipart/form-data
/// - Field "config": JSON `{captions: [...], style_id?, strategy?}`
/// - Field "reference" (optional): reference photo (PNG/JPEG)
async fn start_run(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<StartedRun>, ApiError> {
    let mut request: Option<RunRequest> = None;
    let mut reference = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "config" => {
                let config_data = field
                    .text()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("Config read error: {}", e)))?;

                request = Some(serde_json::from_str(&config_data).map_err(|e| {
                    (
                        StatusCode::BAD_REQUEST,
                        format!("Invalid config JSON: {}", e),
                    )
                })?);
            }
            "reference" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("Read error: {}", e)))?;
                reference = Some(data.to_vec());
            }
            _ => {}
        }
    }

    let mut request = request.ok_or((StatusCode::BAD_REQUEST, "Missing config field".to_string()))?;
    request.reference_image = reference;

    let started = state
        .orchestrator
        .start_run(request)
        .await
        .map_err(run_error)?;
    Ok(Json(started))
}

async fn cancel_run(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cancelled = state.orchestrator.cancel();
    Json(serde_json::json!({ "cancelled": cancelled }))
}

async fn reset_run(State(state): State<AppState>) -> StatusCode {
    state.orchestrator.reset();
    StatusCode::NO_CONTENT
}

async fn regenerate_item(
    State(state): State<AppState>,
    Path(id): Path<usize>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run_id = state.orchestrator.regenerate(id).map_err(run_error)?;
    Ok(Json(serde_json::json!({ "run_id": run_id, "id": id })))
}

async fn ledger_endpoint(State(state): State<AppState>) -> Json<LedgerView> {
    Json(state.orchestrator.ledger_view())
}

#[derive(Deserialize)]
struct ChangesQuery {
    #[serde(default)]
    since: u64,
}

/// Long-poll: returns as soon as the ledger version passes `since`, or after 25s
async fn ledger_changes_endpoint(
    State(state): State<AppState>,
    Query(query): Query<ChangesQuery>,
) -> Json<LedgerView> {
    Json(
        state
            .orchestrator
            .wait_for_change(query.since, Duration::from_secs(25))
            .await,
    )
}

async fn package_endpoint(State(state): State<AppState>) -> Result<Json<ArchiveReceipt>, ApiError> {
    let receipt = state
        .orchestrator
        .package(state.archiver.as_ref())
        .await
        .map_err(run_error)?;
    info!("Bundle written to {}", receipt.location);
    Ok(Json(receipt))
}
