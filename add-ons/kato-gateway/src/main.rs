//! Axum-based API gateway for the memory-and-prediction engine. Config-driven via `Settings`.

use axum::{
    extract::{Json, Path, State},
    response::sse::{Event as SseEvent, Sse},
    routing::{get, post},
    Router,
};
use axum::http::{Method, StatusCode};
use kato_core::processor::{LearnOutcome, ObserveOutcome};
use kato_core::settings::{Settings, SessionConfigPatch};
use kato_core::store::{SledPatternStore, StoreStats};
use kato_core::{BloomCache, KatoError, Prediction, Processor, SessionManager, SessionStore};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::field::Visit;
use tracing_subscriber::layer::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tokio::sync::broadcast;

/// Captures the "message" field from a tracing event.
struct MessageCollector<'a>(&'a mut String);

impl Visit for MessageCollector<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.0 = format!("{:?}", value);
        }
    }
}

/// Sends each tracing event as a line to a broadcast channel for SSE log streaming.
#[derive(Clone)]
struct LogBroadcastLayer {
    tx: broadcast::Sender<String>,
}

impl LogBroadcastLayer {
    fn new(tx: broadcast::Sender<String>) -> Self {
        Self { tx }
    }
}

impl<S> tracing_subscriber::Layer<S> for LogBroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut message = String::new();
        event.record(&mut MessageCollector(&mut message));
        let line = format!("{} [{}] {}", event.metadata().level(), event.metadata().target(), message);
        let _ = self.tx.send(line);
    }
}

/// Pre-flight check: verify the pattern store and session store are accessible and the port is free.
fn run_verify() -> Result<(), String> {
    let settings = Settings::load().map_err(|e| format!("config load failed: {e}"))?;
    let storage_root = std::env::var("KATO_STORAGE_PATH").unwrap_or_else(|_| "data".to_string());
    let storage = std::path::Path::new(&storage_root);
    let pattern_path = storage.join("kato_patterns");
    let session_path = storage.join("kato_sessions");

    print!("Checking kato_patterns store... ");
    let patterns = SledPatternStore::open_path(&pattern_path).map_err(|e| format!("kato_patterns LOCKED or inaccessible: {e}"))?;
    patterns.health_check().map_err(|e| format!("kato_patterns health check failed: {e}"))?;
    drop(patterns);
    println!("OK");

    print!("Checking kato_sessions store... ");
    let sessions = SessionStore::open_path(&session_path).map_err(|e| format!("kato_sessions LOCKED or inaccessible: {e}"))?;
    drop(sessions);
    println!("OK");

    let port = std::env::var("KATO_PORT").ok().and_then(|s| s.parse::<u16>().ok()).unwrap_or(8080);
    print!("Checking port {port}... ");
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    match std::net::TcpListener::bind(addr) {
        Ok(listener) => {
            drop(listener);
            println!("OK (available)");
        }
        Err(e) => return Err(format!("port {port} BLOCKED: {e}")),
    }

    println!("\n✅ SUCCESS: All systems GO. Ready to start gateway.");
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[kato-gateway] .env not loaded: {e} (using system environment)");
    }

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--verify") {
        match run_verify() {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                eprintln!("❌ PRE-FLIGHT FAILED: {e}");
                std::process::exit(1);
            }
        }
    }

    let (log_tx, _) = broadcast::channel(1000);
    let log_layer = LogBroadcastLayer::new(log_tx.clone());

    let settings = Settings::load().expect("load Settings");

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| settings.log_level.clone())))
        .with(tracing_subscriber::fmt::layer())
        .with(log_layer)
        .init();

    let storage_root = std::env::var("KATO_STORAGE_PATH").unwrap_or_else(|_| "data".to_string());
    let storage = std::path::Path::new(&storage_root);
    let pattern_path = storage.join("kato_patterns");
    let session_path = storage.join("kato_sessions");

    let store: Arc<dyn kato_core::PatternStore> = Arc::new(SledPatternStore::open_path(&pattern_path).expect("open kato_patterns"));
    let sessions = Arc::new(SessionManager::new(SessionStore::open_path(&session_path).expect("open kato_sessions"), settings.session_auto_extend));
    let processor = Arc::new(Processor::new(store, sessions, Arc::new(BloomCache::new()), settings.clone()));

    tracing::info!(strict_mode = settings.strict_mode, "kato-gateway starting");

    let port = std::env::var("KATO_PORT").ok().and_then(|s| s.parse::<u16>().ok()).unwrap_or(8080);
    let state = AppState { processor, settings: Arc::new(settings), log_tx };
    let app = build_app(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await.expect("bind listener");
    axum::serve(listener, app).await.expect("serve");
}

fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS, Method::PUT, Method::DELETE])
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/:session_id", axum::routing::delete(delete_session))
        .route("/v1/sessions/:session_id/observe", post(observe))
        .route("/v1/sessions/:session_id/stm", get(get_stm))
        .route("/v1/sessions/:session_id/learn", post(learn))
        .route("/v1/sessions/:session_id/predictions", get(get_predictions))
        .route("/v1/sessions/:session_id/clear_stm", post(clear_stm))
        .route("/v1/sessions/:session_id/clear_all", post(clear_all))
        .route("/v1/sessions/:session_id/config", post(update_config))
        .route("/v1/sessions/:session_id/extend", post(extend_session))
        .route("/v1/sessions/:session_id/status", get(session_status))
        .route("/v1/health", get(health))
        .route("/v1/logs", get(logs_stream))
        .with_state(state)
        .layer(cors)
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) processor: Arc<Processor>,
    pub(crate) settings: Arc<Settings>,
    pub(crate) log_tx: broadcast::Sender<String>,
}

/// The error kinds a `KatoError` maps onto at the wire boundary (§7).
fn status_for(err: &KatoError) -> StatusCode {
    match err {
        KatoError::Input(_) | KatoError::Config(_) => StatusCode::BAD_REQUEST,
        KatoError::Session(kato_core::error::SessionError::NotFound { .. }) => StatusCode::NOT_FOUND,
        KatoError::Session(kato_core::error::SessionError::Busy { .. }) => StatusCode::CONFLICT,
        KatoError::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
        KatoError::TwoStringRule(_) => StatusCode::UNPROCESSABLE_ENTITY,
        KatoError::Filter(kato_core::error::FilterError::Overflow { .. }) => StatusCode::INSUFFICIENT_STORAGE,
        KatoError::Filter(_) | KatoError::Metric(_) | KatoError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: KatoError) -> (StatusCode, axum::Json<serde_json::Value>) {
    let status = status_for(&err);
    (status, axum::Json(serde_json::json!({ "error": err.to_string() })))
}

/// GET /v1/health – liveness check.
async fn health(State(state): State<AppState>) -> (StatusCode, axum::Json<serde_json::Value>) {
    let healthy = state.processor.store_healthy();
    let strict = state.processor.strict_mode();
    let status = if healthy { "ok" } else { "degraded" };
    let code = if !healthy && strict { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
    if !healthy {
        tracing::warn!(strict_mode = strict, "pattern store health check failed");
    }
    (code, axum::Json(serde_json::json!({ "status": status })))
}

/// GET /v1/logs – Server-Sent Events stream of gateway logs (tracing output).
async fn logs_stream(
    State(state): State<AppState>,
) -> Sse<impl futures_util::Stream<Item = Result<SseEvent, std::convert::Infallible>> + Send + 'static> {
    use async_stream::stream;
    let mut rx = state.log_tx.subscribe();
    let stream = stream! {
        loop {
            tokio::select! {
                r = rx.recv() => match r {
                    Ok(line) => yield Ok(SseEvent::default().data(line)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        yield Ok(SseEvent::default().data(format!("... {n} log lines dropped")));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tokio::time::sleep(Duration::from_secs(15)) => {
                    yield Ok(SseEvent::default().comment("keepalive"));
                }
            }
        }
    };
    Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::new().interval(Duration::from_secs(15)).text("keepalive"))
}

#[derive(serde::Deserialize)]
struct CreateSessionRequest {
    node_id: String,
    #[serde(default)]
    ttl_secs: Option<u64>,
    #[serde(default)]
    config_override: SessionConfigPatch,
}

/// POST /v1/sessions – `create_session` (§6.2).
async fn create_session(State(state): State<AppState>, Json(req): Json<CreateSessionRequest>) -> Result<axum::Json<serde_json::Value>, (StatusCode, axum::Json<serde_json::Value>)> {
    let ttl = req.ttl_secs.or(if state.settings.session_auto_extend { Some(state.settings.session_ttl_secs) } else { None });
    let session_id = state.processor.create_session(&req.node_id, ttl, req.config_override).map_err(error_response)?;
    Ok(axum::Json(serde_json::json!({ "session_id": session_id })))
}

/// DELETE /v1/sessions/:session_id – `delete_session` (§6.2).
async fn delete_session(State(state): State<AppState>, Path(session_id): Path<String>) -> Result<StatusCode, (StatusCode, axum::Json<serde_json::Value>)> {
    state.processor.delete_session(&session_id).map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(serde::Deserialize)]
struct ObserveRequest {
    #[serde(default)]
    strings: Vec<String>,
    #[serde(default)]
    vectors: Vec<Vec<f64>>,
    #[serde(default)]
    emotives: std::collections::HashMap<String, f64>,
    #[serde(default)]
    metadata: Vec<String>,
}

/// POST /v1/sessions/:session_id/observe – `observe` (§6.2).
async fn observe(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<ObserveRequest>,
) -> Result<axum::Json<ObserveOutcome>, (StatusCode, axum::Json<serde_json::Value>)> {
    let outcome = state.processor.observe(&session_id, req.strings, req.vectors, req.emotives, req.metadata).await.map_err(error_response)?;
    Ok(axum::Json(outcome))
}

/// GET /v1/sessions/:session_id/stm – `get_stm` (§6.2).
async fn get_stm(State(state): State<AppState>, Path(session_id): Path<String>) -> Result<axum::Json<serde_json::Value>, (StatusCode, axum::Json<serde_json::Value>)> {
    let stm = state.processor.get_stm(&session_id).map_err(error_response)?;
    Ok(axum::Json(serde_json::json!({ "stm": stm })))
}

#[derive(serde::Serialize)]
#[serde(tag = "result")]
enum LearnResponse {
    #[serde(rename = "learned")]
    Learned { name: String, frequency: u64 },
    #[serde(rename = "no-op")]
    NoOp,
}

impl From<LearnOutcome> for LearnResponse {
    fn from(outcome: LearnOutcome) -> Self {
        match outcome {
            LearnOutcome::Learned { name, frequency } => LearnResponse::Learned { name, frequency },
            LearnOutcome::NoOp => LearnResponse::NoOp,
        }
    }
}

/// POST /v1/sessions/:session_id/learn – `learn` (§6.2).
async fn learn(State(state): State<AppState>, Path(session_id): Path<String>) -> Result<axum::Json<LearnResponse>, (StatusCode, axum::Json<serde_json::Value>)> {
    let outcome = state.processor.learn(&session_id).await.map_err(error_response)?;
    Ok(axum::Json(outcome.into()))
}

/// GET /v1/sessions/:session_id/predictions – `get_predictions` (§6.2).
async fn get_predictions(State(state): State<AppState>, Path(session_id): Path<String>) -> Result<axum::Json<Vec<Prediction>>, (StatusCode, axum::Json<serde_json::Value>)> {
    let predictions = state.processor.get_predictions(&session_id).map_err(error_response)?;
    Ok(axum::Json(predictions))
}

/// POST /v1/sessions/:session_id/clear_stm – `clear_stm` (§6.2).
async fn clear_stm(State(state): State<AppState>, Path(session_id): Path<String>) -> Result<StatusCode, (StatusCode, axum::Json<serde_json::Value>)> {
    state.processor.clear_stm(&session_id).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(serde::Deserialize, Default)]
struct ClearAllRequest {
    #[serde(default)]
    drop_patterns: bool,
}

/// POST /v1/sessions/:session_id/clear_all – supplemental to §6.2's `clear_stm`, also resets
/// metadata/emotives and optionally drops the kb_id's persisted patterns.
async fn clear_all(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Option<Json<ClearAllRequest>>,
) -> Result<StatusCode, (StatusCode, axum::Json<serde_json::Value>)> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    state.processor.clear_all(&session_id, req.drop_patterns).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/sessions/:session_id/config – `update_config` (§6.2).
async fn update_config(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(patch): Json<SessionConfigPatch>,
) -> Result<StatusCode, (StatusCode, axum::Json<serde_json::Value>)> {
    state.processor.update_config(&session_id, patch).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(serde::Deserialize)]
struct ExtendSessionRequest {
    ttl_secs: u64,
}

/// POST /v1/sessions/:session_id/extend – `extend_session` (§6.2).
async fn extend_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<ExtendSessionRequest>,
) -> Result<StatusCode, (StatusCode, axum::Json<serde_json::Value>)> {
    state.processor.extend_session(&session_id, req.ttl_secs).map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/sessions/:session_id/status – per-kb_id observability snapshot (§3 supplement).
async fn session_status(State(state): State<AppState>, Path(session_id): Path<String>) -> Result<axum::Json<StoreStats>, (StatusCode, axum::Json<serde_json::Value>)> {
    let stats = state.processor.store_stats(&session_id).map_err(error_response)?;
    Ok(axum::Json(stats))
}
