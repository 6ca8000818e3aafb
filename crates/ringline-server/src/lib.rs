//! Ringline server library logic.

pub mod api;
pub mod api_calls;
pub mod background;
pub mod config;
pub mod media;
pub mod middleware;
pub mod orchestrator;
pub mod webhook;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{any, get, post},
    Extension, Json, Router,
};
use ringline_store::{CallPersistence, CallStore};
use ringline_telephony::CallBackend;
use ringline_voice::{SttEngine, TtsEngine};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use config::Config;
use media::BridgeRegistry;
use orchestrator::{Orchestrator, OrchestratorSettings};

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Authoritative call records.
    pub store: Arc<CallStore>,
    /// Telephony provider.
    pub backend: Arc<dyn CallBackend>,
    pub stt: Arc<dyn SttEngine>,
    pub tts: Arc<dyn TtsEngine>,
    /// Live media bridges (call ID -> bridge).
    pub bridges: BridgeRegistry,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(
        config: Config,
        backend: Arc<dyn CallBackend>,
        stt: Arc<dyn SttEngine>,
        tts: Arc<dyn TtsEngine>,
        persistence: Option<Arc<dyn CallPersistence>>,
    ) -> Self {
        let store = Arc::new(CallStore::new(config.calls.max_concurrent, persistence));
        let bridges = BridgeRegistry::new();
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            backend.clone(),
            bridges.clone(),
            OrchestratorSettings::from(&config),
        ));
        Self {
            config: Arc::new(config),
            store,
            backend,
            stt,
            tts,
            bridges,
            orchestrator,
        }
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route(
            "/api/calls",
            post(api_calls::initiate_call_handler).get(api_calls::list_calls_handler),
        )
        .route("/api/calls/{callId}", get(api_calls::get_call_handler))
        .route(
            "/api/calls/{callId}/continue",
            post(api_calls::continue_call_handler),
        )
        .route(
            "/api/calls/{callId}/speak",
            post(api_calls::speak_handler),
        )
        .route("/api/calls/{callId}/end", post(api_calls::end_call_handler))
        .layer(axum::middleware::from_fn(middleware::auth_middleware));

    let webhook_routes = Router::new()
        .route(
            &state.config.server.webhook_path,
            any(webhook::voice_webhook_handler),
        )
        .layer(DefaultBodyLimit::max(webhook::MAX_WEBHOOK_BODY_BYTES));

    let stream_path = state.config.server.stream_path.trim_end_matches('/');
    let stream_routes = Router::new()
        .route(stream_path, get(webhook::media_stream_handler))
        .route(
            &format!("{}/{{call_id}}", stream_path),
            get(webhook::media_stream_path_handler),
        );

    Router::new()
        .route("/health", get(health))
        .merge(stream_routes)
        .merge(protected_routes)
        .merge(webhook_routes)
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
