//! Ringline server binary.
//!
//! Starts the axum HTTP server with structured logging, restores the call log,
//! and on SIGTERM/SIGINT hangs up live calls before shutting down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ringline_server::{
    app, background,
    config::{self, Config, ProviderKind},
    AppState,
};
use ringline_store::{CallPersistence, JsonlCallLog};
use ringline_telephony::{CallBackend, MockBackend, TwilioBackend, TwilioConfig};
use ringline_voice::{PiperTtsEngine, WhisperSttEngine};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("RINGLINE_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn build_backend(config: &Config) -> Arc<dyn CallBackend> {
    match config.telephony.provider {
        ProviderKind::Twilio => {
            let backend = TwilioBackend::new(TwilioConfig {
                account_sid: config.telephony.account_sid.clone(),
                auth_token: config.telephony.auth_token.clone(),
                api_base_url: config.telephony.api_base_url.clone(),
                webhook_secret: config.telephony.webhook_secret.clone(),
            })
            .expect("failed to build twilio backend — check telephony credentials");
            Arc::new(backend)
        }
        ProviderKind::Mock => {
            tracing::warn!("using mock telephony backend; no real calls will be placed");
            if config.telephony.webhook_secret.is_empty() {
                Arc::new(MockBackend::new())
            } else {
                Arc::new(MockBackend::with_webhook_secret(
                    config.telephony.webhook_secret.clone(),
                ))
            }
        }
    }
}

fn build_state(config: Config, persistence: Option<Arc<dyn CallPersistence>>) -> AppState {
    let backend = build_backend(&config);
    let stt = Arc::new(
        WhisperSttEngine::new(&config.voice.stt_model, &config.voice.stt_binary)
            .with_window_ms(config.voice.stt_window_ms),
    );
    let tts = Arc::new(PiperTtsEngine::new(
        &config.voice.tts_voices_dir,
        &config.voice.tts_binary,
    ));
    AppState::new(config, backend, stt, tts, persistence)
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration — the server cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    config.validate().expect("invalid configuration");

    let log = config.calls.store_path.as_deref().map(|path| {
        Arc::new(JsonlCallLog::open(path).expect("failed to open call log — check calls.store_path"))
    });
    let restored = match &log {
        Some(log) => log
            .load()
            .expect("failed to read call log — check calls.store_path"),
        None => Vec::new(),
    };

    let addr = SocketAddr::new(config.server.host, config.server.port);
    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    let max_duration_secs = config.calls.max_duration_secs;

    let state = build_state(config, log.map(|l| l as Arc<dyn CallPersistence>));

    if !restored.is_empty() {
        let count = restored.len();
        let orphaned = state.store.restore(restored).await;
        tracing::info!(count, orphaned, "restored calls from log");
    }

    let orchestrator = state.orchestrator.clone();
    let bridges = state.bridges.clone();
    let store = state.store.clone();
    tokio::spawn(background::start_reaper_task(
        orchestrator.clone(),
        max_duration_secs,
    ));

    tracing::info!(%addr, "starting ringline server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address — is another process using this port?");

    let stop = CancellationToken::new();
    let server = axum::serve(listener, app(state))
        .with_graceful_shutdown(stop.clone().cancelled_owned());
    let mut server = tokio::spawn(async move { server.await });

    tokio::select! {
        () = shutdown_signal() => {}
        result = &mut server => {
            result.expect("server task panicked").expect("server error");
            return;
        }
    }

    let hung_up = orchestrator.hangup_active_calls().await;
    bridges.close_all().await;
    store.flush().await;
    tracing::info!(hung_up, "ended live calls");
    stop.cancel();

    match tokio::time::timeout(shutdown_timeout, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => tracing::error!(error = %e, "server task failed"),
        Err(_) => tracing::warn!(
            timeout_secs = shutdown_timeout.as_secs(),
            "graceful shutdown timed out"
        ),
    }

    tracing::info!("ringline server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
