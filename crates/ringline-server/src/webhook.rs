//! Provider callbacks: status webhooks and the media-stream upgrade.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, Extension, Path, Query},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use ringline_store::CallStore;
use ringline_telephony::WebhookRequest;
use ringline_types::{CallEvent, CallRecord};
use serde::Deserialize;

use crate::media::{BridgeRegistry, MediaBridge};
use crate::AppState;

/// Largest webhook body accepted.
pub const MAX_WEBHOOK_BODY_BYTES: usize = 1024 * 1024;

/// Handler for the status webhook (`POST {webhook_path}`).
pub async fn voice_webhook_handler(
    Extension(state): Extension<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    if body.len() > MAX_WEBHOOK_BODY_BYTES {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    let request = webhook_request(&state, &method, &uri, &headers, &body);

    if state.config.telephony.skip_signature_verification {
        tracing::debug!("webhook signature verification skipped");
    } else if !state.backend.verify_webhook(&request) {
        tracing::warn!(
            backend = state.backend.name(),
            path = %uri.path(),
            "rejecting webhook with invalid signature"
        );
        return StatusCode::FORBIDDEN.into_response();
    }

    let parsed = match state.backend.parse_webhook(&request) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(backend = state.backend.name(), error = %e, "unparsable webhook");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    for event in parsed.events {
        apply_event(&state.store, &state.bridges, event).await;
    }

    match parsed.response {
        Some(response) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, response.content_type)],
            response.body,
        )
            .into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

fn webhook_request(
    state: &AppState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> WebhookRequest {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let url = format!(
        "{}{}",
        state.config.server.public_url.trim_end_matches('/'),
        path_and_query
    );

    let headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
    let query: HashMap<String, String> =
        serde_urlencoded::from_str(uri.query().unwrap_or_default()).unwrap_or_default();

    WebhookRequest {
        method: method.to_string(),
        url,
        headers,
        query,
        body: body.to_vec(),
    }
}

async fn resolve(store: &CallStore, event: &CallEvent) -> Option<CallRecord> {
    if !event.provider_call_id.is_empty() {
        if let Ok(record) = store.find_by_provider_id(&event.provider_call_id).await {
            return Some(record);
        }
    }
    if !event.call_id.is_empty() {
        if let Ok(record) = store.get(&event.call_id).await {
            return Some(record);
        }
    }
    None
}

/// Applies one provider event. Unknown calls and rejected transitions are
/// logged and dropped.
pub async fn apply_event(store: &CallStore, bridges: &BridgeRegistry, event: CallEvent) {
    let Some(record) = resolve(store, &event).await else {
        tracing::info!(
            provider_call_id = %event.provider_call_id,
            call_id = %event.call_id,
            status = %event.status,
            "dropping webhook for unknown call"
        );
        return;
    };

    // Status callbacks can race the initiate response.
    if record.provider_call_id.is_none() && !event.provider_call_id.is_empty() {
        if let Err(e) = store
            .set_provider_call_id(&record.call_id, &event.provider_call_id)
            .await
        {
            tracing::debug!(call_id = %record.call_id, error = %e, "could not record provider id");
        }
    }

    match store
        .transition(&record.call_id, event.status, event.detail)
        .await
    {
        Ok(updated) => {
            tracing::info!(
                call_id = %updated.call_id,
                event_type = %event.event_type,
                state = %updated.state,
                "call state updated from webhook"
            );
            if updated.is_terminal() {
                bridges.close(&updated.call_id).await;
            }
        }
        Err(e) => {
            tracing::debug!(
                call_id = %record.call_id,
                from = %record.state,
                to = %event.status,
                error = %e,
                "ignoring webhook transition"
            );
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MediaStreamParams {
    #[serde(default)]
    pub call_id: Option<String>,
}

/// Handler for the media stream upgrade (`GET {stream_path}?call_id=`).
pub async fn media_stream_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<MediaStreamParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(call_id) = params.call_id.filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "call_id is required").into_response();
    };
    open_media_stream(state, call_id, ws).await
}

/// Handler for `GET {stream_path}/{call_id}`, for providers that strip the
/// query string from stream URLs.
pub async fn media_stream_path_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(call_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    open_media_stream(state, call_id, ws).await
}

async fn open_media_stream(state: Arc<AppState>, call_id: String, ws: WebSocketUpgrade) -> Response {

    let record = match state.store.get(&call_id).await {
        Ok(record) => record,
        Err(_) => {
            tracing::warn!(call_id = %call_id, "media stream for unknown call");
            return StatusCode::NOT_FOUND.into_response();
        }
    };
    if record.is_terminal() {
        tracing::info!(call_id = %call_id, state = %record.state, "media stream for ended call");
        return StatusCode::GONE.into_response();
    }

    let bridge = MediaBridge::new(
        &call_id,
        &state.config.calls.voice,
        state.store.clone(),
        state.stt.clone(),
        state.tts.clone(),
        state.bridges.clone(),
    );
    if !state.bridges.try_register(bridge.clone()) {
        tracing::warn!(call_id = %call_id, "media stream already connected");
        return StatusCode::CONFLICT.into_response();
    }

    let registry = state.bridges.clone();
    let failed = bridge.clone();
    ws.on_failed_upgrade(move |e| {
        tracing::warn!(call_id = %failed.call_id(), error = %e, "media stream upgrade failed");
        registry.remove(failed.call_id(), &failed);
    })
    .on_upgrade(move |socket| bridge.run(socket))
}
