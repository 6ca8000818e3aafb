use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use ringline_types::{CallEvent, CallState};
use serde::Deserialize;

use crate::backend::{
    CallBackend, InitiateCallRequest, InitiateCallResponse, ParsedWebhook, WebhookRequest,
};
use crate::error::TelephonyError;
use crate::signature::{self, SIGNATURE_HEADER};

/// In-process backend that places no real calls.
///
/// Webhooks are JSON, either one event object or an array of them:
///
/// ```json
/// {"provider_call_id": "mock-1", "status": "answered"}
/// ```
#[derive(Debug, Default)]
pub struct MockBackend {
    webhook_secret: Option<String>,
    fail_initiate: AtomicBool,
    next_id: AtomicU64,
    initiated: Mutex<Vec<InitiateCallRequest>>,
    hangups: Mutex<Vec<String>>,
    played: Mutex<Vec<(String, String)>>,
}

#[derive(Debug, Deserialize)]
struct MockEvent {
    #[serde(default)]
    provider_call_id: String,
    #[serde(default)]
    call_id: String,
    #[serde(default = "default_event_type")]
    event_type: String,
    status: CallState,
    #[serde(default)]
    detail: Option<String>,
}

fn default_event_type() -> String {
    "status".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MockPayload {
    One(MockEvent),
    Many(Vec<MockEvent>),
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires webhooks to be signed with `secret`.
    pub fn with_webhook_secret(secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: Some(secret.into()),
            ..Self::default()
        }
    }

    /// Makes subsequent `initiate_call`s fail with a provider error.
    pub fn set_fail_initiate(&self, fail: bool) {
        self.fail_initiate.store(fail, Ordering::SeqCst);
    }

    pub fn initiated(&self) -> Vec<InitiateCallRequest> {
        lock(&self.initiated).clone()
    }

    pub fn hangups(&self) -> Vec<String> {
        lock(&self.hangups).clone()
    }

    /// `(provider_call_id, text)` pairs passed to `play_tts`.
    pub fn played(&self) -> Vec<(String, String)> {
        lock(&self.played).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl CallBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn initiate_call(
        &self,
        request: &InitiateCallRequest,
    ) -> Result<InitiateCallResponse, TelephonyError> {
        if self.fail_initiate.load(Ordering::SeqCst) {
            return Err(TelephonyError::Provider {
                status: 503,
                body: "mock backend configured to fail".to_string(),
            });
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.initiated).push(request.clone());
        tracing::debug!(call_id = %request.call_id, to = %request.to, "mock call placed");
        Ok(InitiateCallResponse {
            provider_call_id: format!("mock-{}", n),
            status: Some("queued".to_string()),
        })
    }

    async fn hangup_call(&self, provider_call_id: &str) -> Result<(), TelephonyError> {
        lock(&self.hangups).push(provider_call_id.to_string());
        Ok(())
    }

    async fn play_tts(
        &self,
        provider_call_id: &str,
        text: &str,
        _voice: &str,
    ) -> Result<(), TelephonyError> {
        lock(&self.played).push((provider_call_id.to_string(), text.to_string()));
        Ok(())
    }

    fn verify_webhook(&self, request: &WebhookRequest) -> bool {
        let Some(secret) = &self.webhook_secret else {
            return true;
        };
        request
            .header(SIGNATURE_HEADER)
            .is_some_and(|sig| signature::verify(secret, &request.url, &request.body, sig))
    }

    fn parse_webhook(&self, request: &WebhookRequest) -> Result<ParsedWebhook, TelephonyError> {
        let payload: MockPayload = serde_json::from_slice(&request.body)
            .map_err(|e| TelephonyError::InvalidPayload(e.to_string()))?;
        let raw = match payload {
            MockPayload::One(event) => vec![event],
            MockPayload::Many(events) => events,
        };

        let query_call_id = request.query_param("call_id").unwrap_or_default();
        let events = raw
            .into_iter()
            .map(|e| CallEvent {
                call_id: if e.call_id.is_empty() {
                    query_call_id.to_string()
                } else {
                    e.call_id
                },
                provider_call_id: e.provider_call_id,
                event_type: e.event_type,
                status: e.status,
                detail: e.detail,
            })
            .collect();

        Ok(ParsedWebhook {
            events,
            response: None,
        })
    }
}
