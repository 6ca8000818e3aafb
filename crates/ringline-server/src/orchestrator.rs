//! Request-level call operations.
//!
//! The orchestrator validates agent requests, admits calls through the
//! [`CallStore`], drives the telephony backend and routes speech to a live
//! [`MediaBridge`](crate::media::MediaBridge) when one exists.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ringline_store::CallStore;
use ringline_telephony::{CallBackend, InitiateCallRequest, TelephonyError};
use ringline_types::{CallError, CallMode, CallRecord, CallState, TurnEntry, TurnRole};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::Config;
use crate::media::BridgeRegistry;

/// Note returned when ending a call that has already finished.
pub const ALREADY_ENDED: &str = "call already ended";

/// Detail recorded on calls stopped by the duration limit.
pub const MAX_DURATION_DETAIL: &str = "max call duration exceeded";

/// Policy knobs, lifted from [`Config`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub public_url: String,
    pub webhook_path: String,
    pub stream_path: String,
    pub default_to: Option<String>,
    pub default_mode: CallMode,
    pub allowlist: Vec<String>,
    pub from_number: String,
    pub voice: String,
    pub transcript_timeout: Duration,
    pub action_timeout: Duration,
    /// Zero disables the limit.
    pub max_duration: Duration,
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            public_url: config.server.public_url.clone(),
            webhook_path: config.server.webhook_path.clone(),
            stream_path: config.server.stream_path.clone(),
            default_to: config.calls.default_to.clone(),
            default_mode: config.calls.default_mode,
            allowlist: config.calls.allowlist.clone(),
            from_number: config.calls.from_number.clone(),
            voice: config.calls.voice.clone(),
            transcript_timeout: Duration::from_secs(config.calls.transcript_timeout_secs),
            action_timeout: Duration::from_secs(config.calls.action_timeout_secs),
            max_duration: Duration::from_secs(config.calls.max_duration_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitiateCall {
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateCallResult {
    pub call_id: String,
    pub provider_call_id: String,
    pub to: String,
    pub mode: CallMode,
    pub state: CallState,
}

/// Outcome of one conversational turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinueCallResult {
    pub call_id: String,
    pub state: CallState,
    /// New callee turns, or the whole transcript once the call has ended.
    pub transcript: Vec<TurnEntry>,
    #[serde(default)]
    pub ended: bool,
    #[serde(default)]
    pub no_response: bool,
}

/// How speech reached the callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechRoute {
    /// Streamed through the live media bridge.
    Stream,
    /// Played by the provider.
    Provider,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakResult {
    pub call_id: String,
    pub state: CallState,
    pub route: SpeechRoute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndCallResult {
    pub call_id: String,
    pub state: CallState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Validates an E.164 number: `+`, then 2 to 15 digits, the first non-zero.
pub fn validate_e164(number: &str) -> Result<(), CallError> {
    let digits = number.strip_prefix('+').ok_or_else(|| {
        CallError::InvalidInput(format!(
            "phone number {:?} must be in E.164 format (start with '+')",
            number
        ))
    })?;
    if !(2..=15).contains(&digits.len()) {
        return Err(CallError::InvalidInput(format!(
            "phone number {:?} must have between 2 and 15 digits",
            number
        )));
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CallError::InvalidInput(format!(
            "phone number {:?} may only contain digits after '+'",
            number
        )));
    }
    if digits.starts_with('0') {
        return Err(CallError::InvalidInput(format!(
            "phone number {:?} has an invalid country code",
            number
        )));
    }
    Ok(())
}

/// Turns an `http(s)` base URL into its `ws(s)` counterpart.
fn websocket_base(public_url: &str) -> String {
    let base = public_url.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    }
}

fn required(value: &str, what: &str) -> Result<(), CallError> {
    if value.trim().is_empty() {
        Err(CallError::InvalidInput(format!("{} is required", what)))
    } else {
        Ok(())
    }
}

pub struct Orchestrator {
    store: Arc<CallStore>,
    backend: Arc<dyn CallBackend>,
    bridges: BridgeRegistry,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<CallStore>,
        backend: Arc<dyn CallBackend>,
        bridges: BridgeRegistry,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            backend,
            bridges,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Runs a backend operation under the action timeout.
    async fn with_timeout<T>(
        &self,
        operation: impl Future<Output = Result<T, TelephonyError>>,
    ) -> Result<T, TelephonyError> {
        match tokio::time::timeout(self.settings.action_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(TelephonyError::Timeout(self.settings.action_timeout)),
        }
    }

    /// Places a new outbound call.
    pub async fn initiate_call(&self, request: InitiateCall) -> Result<InitiateCallResult, CallError> {
        let message = request.message.trim().to_string();
        required(&message, "message")?;

        let to = request
            .to
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .or_else(|| self.settings.default_to.clone())
            .ok_or_else(|| {
                CallError::InvalidInput("no destination number given and none configured".into())
            })?;
        validate_e164(&to)?;
        if !self.settings.allowlist.is_empty() && !self.settings.allowlist.contains(&to) {
            return Err(CallError::InvalidInput(format!(
                "{} is not in the call allowlist",
                to
            )));
        }

        let mode = match request.mode.as_deref().map(str::trim) {
            Some(mode) if !mode.is_empty() => CallMode::from_str(mode)?,
            _ => self.settings.default_mode,
        };

        let call_id = uuid::Uuid::new_v4().to_string();
        let record = CallRecord::new(&call_id, &to, &self.settings.from_number, mode);
        self.store.create(record).await?;
        self.store
            .append_transcript(&call_id, TurnEntry::bot(&message))
            .await?;

        let base = self.settings.public_url.trim_end_matches('/');
        let backend_request = InitiateCallRequest {
            call_id: call_id.clone(),
            from: self.settings.from_number.clone(),
            to: to.clone(),
            mode,
            message,
            voice: self.settings.voice.clone(),
            webhook_url: format!("{}{}?call_id={}", base, self.settings.webhook_path, call_id),
            stream_url: format!(
                "{}{}?call_id={}",
                websocket_base(base),
                self.settings.stream_path,
                call_id
            ),
        };

        let response = match self
            .with_timeout(self.backend.initiate_call(&backend_request))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    call_id = %call_id,
                    backend = self.backend.name(),
                    error = %e,
                    "failed to place call"
                );
                let detail = e.to_string();
                if let Err(te) = self
                    .store
                    .transition(&call_id, CallState::Failed, Some(detail.clone()))
                    .await
                {
                    tracing::debug!(call_id = %call_id, error = %te, "call already settled");
                }
                return Err(CallError::ProviderError(detail));
            }
        };

        self.store
            .set_provider_call_id(&call_id, &response.provider_call_id)
            .await?;
        let state = self.store.get(&call_id).await?.state;

        tracing::info!(
            call_id = %call_id,
            provider_call_id = %response.provider_call_id,
            mode = %mode,
            "call initiated"
        );
        Ok(InitiateCallResult {
            call_id,
            provider_call_id: response.provider_call_id,
            to,
            mode,
            state,
        })
    }

    /// Says something and waits for the callee's reply.
    ///
    /// Bot turns queued by other requests in the meantime are skipped; only a
    /// user turn ends the wait early.
    pub async fn continue_call(
        &self,
        call_id: &str,
        message: &str,
    ) -> Result<ContinueCallResult, CallError> {
        required(call_id, "call_id")?;
        let message = message.trim();
        required(message, "message")?;

        let record = self.store.get(call_id).await?;
        if record.is_terminal() {
            return Ok(ended(record));
        }

        let index = self
            .store
            .append_transcript(call_id, TurnEntry::bot(message))
            .await?;
        self.speak(&record, message).await?;

        let deadline = Instant::now() + self.settings.transcript_timeout;
        let mut after = index + 1;
        let mut replies = Vec::new();
        while replies.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let entries = match self
                .store
                .wait_for_transcript(call_id, after, remaining)
                .await
            {
                Ok(entries) => entries,
                Err(CallError::InvalidInput(_)) => break,
                Err(e) => return Err(e),
            };
            if entries.is_empty() {
                if self.store.get(call_id).await?.is_terminal() {
                    break;
                }
                continue;
            }
            after += entries.len();
            replies = entries
                .into_iter()
                .filter(|e| e.role == TurnRole::User)
                .collect();
        }

        let current = self.store.get(call_id).await?;
        if replies.is_empty() && current.is_terminal() {
            return Ok(ended(current));
        }

        Ok(ContinueCallResult {
            call_id: call_id.to_string(),
            state: current.state,
            no_response: replies.is_empty(),
            transcript: replies,
            ended: false,
        })
    }

    /// Says something without waiting for a reply.
    pub async fn speak_to_user(&self, call_id: &str, message: &str) -> Result<SpeakResult, CallError> {
        required(call_id, "call_id")?;
        let message = message.trim();
        required(message, "message")?;

        let record = self.store.get(call_id).await?;
        if record.is_terminal() {
            return Err(CallError::InvalidInput(format!(
                "call {} has ended ({})",
                call_id, record.state
            )));
        }

        self.store
            .append_transcript(call_id, TurnEntry::bot(message))
            .await?;
        let route = self.speak(&record, message).await?;
        let state = self.store.get(call_id).await?.state;
        Ok(SpeakResult {
            call_id: call_id.to_string(),
            state,
            route,
        })
    }

    async fn speak(&self, record: &CallRecord, message: &str) -> Result<SpeechRoute, CallError> {
        if let Some(bridge) = self.bridges.get(&record.call_id) {
            bridge.speak_text(message).await;
            return Ok(SpeechRoute::Stream);
        }

        let Some(provider_call_id) = record.provider_call_id.as_deref() else {
            return Err(CallError::InvalidInput(format!(
                "call {} is not connected yet",
                record.call_id
            )));
        };
        self.with_timeout(
            self.backend
                .play_tts(provider_call_id, message, &self.settings.voice),
        )
        .await
        .map_err(|e| CallError::ProviderError(e.to_string()))?;
        Ok(SpeechRoute::Provider)
    }

    /// Hangs up a call. Ending an ended call succeeds with a note.
    pub async fn end_call(&self, call_id: &str) -> Result<EndCallResult, CallError> {
        required(call_id, "call_id")?;
        let record = self.store.get(call_id).await?;
        if record.is_terminal() {
            return Ok(EndCallResult {
                call_id: call_id.to_string(),
                state: record.state,
                note: Some(ALREADY_ENDED.to_string()),
            });
        }

        self.hangup(&record).await;
        match self.store.transition(call_id, CallState::HangupBot, None).await {
            Ok(updated) => {
                tracing::info!(call_id = %call_id, "call ended by agent");
                Ok(EndCallResult {
                    call_id: call_id.to_string(),
                    state: updated.state,
                    note: None,
                })
            }
            Err(CallError::InvalidInput(_)) => {
                let current = self.store.get(call_id).await?;
                Ok(EndCallResult {
                    call_id: call_id.to_string(),
                    state: current.state,
                    note: Some(ALREADY_ENDED.to_string()),
                })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_status(&self, call_id: &str) -> Result<CallRecord, CallError> {
        required(call_id, "call_id")?;
        self.store.get(call_id).await
    }

    pub async fn list_calls(&self, active_only: bool) -> Vec<CallRecord> {
        if active_only {
            self.store.active_calls().await
        } else {
            self.store.all_calls().await
        }
    }

    /// Hangs up every live call. Returns how many were ended.
    pub async fn hangup_active_calls(&self) -> usize {
        let mut ended = 0;
        for record in self.store.active_calls().await {
            self.hangup(&record).await;
            if self
                .store
                .transition(&record.call_id, CallState::HangupBot, None)
                .await
                .is_ok()
            {
                ended += 1;
            }
        }
        if ended > 0 {
            tracing::info!(count = ended, "hung up active calls");
        }
        ended
    }

    /// Moves calls older than the duration limit to `timeout`.
    pub async fn reap_expired_calls(&self) -> usize {
        if self.settings.max_duration.is_zero() {
            return 0;
        }
        let Ok(limit) = chrono::Duration::from_std(self.settings.max_duration) else {
            return 0;
        };
        let cutoff = Utc::now() - limit;

        let mut reaped = 0;
        for record in self.store.active_calls().await {
            if record.created_at > cutoff {
                continue;
            }
            self.hangup(&record).await;
            if self
                .store
                .transition(
                    &record.call_id,
                    CallState::Timeout,
                    Some(MAX_DURATION_DETAIL.to_string()),
                )
                .await
                .is_ok()
            {
                tracing::info!(call_id = %record.call_id, "call exceeded max duration");
                reaped += 1;
            }
        }
        reaped
    }

    /// Best-effort provider hangup plus bridge teardown.
    async fn hangup(&self, record: &CallRecord) {
        if let Some(provider_call_id) = record.provider_call_id.as_deref() {
            if let Err(e) = self
                .with_timeout(self.backend.hangup_call(provider_call_id))
                .await
            {
                tracing::warn!(
                    call_id = %record.call_id,
                    provider_call_id = %provider_call_id,
                    error = %e,
                    "provider hangup failed"
                );
            }
        }
        self.bridges.close(&record.call_id).await;
    }
}

fn ended(record: CallRecord) -> ContinueCallResult {
    ContinueCallResult {
        call_id: record.call_id,
        state: record.state,
        transcript: record.transcript,
        ended: true,
        no_response: false,
    }
}
