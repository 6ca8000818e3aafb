use std::collections::HashMap;

use async_trait::async_trait;
use ringline_types::{CallEvent, CallMode};
use serde::{Deserialize, Serialize};

use crate::error::TelephonyError;

/// Everything a backend needs to place one outbound call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateCallRequest {
    pub call_id: String,
    pub from: String,
    pub to: String,
    pub mode: CallMode,
    /// Announcement for notify calls; greeting for conversations.
    pub message: String,
    pub voice: String,
    /// Where the provider should send status callbacks.
    pub webhook_url: String,
    /// Where the provider should open the media WebSocket.
    pub stream_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateCallResponse {
    pub provider_call_id: String,
    /// Provider's status label at creation, if it reported one.
    pub status: Option<String>,
}

/// An inbound webhook as seen by the HTTP layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookRequest {
    pub method: String,
    /// Full public URL the provider called, including the query string.
    pub url: String,
    /// Header names are stored lowercase.
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl WebhookRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

/// Body the provider expects back from a webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub content_type: String,
    pub body: String,
}

/// Result of parsing one webhook delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedWebhook {
    pub events: Vec<CallEvent>,
    /// `None` means the provider is satisfied with an empty 204.
    pub response: Option<WebhookResponse>,
}

/// A telephony provider.
#[async_trait]
pub trait CallBackend: Send + Sync {
    /// Short provider name used in logs.
    fn name(&self) -> &'static str;

    async fn initiate_call(
        &self,
        request: &InitiateCallRequest,
    ) -> Result<InitiateCallResponse, TelephonyError>;

    async fn hangup_call(&self, provider_call_id: &str) -> Result<(), TelephonyError>;

    /// Speaks `text` on a live call without a media stream.
    async fn play_tts(
        &self,
        provider_call_id: &str,
        text: &str,
        voice: &str,
    ) -> Result<(), TelephonyError>;

    /// Returns `true` if the request carries a valid provider signature.
    fn verify_webhook(&self, request: &WebhookRequest) -> bool;

    fn parse_webhook(&self, request: &WebhookRequest) -> Result<ParsedWebhook, TelephonyError>;
}
