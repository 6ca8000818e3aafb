use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use ringline_types::{CallEvent, CallMode, CallState};
use serde::Deserialize;

use crate::backend::{
    CallBackend, InitiateCallRequest, InitiateCallResponse, ParsedWebhook, WebhookRequest,
};
use crate::error::TelephonyError;
use crate::signature::{self, TWILIO_SIGNATURE_HEADER};

/// Default REST endpoint.
pub const DEFAULT_API_BASE_URL: &str = "https://api.twilio.com";

/// Silence appended after an announcement on a live call so the call stays
/// up while the agent decides what to do next.
const PLAY_HOLD_SECS: u32 = 60;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Credentials and endpoints for a Twilio-style provider.
#[derive(Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub api_base_url: String,
    /// Key for `X-Twilio-Signature` checks. Empty means the auth token,
    /// which is what Twilio signs with unless a secondary token is in use.
    pub webhook_secret: String,
}

impl fmt::Debug for TwilioConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwilioConfig")
            .field("account_sid", &self.account_sid)
            .field("auth_token", &"[REDACTED]")
            .field("api_base_url", &self.api_base_url)
            .field("webhook_secret", &"[REDACTED]")
            .finish()
    }
}

/// Backend for the Twilio REST API.
///
/// Calls are created with inline TwiML: notify calls `<Say>` the message and
/// hang up, conversation calls `<Connect>` a media stream back to us.
#[derive(Debug, Clone)]
pub struct TwilioBackend {
    config: TwilioConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CallResource {
    sid: String,
    #[serde(default)]
    status: Option<String>,
}

impl TwilioBackend {
    pub fn new(config: TwilioConfig) -> Result<Self, TelephonyError> {
        if config.account_sid.is_empty() || config.auth_token.is_empty() {
            return Err(TelephonyError::Config(
                "account_sid and auth_token are required".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { config, client })
    }

    fn signing_key(&self) -> &str {
        if self.config.webhook_secret.is_empty() {
            &self.config.auth_token
        } else {
            &self.config.webhook_secret
        }
    }

    fn calls_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Calls.json",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.account_sid
        )
    }

    fn call_url(&self, provider_call_id: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Calls/{}.json",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.account_sid,
            provider_call_id
        )
    }

    async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<reqwest::Response, TelephonyError> {
        let response = self
            .client
            .post(url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TelephonyError::Provider {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl CallBackend for TwilioBackend {
    fn name(&self) -> &'static str {
        "twilio"
    }

    async fn initiate_call(
        &self,
        request: &InitiateCallRequest,
    ) -> Result<InitiateCallResponse, TelephonyError> {
        let twiml = match request.mode {
            CallMode::Notify => say_and_hangup(&request.message, &request.voice),
            CallMode::Conversation => connect_stream(&request.stream_url, &request.call_id),
        };

        let form = [
            ("To", request.to.as_str()),
            ("From", request.from.as_str()),
            ("Twiml", twiml.as_str()),
            ("StatusCallback", request.webhook_url.as_str()),
            ("StatusCallbackMethod", "POST"),
            ("StatusCallbackEvent", "initiated"),
            ("StatusCallbackEvent", "ringing"),
            ("StatusCallbackEvent", "answered"),
            ("StatusCallbackEvent", "completed"),
        ];

        let response = self.post_form(&self.calls_url(), &form).await?;
        let resource: CallResource = response
            .json()
            .await
            .map_err(|e| TelephonyError::InvalidPayload(format!("call resource: {}", e)))?;

        tracing::info!(
            call_id = %request.call_id,
            provider_call_id = %resource.sid,
            mode = %request.mode,
            "twilio call created"
        );
        Ok(InitiateCallResponse {
            provider_call_id: resource.sid,
            status: resource.status,
        })
    }

    async fn hangup_call(&self, provider_call_id: &str) -> Result<(), TelephonyError> {
        self.post_form(&self.call_url(provider_call_id), &[("Status", "completed")])
            .await?;
        tracing::debug!(provider_call_id = %provider_call_id, "twilio hangup sent");
        Ok(())
    }

    async fn play_tts(
        &self,
        provider_call_id: &str,
        text: &str,
        voice: &str,
    ) -> Result<(), TelephonyError> {
        let twiml = say_and_hold(text, voice);
        self.post_form(&self.call_url(provider_call_id), &[("Twiml", twiml.as_str())])
            .await?;
        Ok(())
    }

    fn verify_webhook(&self, request: &WebhookRequest) -> bool {
        let Some(sig) = request.header(TWILIO_SIGNATURE_HEADER) else {
            return false;
        };
        let Ok(params) = serde_urlencoded::from_bytes::<Vec<(String, String)>>(&request.body) else {
            return false;
        };
        signature::verify_twilio(self.signing_key(), &request.url, &params, sig)
    }

    fn parse_webhook(&self, request: &WebhookRequest) -> Result<ParsedWebhook, TelephonyError> {
        let form: HashMap<String, String> = serde_urlencoded::from_bytes(&request.body)
            .map_err(|e| TelephonyError::InvalidPayload(format!("form body: {}", e)))?;

        let provider_call_id = form.get("CallSid").cloned().unwrap_or_default();
        let call_id = request
            .query_param("call_id")
            .unwrap_or_default()
            .to_string();
        if provider_call_id.is_empty() && call_id.is_empty() {
            return Err(TelephonyError::InvalidPayload(
                "webhook names no call".to_string(),
            ));
        }

        let raw_status = form.get("CallStatus").map(String::as_str).unwrap_or("");
        let Some(status) = map_twilio_status(raw_status) else {
            tracing::debug!(status = %raw_status, "ignoring unmapped twilio status");
            return Ok(ParsedWebhook::default());
        };

        let detail = form
            .get("ErrorMessage")
            .or_else(|| form.get("SipResponseCode"))
            .cloned();

        Ok(ParsedWebhook {
            events: vec![CallEvent {
                provider_call_id,
                call_id,
                event_type: "status".to_string(),
                status,
                detail,
            }],
            response: None,
        })
    }
}

/// Maps a Twilio `CallStatus` to a call state.
pub fn map_twilio_status(status: &str) -> Option<CallState> {
    match status {
        "queued" | "initiated" => Some(CallState::Initiated),
        "ringing" => Some(CallState::Ringing),
        "in-progress" | "answered" => Some(CallState::Answered),
        "completed" => Some(CallState::Completed),
        "busy" => Some(CallState::Busy),
        "no-answer" => Some(CallState::NoAnswer),
        "failed" => Some(CallState::Failed),
        "canceled" => Some(CallState::HangupUser),
        _ => None,
    }
}

fn say_and_hangup(message: &str, voice: &str) -> String {
    format!(
        "<Response>{}<Hangup/></Response>",
        say(message, voice)
    )
}

fn say_and_hold(message: &str, voice: &str) -> String {
    format!(
        "<Response>{}<Pause length=\"{}\"/></Response>",
        say(message, voice),
        PLAY_HOLD_SECS
    )
}

fn say(message: &str, voice: &str) -> String {
    if voice.is_empty() {
        format!("<Say>{}</Say>", xml_escape(message))
    } else {
        format!(
            "<Say voice=\"{}\">{}</Say>",
            xml_escape(voice),
            xml_escape(message)
        )
    }
}

/// Twilio drops the query string from `<Stream url>`, so the call ID moves
/// into the path and also travels as a custom parameter that comes back in
/// the `start` frame.
fn connect_stream(stream_url: &str, call_id: &str) -> String {
    format!(
        "<Response><Connect><Stream url=\"{}\"><Parameter name=\"call_id\" value=\"{}\"/></Stream></Connect></Response>",
        xml_escape(&path_stream_url(stream_url, call_id)),
        xml_escape(call_id)
    )
}

fn path_stream_url(stream_url: &str, call_id: &str) -> String {
    let base = stream_url.split('?').next().unwrap_or(stream_url);
    format!("{}/{}", base.trim_end_matches('/'), call_id)
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
