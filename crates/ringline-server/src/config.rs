//! Server configuration loading from file and environment variables.

use ringline_types::CallMode;
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP listener and public endpoints.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Call policy.
    #[serde(default)]
    pub calls: CallsConfig,

    /// Telephony provider.
    #[serde(default)]
    pub telephony: TelephonyConfig,

    /// Speech engines.
    #[serde(default)]
    pub voice: VoiceConfig,
}

#[derive(Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Externally reachable base URL, used to build provider callbacks.
    #[serde(default = "default_public_url")]
    pub public_url: String,

    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,

    #[serde(default = "default_stream_path")]
    pub stream_path: String,

    /// Upper bound on graceful shutdown.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Bearer token for the call API. Unset leaves the API open.
    #[serde(default)]
    pub api_token: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "ringline_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallsConfig {
    /// Ceiling on simultaneously live calls.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Destination used when a request names none.
    #[serde(default)]
    pub default_to: Option<String>,

    #[serde(default)]
    pub default_mode: CallMode,

    /// When non-empty, only these numbers may be dialled.
    #[serde(default)]
    pub allowlist: Vec<String>,

    /// Caller ID presented to the callee.
    #[serde(default)]
    pub from_number: String,

    /// How long `continue` waits for the callee to answer.
    #[serde(default = "default_transcript_timeout_secs")]
    pub transcript_timeout_secs: u64,

    /// Timeout for every provider request.
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,

    /// Calls older than this are hung up. 0 disables the limit.
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,

    /// TTS voice name.
    #[serde(default)]
    pub voice: String,

    /// JSON-lines call log. Unset keeps calls in memory only.
    #[serde(default)]
    pub store_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Twilio,
    #[default]
    Mock,
}

#[derive(Clone, Deserialize)]
pub struct TelephonyConfig {
    #[serde(default)]
    pub provider: ProviderKind,

    #[serde(default)]
    pub account_sid: String,

    #[serde(default)]
    pub auth_token: String,

    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Webhook signing key. For twilio an empty value means the auth token.
    #[serde(default)]
    pub webhook_secret: String,

    /// Accept unsigned webhooks. Development only.
    #[serde(default)]
    pub skip_signature_verification: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceConfig {
    #[serde(default = "default_stt_binary")]
    pub stt_binary: String,

    #[serde(default = "default_stt_model")]
    pub stt_model: String,

    #[serde(default = "default_tts_binary")]
    pub tts_binary: String,

    #[serde(default = "default_tts_voices_dir")]
    pub tts_voices_dir: String,

    /// Audio gathered per transcription pass.
    #[serde(default = "default_stt_window_ms")]
    pub stt_window_ms: u32,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_public_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_webhook_path() -> String {
    "/webhooks/voice".to_string()
}

fn default_stream_path() -> String {
    "/media-stream".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_concurrent() -> usize {
    3
}

fn default_transcript_timeout_secs() -> u64 {
    30
}

fn default_action_timeout_secs() -> u64 {
    15
}

fn default_max_duration_secs() -> u64 {
    600
}

fn default_api_base_url() -> String {
    ringline_telephony::DEFAULT_API_BASE_URL.to_string()
}

fn default_stt_binary() -> String {
    "whisper-cli".to_string()
}

fn default_stt_model() -> String {
    "models/ggml-base.en.bin".to_string()
}

fn default_tts_binary() -> String {
    "piper".to_string()
}

fn default_tts_voices_dir() -> String {
    "voices".to_string()
}

fn default_stt_window_ms() -> u32 {
    ringline_voice::stt::DEFAULT_STT_WINDOW_MS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: default_public_url(),
            webhook_path: default_webhook_path(),
            stream_path: default_stream_path(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            api_token: None,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("public_url", &self.public_url)
            .field("webhook_path", &self.webhook_path)
            .field("stream_path", &self.stream_path)
            .field("shutdown_timeout_secs", &self.shutdown_timeout_secs)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            default_to: None,
            default_mode: CallMode::default(),
            allowlist: Vec::new(),
            from_number: String::new(),
            transcript_timeout_secs: default_transcript_timeout_secs(),
            action_timeout_secs: default_action_timeout_secs(),
            max_duration_secs: default_max_duration_secs(),
            voice: String::new(),
            store_path: None,
        }
    }
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            account_sid: String::new(),
            auth_token: String::new(),
            api_base_url: default_api_base_url(),
            webhook_secret: String::new(),
            skip_signature_verification: false,
        }
    }
}

impl fmt::Debug for TelephonyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelephonyConfig")
            .field("provider", &self.provider)
            .field("account_sid", &self.account_sid)
            .field("auth_token", &"[REDACTED]")
            .field("api_base_url", &self.api_base_url)
            .field("webhook_secret", &"[REDACTED]")
            .field(
                "skip_signature_verification",
                &self.skip_signature_verification,
            )
            .finish()
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            stt_binary: default_stt_binary(),
            stt_model: default_stt_model(),
            tts_binary: default_tts_binary(),
            tts_voices_dir: default_tts_voices_dir(),
            stt_window_ms: default_stt_window_ms(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but is unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.server.public_url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "server.public_url must be an http(s) URL, got {:?}",
                url
            )));
        }
        for (name, path) in [
            ("server.webhook_path", &self.server.webhook_path),
            ("server.stream_path", &self.server.stream_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "{} must start with '/', got {:?}",
                    name, path
                )));
            }
        }
        if self.server.webhook_path == self.server.stream_path {
            return Err(ConfigError::Invalid(
                "webhook_path and stream_path must differ".to_string(),
            ));
        }
        if self.calls.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "calls.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.telephony.provider == ProviderKind::Twilio {
            if self.telephony.account_sid.is_empty() || self.telephony.auth_token.is_empty() {
                return Err(ConfigError::Invalid(
                    "telephony.account_sid and telephony.auth_token are required for twilio"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `RINGLINE_HOST`, `RINGLINE_PORT`, `RINGLINE_PUBLIC_URL`, `RINGLINE_API_TOKEN`
/// - `RINGLINE_LOG_LEVEL`, `RINGLINE_LOG_JSON` ("true" or "1" to enable)
/// - `RINGLINE_MAX_CONCURRENT`, `RINGLINE_DEFAULT_TO`, `RINGLINE_FROM_NUMBER`,
///   `RINGLINE_STORE_PATH`
/// - `RINGLINE_PROVIDER`, `RINGLINE_ACCOUNT_SID`, `RINGLINE_AUTH_TOKEN`,
///   `RINGLINE_WEBHOOK_SECRET`, `RINGLINE_SKIP_SIGNATURE_VERIFICATION`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies `RINGLINE_*` overrides read through `lookup`.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let flag = |v: String| v == "true" || v == "1";

    if let Some(parsed) = lookup("RINGLINE_HOST").and_then(|v| v.parse().ok()) {
        config.server.host = parsed;
    }
    if let Some(parsed) = lookup("RINGLINE_PORT").and_then(|v| v.parse().ok()) {
        config.server.port = parsed;
    }
    if let Some(url) = lookup("RINGLINE_PUBLIC_URL") {
        config.server.public_url = url;
    }
    if let Some(token) = lookup("RINGLINE_API_TOKEN") {
        config.server.api_token = Some(token).filter(|t| !t.is_empty());
    }
    if let Some(level) = lookup("RINGLINE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("RINGLINE_LOG_JSON") {
        config.logging.json = flag(json);
    }
    if let Some(parsed) = lookup("RINGLINE_MAX_CONCURRENT").and_then(|v| v.parse().ok()) {
        config.calls.max_concurrent = parsed;
    }
    if let Some(to) = lookup("RINGLINE_DEFAULT_TO") {
        config.calls.default_to = Some(to).filter(|t| !t.is_empty());
    }
    if let Some(from) = lookup("RINGLINE_FROM_NUMBER") {
        config.calls.from_number = from;
    }
    if let Some(path) = lookup("RINGLINE_STORE_PATH") {
        config.calls.store_path = Some(path).filter(|p| !p.is_empty());
    }
    match lookup("RINGLINE_PROVIDER").as_deref() {
        Some("twilio") => config.telephony.provider = ProviderKind::Twilio,
        Some("mock") => config.telephony.provider = ProviderKind::Mock,
        Some(other) => tracing::warn!(provider = other, "ignoring unknown RINGLINE_PROVIDER"),
        None => {}
    }
    if let Some(sid) = lookup("RINGLINE_ACCOUNT_SID") {
        config.telephony.account_sid = sid;
    }
    if let Some(token) = lookup("RINGLINE_AUTH_TOKEN") {
        config.telephony.auth_token = token;
    }
    if let Some(secret) = lookup("RINGLINE_WEBHOOK_SECRET") {
        config.telephony.webhook_secret = secret;
    }
    if let Some(skip) = lookup("RINGLINE_SKIP_SIGNATURE_VERIFICATION") {
        config.telephony.skip_signature_verification = flag(skip);
    }
}
