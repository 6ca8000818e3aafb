#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use ringline_server::config::Config;
use ringline_server::{app, AppState};
use ringline_telephony::{CallBackend, MockBackend};
use ringline_voice::{
    AudioStream, SttEngine, SttSession, SttSessionConfig, Transcript, TranscriptStream,
    TtsEngine, VoiceError,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceExt;

pub const CALLEE: &str = "+14155551234";
pub const CALLEE_REPLY: &str = "yes please";
/// Bytes of 24 kHz PCM the fake TTS emits per utterance (four 20 ms frames).
pub const UTTERANCE_PCM_BYTES: usize = 3840;

/// STT that answers the first audio it hears with a fixed final transcript.
pub struct FakeStt;

struct FakeSttSession {
    tx: Mutex<Option<mpsc::Sender<Result<Transcript, VoiceError>>>>,
    rx: Mutex<Option<TranscriptStream>>,
    replied: AtomicBool,
}

#[async_trait]
impl SttEngine for FakeStt {
    async fn start_session(
        &self,
        _config: SttSessionConfig,
    ) -> Result<Box<dyn SttSession>, VoiceError> {
        let (tx, rx) = mpsc::channel(8);
        Ok(Box::new(FakeSttSession {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            replied: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl SttSession for FakeSttSession {
    async fn send_audio(&self, _pcm: Vec<u8>) -> Result<(), VoiceError> {
        if self.replied.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let tx = self.tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx
                .send(Ok(Transcript {
                    text: CALLEE_REPLY.to_string(),
                    is_final: true,
                }))
                .await;
        }
        Ok(())
    }

    fn transcripts(&self) -> Option<TranscriptStream> {
        self.rx.lock().unwrap().take()
    }

    async fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

/// TTS that emits two 1920-byte chunks of PCM and records what it was asked
/// to say.
#[derive(Default)]
pub struct FakeTts {
    pub spoken: Mutex<Vec<String>>,
}

impl TtsEngine for FakeTts {
    fn synthesize_stream(&self, text: &str, _voice: &str, _sample_rate: u32) -> AudioStream {
        self.spoken.lock().unwrap().push(text.to_string());
        let (tx, rx) = mpsc::channel(4);
        let chunk: Vec<u8> = (0..UTTERANCE_PCM_BYTES / 4)
            .flat_map(|i| ((i as i16 % 64) * 256).to_le_bytes())
            .collect();
        tokio::spawn(async move {
            for _ in 0..2 {
                if tx.send(Ok(chunk.clone())).await.is_err() {
                    return;
                }
            }
        });
        rx
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.calls.from_number = "+15550000000".to_string();
    config.calls.transcript_timeout_secs = 2;
    config.calls.action_timeout_secs = 2;
    config
}

pub struct Harness {
    pub state: AppState,
    pub backend: Arc<MockBackend>,
    pub tts: Arc<FakeTts>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        Self::with_backend(config, MockBackend::new())
    }

    pub fn with_backend(config: Config, backend: MockBackend) -> Self {
        let backend = Arc::new(backend);
        let tts = Arc::new(FakeTts::default());
        let state = AppState::new(
            config,
            backend.clone() as Arc<dyn CallBackend>,
            Arc::new(FakeStt),
            tts.clone(),
            None,
        );
        Self {
            state,
            backend,
            tts,
        }
    }

    pub fn router(&self) -> Router {
        app(self.state.clone())
    }

    /// Serves the app on an ephemeral port.
    pub async fn spawn(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = self.router();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }
}

/// Sends one request through the router and decodes the JSON body, if any.
pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&body).into_owned())
        })
    };
    (status, json)
}

pub fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}
