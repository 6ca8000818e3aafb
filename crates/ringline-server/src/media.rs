//! Real-time media bridge between a provider media stream and the speech
//! engines.
//!
//! One [`MediaBridge`] runs per connected conversation call. Inbound µ-law
//! audio is decoded and fed to an STT session whose final transcripts land in
//! the call transcript as user turns. Outbound speech is synthesized at
//! 24 kHz, re-framed through an [`AudioRingBuffer`] into 20 ms frames,
//! downsampled, µ-law encoded and written back to the socket.
//!
//! # Tasks
//!
//! Each bridge owns a read loop (the upgraded socket task), a send loop, an
//! STT loop and at most one live feeder per utterance. All of them stop on
//! the bridge's `done` token, which [`MediaBridge::close`] cancels.

use axum::extract::ws::{Message, WebSocket};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use ringline_store::CallStore;
use ringline_types::{CallState, TurnEntry};
use ringline_voice::codec::{
    frame_bytes, mulaw_to_pcm16le, tts_pcm_to_telephony, TELEPHONY_SAMPLE_RATE, TTS_SAMPLE_RATE,
};
use ringline_voice::{
    AudioRingBuffer, SttEngine, SttSession, SttSessionConfig, TranscriptStream, TtsEngine,
    DEFAULT_RING_CAPACITY,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound frames buffered ahead of the socket.
const OUTBOUND_CAPACITY: usize = 64;

/// Frames sent by the provider.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum InboundFrame {
    Connected,
    Start {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        #[serde(default)]
        start: Option<StartInfo>,
    },
    Media {
        media: MediaPayload,
    },
    Mark {
        #[serde(default)]
        mark: Option<MarkInfo>,
    },
    Stop,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
struct StartInfo {
    #[serde(rename = "streamSid", default)]
    stream_sid: Option<String>,
    /// `<Parameter>` values from the TwiML that opened the stream.
    #[serde(rename = "customParameters", default)]
    custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct MediaPayload {
    payload: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct MarkInfo {
    name: String,
}

/// Frames we send to the provider.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum OutboundFrame<'a> {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
        media: MediaPayload,
    },
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: &'a str,
        mark: MarkInfo,
    },
}

/// Work queued for the send loop.
#[derive(Debug)]
enum Outbound {
    /// µ-law audio tagged with the playback generation it belongs to.
    Media { generation: u64, payload: Vec<u8> },
    Clear,
    Mark(String),
}

/// Bridge for one call's media stream.
pub struct MediaBridge {
    call_id: String,
    voice: String,
    store: Arc<CallStore>,
    stt: Arc<dyn SttEngine>,
    tts: Arc<dyn TtsEngine>,
    registry: BridgeRegistry,
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    stream_sid: Mutex<String>,
    session: OnceLock<Arc<dyn SttSession>>,
    ring: Mutex<AudioRingBuffer>,
    /// Bumped on every barge-in. Frames from older generations are dropped.
    generation: AtomicU64,
    feeder: Mutex<Option<CancellationToken>>,
    done: CancellationToken,
    closed: AtomicBool,
}

impl MediaBridge {
    pub fn new(
        call_id: impl Into<String>,
        voice: impl Into<String>,
        store: Arc<CallStore>,
        stt: Arc<dyn SttEngine>,
        tts: Arc<dyn TtsEngine>,
        registry: BridgeRegistry,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        Arc::new(Self {
            call_id: call_id.into(),
            voice: voice.into(),
            store,
            stt,
            tts,
            registry,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            stream_sid: Mutex::new(String::new()),
            session: OnceLock::new(),
            ring: Mutex::new(AudioRingBuffer::with_capacity(DEFAULT_RING_CAPACITY)),
            generation: AtomicU64::new(0),
            feeder: Mutex::new(None),
            done: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drives the bridge over an upgraded socket until either side stops.
    pub async fn run(self: Arc<Self>, socket: WebSocket) {
        let Some(outbound_rx) = lock(&self.outbound_rx).take() else {
            tracing::warn!(call_id = %self.call_id, "media bridge already running");
            return;
        };
        let (sink, mut stream) = socket.split();

        self.start_stt().await;

        let send_task = tokio::spawn(self.clone().send_loop(sink, outbound_rx));
        tracing::info!(call_id = %self.call_id, "media bridge connected");

        loop {
            let message = tokio::select! {
                _ = self.done.cancelled() => break,
                message = stream.next() => message,
            };
            match message {
                Some(Ok(Message::Text(text))) => {
                    if !self.handle_frame(text.as_str()).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(call_id = %self.call_id, error = %e, "media socket error");
                    break;
                }
            }
        }

        self.close().await;
        let _ = send_task.await;
    }

    /// Opens the STT session and starts forwarding its transcripts.
    async fn start_stt(self: &Arc<Self>) {
        let config = SttSessionConfig {
            sample_rate: TELEPHONY_SAMPLE_RATE,
            language: None,
        };
        match self.stt.start_session(config).await {
            Ok(session) => {
                let session: Arc<dyn SttSession> = Arc::from(session);
                if let Some(transcripts) = session.transcripts() {
                    tokio::spawn(self.clone().stt_loop(transcripts));
                }
                let _ = self.session.set(session.clone());
                // close() may have run while the session was starting.
                if self.done.is_cancelled() {
                    session.close().await;
                }
            }
            Err(e) => {
                tracing::warn!(
                    call_id = %self.call_id,
                    error = %e,
                    "stt session unavailable, callee speech will not be transcribed"
                );
            }
        }
    }

    /// Handles one inbound frame. Returns `false` when the stream is over.
    async fn handle_frame(self: &Arc<Self>, text: &str) -> bool {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(call_id = %self.call_id, error = %e, "ignoring malformed media frame");
                return true;
            }
        };

        match frame {
            InboundFrame::Connected => {
                tracing::debug!(call_id = %self.call_id, "media stream connected");
            }
            InboundFrame::Start { stream_sid, start } => {
                let start = start.unwrap_or_default();
                if let Some(bound) = start.custom_parameters.get("call_id") {
                    if bound != &self.call_id {
                        tracing::warn!(
                            call_id = %self.call_id,
                            stream_call_id = %bound,
                            "media stream started for a different call"
                        );
                        return false;
                    }
                }
                let sid = stream_sid.or(start.stream_sid).unwrap_or_default();
                *lock(&self.stream_sid) = sid.clone();
                tracing::info!(call_id = %self.call_id, stream_sid = %sid, "media stream started");

                self.set_state(CallState::Active).await;
                self.set_state(CallState::Listening).await;

                let greeting = match self.store.get(&self.call_id).await {
                    Ok(record) => record.greeting().map(str::to_string),
                    Err(_) => None,
                };
                if let Some(greeting) = greeting {
                    self.speak_text(&greeting).await;
                }
            }
            InboundFrame::Media { media } => {
                let mulaw = match STANDARD.decode(media.payload.as_bytes()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::debug!(call_id = %self.call_id, error = %e, "bad media payload");
                        return true;
                    }
                };
                if let Some(session) = self.session.get() {
                    if let Err(e) = session.send_audio(mulaw_to_pcm16le(&mulaw)).await {
                        tracing::debug!(call_id = %self.call_id, error = %e, "stt rejected audio");
                    }
                }
            }
            InboundFrame::Mark { mark } => {
                tracing::debug!(
                    call_id = %self.call_id,
                    mark = mark.as_ref().map(|m| m.name.as_str()).unwrap_or(""),
                    "playback mark reached"
                );
            }
            InboundFrame::Stop => {
                tracing::info!(call_id = %self.call_id, "media stream stopped");
                return false;
            }
            InboundFrame::Unknown => {
                tracing::debug!(call_id = %self.call_id, "ignoring unknown media event");
            }
        }
        true
    }

    /// Speaks `text` to the callee, interrupting anything already playing.
    pub async fn speak_text(self: &Arc<Self>, text: &str) {
        if self.is_closed() {
            return;
        }
        let generation = self.barge_in().await;
        self.set_state(CallState::Speaking).await;

        let token = self.done.child_token();
        *lock(&self.feeder) = Some(token.clone());

        let audio = self.tts.synthesize_stream(text, &self.voice, TTS_SAMPLE_RATE);
        tokio::spawn(self.clone().feed(generation, audio, token));
    }

    /// Stops current playback and returns the new playback generation.
    async fn barge_in(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = lock(&self.feeder).take() {
            previous.cancel();
        }
        lock(&self.ring).clear();
        tokio::select! {
            _ = self.done.cancelled() => {}
            _ = self.outbound_tx.send(Outbound::Clear) => {}
        }
        generation
    }

    async fn feed(
        self: Arc<Self>,
        generation: u64,
        mut audio: ringline_voice::AudioStream,
        token: CancellationToken,
    ) {
        let frame_len = frame_bytes(TTS_SAMPLE_RATE);

        let finished = 'stream: loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => break 'stream false,
                chunk = audio.recv() => chunk,
            };
            let pcm = match chunk {
                None => break true,
                Some(Ok(pcm)) => pcm,
                Some(Err(e)) => {
                    tracing::warn!(call_id = %self.call_id, error = %e, "tts failed mid-utterance");
                    break true;
                }
            };

            let mut offset = 0;
            while offset < pcm.len() {
                let frames = {
                    let mut ring = lock(&self.ring);
                    if self.generation.load(Ordering::SeqCst) != generation {
                        break 'stream false;
                    }
                    offset += ring.write(&pcm[offset..]);
                    let mut frames = Vec::new();
                    while let Some(frame) = ring.read_exact_frame(frame_len) {
                        frames.push(frame);
                    }
                    frames
                };
                for frame in frames {
                    if !self.push_media(generation, &frame, &token).await {
                        break 'stream false;
                    }
                }
            }
        };

        if !finished {
            return;
        }

        let rest = {
            let mut ring = lock(&self.ring);
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            ring.drain_all()
        };
        if !rest.is_empty() && !self.push_media(generation, &rest, &token).await {
            return;
        }

        let mark = format!("utterance-{}", generation);
        let sent = tokio::select! {
            _ = token.cancelled() => false,
            sent = self.outbound_tx.send(Outbound::Mark(mark)) => sent.is_ok(),
        };
        if sent && self.generation.load(Ordering::SeqCst) == generation {
            self.set_state(CallState::Listening).await;
        }
    }

    async fn push_media(&self, generation: u64, pcm: &[u8], token: &CancellationToken) -> bool {
        let payload = tts_pcm_to_telephony(pcm);
        if payload.is_empty() {
            return true;
        }
        tokio::select! {
            _ = token.cancelled() => false,
            sent = self.outbound_tx.send(Outbound::Media { generation, payload }) => sent.is_ok(),
        }
    }

    async fn send_loop(
        self: Arc<Self>,
        mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
        mut outbound: mpsc::Receiver<Outbound>,
    ) {
        loop {
            let item = tokio::select! {
                _ = self.done.cancelled() => break,
                item = outbound.recv() => item,
            };
            let Some(item) = item else { break };

            let stream_sid = lock(&self.stream_sid).clone();
            let frame = match item {
                Outbound::Media {
                    generation,
                    payload,
                } => {
                    if generation != self.generation.load(Ordering::SeqCst) {
                        continue;
                    }
                    OutboundFrame::Media {
                        stream_sid: &stream_sid,
                        media: MediaPayload {
                            payload: STANDARD.encode(payload),
                        },
                    }
                }
                Outbound::Clear => OutboundFrame::Clear {
                    stream_sid: &stream_sid,
                },
                Outbound::Mark(name) => OutboundFrame::Mark {
                    stream_sid: &stream_sid,
                    mark: MarkInfo { name },
                },
            };

            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(call_id = %self.call_id, error = %e, "failed to encode media frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                tracing::debug!(call_id = %self.call_id, "media socket closed while sending");
                break;
            }
        }

        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }

    async fn stt_loop(self: Arc<Self>, mut transcripts: TranscriptStream) {
        loop {
            let item = tokio::select! {
                _ = self.done.cancelled() => break,
                item = transcripts.recv() => item,
            };
            match item {
                None => break,
                Some(Ok(transcript)) => {
                    let text = transcript.text.trim();
                    if !transcript.is_final || text.is_empty() {
                        continue;
                    }
                    match self
                        .store
                        .append_transcript(&self.call_id, TurnEntry::user(text))
                        .await
                    {
                        Ok(_) => tracing::info!(call_id = %self.call_id, "callee turn transcribed"),
                        Err(e) => tracing::warn!(
                            call_id = %self.call_id,
                            error = %e,
                            "failed to record callee turn"
                        ),
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(call_id = %self.call_id, error = %e, "stt error");
                }
            }
        }
    }

    async fn set_state(&self, state: CallState) {
        if let Err(e) = self.store.transition(&self.call_id, state, None).await {
            tracing::debug!(call_id = %self.call_id, state = %state, error = %e, "state change skipped");
        }
    }

    /// Shuts the bridge down. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.done.cancel();
        if let Some(session) = self.session.get() {
            session.close().await;
        }
        self.registry.remove(&self.call_id, self);
        tracing::info!(call_id = %self.call_id, "media bridge closed");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Live bridges keyed by call ID. At most one per call.
#[derive(Clone, Default)]
pub struct BridgeRegistry {
    bridges: Arc<Mutex<HashMap<String, Arc<MediaBridge>>>>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `bridge` unless its call already has one.
    pub fn try_register(&self, bridge: Arc<MediaBridge>) -> bool {
        let mut bridges = lock(&self.bridges);
        if bridges.contains_key(bridge.call_id()) {
            return false;
        }
        bridges.insert(bridge.call_id().to_string(), bridge);
        true
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<MediaBridge>> {
        lock(&self.bridges).get(call_id).cloned()
    }

    pub fn contains(&self, call_id: &str) -> bool {
        lock(&self.bridges).contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.bridges).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes the entry for `call_id` only if it is `bridge`.
    pub fn remove(&self, call_id: &str, bridge: &MediaBridge) {
        let mut bridges = lock(&self.bridges);
        if bridges
            .get(call_id)
            .is_some_and(|b| std::ptr::eq(b.as_ref(), bridge))
        {
            bridges.remove(call_id);
        }
    }

    /// Closes the bridge for `call_id`, if any.
    pub async fn close(&self, call_id: &str) {
        if let Some(bridge) = self.get(call_id) {
            bridge.close().await;
        }
    }

    pub async fn close_all(&self) {
        let bridges: Vec<Arc<MediaBridge>> = lock(&self.bridges).values().cloned().collect();
        for bridge in bridges {
            bridge.close().await;
        }
    }
}
