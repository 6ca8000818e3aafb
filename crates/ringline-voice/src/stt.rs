use crate::codec::{pcm16le_to_samples, TELEPHONY_SAMPLE_RATE};
use crate::error::VoiceError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Maximum audio input size for one transcription (10 MiB).
const MAX_STT_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Timeout for STT process execution.
const STT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default amount of audio gathered before each transcription pass.
pub const DEFAULT_STT_WINDOW_MS: u32 = 3_000;

const SESSION_AUDIO_CAPACITY: usize = 256;
const TRANSCRIPT_CAPACITY: usize = 64;
const PENDING_WINDOWS: usize = 4;

/// Windows whose RMS falls below this are treated as silence and skipped.
const SILENCE_RMS: f64 = 200.0;

/// Parameters for a streaming recognition session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SttSessionConfig {
    /// Sample rate of the PCM fed to [`SttSession::send_audio`].
    pub sample_rate: u32,
    /// BCP-47 language hint, if any.
    pub language: Option<String>,
}

impl Default for SttSessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: TELEPHONY_SAMPLE_RATE,
            language: None,
        }
    }
}

/// A recognition result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
    /// `false` for interim hypotheses that may still change.
    pub is_final: bool,
}

/// Stream of recognition results. Errors are delivered as values.
pub type TranscriptStream = mpsc::Receiver<Result<Transcript, VoiceError>>;

/// A speech-to-text engine that can open streaming sessions.
#[async_trait]
pub trait SttEngine: Send + Sync {
    async fn start_session(
        &self,
        config: SttSessionConfig,
    ) -> Result<Box<dyn SttSession>, VoiceError>;
}

/// One live recognition session.
#[async_trait]
pub trait SttSession: Send + Sync {
    /// Feeds 16-bit little-endian PCM at the session's sample rate.
    async fn send_audio(&self, pcm: Vec<u8>) -> Result<(), VoiceError>;

    /// Hands out the result stream. Only the first call returns `Some`.
    fn transcripts(&self) -> Option<TranscriptStream>;

    /// Stops the session. The transcript stream ends shortly after.
    async fn close(&self);
}

/// Speech-to-text backed by a whisper.cpp style binary.
///
/// Sessions gather audio into fixed windows and transcribe each window in
/// turn, so every result is final.
#[derive(Debug, Clone)]
pub struct WhisperSttEngine {
    model_path: PathBuf,
    binary_path: PathBuf,
    window_ms: u32,
}

impl WhisperSttEngine {
    pub fn new(model_path: impl Into<PathBuf>, binary_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            binary_path: binary_path.into(),
            window_ms: DEFAULT_STT_WINDOW_MS,
        }
    }

    pub fn with_window_ms(mut self, window_ms: u32) -> Self {
        self.window_ms = window_ms.max(100);
        self
    }

    /// Transcribes one buffer of PCM.
    pub async fn transcribe(&self, pcm: &[u8], sample_rate: u32) -> Result<String, VoiceError> {
        if pcm.len() > MAX_STT_INPUT_BYTES {
            return Err(VoiceError::Stt(format!(
                "audio data exceeds maximum size: {} bytes (limit: {} bytes)",
                pcm.len(),
                MAX_STT_INPUT_BYTES
            )));
        }

        let mut command = Command::new(&self.binary_path);
        command
            .arg("-m")
            .arg(&self.model_path)
            .arg("-f")
            .arg("-")
            .arg("--no-timestamps")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| VoiceError::Stt(format!("Failed to spawn STT binary: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Stt("Failed to open stdin".to_string()))?;

        let mut wav = Vec::with_capacity(pcm.len() + 44);
        wav.extend_from_slice(&wav_header(sample_rate, pcm.len() as u32));
        wav.extend_from_slice(pcm);

        let write_task = tokio::spawn(async move {
            stdin.write_all(&wav).await?;
            stdin.shutdown().await
        });

        let output = tokio::time::timeout(STT_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::Stt(format!(
                    "STT process timed out after {} seconds",
                    STT_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| VoiceError::Stt(format!("Failed to read stdout: {}", e)))?;

        match write_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(VoiceError::Stt(format!("Failed to write to stdin: {}", e)))
            }
            Err(e) => return Err(VoiceError::Stt(format!("Stdin task failed: {}", e))),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Stt(format!("STT binary failed: {}", stderr)));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SttEngine for WhisperSttEngine {
    async fn start_session(
        &self,
        config: SttSessionConfig,
    ) -> Result<Box<dyn SttSession>, VoiceError> {
        if config.sample_rate == 0 {
            return Err(VoiceError::Config("sample rate must be positive".to_string()));
        }

        let window_bytes = config.sample_rate as usize * 2 * self.window_ms as usize / 1000;
        let cancel = CancellationToken::new();
        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(SESSION_AUDIO_CAPACITY);
        let (window_tx, mut window_rx) = mpsc::channel::<Vec<u8>>(PENDING_WINDOWS);
        let (transcript_tx, transcript_rx) = mpsc::channel(TRANSCRIPT_CAPACITY);

        let gather_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut pending = Vec::with_capacity(window_bytes);
            loop {
                tokio::select! {
                    _ = gather_cancel.cancelled() => break,
                    chunk = audio_rx.recv() => {
                        let Some(chunk) = chunk else { break };
                        pending.extend_from_slice(&chunk);
                        if pending.len() < window_bytes {
                            continue;
                        }
                        let window = std::mem::replace(&mut pending, Vec::with_capacity(window_bytes));
                        if is_silent(&window) {
                            continue;
                        }
                        if window_tx.try_send(window).is_err() {
                            tracing::warn!("stt transcriber is behind, dropping audio window");
                        }
                    }
                }
            }
        });

        let engine = self.clone();
        let sample_rate = config.sample_rate;
        let transcribe_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let window = tokio::select! {
                    _ = transcribe_cancel.cancelled() => break,
                    window = window_rx.recv() => match window {
                        Some(w) => w,
                        None => break,
                    },
                };
                let result = tokio::select! {
                    _ = transcribe_cancel.cancelled() => break,
                    result = engine.transcribe(&window, sample_rate) => result,
                };
                let message = match result {
                    Ok(text) if text.is_empty() => continue,
                    Ok(text) => Ok(Transcript {
                        text,
                        is_final: true,
                    }),
                    Err(e) => Err(e),
                };
                if transcript_tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        Ok(Box::new(WhisperSession {
            audio_tx,
            transcripts: Mutex::new(Some(transcript_rx)),
            cancel,
        }))
    }
}

struct WhisperSession {
    audio_tx: mpsc::Sender<Vec<u8>>,
    transcripts: Mutex<Option<TranscriptStream>>,
    cancel: CancellationToken,
}

#[async_trait]
impl SttSession for WhisperSession {
    async fn send_audio(&self, pcm: Vec<u8>) -> Result<(), VoiceError> {
        if self.cancel.is_cancelled() {
            return Err(VoiceError::Closed);
        }
        self.audio_tx.send(pcm).await.map_err(|_| VoiceError::Closed)
    }

    fn transcripts(&self) -> Option<TranscriptStream> {
        match self.transcripts.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}

fn is_silent(pcm: &[u8]) -> bool {
    let samples = pcm16le_to_samples(pcm);
    if samples.is_empty() {
        return true;
    }
    let energy: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (energy / samples.len() as f64).sqrt() < SILENCE_RMS
}

/// Canonical 44-byte header for mono 16-bit PCM WAV data.
pub fn wav_header(sample_rate: u32, data_len: u32) -> [u8; 44] {
    let mut header = [0u8; 44];
    let byte_rate = sample_rate * 2;
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&(36 + data_len).to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&1u16.to_le_bytes());
    header[22..24].copy_from_slice(&1u16.to_le_bytes());
    header[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&2u16.to_le_bytes());
    header[34..36].copy_from_slice(&16u16.to_le_bytes());
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_len.to_le_bytes());
    header
}
