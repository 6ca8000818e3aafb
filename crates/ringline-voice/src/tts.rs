use crate::error::VoiceError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Maximum text input size for TTS (64 KiB).
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Timeout for one synthesis, from spawn to the last chunk.
const TTS_TIMEOUT: Duration = Duration::from_secs(60);

/// Size of the chunks read from the synthesizer's stdout.
const CHUNK_BYTES: usize = 4096;

const STREAM_CAPACITY: usize = 32;

/// Voice used when the caller passes an empty voice name.
pub const DEFAULT_VOICE: &str = "default";

/// Stream of raw PCM chunks. A synthesis failure arrives as the last item.
pub type AudioStream = mpsc::Receiver<Result<Vec<u8>, VoiceError>>;

/// A text-to-speech engine that streams 16-bit little-endian mono PCM.
pub trait TtsEngine: Send + Sync {
    /// Starts synthesizing `text` and returns the chunk stream immediately.
    ///
    /// Dropping the receiver stops the synthesis.
    fn synthesize_stream(&self, text: &str, voice: &str, sample_rate: u32) -> AudioStream;
}

/// Text-to-speech backed by the piper binary.
///
/// Voices are `.onnx` models under `voices_dir`. Piper cannot resample, so a
/// model whose sidecar `.onnx.json` declares a different sample rate than
/// the one requested is rejected.
#[derive(Debug, Clone)]
pub struct PiperTtsEngine {
    voices_dir: PathBuf,
    piper_binary: PathBuf,
}

impl PiperTtsEngine {
    pub fn new(voices_dir: impl AsRef<Path>, piper_binary: impl AsRef<Path>) -> Self {
        Self {
            voices_dir: voices_dir.as_ref().to_path_buf(),
            piper_binary: piper_binary.as_ref().to_path_buf(),
        }
    }

    /// Resolves a voice name to its model file.
    pub fn model_path(&self, voice: &str) -> PathBuf {
        let voice = if voice.is_empty() { DEFAULT_VOICE } else { voice };
        let path = Path::new(voice);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        if voice.ends_with(".onnx") {
            self.voices_dir.join(voice)
        } else {
            self.voices_dir.join(format!("{}.onnx", voice))
        }
    }

    async fn stream_piper(
        &self,
        text: &str,
        voice: &str,
        sample_rate: u32,
        tx: &mpsc::Sender<Result<Vec<u8>, VoiceError>>,
    ) -> Result<(), VoiceError> {
        if text.len() > MAX_TTS_INPUT_BYTES {
            return Err(VoiceError::Tts(format!(
                "text exceeds maximum size: {} bytes (limit: {} bytes)",
                text.len(),
                MAX_TTS_INPUT_BYTES
            )));
        }

        let model_path = self.model_path(voice);
        if !model_path.exists() {
            return Err(VoiceError::Tts(format!(
                "Model file not found: {:?}",
                model_path
            )));
        }
        check_model_sample_rate(&model_path, sample_rate).await?;

        let mut command = Command::new(&self.piper_binary);
        command
            .arg("--model")
            .arg(&model_path)
            .arg("--output_raw")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| VoiceError::Tts(format!("Failed to spawn piper: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Tts("Failed to open stdin".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| VoiceError::Tts("Failed to open stdout".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| VoiceError::Tts("Failed to open stderr".to_string()))?;

        let text_owned = text.to_string();
        let write_task = tokio::spawn(async move {
            stdin.write_all(text_owned.as_bytes()).await?;
            stdin.shutdown().await
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let pump = async {
            let mut buf = vec![0u8; CHUNK_BYTES];
            loop {
                let n = stdout
                    .read(&mut buf)
                    .await
                    .map_err(|e| VoiceError::Tts(format!("Failed to read stdout: {}", e)))?;
                if n == 0 {
                    return Ok(true);
                }
                if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                    return Ok(false);
                }
            }
        };

        let completed: bool = tokio::time::timeout(TTS_TIMEOUT, pump)
            .await
            .map_err(|_| {
                VoiceError::Tts(format!(
                    "TTS process timed out after {} seconds",
                    TTS_TIMEOUT.as_secs()
                ))
            })??;

        if !completed {
            tracing::debug!("tts consumer went away, stopping piper");
            let _ = child.kill().await;
            return Ok(());
        }

        match write_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(VoiceError::Tts(format!("Failed to write to stdin: {}", e))),
            Err(e) => return Err(VoiceError::Tts(format!("Stdin task failed: {}", e))),
        }

        let status = child
            .wait()
            .await
            .map_err(|e| VoiceError::Tts(format!("Failed to wait for piper: {}", e)))?;
        if !status.success() {
            let stderr = stderr_task.await.unwrap_or_default();
            return Err(VoiceError::Tts(format!("Piper failed: {}", stderr.trim())));
        }
        Ok(())
    }
}

impl TtsEngine for PiperTtsEngine {
    fn synthesize_stream(&self, text: &str, voice: &str, sample_rate: u32) -> AudioStream {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let engine = self.clone();
        let text = text.to_string();
        let voice = voice.to_string();
        tokio::spawn(async move {
            if let Err(e) = engine.stream_piper(&text, &voice, sample_rate, &tx).await {
                tracing::warn!(voice = %voice, error = %e, "tts synthesis failed");
                let _ = tx.send(Err(e)).await;
            }
        });
        rx
    }
}

/// Compares the model's declared sample rate, when it has a sidecar config,
/// against the requested one.
async fn check_model_sample_rate(model_path: &Path, sample_rate: u32) -> Result<(), VoiceError> {
    let mut config_path = model_path.as_os_str().to_owned();
    config_path.push(".json");

    let raw = match tokio::fs::read_to_string(&config_path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(VoiceError::Config(format!("unreadable model config: {}", e))),
    };
    let config: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| VoiceError::Config(format!("invalid model config: {}", e)))?;

    match config
        .get("audio")
        .and_then(|a| a.get("sample_rate"))
        .and_then(|r| r.as_u64())
    {
        Some(declared) if declared != sample_rate as u64 => Err(VoiceError::Config(format!(
            "voice model produces {} Hz audio, {} Hz requested",
            declared, sample_rate
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_names_resolve_under_voices_dir() {
        let engine = PiperTtsEngine::new("/voices", "piper");
        assert_eq!(engine.model_path("amy"), PathBuf::from("/voices/amy.onnx"));
        assert_eq!(engine.model_path("amy.onnx"), PathBuf::from("/voices/amy.onnx"));
        assert_eq!(engine.model_path(""), PathBuf::from("/voices/default.onnx"));
        assert_eq!(engine.model_path("/opt/x.onnx"), PathBuf::from("/opt/x.onnx"));
    }

    #[tokio::test]
    async fn oversized_text_is_rejected() {
        let engine = PiperTtsEngine::new("/voices", "piper");
        let text = "a".repeat(MAX_TTS_INPUT_BYTES + 1);
        let mut stream = engine.synthesize_stream(&text, "amy", 24_000);
        match stream.recv().await {
            Some(Err(VoiceError::Tts(msg))) => assert!(msg.contains("maximum size")),
            other => panic!("expected size error, got {:?}", other),
        }
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn sample_rate_mismatch_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("amy.onnx"), b"model").unwrap();
        std::fs::write(
            dir.path().join("amy.onnx.json"),
            br#"{"audio":{"sample_rate":22050}}"#,
        )
        .unwrap();

        let engine = PiperTtsEngine::new(dir.path(), "/nonexistent/piper");
        let mut stream = engine.synthesize_stream("hello", "amy", 24_000);
        match stream.recv().await {
            Some(Err(VoiceError::Config(msg))) => assert!(msg.contains("22050")),
            other => panic!("expected config error, got {:?}", other),
        }
    }
}
