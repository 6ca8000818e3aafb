use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoiceError {
    #[error("STT error: {0}")]
    Stt(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("session closed")]
    Closed,
}
