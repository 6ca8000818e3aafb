//! Audio plumbing for ringline calls.
//!
//! - [`codec`]: G.711 µ-law companding and the 24 kHz / 8 kHz resamplers.
//! - [`ring`]: the byte ring buffer that re-frames TTS output.
//! - [`stt`]: the streaming speech-to-text port and a whisper adapter.
//! - [`tts`]: the streaming text-to-speech port and a piper adapter.

pub mod codec;
mod error;
pub mod ring;
pub mod stt;
pub mod tts;

pub use error::VoiceError;
pub use ring::{AudioRingBuffer, DEFAULT_RING_CAPACITY};
pub use stt::{
    SttEngine, SttSession, SttSessionConfig, Transcript, TranscriptStream, WhisperSttEngine,
};
pub use tts::{AudioStream, PiperTtsEngine, TtsEngine};
