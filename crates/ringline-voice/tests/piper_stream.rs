//! Drives `PiperTtsEngine` against a stand-in shell script.
#![cfg(unix)]

use ringline_voice::{PiperTtsEngine, TtsEngine, VoiceError};
use std::os::unix::fs::PermissionsExt;

#[tokio::test]
async fn streams_script_stdout_and_reports_failures() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("amy.onnx"), b"model").unwrap();

    // Echo the text back as "audio"; fail on the magic word.
    let script = dir.path().join("fake-piper");
    std::fs::write(
        &script,
        "#!/bin/sh\ntext=$(cat)\nif [ \"$text\" = \"fail\" ]; then echo boom >&2; exit 3; fi\nprintf '%s' \"$text\"\n",
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let engine = PiperTtsEngine::new(dir.path(), &script);

    let mut stream = engine.synthesize_stream("hello there", "amy", 24_000);
    let mut audio = Vec::new();
    while let Some(chunk) = stream.recv().await {
        audio.extend(chunk.expect("chunk should be ok"));
    }
    assert_eq!(audio, b"hello there");

    let mut stream = engine.synthesize_stream("fail", "amy", 24_000);
    let mut last = None;
    while let Some(item) = stream.recv().await {
        last = Some(item);
    }
    match last {
        Some(Err(VoiceError::Tts(msg))) => assert!(msg.contains("boom"), "got: {}", msg),
        other => panic!("expected piper failure, got {:?}", other),
    }
}

#[tokio::test]
async fn missing_model_is_reported_on_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let engine = PiperTtsEngine::new(dir.path(), "piper");

    let mut stream = engine.synthesize_stream("hello", "missing", 24_000);
    match stream.recv().await {
        Some(Err(VoiceError::Tts(msg))) => assert!(msg.contains("Model file not found")),
        other => panic!("expected missing model, got {:?}", other),
    }
}
