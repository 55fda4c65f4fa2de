//! Deterministic engine test doubles.
//!
//! Grounded on the teacher's `stt/stub.rs` (`StubSTT`): fixed, predictable
//! responses so pipeline/orchestrator tests don't depend on a live network
//! call. Test-only — never constructed from `main.rs` (see the "simulated
//! streaming path" note in DESIGN.md's Open Question decisions).
#![cfg(test)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

use super::{
    RecognitionConfig, RecognizeResult, SpeechRecognizer, StreamingEvent, StreamingRecognizeSession,
    Synthesizer, Translator, VoiceConfig,
};
use crate::error::EngineError;

pub struct StubRecognizer {
    pub fixed_transcript: String,
    pub confidence: f32,
}

impl StubRecognizer {
    pub fn new(fixed_transcript: impl Into<String>) -> Self {
        Self {
            fixed_transcript: fixed_transcript.into(),
            confidence: 0.95,
        }
    }
}

pub struct StubStreamingSession {
    pending: VecDeque<StreamingEvent>,
    audio_bytes_seen: usize,
    fixed_transcript: String,
    confidence: f32,
    emitted_final: bool,
}

#[async_trait]
impl StreamingRecognizeSession for StubStreamingSession {
    async fn send_audio(&mut self, bytes: Vec<u8>) -> Result<(), EngineError> {
        self.audio_bytes_seen += bytes.len();
        // Emit a final once enough audio has accumulated, matching the
        // teacher's stub duration-bucket heuristic.
        if !self.emitted_final && self.audio_bytes_seen >= 16_000 {
            self.emitted_final = true;
            self.pending.push_back(StreamingEvent {
                text: self.fixed_transcript.clone(),
                is_final: true,
                confidence: self.confidence,
            });
        }
        Ok(())
    }

    async fn recv_event(&mut self) -> Result<Option<StreamingEvent>, EngineError> {
        // `Ok(None)` means the upstream stream closed (the adapter's worker
        // loop exits on it), so block until an event is actually queued
        // instead of reporting "closed" on every empty poll.
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl SpeechRecognizer for StubRecognizer {
    async fn start_streaming(
        &self,
        _config: RecognitionConfig,
    ) -> Result<Box<dyn StreamingRecognizeSession>, EngineError> {
        Ok(Box::new(StubStreamingSession {
            pending: VecDeque::new(),
            audio_bytes_seen: 0,
            fixed_transcript: self.fixed_transcript.clone(),
            confidence: self.confidence,
            emitted_final: false,
        }))
    }

    async fn recognize(
        &self,
        _config: RecognitionConfig,
        bytes: Vec<u8>,
        _timeout: Duration,
    ) -> Result<RecognizeResult, EngineError> {
        if bytes.is_empty() {
            return Err(EngineError::Rejected("empty audio".to_string()));
        }
        Ok(RecognizeResult {
            text: self.fixed_transcript.clone(),
            confidence: self.confidence,
        })
    }
}

/// Translator stub whose behavior is scripted by the caller: either a fixed
/// translation, or a programmed sequence of failures (for breaker tests).
pub struct StubTranslator {
    responses: Mutex<VecDeque<Result<String, EngineError>>>,
    default_suffix: String,
}

impl StubTranslator {
    pub fn new(default_suffix: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default_suffix: default_suffix.into(),
        }
    }

    pub fn fail_next(&self, n: usize) {
        let mut q = self.responses.lock();
        for _ in 0..n {
            q.push_back(Err(EngineError::Transport("stub failure".to_string())));
        }
    }
}

#[async_trait]
impl Translator for StubTranslator {
    async fn translate(
        &self,
        text: &str,
        _source_lang: &str,
        _target_lang: &str,
        _timeout: Duration,
    ) -> Result<String, EngineError> {
        if let Some(scripted) = self.responses.lock().pop_front() {
            return scripted;
        }
        Ok(format!("{} {}", text, self.default_suffix))
    }
}

pub struct StubSynthesizer {
    pub payload_len: usize,
}

impl StubSynthesizer {
    pub fn new(payload_len: usize) -> Self {
        Self { payload_len }
    }
}

#[async_trait]
impl Synthesizer for StubSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        _voice: &VoiceConfig,
        _audio_encoding: &str,
        _timeout: Duration,
    ) -> Result<Vec<u8>, EngineError> {
        if text.is_empty() {
            return Err(EngineError::Rejected("empty text".to_string()));
        }
        Ok(vec![0xAB; self.payload_len])
    }
}
