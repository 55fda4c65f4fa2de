//! External engine trait boundary.
//!
//! The STT / translation / synthesis backends are opaque RPCs (spec §6.3).
//! Business logic depends only on these traits, never on the generated
//! tonic client types directly — the same seam the teacher draws between
//! `tts/mod.rs`'s `TextToSpeech` trait and its concrete engine backends.

pub mod grpc;
pub mod stub;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    pub sample_rate_hertz: u32,
    pub language_code: String,
    pub enhanced: bool,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct RecognizeResult {
    pub text: String,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct StreamingEvent {
    pub text: String,
    pub is_final: bool,
    pub confidence: f32,
}

/// One streaming recognition session: push audio in, receive events out.
#[async_trait]
pub trait StreamingRecognizeSession: Send {
    async fn send_audio(&mut self, bytes: Vec<u8>) -> Result<(), EngineError>;
    async fn recv_event(&mut self) -> Result<Option<StreamingEvent>, EngineError>;
    async fn close(&mut self);
}

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn start_streaming(&self, config: RecognitionConfig) -> Result<Box<dyn StreamingRecognizeSession>, EngineError>;
    async fn recognize(&self, config: RecognitionConfig, bytes: Vec<u8>, timeout: Duration) -> Result<RecognizeResult, EngineError>;
}

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, source_lang: &str, target_lang: &str, timeout: Duration) -> Result<String, EngineError>;
}

#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub language_code: String,
    pub name: String,
    pub gender: String,
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceConfig, audio_encoding: &str, timeout: Duration) -> Result<Vec<u8>, EngineError>;
}
