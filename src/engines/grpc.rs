//! gRPC-backed engine clients.
//!
//! Wraps the generated `tonic` stubs (compiled from `proto/engines.proto` by
//! `build.rs`, mirroring the teacher's own `voice_service.rs`/`build.rs`
//! pairing) behind the [`crate::engines`] traits so the rest of the crate
//! never names a generated type.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::Request;

use crate::error::EngineError;

#[allow(clippy::all)]
pub mod proto {
    include!("../proto/speechbridge.engines.v1.rs");
}

use proto::speech_engine_client::SpeechEngineClient;
use proto::synthesis_engine_client::SynthesisEngineClient;
use proto::translation_engine_client::TranslationEngineClient;
use proto::{
    streaming_recognize_request, RecognitionConfig as ProtoRecognitionConfig, RecognizeRequest,
    StreamingRecognizeRequest, SynthesizeRequest, TranslateRequest, VoiceConfig as ProtoVoiceConfig,
};

use super::{RecognitionConfig, RecognizeResult, StreamingEvent, StreamingRecognizeSession, Synthesizer, Translator, VoiceConfig};

fn to_status_error(status: tonic::Status) -> EngineError {
    use tonic::Code;
    match status.code() {
        Code::DeadlineExceeded => EngineError::Timeout(Duration::from_secs(0)),
        Code::Unavailable | Code::Unknown | Code::Aborted | Code::Cancelled => {
            EngineError::Transport(status.message().to_string())
        }
        _ => EngineError::Rejected(status.message().to_string()),
    }
}

fn to_proto_config(config: &RecognitionConfig) -> ProtoRecognitionConfig {
    ProtoRecognitionConfig {
        sample_rate_hertz: config.sample_rate_hertz as i32,
        language_code: config.language_code.clone(),
        enhanced: config.enhanced,
        model: config.model.clone(),
    }
}

pub struct GrpcSpeechRecognizer {
    client: SpeechEngineClient<Channel>,
}

impl GrpcSpeechRecognizer {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: SpeechEngineClient::new(channel),
        }
    }
}

pub struct GrpcStreamingSession {
    tx: mpsc::Sender<StreamingRecognizeRequest>,
    rx: tonic::Streaming<proto::StreamingRecognizeResponse>,
}

#[async_trait]
impl StreamingRecognizeSession for GrpcStreamingSession {
    async fn send_audio(&mut self, bytes: Vec<u8>) -> Result<(), EngineError> {
        self.tx
            .send(StreamingRecognizeRequest {
                request: Some(streaming_recognize_request::Request::AudioContent(bytes)),
            })
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))
    }

    async fn recv_event(&mut self) -> Result<Option<StreamingEvent>, EngineError> {
        match self.rx.message().await {
            Ok(Some(resp)) => Ok(Some(StreamingEvent {
                text: resp.transcript,
                is_final: resp.is_final,
                confidence: resp.confidence,
            })),
            Ok(None) => Ok(None),
            Err(status) => Err(to_status_error(status)),
        }
    }

    async fn close(&mut self) {
        // Dropping the sender closes the request stream; the server
        // half-closes its response stream in turn.
    }
}

#[async_trait]
impl super::SpeechRecognizer for GrpcSpeechRecognizer {
    async fn start_streaming(
        &self,
        config: RecognitionConfig,
    ) -> Result<Box<dyn StreamingRecognizeSession>, EngineError> {
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamingRecognizeRequest {
            request: Some(streaming_recognize_request::Request::Config(to_proto_config(&config))),
        })
        .await
        .map_err(|e| EngineError::Transport(e.to_string()))?;

        let mut client = self.client.clone();
        let outbound = ReceiverStream::new(rx);
        let response = client
            .streaming_recognize(Request::new(outbound))
            .await
            .map_err(to_status_error)?;

        Ok(Box::new(GrpcStreamingSession {
            tx,
            rx: response.into_inner(),
        }))
    }

    async fn recognize(
        &self,
        config: RecognitionConfig,
        bytes: Vec<u8>,
        timeout: Duration,
    ) -> Result<RecognizeResult, EngineError> {
        let mut client = self.client.clone();
        let mut req = Request::new(RecognizeRequest {
            config: Some(to_proto_config(&config)),
            audio_content: bytes,
        });
        req.set_timeout(timeout);
        let resp = client.recognize(req).await.map_err(to_status_error)?.into_inner();
        Ok(RecognizeResult {
            text: resp.transcript,
            confidence: resp.confidence,
        })
    }
}

pub struct GrpcTranslator {
    client: TranslationEngineClient<Channel>,
}

impl GrpcTranslator {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: TranslationEngineClient::new(channel),
        }
    }
}

#[async_trait]
impl Translator for GrpcTranslator {
    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
        timeout: Duration,
    ) -> Result<String, EngineError> {
        let mut client = self.client.clone();
        let mut req = Request::new(TranslateRequest {
            text: text.to_string(),
            source_language: source_lang.to_string(),
            target_language: target_lang.to_string(),
        });
        req.set_timeout(timeout);
        let resp = client.translate(req).await.map_err(to_status_error)?.into_inner();
        Ok(resp.translated_text)
    }
}

pub struct GrpcSynthesizer {
    client: SynthesisEngineClient<Channel>,
}

impl GrpcSynthesizer {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: SynthesisEngineClient::new(channel),
        }
    }
}

#[async_trait]
impl Synthesizer for GrpcSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceConfig,
        audio_encoding: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, EngineError> {
        let mut client = self.client.clone();
        let mut req = Request::new(SynthesizeRequest {
            text: text.to_string(),
            voice: Some(ProtoVoiceConfig {
                language_code: voice.language_code.clone(),
                name: voice.name.clone(),
                gender: voice.gender.clone(),
            }),
            audio_encoding: audio_encoding.to_string(),
        });
        req.set_timeout(timeout);
        let resp = client.synthesize(req).await.map_err(to_status_error)?.into_inner();
        Ok(resp.audio_content)
    }
}
