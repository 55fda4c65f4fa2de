//! Wires one speaker socket to its recognizer, pipeline, and broadcast path.
//!
//! Grounded on the teacher's `call_server.rs::handle_connection` (the
//! accept/read-loop/dispatch shape) and
//! `examples/original_source/backend/main.py` (the per-connection wiring of
//! recognizer callback -> pipeline -> broadcast).

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::connection_manager::ConnectionManager;
use crate::engines::{RecognitionConfig, SpeechRecognizer};
use crate::hybrid_service::HybridSttService;
use crate::pipeline::TranslateSynthesizePipeline;
use crate::recognizer_adapter::StreamingRecognizerAdapter;

#[derive(Debug, Deserialize)]
struct KeepaliveFrame {
    #[serde(rename = "type")]
    kind: String,
    action: String,
}

pub struct SessionController {
    stream_id: String,
    connection_manager: Arc<ConnectionManager>,
    pipeline: Arc<TranslateSynthesizePipeline>,
    fallback_audio: Vec<u8>,
}

impl SessionController {
    pub fn new(
        stream_id: String,
        connection_manager: Arc<ConnectionManager>,
        pipeline: Arc<TranslateSynthesizePipeline>,
        fallback_audio: Vec<u8>,
    ) -> Self {
        Self {
            stream_id,
            connection_manager,
            pipeline,
            fallback_audio,
        }
    }

    /// Runs the speaker socket's full lifecycle: start the recognizer,
    /// loop reading frames, and clean up on disconnect.
    pub async fn run(
        self: Arc<Self>,
        mut socket: WebSocketStream<TcpStream>,
        recognizer_engine: Arc<dyn SpeechRecognizer>,
        recognition_config: RecognitionConfig,
        restart_deadline: Duration,
        hybrid: Arc<HybridSttService>,
    ) {
        // Finalized transcripts are fed into a single channel drained by one
        // worker task, so concurrent finals from streaming and buffered
        // processing are handed to the pipeline strictly in emission order
        // (spec §9) instead of racing as independent `tokio::spawn`s.
        let (final_tx, mut final_rx) = mpsc::unbounded_channel::<String>();
        {
            let controller = self.clone();
            tokio::spawn(async move {
                while let Some(text) = final_rx.recv().await {
                    controller.handle_final_transcript(text).await;
                }
            });
        }

        let callback_tx = final_tx.clone();
        let adapter = Arc::new(StreamingRecognizerAdapter::new(
            recognizer_engine,
            recognition_config,
            restart_deadline,
            Arc::new(move |text, _confidence| {
                let _ = callback_tx.send(text);
            }),
        ));

        if let Err(e) = adapter.start().await {
            warn!(stream_id = %self.stream_id, error = %e, "failed to start streaming recognizer session");
        }

        while let Some(frame) = socket.next().await {
            match frame {
                Ok(Message::Binary(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    let result = hybrid.process_audio_chunk(&self.stream_id, bytes, &adapter).await;
                    if let Some(text) = result.transcription {
                        let _ = final_tx.send(text);
                    }
                    adapter.maybe_restart().await;
                }
                Ok(Message::Text(text)) => {
                    self.handle_text_frame(&text);
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(stream_id = %self.stream_id, error = %e, "speaker socket read error");
                    break;
                }
            }
        }

        adapter.stop().await;
        info!(stream_id = %self.stream_id, "speaker session ended");
    }

    fn handle_text_frame(&self, text: &str) {
        match serde_json::from_str::<KeepaliveFrame>(text) {
            Ok(frame) if frame.kind == "keepalive" && frame.action == "pong" => {
                debug!(stream_id = %self.stream_id, "keepalive pong on speaker channel ignored");
            }
            Ok(_) | Err(_) => {
                debug!(stream_id = %self.stream_id, "unrecognized text frame ignored");
            }
        }
    }

    async fn handle_final_transcript(&self, transcript: String) {
        let payload = match self.pipeline.process(&transcript).await {
            Ok(audio) => audio,
            Err(e) => {
                warn!(stream_id = %self.stream_id, error = %e, "pipeline failed, sending fallback audio");
                self.fallback_audio.clone()
            }
        };
        self.connection_manager.broadcast_to_stream(&self.stream_id, payload).await;
    }
}
