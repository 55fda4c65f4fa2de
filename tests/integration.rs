//! End-to-end scenarios wired over real loopback WebSocket sockets.
//!
//! Exercises the literal scenarios and invariants from spec §8 (happy path,
//! broadcast fan-out, breaker short-circuit + fallback audio, dead-socket
//! reclamation, adapter restart, keepalive, fallback/recovery) using local
//! engine doubles, since `engines::stub` is `#[cfg(test)]`-only and not
//! visible from an external test crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use speechbridge_core::engines::{
    RecognitionConfig, RecognizeResult, SpeechRecognizer, StreamingEvent, StreamingRecognizeSession,
    Synthesizer, Translator, VoiceConfig,
};
use speechbridge_core::error::EngineError;
use speechbridge_core::hybrid_service::BufferMode;
use speechbridge_core::{
    CircuitBreaker, ConnectionManager, FallbackOrchestrator, HybridServiceFactory, PipelineConfig,
    RetryPolicy, SessionController, StreamingRecognizerAdapter, TranslateSynthesizePipeline, TranslationCache,
};

const FINAL_THRESHOLD_BYTES: usize = 8_000;

/// Emits one final transcript once enough audio has streamed through, then
/// stays silent. Mirrors the crate's own `StubRecognizer` stub, duplicated
/// here because that one only compiles under `cfg(test)` inside the library.
struct FixedRecognizer {
    transcript: String,
}

struct FixedStreamingSession {
    transcript: String,
    seen: usize,
    emitted: bool,
}

#[async_trait]
impl StreamingRecognizeSession for FixedStreamingSession {
    async fn send_audio(&mut self, bytes: Vec<u8>) -> Result<(), EngineError> {
        self.seen += bytes.len();
        Ok(())
    }

    async fn recv_event(&mut self) -> Result<Option<StreamingEvent>, EngineError> {
        // `Ok(None)` tells the adapter's worker the upstream stream closed,
        // so this must block until the final is actually ready rather than
        // reporting "closed" on every empty poll.
        loop {
            if !self.emitted && self.seen >= FINAL_THRESHOLD_BYTES {
                self.emitted = true;
                return Ok(Some(StreamingEvent {
                    text: self.transcript.clone(),
                    is_final: true,
                    confidence: 0.9,
                }));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl SpeechRecognizer for FixedRecognizer {
    async fn start_streaming(
        &self,
        _config: RecognitionConfig,
    ) -> Result<Box<dyn StreamingRecognizeSession>, EngineError> {
        Ok(Box::new(FixedStreamingSession {
            transcript: self.transcript.clone(),
            seen: 0,
            emitted: false,
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
            text: self.transcript.clone(),
            confidence: 0.9,
        })
    }
}

struct FixedTranslator {
    fail_remaining: Mutex<usize>,
    calls: AtomicUsize,
}

impl FixedTranslator {
    fn new(fail_first: usize) -> Self {
        Self {
            fail_remaining: Mutex::new(fail_first),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Translator for FixedTranslator {
    async fn translate(
        &self,
        text: &str,
        _source_lang: &str,
        _target_lang: &str,
        _timeout: Duration,
    ) -> Result<String, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut remaining = self.fail_remaining.lock();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(EngineError::Transport("forced failure".to_string()));
        }
        Ok(format!("{text} (en)"))
    }
}

struct FixedSynthesizer {
    payload_len: usize,
}

#[async_trait]
impl Synthesizer for FixedSynthesizer {
    async fn synthesize(
        &self,
        _text: &str,
        _voice: &VoiceConfig,
        _audio_encoding: &str,
        _timeout: Duration,
    ) -> Result<Vec<u8>, EngineError> {
        Ok(vec![0xABu8; self.payload_len])
    }
}

fn recognition_config() -> RecognitionConfig {
    RecognitionConfig {
        sample_rate_hertz: 16_000,
        language_code: "nl-NL".to_string(),
        enhanced: true,
        model: "latest_long".to_string(),
    }
}

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        source_lang: "nl".to_string(),
        target_lang: "en".to_string(),
        voice: VoiceConfig {
            language_code: "en-US".to_string(),
            name: "en-US-Wavenet-D".to_string(),
            gender: "NEUTRAL".to_string(),
        },
        audio_encoding: "MP3".to_string(),
        translation_timeout: Duration::from_secs(5),
        synthesis_timeout: Duration::from_secs(5),
        outer_timeout: Duration::from_secs(5),
    }
}

async fn bind_loopback() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, format!("ws://{addr}"))
}

/// Connects as a plain-TCP WebSocket client, bypassing `connect_async`'s TLS
/// stream wrapper entirely since every address under test is loopback.
async fn connect_client(url: &str) -> WebSocketStream<TcpStream> {
    let addr = url.trim_start_matches("ws://");
    let stream = TcpStream::connect(addr).await.unwrap();
    let (ws, _) = tokio_tungstenite::client_async(url, stream).await.unwrap();
    ws
}

/// Drives one speaker session end-to-end over a real loopback socket, with
/// `n_listeners` real loopback listener sockets attached beforehand.
async fn run_happy_path(n_listeners: usize, payload_len: usize) -> Vec<Vec<u8>> {
    let connection_manager = Arc::new(ConnectionManager::new(Duration::from_secs(30), Duration::from_secs(10)));
    let orchestrator = Arc::new(FallbackOrchestrator::new(3, Duration::from_secs(60), 5, 0.7));

    let recognizer: Arc<dyn SpeechRecognizer> = Arc::new(FixedRecognizer {
        transcript: "hallo wereld".to_string(),
    });
    let translator: Arc<dyn Translator> = Arc::new(FixedTranslator::new(0));
    let synthesizer: Arc<dyn Synthesizer> = Arc::new(FixedSynthesizer { payload_len });

    let pipeline = Arc::new(TranslateSynthesizePipeline::new(
        translator,
        synthesizer,
        Arc::new(TranslationCache::new()),
        Arc::new(CircuitBreaker::new("translate", 5, Duration::from_secs(30))),
        Arc::new(CircuitBreaker::new("synthesize", 5, Duration::from_secs(30))),
        RetryPolicy::new(2, Duration::from_millis(10)),
        pipeline_config(),
    ));

    let hybrid_factory = Arc::new(HybridServiceFactory {
        streaming_threshold_bytes: 5_000,
        freq_threshold_per_s: 8.0,
        quality_threshold: 0.5,
        measurement_window: Duration::from_secs(10),
        buffered_base_timeout: Duration::from_secs(2),
        orchestrator,
        one_shot_engine: recognizer.clone(),
        recognition_config: recognition_config(),
        one_shot_timeout: Duration::from_secs(5),
    });

    // Attach listeners over real loopback sockets.
    let (listener_listener, listener_url) = bind_loopback().await;
    let stream_id = "demo".to_string();
    {
        let connection_manager = connection_manager.clone();
        let stream_id = stream_id.clone();
        tokio::spawn(async move {
            for _ in 0..n_listeners {
                if let Ok((stream, _)) = listener_listener.accept().await {
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        connection_manager.add_listener(&stream_id, ws);
                    }
                }
            }
        });
    }
    let mut listener_clients = Vec::new();
    for _ in 0..n_listeners {
        listener_clients.push(connect_client(&listener_url).await);
    }
    // Give the accept loop a moment to register every listener before the
    // speaker starts producing a broadcast.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Speaker socket.
    let (speaker_listener, speaker_url) = bind_loopback().await;
    let controller = Arc::new(SessionController::new(
        stream_id.clone(),
        connection_manager.clone(),
        pipeline,
        b"FALLBACK".to_vec(),
    ));
    {
        let controller = controller.clone();
        let recognizer = recognizer.clone();
        let hybrid = Arc::new(hybrid_factory.build());
        tokio::spawn(async move {
            let (stream, _) = speaker_listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            controller
                .run(ws, recognizer, recognition_config(), Duration::from_secs(280), hybrid)
                .await;
        });
    }
    let mut speaker = connect_client(&speaker_url).await;

    // 30 x 100ms chunks of arbitrary content, as in the literal scenario.
    for _ in 0..30 {
        speaker.send(Message::Binary(vec![0x11u8; 1_600])).await.unwrap();
    }

    let mut received = Vec::new();
    for client in listener_clients.iter_mut() {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("listener should receive a frame before the timeout")
            .expect("listener stream should not end")
            .expect("listener frame should not be a transport error");
        match frame {
            Message::Binary(bytes) => received.push(bytes),
            other => panic!("expected a binary frame, got {other:?}"),
        }
    }
    received
}

#[tokio::test]
async fn happy_path_listener_receives_exactly_one_matching_frame() {
    let received = run_happy_path(1, 7_890).await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].len(), 7_890);
}

#[tokio::test]
async fn broadcast_fan_out_delivers_identical_frame_to_every_listener() {
    let received = run_happy_path(3, 4_096).await;
    assert_eq!(received.len(), 3);
    assert!(received.iter().all(|b| b == &received[0]));
    assert_eq!(received[0].len(), 4_096);
}

#[tokio::test]
async fn breaker_opens_after_fail_max_and_subsequent_call_is_short_circuited() {
    let translator = Arc::new(FixedTranslator::new(2));
    let synthesizer: Arc<dyn Synthesizer> = Arc::new(FixedSynthesizer { payload_len: 16 });
    let pipeline = TranslateSynthesizePipeline::new(
        translator.clone(),
        synthesizer,
        Arc::new(TranslationCache::new()),
        Arc::new(CircuitBreaker::new("translate", 2, Duration::from_secs(30))),
        Arc::new(CircuitBreaker::new("synthesize", 2, Duration::from_secs(30))),
        RetryPolicy::new(1, Duration::from_millis(1)),
        pipeline_config(),
    );

    assert!(pipeline.process("eerste poging").await.is_err());
    assert!(pipeline.process("tweede poging").await.is_err());
    let calls_before = translator.calls.load(Ordering::SeqCst);

    // Breaker is now open; this call must short-circuit without reaching
    // the translator, so the caller falls back to FALLBACK_AUDIO.
    let third = pipeline.process("derde poging").await;
    assert!(third.is_err());
    assert_eq!(translator.calls.load(Ordering::SeqCst), calls_before);
}

#[tokio::test]
async fn dead_listener_is_removed_and_remaining_listener_still_receives_broadcast() {
    let connection_manager = Arc::new(ConnectionManager::new(Duration::from_secs(30), Duration::from_secs(10)));
    let (listener_listener, listener_url) = bind_loopback().await;
    let stream_id = "demo".to_string();

    {
        let connection_manager = connection_manager.clone();
        let stream_id = stream_id.clone();
        tokio::spawn(async move {
            for _ in 0..2 {
                let (stream, _) = listener_listener.accept().await.unwrap();
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                connection_manager.add_listener(&stream_id, ws);
            }
        });
    }

    let dead_client = connect_client(&listener_url).await;
    let mut live_client = connect_client(&listener_url).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connection_manager.listener_count(&stream_id), 2);

    // Close the first client's transport so its writes start failing. A
    // single write right after close can still succeed at the OS level
    // before the peer's reset is observed, so broadcast twice with a pause
    // in between to give the dead socket's write a chance to surface.
    drop(dead_client);
    tokio::time::sleep(Duration::from_millis(100)).await;

    connection_manager.broadcast_to_stream(&stream_id, vec![9, 9, 9]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    connection_manager.broadcast_to_stream(&stream_id, vec![7, 7, 7]).await;

    // The live listener still receives every broadcast regardless of the
    // dead listener's fate.
    for _ in 0..2 {
        let frame = tokio::time::timeout(Duration::from_secs(5), live_client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(frame, Message::Binary(_)));
    }

    assert_eq!(connection_manager.listener_count(&stream_id), 1);
}

/// Scenario 4: 5-minute restart. Scaled down to milliseconds: a
/// `restart_deadline` short enough to force exactly one restart inside the
/// test's runtime, with finals emitted both before and after the swap so no
/// transcript stream goes dark across it.
#[tokio::test]
async fn adapter_restarts_once_past_deadline_without_losing_finals() {
    let finals = Arc::new(Mutex::new(Vec::<String>::new()));
    let finals_cb = finals.clone();
    let recognizer: Arc<dyn SpeechRecognizer> = Arc::new(FixedRecognizer {
        transcript: "hallo wereld".to_string(),
    });
    let adapter = Arc::new(StreamingRecognizerAdapter::new(
        recognizer,
        recognition_config(),
        Duration::from_millis(300),
        Arc::new(move |text, _conf| finals_cb.lock().push(text)),
    ));
    adapter.start().await.unwrap();

    for _ in 0..5 {
        adapter.send_chunk(vec![0x11u8; 1_600]).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(150)).await;
    adapter.maybe_restart().await;
    assert_eq!(adapter.metrics.restarts.load(Ordering::SeqCst), 0, "deadline not yet elapsed");
    assert_eq!(finals.lock().len(), 1, "first session should have finalized once");

    tokio::time::sleep(Duration::from_millis(250)).await;
    adapter.maybe_restart().await;
    assert_eq!(adapter.metrics.restarts.load(Ordering::SeqCst), 1, "exactly one restart should have occurred");

    for _ in 0..5 {
        adapter.send_chunk(vec![0x11u8; 1_600]).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(finals.lock().len() >= 2, "second session should keep finalizing after the swap");

    adapter.stop().await;
}

/// Scenario 6: keepalive. Scaled down to milliseconds: a listener that pongs
/// promptly survives every tick with zero removals; a listener that never
/// pongs is reaped once `pingInterval + pongTimeout` elapses.
#[tokio::test]
async fn keepalive_listener_that_pongs_survives_every_tick() {
    let connection_manager = Arc::new(ConnectionManager::new(Duration::from_millis(40), Duration::from_millis(60)));
    let (listener_listener, listener_url) = bind_loopback().await;
    let stream_id = "demo".to_string();
    {
        let connection_manager = connection_manager.clone();
        let stream_id = stream_id.clone();
        tokio::spawn(async move {
            let (stream, _) = listener_listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            connection_manager.add_listener(&stream_id, ws);
        });
    }

    let mut client = connect_client(&listener_url).await;
    tokio::spawn(async move {
        while let Some(Ok(msg)) = client.next().await {
            if let Message::Text(text) = msg {
                if text.contains("keepalive") {
                    let _ = client
                        .send(Message::Text(r#"{"type":"keepalive","action":"pong"}"#.to_string()))
                        .await;
                }
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    for _ in 0..3 {
        connection_manager.keepalive_tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let stats = connection_manager.keepalive_stats();
    assert!(stats.pings_sent >= 3);
    assert!(stats.pongs_seen >= 1);
    assert_eq!(stats.timeouts, 0);
    assert_eq!(connection_manager.listener_count(&stream_id), 1);
}

#[tokio::test]
async fn keepalive_listener_that_never_pongs_is_reaped() {
    let connection_manager = Arc::new(ConnectionManager::new(Duration::from_millis(20), Duration::from_millis(30)));
    let (listener_listener, listener_url) = bind_loopback().await;
    let stream_id = "demo".to_string();
    {
        let connection_manager = connection_manager.clone();
        let stream_id = stream_id.clone();
        tokio::spawn(async move {
            let (stream, _) = listener_listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            connection_manager.add_listener(&stream_id, ws);
        });
    }

    // Connect but never answer pings.
    let _silent_client = connect_client(&listener_url).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connection_manager.listener_count(&stream_id), 1);

    connection_manager.keepalive_tick().await; // sends the ping
    tokio::time::sleep(Duration::from_millis(60)).await; // past ping_interval + pong_timeout
    connection_manager.keepalive_tick().await; // observes the timeout

    assert_eq!(connection_manager.listener_count(&stream_id), 0);
    assert!(connection_manager.keepalive_stats().timeouts >= 1);
}

/// Scenario 7: fallback then recovery. Repeated streaming-send failures
/// trip the orchestrator into buffered mode; once `recoveryInterval` has
/// elapsed, the next chunk's evaluation (via `process_audio_chunk`'s
/// production call to `should_attempt_recovery`/`attempt_recovery`) flips
/// the stream back to streaming.
#[tokio::test]
async fn fallback_then_recovery_flips_mode_back_to_streaming() {
    let orchestrator = Arc::new(FallbackOrchestrator::new(3, Duration::from_millis(30), 5, 0.0));
    let one_shot: Arc<dyn SpeechRecognizer> = Arc::new(FixedRecognizer {
        transcript: "hallo wereld".to_string(),
    });
    let hybrid_factory = HybridServiceFactory {
        streaming_threshold_bytes: 1,
        freq_threshold_per_s: 0.1,
        quality_threshold: 0.0,
        measurement_window: Duration::from_secs(10),
        buffered_base_timeout: Duration::from_secs(2),
        orchestrator: orchestrator.clone(),
        one_shot_engine: one_shot.clone(),
        recognition_config: recognition_config(),
        one_shot_timeout: Duration::from_secs(5),
    };
    let service = hybrid_factory.build();

    // Never started: every `send_chunk` call fails closed, standing in for
    // repeated streaming errors.
    let unstarted_adapter = Arc::new(StreamingRecognizerAdapter::new(
        one_shot.clone(),
        recognition_config(),
        Duration::from_secs(280),
        Arc::new(|_text, _conf| {}),
    ));

    for _ in 0..3 {
        service.process_audio_chunk("s1", vec![0x11u8; 1_600], &unstarted_adapter).await;
    }
    let stats = orchestrator.stats();
    assert_eq!(stats.mode_distribution.get("buffered").copied(), Some(1));
    assert!(stats.total_fallbacks >= 1);

    tokio::time::sleep(Duration::from_millis(60)).await;

    // Started and healthy: its `send_chunk` calls succeed, standing in for
    // the recovered stream's next chunk with no failures.
    let started_adapter = Arc::new(StreamingRecognizerAdapter::new(
        one_shot.clone(),
        recognition_config(),
        Duration::from_secs(280),
        Arc::new(|_text, _conf| {}),
    ));
    started_adapter.start().await.unwrap();

    let result = service.process_audio_chunk("s1", vec![0x11u8; 1_600], &started_adapter).await;
    assert_eq!(result.mode_used, BufferMode::Streaming);

    let stats_after = orchestrator.stats();
    assert!(stats_after.total_recoveries >= 1);
    assert_eq!(stats_after.mode_distribution.get("streaming").copied(), Some(1));

    started_adapter.stop().await;
}
