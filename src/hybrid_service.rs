//! Front door routing each audio chunk to streaming or buffered recognition.
//!
//! Ported from `examples/original_source/backend/hybrid_stt_service.py`:
//! consults the adaptive buffer, quality monitor, and fallback orchestrator
//! to pick a path per chunk, falling back to buffered processing inline if
//! streaming fails.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::adaptive_buffer::AdaptiveStreamBuffer;
use crate::engines::{RecognitionConfig, SpeechRecognizer};
use crate::error::ErrorCategory;
use crate::orchestrator::{FallbackOrchestrator, ProcessingMode};
use crate::quality_monitor::ConnectionQualityMonitor;
use crate::recognizer_adapter::StreamingRecognizerAdapter;
use crate::ring::RingBuffer;
use crate::smart_buffer::SmartAudioBuffer;

const MODE_HISTORY_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    Streaming,
    Buffered,
}

pub struct ProcessingResult {
    pub transcription: Option<String>,
    pub mode_used: BufferMode,
    pub processing_ms: u64,
}

pub struct HybridSttService {
    adaptive_buffer: AdaptiveStreamBuffer,
    quality_monitor: Arc<ConnectionQualityMonitor>,
    orchestrator: Arc<FallbackOrchestrator>,
    smart_buffer: Mutex<SmartAudioBuffer>,
    one_shot_engine: Arc<dyn SpeechRecognizer>,
    recognition_config: RecognitionConfig,
    one_shot_timeout: Duration,
    /// Rolling diagnostics history of modes used per chunk, as in the
    /// original's `_record_outcome`. Never consulted for control flow.
    processing_mode_history: RingBuffer<BufferMode, MODE_HISTORY_CAPACITY>,
}

/// Builds a fresh, per-speaker [`HybridSttService`]. The Adaptive Stream
/// Buffer, Smart Audio Buffer, and Connection-Quality Monitor are per-stream
/// state (spec §3/§4.4); only the Fallback Orchestrator (keyed internally by
/// `streamId`) and the one-shot recognizer handle are process-wide.
pub struct HybridServiceFactory {
    pub streaming_threshold_bytes: usize,
    pub freq_threshold_per_s: f64,
    pub quality_threshold: f64,
    pub measurement_window: Duration,
    pub buffered_base_timeout: Duration,
    pub orchestrator: Arc<FallbackOrchestrator>,
    pub one_shot_engine: Arc<dyn SpeechRecognizer>,
    pub recognition_config: RecognitionConfig,
    pub one_shot_timeout: Duration,
}

impl HybridServiceFactory {
    pub fn build(&self) -> HybridSttService {
        HybridSttService::new(
            AdaptiveStreamBuffer::new(self.streaming_threshold_bytes, self.freq_threshold_per_s, self.quality_threshold),
            Arc::new(ConnectionQualityMonitor::new(self.measurement_window)),
            self.orchestrator.clone(),
            SmartAudioBuffer::new(self.buffered_base_timeout, self.quality_threshold),
            self.one_shot_engine.clone(),
            self.recognition_config.clone(),
            self.one_shot_timeout,
        )
    }
}

impl HybridSttService {
    pub fn new(
        adaptive_buffer: AdaptiveStreamBuffer,
        quality_monitor: Arc<ConnectionQualityMonitor>,
        orchestrator: Arc<FallbackOrchestrator>,
        smart_buffer: SmartAudioBuffer,
        one_shot_engine: Arc<dyn SpeechRecognizer>,
        recognition_config: RecognitionConfig,
        one_shot_timeout: Duration,
    ) -> Self {
        Self {
            adaptive_buffer,
            quality_monitor,
            orchestrator,
            smart_buffer: Mutex::new(smart_buffer),
            one_shot_engine,
            recognition_config,
            one_shot_timeout,
            processing_mode_history: RingBuffer::new(0),
        }
    }

    /// Up to the last [`MODE_HISTORY_CAPACITY`] modes used, oldest first —
    /// diagnostics only, mirroring the original's `getKeepaliveStats()`-style
    /// snapshot.
    pub fn mode_history_snapshot(&self) -> Vec<BufferMode> {
        let mut modes = Vec::new();
        while let Some((_, mode)) = self.processing_mode_history.try_pop() {
            modes.push(mode);
        }
        for mode in &modes {
            let _ = self.processing_mode_history.try_push(*mode);
        }
        modes
    }

    fn record_mode(&self, mode: BufferMode) {
        if self.processing_mode_history.try_push(mode).is_none() {
            self.processing_mode_history.try_pop();
            let _ = self.processing_mode_history.try_push(mode);
        }
    }

    /// Processes one inbound chunk for `stream_id`. When routed to
    /// streaming, the chunk is handed to `recognizer`; the caller's final
    /// transcript will arrive later through the adapter's own callback, not
    /// through this call's return value.
    pub async fn process_audio_chunk(
        &self,
        stream_id: &str,
        bytes: Vec<u8>,
        recognizer: &StreamingRecognizerAdapter,
    ) -> ProcessingResult {
        let start = Instant::now();
        let quality = self.quality_monitor.current();
        let hint = self.adaptive_buffer.observe_chunk(bytes.len(), quality.overall);

        if self.orchestrator.should_attempt_recovery(stream_id) {
            self.orchestrator.attempt_recovery(stream_id);
        }

        let mode = self.orchestrator.decide_mode(stream_id, quality.overall, hint);
        self.record_mode(match mode {
            ProcessingMode::Streaming => BufferMode::Streaming,
            ProcessingMode::Buffered => BufferMode::Buffered,
        });

        if mode == ProcessingMode::Streaming {
            match recognizer.send_chunk(bytes.clone()) {
                Ok(()) => {
                    let elapsed = start.elapsed();
                    self.quality_monitor.record(elapsed, true);
                    self.orchestrator.record_success(stream_id, elapsed.as_millis() as u64);
                    return ProcessingResult {
                        transcription: None,
                        mode_used: BufferMode::Streaming,
                        processing_ms: elapsed.as_millis() as u64,
                    };
                }
                Err(e) => {
                    warn!(stream_id, error = %e, "streaming send failed, falling back to buffered for this chunk");
                    self.orchestrator.handle_processing_error(stream_id, ErrorCategory::Transport);
                }
            }
        }

        self.process_buffered(stream_id, bytes, start).await
    }

    async fn process_buffered(&self, stream_id: &str, bytes: Vec<u8>, start: Instant) -> ProcessingResult {
        let quality_score = self.quality_monitor.current().overall;
        let release = self.smart_buffer.lock().push(bytes, quality_score, None);

        let transcription = match release {
            Some((combined, _metrics)) => {
                match self
                    .one_shot_engine
                    .recognize(self.recognition_config.clone(), combined, self.one_shot_timeout)
                    .await
                {
                    Ok(result) => {
                        let elapsed = start.elapsed();
                        self.quality_monitor.record(elapsed, true);
                        self.orchestrator.record_success(stream_id, elapsed.as_millis() as u64);
                        Some(result.text)
                    }
                    Err(e) => {
                        let elapsed = start.elapsed();
                        self.quality_monitor.record(elapsed, false);
                        self.orchestrator.handle_processing_error(stream_id, e.category());
                        None
                    }
                }
            }
            None => None,
        };

        ProcessingResult {
            transcription,
            mode_used: BufferMode::Buffered,
            processing_ms: start.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::stub::StubRecognizer;

    fn test_config() -> RecognitionConfig {
        RecognitionConfig {
            sample_rate_hertz: 16_000,
            language_code: "nl-NL".to_string(),
            enhanced: true,
            model: "latest_long".to_string(),
        }
    }

    fn build_service() -> HybridSttService {
        HybridSttService::new(
            AdaptiveStreamBuffer::new(5_000, 8.0, 0.7),
            Arc::new(ConnectionQualityMonitor::new(Duration::from_secs(10))),
            Arc::new(FallbackOrchestrator::new(3, Duration::from_secs(60), 5, 0.6)),
            SmartAudioBuffer::new(Duration::from_secs(2), 0.7),
            Arc::new(StubRecognizer::new("hallo wereld")),
            test_config(),
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn buffered_path_returns_inline_transcript_on_force_release() {
        let service = build_service();
        let adapter = Arc::new(StreamingRecognizerAdapter::new(
            Arc::new(StubRecognizer::new("hallo wereld")),
            test_config(),
            Duration::from_secs(280),
            Arc::new(|_t, _c| {}),
        ));
        // Orchestrator defaults to streaming mode; force an error to push
        // this stream into buffered mode before exercising the buffer path.
        service.orchestrator.handle_processing_error("s1", ErrorCategory::Transport);
        service.orchestrator.handle_processing_error("s1", ErrorCategory::Transport);
        service.orchestrator.handle_processing_error("s1", ErrorCategory::Transport);

        let big_chunk = vec![1u8; 300 * 1024];
        let result = service.process_audio_chunk("s1", big_chunk, &adapter).await;
        assert_eq!(result.mode_used, BufferMode::Buffered);
        assert_eq!(result.transcription.as_deref(), Some("hallo wereld"));
    }
}
