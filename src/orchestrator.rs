//! Per-stream processing-mode state machine.
//!
//! Ported from `examples/original_source/backend/fallback_orchestrator.py`:
//! tracks failure/success counters per stream and decides when to fall back
//! from streaming to buffered recognition, and when recovery is safe.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::adaptive_buffer::StreamModeHint;
use crate::error::ErrorCategory;
use crate::ring::RingBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    Streaming,
    Buffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    StreamingError,
    ConnectionQuality,
    ApiQuota,
    Timeout,
    ResourceLimit,
    UserPreference,
}

#[derive(Debug, Clone)]
pub struct FallbackEvent {
    pub stream_id: String,
    pub from: ProcessingMode,
    pub to: ProcessingMode,
    pub reason: FallbackReason,
    pub at: Instant,
}

struct StreamStatus {
    mode: ProcessingMode,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
    recovery_attempts: u32,
}

impl StreamStatus {
    fn new() -> Self {
        Self {
            mode: ProcessingMode::Streaming,
            consecutive_failures: 0,
            last_failure_at: None,
            last_success_at: None,
            recovery_attempts: 0,
        }
    }
}

pub fn classify(category: ErrorCategory) -> FallbackReason {
    match category {
        ErrorCategory::EngineRejected => FallbackReason::ApiQuota,
        ErrorCategory::Timeout => FallbackReason::Timeout,
        ErrorCategory::Transport => FallbackReason::ConnectionQuality,
        ErrorCategory::BreakerOpen => FallbackReason::ApiQuota,
        ErrorCategory::Protocol | ErrorCategory::Internal => FallbackReason::StreamingError,
    }
}

/// Running aggregate counters, as in the original's `get_orchestrator_stats()`.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorStats {
    pub total_fallbacks: u64,
    pub total_recoveries: u64,
    pub mode_distribution: HashMap<String, usize>,
}

pub struct FallbackOrchestrator {
    failure_threshold: u32,
    recovery_interval: Duration,
    max_recovery_attempts: u32,
    quality_threshold: f64,
    streams: Mutex<HashMap<String, StreamStatus>>,
    events: RingBuffer<FallbackEvent, 1000>,
    total_fallbacks: std::sync::atomic::AtomicU64,
    total_recoveries: std::sync::atomic::AtomicU64,
}

impl FallbackOrchestrator {
    pub fn new(
        failure_threshold: u32,
        recovery_interval: Duration,
        max_recovery_attempts: u32,
        quality_threshold: f64,
    ) -> Self {
        Self {
            failure_threshold,
            recovery_interval,
            max_recovery_attempts,
            quality_threshold,
            streams: Mutex::new(HashMap::new()),
            events: RingBuffer::new(0),
            total_fallbacks: std::sync::atomic::AtomicU64::new(0),
            total_recoveries: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Running fallback/recovery counters plus the current mode distribution
    /// across every stream the orchestrator has seen.
    pub fn stats(&self) -> OrchestratorStats {
        let streams = self.streams.lock();
        let mut mode_distribution = HashMap::new();
        for status in streams.values() {
            let key = match status.mode {
                ProcessingMode::Streaming => "streaming",
                ProcessingMode::Buffered => "buffered",
            };
            *mode_distribution.entry(key.to_string()).or_insert(0usize) += 1;
        }
        OrchestratorStats {
            total_fallbacks: self.total_fallbacks.load(std::sync::atomic::Ordering::Relaxed),
            total_recoveries: self.total_recoveries.load(std::sync::atomic::Ordering::Relaxed),
            mode_distribution,
        }
    }

    /// Current recommended mode for `stream_id`, considering both the
    /// connection-quality score and the Adaptive Stream Buffer's own
    /// streaming-vs-buffered vote (§4.8's `decideMode(streamId,
    /// connectionMetrics, audioCharacteristics)`).
    pub fn decide_mode(&self, stream_id: &str, quality_score: f64, buffer_hint: StreamModeHint) -> ProcessingMode {
        let mut streams = self.streams.lock();
        let status = streams.entry(stream_id.to_string()).or_insert_with(StreamStatus::new);

        if status.mode == ProcessingMode::Streaming
            && (quality_score < self.quality_threshold || buffer_hint == StreamModeHint::Buffered)
        {
            self.transition(status, stream_id, FallbackReason::ConnectionQuality);
        }
        status.mode
    }

    /// Reports a processing error for `stream_id`. Returns `true` if this
    /// call caused a streaming -> buffered fallback.
    pub fn handle_processing_error(&self, stream_id: &str, category: ErrorCategory) -> bool {
        let reason = classify(category);
        let mut streams = self.streams.lock();
        let status = streams.entry(stream_id.to_string()).or_insert_with(StreamStatus::new);

        status.consecutive_failures += 1;
        status.last_failure_at = Some(Instant::now());

        let was_streaming = status.mode == ProcessingMode::Streaming;
        let should_fallback = was_streaming
            && (status.consecutive_failures >= self.failure_threshold
                || matches!(reason, FallbackReason::ApiQuota | FallbackReason::ResourceLimit));

        if should_fallback {
            self.transition(status, stream_id, reason);
            true
        } else {
            false
        }
    }

    pub fn record_success(&self, stream_id: &str, _processing_ms: u64) {
        let mut streams = self.streams.lock();
        let status = streams.entry(stream_id.to_string()).or_insert_with(StreamStatus::new);
        status.consecutive_failures = 0;
        status.last_success_at = Some(Instant::now());
    }

    /// Whether `stream_id`, currently buffered, should attempt streaming
    /// recovery. All conditions in spec §4.8 must hold.
    pub fn should_attempt_recovery(&self, stream_id: &str) -> bool {
        let streams = self.streams.lock();
        let status = match streams.get(stream_id) {
            Some(s) => s,
            None => return false,
        };
        if status.mode != ProcessingMode::Buffered {
            return false;
        }
        if status.recovery_attempts >= self.max_recovery_attempts {
            return false;
        }
        let elapsed_ok = status
            .last_failure_at
            .map(|t| t.elapsed() >= self.recovery_interval)
            .unwrap_or(true);
        elapsed_ok
    }

    /// Transitions a recovering stream back to streaming mode. Call only
    /// after `should_attempt_recovery` returned true.
    pub fn attempt_recovery(&self, stream_id: &str) {
        let mut streams = self.streams.lock();
        if let Some(status) = streams.get_mut(stream_id) {
            if status.mode == ProcessingMode::Buffered {
                status.recovery_attempts += 1;
                self.transition(status, stream_id, FallbackReason::UserPreference);
                info!(stream_id, "stream recovering to streaming mode");
            }
        }
    }

    fn transition(&self, status: &mut StreamStatus, stream_id: &str, reason: FallbackReason) {
        let from = status.mode;
        let to = match from {
            ProcessingMode::Streaming => ProcessingMode::Buffered,
            ProcessingMode::Buffered => ProcessingMode::Streaming,
        };
        if from == to {
            return;
        }
        warn!(stream_id, ?from, ?to, ?reason, "stream processing mode switch");
        status.mode = to;
        match to {
            ProcessingMode::Buffered => {
                self.total_fallbacks.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            ProcessingMode::Streaming => {
                self.total_recoveries.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
        self.events.try_push(FallbackEvent {
            stream_id: stream_id.to_string(),
            from,
            to,
            reason,
            at: Instant::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_consecutive_failures_trigger_fallback() {
        let orch = FallbackOrchestrator::new(3, Duration::from_secs(60), 5, 0.6);
        assert!(!orch.handle_processing_error("s1", ErrorCategory::Transport));
        assert!(!orch.handle_processing_error("s1", ErrorCategory::Transport));
        assert!(orch.handle_processing_error("s1", ErrorCategory::Transport));
        assert_eq!(orch.decide_mode("s1", 1.0, StreamModeHint::Streaming), ProcessingMode::Buffered);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let orch = FallbackOrchestrator::new(3, Duration::from_secs(60), 5, 0.6);
        orch.handle_processing_error("s1", ErrorCategory::Transport);
        orch.handle_processing_error("s1", ErrorCategory::Transport);
        orch.record_success("s1", 10);
        assert!(!orch.handle_processing_error("s1", ErrorCategory::Transport));
    }

    #[test]
    fn recovery_requires_elapsed_interval() {
        let orch = FallbackOrchestrator::new(1, Duration::from_millis(50), 5, 0.6);
        orch.handle_processing_error("s1", ErrorCategory::Transport);
        assert!(!orch.should_attempt_recovery("s1"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(orch.should_attempt_recovery("s1"));
        orch.attempt_recovery("s1");
        assert_eq!(orch.decide_mode("s1", 1.0, StreamModeHint::Streaming), ProcessingMode::Streaming);
    }

    #[test]
    fn buffer_hint_alone_can_trigger_fallback() {
        let orch = FallbackOrchestrator::new(10, Duration::from_secs(60), 5, 0.1);
        assert_eq!(
            orch.decide_mode("s1", 1.0, StreamModeHint::Buffered),
            ProcessingMode::Buffered
        );
    }

    #[test]
    fn stats_reports_fallback_and_mode_distribution() {
        let orch = FallbackOrchestrator::new(1, Duration::from_secs(60), 5, 0.6);
        orch.handle_processing_error("s1", ErrorCategory::Transport);
        let stats = orch.stats();
        assert_eq!(stats.total_fallbacks, 1);
        assert_eq!(stats.mode_distribution.get("buffered").copied(), Some(1));
    }

    #[test]
    fn quota_error_falls_back_even_below_threshold() {
        let orch = FallbackOrchestrator::new(5, Duration::from_secs(60), 5, 0.6);
        assert!(orch.handle_processing_error("s1", ErrorCategory::EngineRejected));
    }
}
