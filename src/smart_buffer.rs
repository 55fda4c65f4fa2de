//! Buffered-path chunk accumulator.
//!
//! Ported from `examples/original_source/backend/smart_buffer.py`, with the
//! ring-buffer-of-overlapping-chunks shape borrowed from the teacher's
//! `continuous/sliding_buffer.rs`. Accumulates [`BufferChunk`]s until one of
//! several release conditions fires, then yields the combined bytes plus
//! metrics describing why it released.

use std::time::{Duration, Instant};

const MAX_BUFFER_SIZE: usize = 300 * 1024;
const MIN_DURATION: Duration = Duration::from_millis(2_500);
const QUALITY_MIN_DURATION: Duration = Duration::from_secs(1);
const QUALITY_MIN_BYTES: usize = 10 * 1024;
const SILENCE_THRESHOLD: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    MaxSize,
    MinDuration,
    QualityThreshold,
    SilenceDetected,
    Timeout,
    ForceFlush,
}

#[derive(Debug, Clone)]
pub struct BufferChunk {
    pub bytes: Vec<u8>,
    pub quality_score: f64,
    pub arrival_time: Instant,
}

#[derive(Debug, Clone)]
pub struct BufferReleaseMetrics {
    pub chunk_count: usize,
    pub total_bytes: usize,
    pub duration: Duration,
    pub average_quality: f64,
    pub dominant_format: Option<String>,
    pub release_reason: ReleaseReason,
}

pub struct SmartAudioBuffer {
    base_timeout: Duration,
    quality_threshold: f64,
    chunks: Vec<BufferChunk>,
    formats: Vec<String>,
    first_chunk_time: Option<Instant>,
    last_release_was_timeout: bool,
}

impl SmartAudioBuffer {
    pub fn new(base_timeout: Duration, quality_threshold: f64) -> Self {
        Self {
            base_timeout,
            quality_threshold,
            chunks: Vec::new(),
            formats: Vec::new(),
            first_chunk_time: None,
            last_release_was_timeout: false,
        }
    }

    /// Pushes a chunk and returns `Some((bytes, metrics))` if a release
    /// condition fires; `None` if the buffer should keep accumulating.
    pub fn push(&mut self, bytes: Vec<u8>, quality_score: f64, format: Option<String>) -> Option<(Vec<u8>, BufferReleaseMetrics)> {
        let now = Instant::now();
        if self.first_chunk_time.is_none() {
            self.first_chunk_time = Some(now);
        }
        if let Some(f) = format {
            self.formats.push(f);
        }
        self.chunks.push(BufferChunk {
            bytes,
            quality_score,
            arrival_time: now,
        });

        self.check_release(now)
    }

    pub fn force_flush(&mut self) -> Option<(Vec<u8>, BufferReleaseMetrics)> {
        if self.chunks.is_empty() {
            return None;
        }
        Some(self.release(ReleaseReason::ForceFlush))
    }

    fn total_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.bytes.len()).sum()
    }

    fn duration(&self, now: Instant) -> Duration {
        self.first_chunk_time
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default()
    }

    fn recent_quality_trend_non_increasing(&self) -> bool {
        if self.chunks.len() < 2 {
            return true;
        }
        let last = self.chunks[self.chunks.len() - 1].quality_score;
        let prev = self.chunks[self.chunks.len() - 2].quality_score;
        last <= prev
    }

    fn dominant_format_share(&self) -> f64 {
        if self.formats.is_empty() {
            return 0.0;
        }
        let mut counts = std::collections::HashMap::new();
        for f in &self.formats {
            *counts.entry(f.as_str()).or_insert(0usize) += 1;
        }
        let max = counts.values().copied().max().unwrap_or(0);
        max as f64 / self.formats.len() as f64
    }

    fn avg_quality_last_n(&self, n: usize) -> f64 {
        if self.chunks.is_empty() {
            return 0.0;
        }
        let start = self.chunks.len().saturating_sub(n);
        let slice = &self.chunks[start..];
        slice.iter().map(|c| c.quality_score).sum::<f64>() / slice.len() as f64
    }

    fn adaptive_timeout(&self) -> Duration {
        let avg_quality = self.avg_quality_last_n(3);
        let scale = 1.0 + (avg_quality - self.quality_threshold).clamp(-0.2, 0.2);
        let mut secs = self.base_timeout.as_secs_f64() * scale;
        if self.last_release_was_timeout {
            secs *= 0.9;
        }
        secs = secs.clamp(1.0, self.base_timeout.as_secs_f64() * 1.5);
        Duration::from_secs_f64(secs)
    }

    fn check_release(&mut self, now: Instant) -> Option<(Vec<u8>, BufferReleaseMetrics)> {
        let total_bytes = self.total_bytes();
        let duration = self.duration(now);

        if total_bytes >= MAX_BUFFER_SIZE {
            return Some(self.release(ReleaseReason::MaxSize));
        }

        if duration >= MIN_DURATION
            && (self.recent_quality_trend_non_increasing() || self.dominant_format_share() >= 0.7)
        {
            return Some(self.release(ReleaseReason::MinDuration));
        }

        if self.avg_quality_last_n(3) >= self.quality_threshold
            && duration >= QUALITY_MIN_DURATION
            && self.chunks.len() >= 2
            && total_bytes >= QUALITY_MIN_BYTES
        {
            return Some(self.release(ReleaseReason::QualityThreshold));
        }

        let last3_below_silence = self
            .chunks
            .iter()
            .rev()
            .take(3)
            .filter(|c| c.quality_score < SILENCE_THRESHOLD)
            .count();
        if last3_below_silence >= 2 && duration >= MIN_DURATION.mul_f64(0.8) {
            return Some(self.release(ReleaseReason::SilenceDetected));
        }

        if duration >= self.adaptive_timeout() {
            return Some(self.release(ReleaseReason::Timeout));
        }

        None
    }

    fn release(&mut self, reason: ReleaseReason) -> (Vec<u8>, BufferReleaseMetrics) {
        let now = Instant::now();
        let chunk_count = self.chunks.len();
        let total_bytes = self.total_bytes();
        let duration = self.duration(now);
        let average_quality = if chunk_count == 0 {
            0.0
        } else {
            self.chunks.iter().map(|c| c.quality_score).sum::<f64>() / chunk_count as f64
        };
        let dominant_format = self.formats.iter().fold(
            std::collections::HashMap::<String, usize>::new(),
            |mut acc, f| {
                *acc.entry(f.clone()).or_insert(0) += 1;
                acc
            },
        ).into_iter().max_by_key(|(_, n)| *n).map(|(f, _)| f);

        let combined: Vec<u8> = self.chunks.iter().flat_map(|c| c.bytes.iter().copied()).collect();

        self.last_release_was_timeout = reason == ReleaseReason::Timeout;
        self.chunks.clear();
        self.formats.clear();
        // first_chunk_time is intentionally NOT reset: preserved across
        // releases so the adaptive timeout reflects true session age.

        (
            combined,
            BufferReleaseMetrics {
                chunk_count,
                total_bytes,
                duration,
                average_quality,
                dominant_format,
                release_reason: reason,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_on_max_size() {
        let mut buf = SmartAudioBuffer::new(Duration::from_secs(2), 0.7);
        let chunk = vec![0u8; MAX_BUFFER_SIZE];
        let released = buf.push(chunk, 0.9, None);
        assert!(released.is_some());
        let (_, metrics) = released.unwrap();
        assert_eq!(metrics.release_reason, ReleaseReason::MaxSize);
    }

    #[test]
    fn force_flush_returns_none_when_empty() {
        let mut buf = SmartAudioBuffer::new(Duration::from_secs(2), 0.7);
        assert!(buf.force_flush().is_none());
    }

    #[test]
    fn force_flush_combines_chunks_and_clears() {
        let mut buf = SmartAudioBuffer::new(Duration::from_secs(2), 0.7);
        buf.push(vec![1, 2, 3], 0.9, Some("pcm16".to_string()));
        let (bytes, metrics) = buf.force_flush().unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(metrics.release_reason, ReleaseReason::ForceFlush);
        assert_eq!(metrics.chunk_count, 1);
        assert!(buf.force_flush().is_none());
    }

    #[test]
    fn first_chunk_time_survives_release() {
        let mut buf = SmartAudioBuffer::new(Duration::from_secs(2), 0.7);
        buf.push(vec![1], 0.9, None);
        let before = buf.first_chunk_time;
        buf.force_flush();
        assert_eq!(buf.first_chunk_time, before);
    }
}
