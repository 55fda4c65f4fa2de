//! Per-stream streaming-vs-buffered mode recommendation.
//!
//! Ported from `examples/original_source/backend/adaptive_stream_buffer.py`:
//! a rolling window of recent chunk sizes/timestamps/quality reduced to a
//! small scored vote with hysteresis, so a stream doesn't flap between
//! streaming and buffered mode on every chunk.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamModeHint {
    Streaming,
    Buffered,
}

#[derive(Debug, Clone, Copy)]
struct ChunkSample {
    at: Instant,
    bytes: usize,
    quality: f64,
}

#[derive(Debug, Clone)]
pub struct ModeSwitch {
    pub from: StreamModeHint,
    pub to: StreamModeHint,
    pub reason: &'static str,
}

struct Inner {
    recent: VecDeque<ChunkSample>,
    mode: StreamModeHint,
    last_switch: Option<ModeSwitch>,
}

pub struct AdaptiveStreamBuffer {
    streaming_threshold_bytes: f64,
    freq_threshold_per_s: f64,
    quality_threshold: f64,
    window: Duration,
    inner: Mutex<Inner>,
}

impl AdaptiveStreamBuffer {
    pub fn new(streaming_threshold_bytes: usize, freq_threshold_per_s: f64, quality_threshold: f64) -> Self {
        Self {
            streaming_threshold_bytes: streaming_threshold_bytes as f64,
            freq_threshold_per_s,
            quality_threshold,
            window: Duration::from_secs(1),
            inner: Mutex::new(Inner {
                recent: VecDeque::with_capacity(16),
                mode: StreamModeHint::Buffered,
                last_switch: None,
            }),
        }
    }

    pub fn current_mode(&self) -> StreamModeHint {
        self.inner.lock().mode
    }

    /// Record one chunk's arrival and return the (possibly unchanged) mode.
    pub fn observe_chunk(&self, bytes: usize, quality: f64) -> StreamModeHint {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.recent.push_back(ChunkSample { at: now, bytes, quality });
        while inner.recent.len() > 64 {
            inner.recent.pop_front();
        }

        let cutoff = now - self.window;
        let windowed: Vec<ChunkSample> = inner.recent.iter().copied().filter(|c| c.at >= cutoff).collect();
        if windowed.is_empty() {
            return inner.mode;
        }

        let count = windowed.len() as f64;
        let avg_bytes = windowed.iter().map(|c| c.bytes as f64).sum::<f64>() / count;
        let avg_quality = windowed.iter().map(|c| c.quality).sum::<f64>() / count;
        let frequency = count; // samples within the 1s window == chunks/s

        let last3: Vec<&ChunkSample> = windowed.iter().rev().take(3).collect();
        let last3_max = last3.iter().map(|c| c.bytes as f64).fold(0.0, f64::max);
        let span = windowed
            .first()
            .map(|first| now.saturating_duration_since(first.at).as_secs_f64())
            .unwrap_or(1.0)
            .max(1e-6);
        let total_bytes: f64 = windowed.iter().map(|c| c.bytes as f64).sum();
        let efficiency = (total_bytes / span) / (self.streaming_threshold_bytes * self.freq_threshold_per_s);

        let mut streaming_votes = 0;
        if avg_bytes >= self.streaming_threshold_bytes {
            streaming_votes += 3;
        }
        if last3_max >= self.streaming_threshold_bytes {
            streaming_votes += 2;
        }
        if frequency > self.freq_threshold_per_s {
            streaming_votes += 2;
        }
        if avg_quality > self.quality_threshold {
            streaming_votes += 2;
        }
        if efficiency > 0.8 {
            streaming_votes += 1;
        }

        let mut buffered_votes = 0;
        if avg_bytes < self.streaming_threshold_bytes / 2.0 && frequency < self.freq_threshold_per_s {
            buffered_votes += 2;
        }
        if frequency < self.freq_threshold_per_s / 2.0 {
            buffered_votes += 3;
        }
        if avg_quality < self.quality_threshold / 2.0 {
            buffered_votes += 2;
        }

        let next = match inner.mode {
            StreamModeHint::Streaming if buffered_votes > streaming_votes => StreamModeHint::Buffered,
            StreamModeHint::Buffered if streaming_votes >= buffered_votes && streaming_votes > 0 => {
                StreamModeHint::Streaming
            }
            other => other,
        };

        if next != inner.mode {
            inner.last_switch = Some(ModeSwitch {
                from: inner.mode,
                to: next,
                reason: if next == StreamModeHint::Streaming {
                    "streaming_votes_ge_buffered"
                } else {
                    "buffered_votes_gt_streaming"
                },
            });
            inner.mode = next;
        }
        inner.mode
    }

    pub fn last_switch(&self) -> Option<ModeSwitch> {
        self.inner.lock().last_switch.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_small_chunks_stay_buffered() {
        let buf = AdaptiveStreamBuffer::new(5_000, 8.0, 0.7);
        let hint = buf.observe_chunk(200, 0.9);
        assert_eq!(hint, StreamModeHint::Buffered);
    }

    #[test]
    fn frequent_large_high_quality_chunks_switch_to_streaming() {
        let buf = AdaptiveStreamBuffer::new(1_000, 3.0, 0.5);
        let mut hint = StreamModeHint::Buffered;
        for _ in 0..5 {
            hint = buf.observe_chunk(2_000, 0.9);
        }
        assert_eq!(hint, StreamModeHint::Streaming);
        assert!(buf.last_switch().is_some());
    }

    #[test]
    fn hysteresis_keeps_streaming_until_buffered_wins_outright() {
        let buf = AdaptiveStreamBuffer::new(1_000, 3.0, 0.5);
        for _ in 0..5 {
            buf.observe_chunk(2_000, 0.9);
        }
        assert_eq!(buf.current_mode(), StreamModeHint::Streaming);

        // A single weak chunk shouldn't immediately flip back.
        let hint = buf.observe_chunk(2_000, 0.9);
        assert_eq!(hint, StreamModeHint::Streaming);
    }
}
