//! Per-stream connection quality scoring.
//!
//! Shape (bounded deque of timings, on-demand scoring) ported from
//! `examples/original_source/backend/connection_quality_monitor.py`; the
//! scoring weights and thresholds follow this system's own contract rather
//! than the source's, since the two disagree on exact constants.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const HISTORY_CAP: usize = 1000;
const MIN_SAMPLES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityLevel {
    Critical,
    Poor,
    Fair,
    Good,
    Excellent,
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    at: Instant,
    latency: Duration,
    success: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct QualityScore {
    pub overall: f64,
    pub latency_score: f64,
    pub reliability_score: f64,
    pub throughput_score: f64,
    pub stability_score: f64,
    pub level: QualityLevel,
}

/// Raw connection metrics as tracked by the original implementation.
/// `packet_loss_rate`/`bandwidth_mbps` are always `0.0` here: this crate sits
/// above the transport layer that would measure them, but the fields are
/// kept on the data model so callers built against the original's shape
/// still compile against the same four-field struct.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionMetrics {
    pub packet_loss_rate: f64,
    pub bandwidth_mbps: f64,
    pub mean_latency_ms: f64,
    pub success_rate: f64,
}

struct Inner {
    history: VecDeque<Timing>,
}

pub struct ConnectionQualityMonitor {
    window: Duration,
    inner: Mutex<Inner>,
}

fn step(value: f64, breakpoints: [(f64, f64); 4], below_lowest: f64) -> f64 {
    for (threshold, score) in breakpoints {
        if value <= threshold {
            return score;
        }
    }
    below_lowest
}

impl ConnectionQualityMonitor {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: Mutex::new(Inner {
                history: VecDeque::with_capacity(64),
            }),
        }
    }

    pub fn record(&self, latency: Duration, success: bool) {
        let mut inner = self.inner.lock();
        if inner.history.len() >= HISTORY_CAP {
            inner.history.pop_front();
        }
        inner.history.push_back(Timing {
            at: Instant::now(),
            latency,
            success,
        });
    }

    /// Quality derived from the timings observed within the configured
    /// window. A cold-start floor of [`MIN_SAMPLES`] avoids flapping on a
    /// handful of early samples: below it, quality reads as `Excellent`.
    pub fn current(&self) -> QualityScore {
        let inner = self.inner.lock();
        let cutoff = Instant::now() - self.window;
        let samples: Vec<Timing> = inner.history.iter().copied().filter(|t| t.at >= cutoff).collect();

        if samples.len() < MIN_SAMPLES {
            return QualityScore {
                overall: 1.0,
                latency_score: 1.0,
                reliability_score: 1.0,
                throughput_score: 1.0,
                stability_score: 1.0,
                level: QualityLevel::Excellent,
            };
        }

        let total = samples.len() as f64;
        let successes = samples.iter().filter(|t| t.success).count() as f64;
        let success_rate = successes / total;

        let latencies_ms: Vec<f64> = samples.iter().map(|t| t.latency.as_secs_f64() * 1000.0).collect();
        let mean_latency_ms = latencies_ms.iter().sum::<f64>() / total;

        let variance = latencies_ms.iter().map(|l| (l - mean_latency_ms).powi(2)).sum::<f64>() / total;
        let jitter_ms = variance.sqrt();

        let window_secs = self.window.as_secs_f64().max(1e-6);
        let rps = total / window_secs;

        let latency_score = step(
            mean_latency_ms,
            [(50.0, 1.0), (150.0, 0.8), (300.0, 0.6), (1000.0, 0.3)],
            0.1,
        );
        let reliability_score = success_rate;
        let throughput_score = (rps / 10.0).min(1.0) - (mean_latency_ms / 1000.0).min(0.5);
        let stability_score = step(jitter_ms, [(10.0, 1.0), (50.0, 0.8), (100.0, 0.6), (200.0, 0.3)], 0.1);

        let overall =
            0.35 * latency_score + 0.35 * reliability_score + 0.15 * throughput_score + 0.15 * stability_score;

        let level = if success_rate < 0.5 || mean_latency_ms > 2000.0 {
            QualityLevel::Critical
        } else if overall >= 0.9 {
            QualityLevel::Excellent
        } else if overall >= 0.75 {
            QualityLevel::Good
        } else if overall >= 0.5 {
            QualityLevel::Fair
        } else if overall >= 0.25 {
            QualityLevel::Poor
        } else {
            QualityLevel::Critical
        };

        QualityScore {
            overall,
            latency_score,
            reliability_score,
            throughput_score,
            stability_score,
            level,
        }
    }

    /// Raw metrics snapshot over the configured window, as in the
    /// original's `ConnectionMetrics` dataclass.
    pub fn current_metrics(&self) -> ConnectionMetrics {
        let inner = self.inner.lock();
        let cutoff = Instant::now() - self.window;
        let samples: Vec<Timing> = inner.history.iter().copied().filter(|t| t.at >= cutoff).collect();
        if samples.is_empty() {
            return ConnectionMetrics::default();
        }
        let total = samples.len() as f64;
        let mean_latency_ms = samples.iter().map(|t| t.latency.as_secs_f64() * 1000.0).sum::<f64>() / total;
        let success_rate = samples.iter().filter(|t| t.success).count() as f64 / total;
        ConnectionMetrics {
            packet_loss_rate: 0.0,
            bandwidth_mbps: 0.0,
            mean_latency_ms,
            success_rate,
        }
    }

    pub fn is_suitable_for_streaming(&self, min_score: f64, max_latency_ms: f64, min_success: f64) -> bool {
        let score = self.current();
        score.overall >= min_score && score.latency_score > 0.0 && {
            let inner = self.inner.lock();
            let cutoff = Instant::now() - self.window;
            let samples: Vec<&Timing> = inner.history.iter().filter(|t| t.at >= cutoff).collect();
            if samples.is_empty() {
                true
            } else {
                let total = samples.len() as f64;
                let mean_latency_ms =
                    samples.iter().map(|t| t.latency.as_secs_f64() * 1000.0).sum::<f64>() / total;
                let success_rate = samples.iter().filter(|t| t.success).count() as f64 / total;
                mean_latency_ms <= max_latency_ms && success_rate >= min_success
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cold_start_reports_excellent() {
        let monitor = ConnectionQualityMonitor::new(Duration::from_secs(10));
        let score = monitor.current();
        assert_eq!(score.level, QualityLevel::Excellent);
    }

    #[test]
    fn high_latency_degrades_to_critical() {
        let monitor = ConnectionQualityMonitor::new(Duration::from_secs(10));
        for _ in 0..MIN_SAMPLES {
            monitor.record(Duration::from_millis(2500), true);
        }
        let score = monitor.current();
        assert_eq!(score.level, QualityLevel::Critical);
    }

    #[test]
    fn low_success_rate_is_critical_regardless_of_latency() {
        let monitor = ConnectionQualityMonitor::new(Duration::from_secs(10));
        for i in 0..MIN_SAMPLES {
            monitor.record(Duration::from_millis(20), i % 3 == 0);
        }
        let score = monitor.current();
        assert_eq!(score.level, QualityLevel::Critical);
        assert!(score.reliability_score < 0.5);
    }

    #[test]
    fn excellent_connection_is_suitable_for_streaming() {
        let monitor = ConnectionQualityMonitor::new(Duration::from_secs(10));
        for _ in 0..MIN_SAMPLES {
            monitor.record(Duration::from_millis(20), true);
        }
        assert!(monitor.is_suitable_for_streaming(0.7, 500.0, 0.9));
    }
}
