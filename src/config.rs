//! Process-wide configuration.
//!
//! Loaded once at startup from environment variables (prefix
//! `SPEECHBRIDGE_`) with an optional `.env` file, mirroring
//! `examples/original_source/backend/config.py`'s `AppSettings`.

use serde::Deserialize;
use std::time::Duration;

/// Recognized options, defaults matching spec.md §6.4.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    // Pipeline
    pub api_retry_attempts: u32,
    pub api_retry_base_ms: u64,
    pub pipeline_timeout_s: f64,

    // STT
    pub stt_sample_rate: u32,
    pub stt_language_code: String,
    pub stt_timeout_s: f64,

    // Translation
    pub source_lang: String,
    pub target_lang: String,
    pub translation_timeout_s: f64,

    // TTS
    pub tts_language_code: String,
    pub tts_voice_name: String,
    pub tts_voice_gender: String,
    pub tts_audio_format: String,
    pub tts_timeout_s: f64,

    // Breaker
    pub fail_max: u32,
    pub reset_timeout_s: u64,

    // Fallback audio, base64-encoded in the environment (bytes aren't valid
    // env var text); defaults to a short literal marker.
    pub fallback_audio_base64: String,

    // Streaming
    pub enable_streaming: bool,
    pub quality_threshold: f64,
    pub streaming_timeout_s: f64,
    pub streaming_threshold_bytes: usize,
    pub buffered_timeout_s: f64,
    pub freq_threshold_per_s: f64,

    // Orchestrator
    pub failure_threshold: u32,
    pub recovery_interval_s: u64,
    pub max_recovery_attempts: u32,

    // Monitor
    pub measurement_window_s: f64,
    pub max_concurrent_sessions: usize,

    // Connection manager
    pub ping_interval_s: u64,
    pub pong_timeout_s: u64,

    // Ambient / process
    pub speaker_listen_addr: String,
    pub listener_listen_addr: String,
    pub log_level: String,

    // Streaming recognizer session bound (spec.md §4.6)
    pub restart_deadline_s: u64,

    // External engine endpoints (opaque RPCs, spec §6.3)
    pub stt_engine_endpoint: String,
    pub translation_engine_endpoint: String,
    pub synthesis_engine_endpoint: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_retry_attempts: 3,
            api_retry_base_ms: 500,
            pipeline_timeout_s: 15.0,

            stt_sample_rate: 16_000,
            stt_language_code: "nl-NL".to_string(),
            stt_timeout_s: 10.0,

            source_lang: "nl".to_string(),
            target_lang: "en".to_string(),
            translation_timeout_s: 10.0,

            tts_language_code: "en-US".to_string(),
            tts_voice_name: "en-US-Wavenet-D".to_string(),
            tts_voice_gender: "NEUTRAL".to_string(),
            tts_audio_format: "MP3".to_string(),
            tts_timeout_s: 10.0,

            fail_max: 5,
            reset_timeout_s: 30,

            fallback_audio_base64: "VEVTVF9BVURJT19CRUVQX01BUktFUg==".to_string(),

            enable_streaming: true,
            quality_threshold: 0.7,
            streaming_timeout_s: 5.0,
            streaming_threshold_bytes: 5_000,
            buffered_timeout_s: 2.0,
            freq_threshold_per_s: 8.0,

            failure_threshold: 3,
            recovery_interval_s: 60,
            max_recovery_attempts: 5,

            measurement_window_s: 10.0,
            max_concurrent_sessions: 20,

            ping_interval_s: 30,
            pong_timeout_s: 10,

            speaker_listen_addr: "0.0.0.0:8080".to_string(),
            listener_listen_addr: "0.0.0.0:8081".to_string(),
            log_level: "info".to_string(),

            restart_deadline_s: 280,

            stt_engine_endpoint: "http://127.0.0.1:50051".to_string(),
            translation_engine_endpoint: "http://127.0.0.1:50051".to_string(),
            synthesis_engine_endpoint: "http://127.0.0.1:50051".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from `.env` (if present) then the process environment.
    /// Unset variables fall back to [`AppConfig::default`].
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();
        match envy::prefixed("SPEECHBRIDGE_").from_env::<AppConfig>() {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse environment config, using defaults");
                Self::default()
            }
        }
    }

    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.pipeline_timeout_s)
    }

    pub fn stt_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stt_timeout_s)
    }

    pub fn translation_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.translation_timeout_s)
    }

    pub fn tts_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.tts_timeout_s)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_s)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_s)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_s)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_s)
    }

    pub fn restart_deadline(&self) -> Duration {
        Duration::from_secs(self.restart_deadline_s)
    }

    /// Decoded fallback payload (spec.md §6.4 `FALLBACK_AUDIO`).
    pub fn fallback_audio(&self) -> Vec<u8> {
        base64_decode(&self.fallback_audio_base64).unwrap_or_else(|_| {
            tracing::warn!("fallback_audio_base64 invalid, using literal marker");
            b"TEST_AUDIO_BEEP_MARKER:PIPELINE_ERROR_FALLBACK".to_vec()
        })
    }
}

// Minimal dependency-free base64 decode, mirroring the teacher's own
// `call_server.rs` helper (no external base64 crate in the dependency set).
fn base64_decode(data: &str) -> Result<Vec<u8>, ()> {
    const DECODE: [i8; 128] = {
        let mut table = [-1i8; 128];
        let mut i = 0;
        let upper = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
        let lower = b"abcdefghijklmnopqrstuvwxyz";
        let digits = b"0123456789";
        while i < 26 {
            table[upper[i] as usize] = i as i8;
            table[lower[i] as usize] = (26 + i) as i8;
            i += 1;
        }
        i = 0;
        while i < 10 {
            table[digits[i] as usize] = (52 + i) as i8;
            i += 1;
        }
        table[b'+' as usize] = 62;
        table[b'/' as usize] = 63;
        table
    };

    let data = data.trim_end_matches('=');
    let mut out = Vec::with_capacity(data.len() * 3 / 4 + 3);
    for chunk in data.as_bytes().chunks(4) {
        if chunk.len() < 2 {
            break;
        }
        let b0 = DECODE.get(chunk[0] as usize).copied().unwrap_or(-1);
        let b1 = DECODE.get(chunk[1] as usize).copied().unwrap_or(-1);
        if b0 < 0 || b1 < 0 {
            return Err(());
        }
        out.push(((b0 << 2) | (b1 >> 4)) as u8);
        if let Some(&c2) = chunk.get(2) {
            let b2 = DECODE.get(c2 as usize).copied().unwrap_or(-1);
            if b2 >= 0 {
                out.push((((b1 & 0x0f) << 4) | (b2 >> 2)) as u8);
                if let Some(&c3) = chunk.get(3) {
                    let b3 = DECODE.get(c3 as usize).copied().unwrap_or(-1);
                    if b3 >= 0 {
                        out.push((((b2 & 0x03) << 6) | b3) as u8);
                    }
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.fail_max, 5);
        assert_eq!(cfg.reset_timeout_s, 30);
        assert_eq!(cfg.stt_sample_rate, 16_000);
        assert_eq!(cfg.source_lang, "nl");
        assert_eq!(cfg.target_lang, "en");
        assert_eq!(cfg.restart_deadline_s, 280);
    }

    #[test]
    fn fallback_audio_decodes() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.fallback_audio(), b"TEST_AUDIO_BEEP_MARKER".to_vec());
    }
}
