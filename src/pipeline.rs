//! Translate-then-synthesize pipeline.
//!
//! Ported from `examples/original_source/backend/services.py` /
//! `enhanced_stt_service.py`: cache lookup, translate through retry+breaker,
//! synthesize through retry+breaker, bounded by an outer pipeline timeout.
//! Stage shape (translate stage, synthesize stage) borrowed from the
//! teacher's generic `pipeline.rs`.

use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::breaker::CircuitBreaker;
use crate::engines::{Synthesizer, Translator, VoiceConfig};
use crate::error::{EngineError, PipelineError};
use crate::retry::RetryPolicy;

const CACHE_CAPACITY: usize = 10_000;

fn normalize_key(transcript: &str) -> String {
    transcript.trim().to_lowercase()
}

/// Process-wide, bounded translation memo: normalized Dutch text -> English.
pub struct TranslationCache {
    inner: Mutex<LruCache<String, String>>,
}

impl TranslationCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::new(std::num::NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
        }
    }

    pub fn get(&self, transcript: &str) -> Option<String> {
        self.inner.lock().get(&normalize_key(transcript)).cloned()
    }

    fn insert(&self, transcript: &str, english: String) {
        self.inner.lock().put(normalize_key(transcript), english);
    }
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PipelineConfig {
    pub source_lang: String,
    pub target_lang: String,
    pub voice: VoiceConfig,
    pub audio_encoding: String,
    pub translation_timeout: Duration,
    pub synthesis_timeout: Duration,
    pub outer_timeout: Duration,
}

pub struct TranslateSynthesizePipeline {
    translator: Arc<dyn Translator>,
    synthesizer: Arc<dyn Synthesizer>,
    cache: Arc<TranslationCache>,
    translate_breaker: Arc<CircuitBreaker>,
    synthesize_breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    config: PipelineConfig,
}

impl TranslateSynthesizePipeline {
    pub fn new(
        translator: Arc<dyn Translator>,
        synthesizer: Arc<dyn Synthesizer>,
        cache: Arc<TranslationCache>,
        translate_breaker: Arc<CircuitBreaker>,
        synthesize_breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        config: PipelineConfig,
    ) -> Self {
        Self {
            translator,
            synthesizer,
            cache,
            translate_breaker,
            synthesize_breaker,
            retry,
            config,
        }
    }

    /// Runs translate -> synthesize for one finalized transcript, bounded by
    /// the outer pipeline timeout. An outer timeout is reported to the
    /// translate breaker as one failure, matching spec §4.7.
    pub async fn process(&self, transcript: &str) -> Result<Vec<u8>, PipelineError> {
        match tokio::time::timeout(self.config.outer_timeout, self.process_inner(transcript)).await {
            Ok(result) => result,
            Err(_) => {
                self.translate_breaker.call(|| async { Err::<(), _>(EngineError::Timeout(self.config.outer_timeout)) }).await.ok();
                Err(PipelineError::Timeout)
            }
        }
    }

    async fn process_inner(&self, transcript: &str) -> Result<Vec<u8>, PipelineError> {
        let english = if let Some(cached) = self.cache.get(transcript) {
            cached
        } else {
            let english = self.translate(transcript).await?;
            self.cache.insert(transcript, english.clone());
            english
        };

        self.synthesize(&english).await
    }

    async fn translate(&self, transcript: &str) -> Result<String, PipelineError> {
        let source = self.config.source_lang.clone();
        let target = self.config.target_lang.clone();
        let timeout = self.config.translation_timeout;
        let retry = self.retry;

        let result = self
            .translate_breaker
            .call(|| async {
                retry
                    .run(|_attempt| {
                        let translator = self.translator.clone();
                        let source = source.clone();
                        let target = target.clone();
                        let text = transcript.to_string();
                        async move { translator.translate(&text, &source, &target, timeout).await }
                    })
                    .await
            })
            .await;

        match result {
            Ok(english) => Ok(english),
            Err(crate::error::BreakerError::Open) => Err(PipelineError::BreakerOpen),
            Err(crate::error::BreakerError::Inner(e)) => Err(PipelineError::Translation(e)),
        }
    }

    async fn synthesize(&self, english: &str) -> Result<Vec<u8>, PipelineError> {
        let voice = self.config.voice.clone();
        let encoding = self.config.audio_encoding.clone();
        let timeout = self.config.synthesis_timeout;
        let retry = self.retry;

        let result = self
            .synthesize_breaker
            .call(|| async {
                retry
                    .run(|_attempt| {
                        let synthesizer = self.synthesizer.clone();
                        let voice = voice.clone();
                        let encoding = encoding.clone();
                        let text = english.to_string();
                        async move { synthesizer.synthesize(&text, &voice, &encoding, timeout).await }
                    })
                    .await
            })
            .await;

        match result {
            Ok(audio) => {
                info!(bytes = audio.len(), "synthesis succeeded");
                Ok(audio)
            }
            Err(crate::error::BreakerError::Open) => Err(PipelineError::BreakerOpen),
            Err(crate::error::BreakerError::Inner(e)) => {
                warn!(error = %e, "synthesis failed");
                Err(PipelineError::Synthesis(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::stub::{StubSynthesizer, StubTranslator};

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            source_lang: "nl".to_string(),
            target_lang: "en".to_string(),
            voice: VoiceConfig {
                language_code: "en-US".to_string(),
                name: "en-US-Wavenet-D".to_string(),
                gender: "NEUTRAL".to_string(),
            },
            audio_encoding: "MP3".to_string(),
            translation_timeout: Duration::from_secs(10),
            synthesis_timeout: Duration::from_secs(10),
            outer_timeout: Duration::from_secs(5),
        }
    }

    fn build_pipeline(
        translator: Arc<StubTranslator>,
        synthesizer: Arc<StubSynthesizer>,
    ) -> TranslateSynthesizePipeline {
        TranslateSynthesizePipeline::new(
            translator,
            synthesizer,
            Arc::new(TranslationCache::new()),
            Arc::new(CircuitBreaker::new("translate", 2, Duration::from_secs(30))),
            Arc::new(CircuitBreaker::new("synthesize", 2, Duration::from_secs(30))),
            RetryPolicy::new(1, Duration::from_millis(1)),
            test_config(),
        )
    }

    #[tokio::test]
    async fn happy_path_caches_translation() {
        let translator = Arc::new(StubTranslator::new("(en)"));
        let synthesizer = Arc::new(StubSynthesizer::new(7890));
        let pipeline = build_pipeline(translator.clone(), synthesizer);

        let audio = pipeline.process("hallo wereld").await.unwrap();
        assert_eq!(audio.len(), 7890);
        assert!(pipeline.cache.get("hallo wereld").is_some());
    }

    #[tokio::test]
    async fn cache_hit_skips_translate_call() {
        let translator = Arc::new(StubTranslator::new("(en)"));
        let synthesizer = Arc::new(StubSynthesizer::new(100));
        let pipeline = build_pipeline(translator.clone(), synthesizer);

        pipeline.cache.insert("hallo", "hello (cached)".to_string());
        translator.fail_next(10); // would fail if actually called
        let audio = pipeline.process("  Hallo  ").await.unwrap();
        assert_eq!(audio.len(), 100);
    }

    #[tokio::test]
    async fn translate_breaker_opens_and_short_circuits() {
        let translator = Arc::new(StubTranslator::new("(en)"));
        translator.fail_next(10);
        let synthesizer = Arc::new(StubSynthesizer::new(10));
        let pipeline = build_pipeline(translator, synthesizer);

        let first = pipeline.process("foo").await;
        assert!(first.is_err());
        let second = pipeline.process("bar").await;
        assert!(matches!(second, Err(PipelineError::BreakerOpen)));
    }
}
