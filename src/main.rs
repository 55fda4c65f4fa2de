//! speechbridge process entrypoint.
//!
//! Loads configuration, wires the process-wide singletons (breaker, cache,
//! connection manager, orchestrator), connects the external engine clients,
//! and runs the speaker and listener accept loops plus the keepalive task.

use std::sync::Arc;
use std::time::Duration;

use tonic::transport::Channel;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use speechbridge_core::breaker::CircuitBreaker;
use speechbridge_core::config::AppConfig;
use speechbridge_core::connection_manager::ConnectionManager;
use speechbridge_core::engines::grpc::{GrpcSpeechRecognizer, GrpcSynthesizer, GrpcTranslator};
use speechbridge_core::engines::{RecognitionConfig, VoiceConfig};
use speechbridge_core::hybrid_service::HybridServiceFactory;
use speechbridge_core::orchestrator::FallbackOrchestrator;
use speechbridge_core::pipeline::{PipelineConfig, TranslateSynthesizePipeline, TranslationCache};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let config = AppConfig::load();

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("starting speechbridge broker");

    let stt_channel = Channel::from_shared(config.stt_engine_endpoint.clone())?.connect_lazy();
    let translate_channel = Channel::from_shared(config.translation_engine_endpoint.clone())?.connect_lazy();
    let synth_channel = Channel::from_shared(config.synthesis_engine_endpoint.clone())?.connect_lazy();

    let recognizer_engine = Arc::new(GrpcSpeechRecognizer::new(stt_channel));
    let translator: Arc<dyn speechbridge_core::engines::Translator> = Arc::new(GrpcTranslator::new(translate_channel));
    let synthesizer: Arc<dyn speechbridge_core::engines::Synthesizer> = Arc::new(GrpcSynthesizer::new(synth_channel));

    let translate_breaker = Arc::new(CircuitBreaker::new(
        "translate",
        config.fail_max,
        config.reset_timeout(),
    ));
    let synthesize_breaker = Arc::new(CircuitBreaker::new(
        "synthesize",
        config.fail_max,
        config.reset_timeout(),
    ));
    let cache = Arc::new(TranslationCache::new());
    let retry = speechbridge_core::RetryPolicy::new(
        config.api_retry_attempts,
        Duration::from_millis(config.api_retry_base_ms),
    );

    let pipeline = Arc::new(TranslateSynthesizePipeline::new(
        translator,
        synthesizer,
        cache,
        translate_breaker,
        synthesize_breaker,
        retry,
        PipelineConfig {
            source_lang: config.source_lang.clone(),
            target_lang: config.target_lang.clone(),
            voice: VoiceConfig {
                language_code: config.tts_language_code.clone(),
                name: config.tts_voice_name.clone(),
                gender: config.tts_voice_gender.clone(),
            },
            audio_encoding: config.tts_audio_format.clone(),
            translation_timeout: config.translation_timeout(),
            synthesis_timeout: config.tts_timeout(),
            outer_timeout: config.pipeline_timeout(),
        },
    ));

    let connection_manager = Arc::new(ConnectionManager::new(config.ping_interval(), config.pong_timeout()));
    let orchestrator = Arc::new(FallbackOrchestrator::new(
        config.failure_threshold,
        config.recovery_interval(),
        config.max_recovery_attempts,
        config.quality_threshold,
    ));
    let recognition_config = RecognitionConfig {
        sample_rate_hertz: config.stt_sample_rate,
        language_code: config.stt_language_code.clone(),
        enhanced: true,
        model: "latest_long".to_string(),
    };

    let hybrid_factory = Arc::new(HybridServiceFactory {
        streaming_threshold_bytes: config.streaming_threshold_bytes,
        freq_threshold_per_s: config.freq_threshold_per_s,
        quality_threshold: config.quality_threshold,
        measurement_window: Duration::from_secs_f64(config.measurement_window_s),
        buffered_base_timeout: Duration::from_secs_f64(config.buffered_timeout_s),
        orchestrator,
        one_shot_engine: recognizer_engine.clone(),
        recognition_config: recognition_config.clone(),
        one_shot_timeout: Duration::from_secs_f64(config.stt_timeout_s),
    });

    let keepalive_manager = connection_manager.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            keepalive_manager.keepalive_tick().await;
        }
    });

    let listener_manager = connection_manager.clone();
    let listener_addr = config.listener_listen_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = speechbridge_core::server::run_listener_server(&listener_addr, listener_manager).await {
            error!(error = %e, "listener server exited");
        }
    });

    speechbridge_core::server::run_speaker_server(
        &config.speaker_listen_addr,
        connection_manager,
        pipeline,
        hybrid_factory,
        recognizer_engine,
        recognition_config,
        config.restart_deadline(),
        config.fallback_audio(),
    )
    .await?;

    Ok(())
}
