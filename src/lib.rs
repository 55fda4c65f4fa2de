//! speechbridge-core
//!
//! Real-time Dutch-to-English speech-to-speech translation broker.
//!
//! # Architecture
//!
//! One speaker socket per named stream pushes live microphone audio; the
//! core recognizes it (streaming or buffered, depending on stream health),
//! translates the finalized transcript, synthesizes English audio, and
//! fans the result out to every listener currently attached to that
//! stream.
//!
//! ```text
//! speaker socket -> SessionController -> HybridSttService
//!                                          -> StreamingRecognizerAdapter (streaming)
//!                                          -> SmartAudioBuffer + one-shot recognize (buffered)
//!                                        -> TranslateSynthesizePipeline (breaker+retry+cache)
//!                                        -> ConnectionManager -> listener sockets
//! ```
//!
//! The Circuit Breaker, Retry Policy, Connection-Quality Monitor, Adaptive
//! Stream Buffer, and Fallback Orchestrator are the concurrency/resilience
//! substrate shared across every stream in the process.

pub mod adaptive_buffer;
pub mod breaker;
pub mod config;
pub mod connection_manager;
pub mod engines;
pub mod error;
pub mod handle;
pub mod hybrid_service;
pub mod orchestrator;
pub mod pipeline;
pub mod quality_monitor;
pub mod recognizer_adapter;
pub mod retry;
pub mod ring;
pub mod server;
pub mod session_controller;
pub mod smart_buffer;

pub use breaker::{BreakerState, CircuitBreaker};
pub use config::AppConfig;
pub use connection_manager::ConnectionManager;
pub use handle::Handle;
pub use hybrid_service::{HybridServiceFactory, HybridSttService};
pub use orchestrator::{FallbackOrchestrator, OrchestratorStats, ProcessingMode};
pub use pipeline::{PipelineConfig, TranslateSynthesizePipeline, TranslationCache};
pub use quality_monitor::{ConnectionMetrics, ConnectionQualityMonitor, QualityLevel};
pub use recognizer_adapter::StreamingRecognizerAdapter;
pub use retry::RetryPolicy;
pub use ring::{PeekGuard, RingBuffer, SlotRef};
pub use session_controller::SessionController;
