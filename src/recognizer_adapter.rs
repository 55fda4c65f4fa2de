//! Long-lived streaming recognizer session per speaker.
//!
//! Ported from `examples/original_source/backend/streaming_stt_manager.py`
//! (session lifecycle, graceful restart) and the teacher's `ws_audio.rs`
//! (worker-fed request generator). The bounded-queue-with-drop-oldest
//! backpressure discipline follows
//! `other_examples/373bd2c6_permissionlessweb-lingua-bridge__src-voice-client.rs.rs`'s
//! `VoiceInferenceClient` queueing strategy.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engines::{RecognitionConfig, SpeechRecognizer, StreamingEvent};
use crate::error::RecognizerError;
use crate::ring::RingBuffer;

const QUEUE_CAPACITY: usize = 50;
const SILENCE_FRAME_BYTES: usize = 3_200; // 16kHz * 16bit * 0.1s
const POLL_DEADLINE: Duration = Duration::from_millis(200);
const DRAIN_DEADLINE: Duration = Duration::from_millis(100);
const STOP_JOIN_DEADLINE: Duration = Duration::from_secs(2);

pub type TranscriptCallback = Arc<dyn Fn(String, f32) + Send + Sync>;

pub struct AdapterMetrics {
    pub dropped_chunks: AtomicU64,
    pub restarts: AtomicU64,
}

impl Default for AdapterMetrics {
    fn default() -> Self {
        Self {
            dropped_chunks: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        }
    }
}

struct Session {
    queue: Arc<RingBuffer<Vec<u8>, QUEUE_CAPACITY>>,
    stop_tx: mpsc::Sender<()>,
    worker: JoinHandle<()>,
    started_at: Instant,
}

/// Streams a speaker's audio into an external engine across one or more
/// engine sessions, restarting before the engine's hard session cap.
pub struct StreamingRecognizerAdapter {
    engine: Arc<dyn SpeechRecognizer>,
    config: RecognitionConfig,
    restart_deadline: Duration,
    on_final: TranscriptCallback,
    session: Mutex<Option<Session>>,
    restart_in_flight: AtomicBool,
    stopped: AtomicBool,
    pub metrics: Arc<AdapterMetrics>,
}

impl StreamingRecognizerAdapter {
    pub fn new(
        engine: Arc<dyn SpeechRecognizer>,
        config: RecognitionConfig,
        restart_deadline: Duration,
        on_final: TranscriptCallback,
    ) -> Self {
        Self {
            engine,
            config,
            restart_deadline,
            on_final,
            session: Mutex::new(None),
            restart_in_flight: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            metrics: Arc::new(AdapterMetrics::default()),
        }
    }

    /// Starts the first session. No-op if already started.
    pub async fn start(self: &Arc<Self>) -> Result<(), RecognizerError> {
        if self.session.lock().is_some() {
            return Ok(());
        }
        let session = self.spawn_session().await?;
        *self.session.lock() = Some(session);
        Ok(())
    }

    /// Enqueues an audio chunk. Non-blocking; on overflow, drops up to 3
    /// oldest queued chunks and retries the enqueue once before giving up
    /// and dropping the new chunk (spec §4.6).
    pub fn send_chunk(&self, bytes: Vec<u8>) -> Result<(), RecognizerError> {
        let queue = {
            let guard = self.session.lock();
            match guard.as_ref() {
                Some(s) => s.queue.clone(),
                None => return Err(RecognizerError::Closed),
            }
        };

        if queue.try_push(bytes.clone()).is_some() {
            return Ok(());
        }

        for _ in 0..3 {
            if queue.try_pop().is_none() {
                break;
            }
            self.metrics.dropped_chunks.fetch_add(1, Ordering::Relaxed);
        }

        if queue.try_push(bytes).is_some() {
            return Ok(());
        }

        self.metrics.dropped_chunks.fetch_add(1, Ordering::Relaxed);
        Err(RecognizerError::QueueFull)
    }

    /// Must be polled periodically (e.g. alongside `send_chunk` calls) to
    /// trigger the scheduled restart once the session has been alive for
    /// `restart_deadline`.
    pub async fn maybe_restart(self: &Arc<Self>) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        let due = {
            let guard = self.session.lock();
            match guard.as_ref() {
                Some(s) => s.started_at.elapsed() >= self.restart_deadline,
                None => false,
            }
        };
        if !due {
            return;
        }
        if self
            .restart_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        info!("streaming recognizer session restart due");
        let old_queue = {
            let guard = self.session.lock();
            guard.as_ref().map(|s| s.queue.clone())
        };

        let old = self.session.lock().take();
        if let Some(old) = old {
            let _ = old.stop_tx.send(()).await;
            tokio::time::sleep(DRAIN_DEADLINE).await;
            old.worker.abort();
        }

        match self.spawn_session().await {
            Ok(mut new_session) => {
                // Audio that arrived during the swap survives in the old
                // queue; drain it into the new one so nothing is dropped.
                if let Some(old_queue) = old_queue {
                    while let Some((_, chunk)) = old_queue.try_pop() {
                        let _ = new_session.queue.try_push(chunk);
                    }
                }
                self.metrics.restarts.fetch_add(1, Ordering::Relaxed);
                *self.session.lock() = Some(new_session);
            }
            Err(e) => {
                error!(error = %e, "streaming recognizer restart failed, stopping adapter");
                self.stopped.store(true, Ordering::SeqCst);
            }
        }

        self.restart_in_flight.store(false, Ordering::SeqCst);
    }

    pub async fn stop(self: &Arc<Self>) {
        self.stopped.store(true, Ordering::SeqCst);
        let session = self.session.lock().take();
        if let Some(session) = session {
            let _ = session.stop_tx.send(()).await;
            let _ = tokio::time::timeout(STOP_JOIN_DEADLINE, session.worker).await;
        }
    }

    async fn spawn_session(self: &Arc<Self>) -> Result<Session, RecognizerError> {
        let mut stream = self
            .engine
            .start_streaming(self.config.clone())
            .await
            .map_err(RecognizerError::Transport)?;

        let queue: Arc<RingBuffer<Vec<u8>, QUEUE_CAPACITY>> = Arc::new(RingBuffer::new(0));
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        let worker_queue = queue.clone();
        let on_final = self.on_final.clone();

        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        stream.close().await;
                        break;
                    }
                    chunk = poll_with_deadline(&worker_queue) => {
                        let audio = chunk.unwrap_or_else(|| vec![0u8; SILENCE_FRAME_BYTES]);
                        if let Err(e) = stream.send_audio(audio).await {
                            warn!(error = %e, "streaming recognizer send_audio failed");
                            break;
                        }
                    }
                    event = stream.recv_event() => {
                        match event {
                            Ok(Some(StreamingEvent { text, is_final, confidence })) => {
                                if is_final {
                                    on_final(text, confidence);
                                } else {
                                    debug!(%text, "interim transcript discarded");
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!(error = %e, "streaming recognizer event stream error");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Session {
            queue,
            stop_tx,
            worker,
            started_at: Instant::now(),
        })
    }
}

async fn poll_with_deadline(queue: &RingBuffer<Vec<u8>, QUEUE_CAPACITY>) -> Option<Vec<u8>> {
    match tokio::time::timeout(POLL_DEADLINE, async {
        loop {
            if let Some((_, item)) = queue.try_pop() {
                return item;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    {
        Ok(item) => Some(item),
        Err(_) => None,
    }
}
