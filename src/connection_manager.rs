//! Per-stream listener sets, fan-out, and keepalive.
//!
//! Ported from `examples/original_source/backend/connection_manager.py`
//! (listener sets, broadcast-then-GC, dead-connection sweep). The split
//! sink/stream plus forwarder-task plumbing is the teacher's own
//! `call_server.rs::handle_connection` shape: a dedicated task drains an
//! mpsc channel into the socket's write half, leaving the read half free
//! for a second task to observe inbound frames (here, keepalive pongs)
//! without contending with writers for the socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ListenerSocket = WebSocketStream<TcpStream>;

const OUTBOX_CAPACITY: usize = 32;

#[derive(Debug, Deserialize)]
struct KeepaliveFrame {
    #[serde(rename = "type")]
    kind: String,
    action: String,
}

struct ListenerEntry {
    tx: mpsc::Sender<Message>,
    closed: Arc<AtomicBool>,
    connected_at: Instant,
    last_ping_sent: Option<Instant>,
    last_pong_seen: Instant,
}

pub struct KeepaliveStats {
    pub pings_sent: u64,
    pub pongs_seen: u64,
    pub timeouts: u64,
}

struct StreamState {
    listeners: HashMap<Uuid, ListenerEntry>,
}

pub struct ConnectionManager {
    ping_interval: Duration,
    pong_timeout: Duration,
    streams: Arc<SyncMutex<HashMap<String, StreamState>>>,
    pings_sent: AtomicU64,
    pongs_seen: Arc<AtomicU64>,
    timeouts: AtomicU64,
}

/// Marks `listener_id` as having just ponged, without needing a handle back
/// to the owning `ConnectionManager` — used from the per-listener read task,
/// which only has the pieces of shared state it was spawned with.
fn record_pong(streams: &SyncMutex<HashMap<String, StreamState>>, pongs_seen: &AtomicU64, stream_id: &str, listener_id: Uuid) {
    let mut streams = streams.lock();
    if let Some(state) = streams.get_mut(stream_id) {
        if let Some(entry) = state.listeners.get_mut(&listener_id) {
            entry.last_pong_seen = Instant::now();
            pongs_seen.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl ConnectionManager {
    pub fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
            streams: Arc::new(SyncMutex::new(HashMap::new())),
            pings_sent: AtomicU64::new(0),
            pongs_seen: Arc::new(AtomicU64::new(0)),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Attaches a listener socket to `stream_id`. Splits the socket into its
    /// write half (drained by a forwarder task fed through an internal
    /// channel, so `broadcast_to_stream`/keepalive pings never block on a
    /// slow reader) and read half (scanned by a second task for inbound
    /// keepalive pongs, per §4.10's protocol).
    pub fn add_listener(&self, stream_id: &str, socket: ListenerSocket) -> Uuid {
        let id = Uuid::new_v4();
        let now = Instant::now();
        let (sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOX_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));

        let forward_closed = closed.clone();
        let mut forward_sink = sink;
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if forward_sink.send(msg).await.is_err() {
                    forward_closed.store(true, Ordering::Relaxed);
                    break;
                }
            }
        });

        let streams_for_read = self.streams.clone();
        let pongs_seen_for_read = self.pongs_seen.clone();
        let stream_id_owned = stream_id.to_string();
        let read_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if let Ok(frame) = serde_json::from_str::<KeepaliveFrame>(&text) {
                            if frame.kind == "keepalive" && frame.action == "pong" {
                                record_pong(&streams_for_read, &pongs_seen_for_read, &stream_id_owned, id);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(stream_id = %stream_id_owned, listener = %id, error = %e, "listener socket read error");
                        break;
                    }
                }
            }
            read_closed.store(true, Ordering::Relaxed);
        });

        let mut streams = self.streams.lock();
        let state = streams.entry(stream_id.to_string()).or_insert_with(|| StreamState {
            listeners: HashMap::new(),
        });
        state.listeners.insert(
            id,
            ListenerEntry {
                tx,
                closed,
                connected_at: now,
                last_ping_sent: None,
                last_pong_seen: now,
            },
        );
        info!(stream_id, listener = %id, "listener attached");
        id
    }

    pub fn remove_listener(&self, stream_id: &str, listener_id: Uuid) {
        let mut streams = self.streams.lock();
        if let Some(state) = streams.get_mut(stream_id) {
            state.listeners.remove(&listener_id);
            if state.listeners.is_empty() {
                streams.remove(stream_id);
            }
        }
    }

    pub fn listener_count(&self, stream_id: &str) -> usize {
        self.streams
            .lock()
            .get(stream_id)
            .map(|s| s.listeners.len())
            .unwrap_or(0)
    }

    /// Writes `bytes` to every current listener of `stream_id`. Listeners
    /// whose outbox is gone (forwarder task exited) are dropped; failures
    /// are logged, not propagated.
    pub async fn broadcast_to_stream(&self, stream_id: &str, bytes: Vec<u8>) {
        let senders: Vec<(Uuid, mpsc::Sender<Message>, Arc<AtomicBool>)> = {
            let streams = self.streams.lock();
            match streams.get(stream_id) {
                Some(state) => state
                    .listeners
                    .iter()
                    .map(|(id, entry)| (*id, entry.tx.clone(), entry.closed.clone()))
                    .collect(),
                None => return,
            }
        };

        let mut dead = Vec::new();
        for (id, tx, closed) in senders {
            if closed.load(Ordering::Relaxed) || tx.send(Message::Binary(bytes.clone())).await.is_err() {
                warn!(stream_id, listener = %id, "broadcast write failed, removing listener");
                dead.push(id);
            }
        }

        for id in dead {
            self.remove_listener(stream_id, id);
        }
    }

    /// Removes listeners whose forwarder or reader task has observed the
    /// socket close.
    pub async fn cleanup_dead_connections(&self, stream_id: &str) {
        let dead: Vec<Uuid> = {
            let streams = self.streams.lock();
            match streams.get(stream_id) {
                Some(state) => state
                    .listeners
                    .iter()
                    .filter(|(_, entry)| entry.closed.load(Ordering::Relaxed))
                    .map(|(id, _)| *id)
                    .collect(),
                None => return,
            }
        };
        for id in dead {
            self.remove_listener(stream_id, id);
        }
    }

    pub fn handle_pong(&self, stream_id: &str, listener_id: Uuid) {
        record_pong(&self.streams, &self.pongs_seen, stream_id, listener_id);
    }

    pub fn keepalive_stats(&self) -> KeepaliveStats {
        KeepaliveStats {
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            pongs_seen: self.pongs_seen.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    /// One keepalive tick: pings listeners due for a ping, and reaps
    /// listeners that have exceeded `pong_timeout` since their last ping.
    pub async fn keepalive_tick(&self) {
        let now = Instant::now();
        let due_for_ping: Vec<(String, Uuid, mpsc::Sender<Message>)>;
        let mut expired: Vec<(String, Uuid)> = Vec::new();

        {
            let mut streams = self.streams.lock();
            let mut pings = Vec::new();
            for (stream_id, state) in streams.iter_mut() {
                for (id, entry) in state.listeners.iter_mut() {
                    if let Some(last_ping) = entry.last_ping_sent {
                        if now.duration_since(last_ping) > self.pong_timeout
                            && entry.last_pong_seen < last_ping
                        {
                            expired.push((stream_id.clone(), *id));
                            continue;
                        }
                    }
                    let due = entry
                        .last_ping_sent
                        .map(|t| now.duration_since(t) >= self.ping_interval)
                        .unwrap_or(true);
                    if due {
                        entry.last_ping_sent = Some(now);
                        pings.push((stream_id.clone(), *id, entry.tx.clone()));
                    }
                }
            }
            due_for_ping = pings;
        }

        for (stream_id, id) in &expired {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(stream_id = %stream_id, listener = %id, "listener missed keepalive pong, removing");
            self.remove_listener(stream_id, *id);
        }

        for (stream_id, id, tx) in due_for_ping {
            let frame = r#"{"type":"keepalive","action":"ping"}"#;
            if tx.send(Message::Text(frame.to_string())).await.is_ok() {
                self.pings_sent.fetch_add(1, Ordering::Relaxed);
            } else {
                warn!(stream_id, listener = %id, "keepalive ping write failed, removing listener");
                self.remove_listener(&stream_id, id);
            }
        }
    }
}
