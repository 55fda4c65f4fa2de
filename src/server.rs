//! Process-level accept loops for the speaker and listener ports.
//!
//! Grounded on the teacher's `start_call_server` top-level accept loop in
//! `call_server.rs`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tracing::{error, info, warn};

use crate::connection_manager::ConnectionManager;
use crate::engines::{RecognitionConfig, SpeechRecognizer};
use crate::hybrid_service::HybridServiceFactory;
use crate::pipeline::TranslateSynthesizePipeline;
use crate::session_controller::SessionController;

/// Extracts the `streamId` path segment from a request path, e.g.
/// `/speak/demo` or `/listen/demo` -> `demo`.
pub fn stream_id_from_path(path: &str) -> Option<String> {
    path.rsplit('/').next().filter(|s| !s.is_empty()).map(str::to_string)
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

/// Completes the WebSocket handshake while capturing the request path, so
/// the speaker and listener sides of the same logical stream resolve to the
/// same `stream_id` (derived from the path, not from each socket's own
/// ephemeral peer address).
async fn accept_with_stream_id(
    stream: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
    fallback_prefix: &str,
) -> tokio_tungstenite::tungstenite::Result<(WsStream, String)> {
    let path: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let path_cb = path.clone();
    let callback = move |req: &Request, response: Response| {
        *path_cb.lock() = Some(req.uri().path().to_string());
        Ok(response)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let stream_id = path
        .lock()
        .as_deref()
        .and_then(stream_id_from_path)
        .unwrap_or_else(|| format!("{fallback_prefix}-{peer}"));
    Ok((ws, stream_id))
}

pub async fn run_speaker_server(
    addr: &str,
    connection_manager: Arc<ConnectionManager>,
    pipeline: Arc<TranslateSynthesizePipeline>,
    hybrid_factory: Arc<HybridServiceFactory>,
    recognizer_engine: Arc<dyn SpeechRecognizer>,
    recognition_config: RecognitionConfig,
    restart_deadline: Duration,
    fallback_audio: Vec<u8>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr, "speaker server listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "speaker accept failed");
                continue;
            }
        };

        let connection_manager = connection_manager.clone();
        let pipeline = pipeline.clone();
        let hybrid_factory = hybrid_factory.clone();
        let recognizer_engine = recognizer_engine.clone();
        let recognition_config = recognition_config.clone();
        let fallback_audio = fallback_audio.clone();

        tokio::spawn(async move {
            let (ws, stream_id) = match accept_with_stream_id(stream, peer, "speaker").await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(%peer, error = %e, "speaker websocket handshake failed");
                    return;
                }
            };

            let hybrid = Arc::new(hybrid_factory.build());

            let controller = Arc::new(SessionController::new(
                stream_id,
                connection_manager,
                pipeline,
                fallback_audio,
            ));
            controller
                .run(ws, recognizer_engine, recognition_config, restart_deadline, hybrid)
                .await;
        });
    }
}

pub async fn run_listener_server(addr: &str, connection_manager: Arc<ConnectionManager>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr, "listener server listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "listener accept failed");
                continue;
            }
        };

        let connection_manager = connection_manager.clone();

        tokio::spawn(async move {
            let (ws, stream_id) = match accept_with_stream_id(stream, peer, "listener").await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(%peer, error = %e, "listener websocket handshake failed");
                    return;
                }
            };
            connection_manager.add_listener(&stream_id, ws);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_stream_id_from_path() {
        assert_eq!(stream_id_from_path("/speak/demo"), Some("demo".to_string()));
        assert_eq!(stream_id_from_path("/listen/demo"), Some("demo".to_string()));
        assert_eq!(stream_id_from_path("/"), None);
    }
}
