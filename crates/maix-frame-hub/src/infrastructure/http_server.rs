//! HTTP and WebSocket front end of the frame hub.
//!
//! | Route              | Behaviour                                              |
//! |--------------------|--------------------------------------------------------|
//! | `GET /`            | JSON array of keys, or a push WebSocket on upgrade     |
//! | `GET /ws`          | push WebSocket                                         |
//! | `GET /image/:key`  | latest frame with `X-Image-*` headers, 404 if absent   |
//! | `GET /stream/:key` | `multipart/x-mixed-replace` stream, 404 if absent      |
//!
//! # Push protocol
//!
//! A push client sends a key as a text (or UTF-8 binary) message and gets one
//! binary message back: the frame bytes followed by the ASCII millisecond
//! timestamp.  Unknown keys get no reply.  Every newly published frame is
//! also sent to every push client, whichever key it asked for last.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::application::FrameStore;
use crate::domain::frame::STREAM_BOUNDARY;

/// Errors surfaced by the frame hub's network layer.
#[derive(Debug, Error)]
pub enum FrameHubError {
    /// No frame has been published under the requested key.
    #[error("Image not found")]
    NotFound(String),

    #[error("failed to bind frame hub on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("frame hub server failed")]
    Serve(#[source] io::Error),

    #[error("failed to build response")]
    Response(#[from] axum::http::Error),
}

impl IntoResponse for FrameHubError {
    fn into_response(self) -> Response {
        match self {
            FrameHubError::NotFound(key) => {
                debug!(key, "no frame for key");
                (StatusCode::NOT_FOUND, "Image not found").into_response()
            }
            other => {
                warn!("frame hub error: {other}");
                (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response()
            }
        }
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

/// A bound frame hub listener, ready to serve.
///
/// Binding and serving are split so callers (and tests) can learn the actual
/// port before the accept loop starts.
pub struct FrameServer {
    listener: TcpListener,
    store: Arc<FrameStore>,
}

impl FrameServer {
    /// # Errors
    ///
    /// Returns [`FrameHubError::Bind`] if the port is in use or not permitted.
    pub async fn bind(addr: SocketAddr, store: Arc<FrameStore>) -> Result<Self, FrameHubError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| FrameHubError::Bind { addr, source })?;
        Ok(Self { listener, store })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, FrameHubError> {
        self.listener.local_addr().map_err(FrameHubError::Serve)
    }

    /// Serves until `shutdown` resolves, then lets in-flight requests finish.
    pub async fn run<F>(self, shutdown: F) -> Result<(), FrameHubError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = self.listener.local_addr() {
            info!("frame hub listening on {addr}");
        }
        axum::serve(self.listener, router(self.store))
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(FrameHubError::Serve)
    }
}

/// Builds the frame hub routes over `store`.
pub fn router(store: Arc<FrameStore>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/ws", get(push_upgrade))
        .route("/image/:key", get(get_image))
        .route("/stream/:key", get(stream_frames))
        .with_state(store)
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn root(State(store): State<Arc<FrameStore>>, ws: Option<WebSocketUpgrade>) -> Response {
    match ws {
        Some(ws) => ws.on_upgrade(move |socket| run_push_session(socket, store)),
        None => Json(store.keys().await).into_response(),
    }
}

async fn push_upgrade(State(store): State<Arc<FrameStore>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_push_session(socket, store))
}

async fn get_image(
    State(store): State<Arc<FrameStore>>,
    Path(key): Path<String>,
) -> Result<Response, FrameHubError> {
    let frame = store
        .get(&key)
        .await
        .ok_or(FrameHubError::NotFound(key))?;

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, frame.content_type())
        .header(header::CACHE_CONTROL, "no-cache")
        .header("X-Frame-Timestamp", frame.timestamp_ms.to_string());
    if let Some(meta) = &frame.metadata {
        builder = builder
            .header("X-Image-Width", meta.width.to_string())
            .header("X-Image-Height", meta.height.to_string())
            .header("X-Image-ColorSpace", meta.color_space.as_str())
            .header("X-Image-Format", meta.format.name());
    }
    Ok(builder.body(Body::from(frame.bytes))?)
}

async fn stream_frames(
    State(store): State<Arc<FrameStore>>,
    Path(key): Path<String>,
) -> Result<Response, FrameHubError> {
    if store.get(&key).await.is_none() {
        return Err(FrameHubError::NotFound(key));
    }
    let handle = store.attach_stream(&key).await;
    info!(key, consumer = %handle.id(), "stream started");

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={STREAM_BOUNDARY}"),
        )
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(handle))?)
}

// ── Push sessions ─────────────────────────────────────────────────────────────

async fn run_push_session(socket: WebSocket, store: Arc<FrameStore>) {
    let (mut sender, mut receiver) = socket.split();
    let mut pushed = store.subscribe_push();
    debug!("push client connected");

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let key = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("push client read error: {e}");
                        break;
                    }
                };
                let Some(frame) = store.get(key.trim()).await else {
                    debug!(key = key.trim(), "push request for unknown key");
                    continue;
                };
                if sender.send(Message::Binary(frame.push_message())).await.is_err() {
                    break;
                }
            }
            published = pushed.recv() => {
                match published {
                    Ok(frame) => {
                        if sender.send(Message::Binary(frame.push_message())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "push client lagging; frames skipped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    debug!("push client disconnected");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
