//! WebSocket transport for one device link.
//!
//! A [`Link`] owns a background I/O task per connection.  The task opens
//! `ws://<ip>:<port>`, feeds every decoded frame to the shared
//! [`LinkStateMachine`], and carries out the [`Action`]s it returns: writing
//! frames, publishing [`LinkEvent`]s, or closing the connection.
//!
//! # Heartbeat
//!
//! The heartbeat deadline starts when [`Link::connect`] is called and is
//! pushed back every time a frame is sent or received.  If it fires, the task
//! publishes one `Error(HeartbeatTimeout)` and closes the link.
//!
//! # Shutdown
//!
//! [`Link::disconnect`] flips a `watch` flag and waits for the task to finish.
//! The task reacts to the flag at its next `select!`, so the socket is always
//! closed from inside the task that owns it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use maix_core::protocol::messages::{DEFAULT_CLIENT_TOKEN, DEVICE_PORT};
use maix_core::{decode_frame, encode_frame, DeviceIdentity, DeviceMetadata, Frame, ImageFormat, Payload};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::application::link_state::{Action, LinkError, LinkEvent, LinkState, LinkStateMachine};
use crate::application::session_manager::{DeviceLink, LinkFactory};

/// Default time without traffic before a link is declared dead.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of each link's event channel.
const EVENT_CAPACITY: usize = 256;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Per-link connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    pub port: u16,
    pub client_token: String,
    pub heartbeat_timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            port: DEVICE_PORT,
            client_token: DEFAULT_CLIENT_TOKEN.to_string(),
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

/// State shared between a [`Link`] handle and its I/O task.
struct LinkShared {
    machine: Mutex<LinkStateMachine>,
    state_tx: watch::Sender<LinkState>,
    events: broadcast::Sender<LinkEvent>,
}

impl LinkShared {
    /// Runs `f` against the state machine and republishes the resulting state.
    async fn with_machine<T>(&self, f: impl FnOnce(&mut LinkStateMachine) -> T) -> T {
        let mut machine = self.machine.lock().await;
        let out = f(&mut machine);
        self.state_tx.send_replace(machine.state());
        out
    }

    fn emit(&self, event: LinkEvent) {
        // No receivers is fine; events are fire-and-forget.
        let _ = self.events.send(event);
    }
}

/// Handles owned by [`Link`] for one live connection.
struct Connection {
    shutdown: watch::Sender<bool>,
    outbound: mpsc::UnboundedSender<Frame>,
    task: JoinHandle<()>,
}

/// A persistent connection to one device.
pub struct Link {
    identity: DeviceIdentity,
    settings: LinkSettings,
    shared: Arc<LinkShared>,
    conn: Mutex<Option<Connection>>,
}

impl Link {
    pub fn new(identity: DeviceIdentity, settings: LinkSettings) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            identity,
            shared: Arc::new(LinkShared {
                machine: Mutex::new(LinkStateMachine::new(settings.client_token.clone())),
                state_tx,
                events,
            }),
            settings,
            conn: Mutex::new(None),
        }
    }

    /// Builds a request frame under the state lock and hands it to the I/O task.
    async fn request(
        &self,
        build: impl FnOnce(&LinkStateMachine) -> Result<Frame, LinkError>,
    ) -> Result<(), LinkError> {
        let frame = {
            let machine = self.shared.machine.lock().await;
            build(&machine)?
        };
        let conn = self.conn.lock().await;
        let conn = conn.as_ref().ok_or(LinkError::NotConnected)?;
        conn.outbound
            .send(frame)
            .map_err(|_| LinkError::NotConnected)
    }
}

#[async_trait]
impl DeviceLink for Link {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn state(&self) -> LinkState {
        *self.shared.state_tx.borrow()
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    async fn device_info(&self) -> Option<DeviceMetadata> {
        self.shared.machine.lock().await.metadata().cloned()
    }

    async fn connect(&self) {
        let mut conn = self.conn.lock().await;
        if conn.as_ref().is_some_and(|c| !c.task.is_finished()) {
            debug!("{} already connecting or connected", self.identity);
            return;
        }

        self.shared.with_machine(|m| m.on_connect_started()).await;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drive(
            self.identity.clone(),
            self.settings.clone(),
            Arc::clone(&self.shared),
            shutdown_rx,
            outbound_rx,
        ));
        *conn = Some(Connection {
            shutdown,
            outbound,
            task,
        });
    }

    async fn disconnect(&self) {
        let conn = self.conn.lock().await.take();
        let Some(conn) = conn else {
            return;
        };
        conn.shutdown.send_replace(true);
        if let Err(e) = conn.task.await {
            warn!("link task for {} ended abnormally: {e}", self.identity);
        }
    }

    async fn run_code(&self, code: &str) -> Result<(), LinkError> {
        self.request(|m| m.request_run(code)).await
    }

    async fn run_project(&self, archive: Vec<u8>) -> Result<(), LinkError> {
        self.request(|m| m.request_run_project(&archive)).await
    }

    async fn stop_code(&self) -> Result<(), LinkError> {
        self.request(|m| m.request_stop()).await
    }

    async fn set_image_format(&self, format: ImageFormat) -> Result<(), LinkError> {
        self.request(|m| m.request_image_format(format)).await
    }

    async fn install_app(&self, package: Vec<u8>) -> Result<(), LinkError> {
        self.request(|m| m.request_install_app(&package)).await
    }

    async fn update_runtime(&self) -> Result<(), LinkError> {
        self.request(|m| m.request_update_runtime()).await
    }
}

/// Creates WebSocket links with fixed settings.
#[derive(Debug, Clone, Default)]
pub struct WsLinkFactory {
    settings: LinkSettings,
}

impl WsLinkFactory {
    pub fn new(settings: LinkSettings) -> Self {
        Self { settings }
    }
}

impl LinkFactory for WsLinkFactory {
    fn create(&self, identity: DeviceIdentity) -> Arc<dyn DeviceLink> {
        Arc::new(Link::new(identity, self.settings.clone()))
    }
}

// ── I/O task ──────────────────────────────────────────────────────────────────

/// Owns the socket for one connection attempt, from dial to close.
async fn drive(
    identity: DeviceIdentity,
    settings: LinkSettings,
    shared: Arc<LinkShared>,
    mut shutdown: watch::Receiver<bool>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    let timeout = settings.heartbeat_timeout;
    let mut heartbeat: std::pin::Pin<Box<Sleep>> = Box::pin(tokio::time::sleep(timeout));
    let url = format!("ws://{}:{}", identity.ip, settings.port);
    debug!("dialing {url}");

    let ws = tokio::select! {
        _ = shutdown.changed() => {
            finish(&identity, &shared, "disconnected by host".into()).await;
            return;
        }
        _ = &mut heartbeat => {
            let reason = heartbeat_expired(&shared, timeout);
            finish(&identity, &shared, reason).await;
            return;
        }
        result = tokio_tungstenite::connect_async(url.as_str()) => match result {
            Ok((ws, _)) => ws,
            Err(e) => {
                finish(&identity, &shared, format!("connect to {url} failed: {e}")).await;
                return;
            }
        },
    };

    info!("connected to {identity}");
    let (mut sink, mut stream) = ws.split();
    let mut pending = shared.with_machine(|m| m.on_open()).await;

    let reason = loop {
        if let Err(reason) = apply(pending, &mut sink, &shared, heartbeat.as_mut(), timeout).await {
            break reason;
        }

        pending = tokio::select! {
            _ = shutdown.changed() => break "disconnected by host".to_string(),
            _ = &mut heartbeat => break heartbeat_expired(&shared, timeout),
            Some(frame) = outbound.recv() => vec![Action::Send(frame)],
            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    let frames = decode_all(&identity, &data);
                    // Only a well-formed frame proves the device is alive.
                    if !frames.is_empty() {
                        heartbeat.as_mut().reset(Instant::now() + timeout);
                    }
                    let mut actions = Vec::new();
                    for frame in frames {
                        actions.extend(shared.with_machine(|m| m.on_frame(frame)).await);
                    }
                    actions
                }
                Some(Ok(Message::Close(close))) => {
                    break match close {
                        Some(close) if !close.reason.is_empty() => {
                            format!("closed by device: {}", close.reason)
                        }
                        _ => "closed by device".to_string(),
                    };
                }
                Some(Ok(other)) => {
                    debug!("ignoring non-binary message from {identity}: {other:?}");
                    Vec::new()
                }
                Some(Err(e)) => break format!("socket error: {e}"),
                None => break "connection closed by device".to_string(),
            },
        };
    };

    if let Err(e) = sink.close().await {
        debug!("closing socket to {identity}: {e}");
    }
    finish(&identity, &shared, reason).await;
}

/// Executes the state machine's actions in order.
///
/// Returns `Err(reason)` when an action requires the connection to close.
async fn apply(
    actions: Vec<Action>,
    sink: &mut WsSink,
    shared: &LinkShared,
    mut heartbeat: std::pin::Pin<&mut Sleep>,
    timeout: Duration,
) -> Result<(), String> {
    for action in actions {
        match action {
            Action::Send(frame) => {
                let bytes = encode_frame(frame.command, Payload::Bytes(&frame.payload))
                    .map_err(|e| format!("encode failed: {e}"))?;
                sink.send(Message::Binary(bytes))
                    .await
                    .map_err(|e| format!("send failed: {e}"))?;
                heartbeat.as_mut().reset(Instant::now() + timeout);
            }
            Action::Emit(event) => shared.emit(event),
            Action::Disconnect(err) => {
                let reason = err.to_string();
                shared.emit(LinkEvent::Error(err));
                return Err(reason);
            }
        }
    }
    Ok(())
}

/// Decodes every frame packed in one WebSocket message.  Decoding stops at the
/// first bad frame; the rest of that message is discarded.
fn decode_all(identity: &DeviceIdentity, data: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        match decode_frame(&data[offset..]) {
            Ok((frame, consumed)) => {
                frames.push(frame);
                offset += consumed;
            }
            Err(e) => {
                warn!("dropping undecodable message from {identity}: {e}");
                break;
            }
        }
    }
    frames
}

fn heartbeat_expired(shared: &LinkShared, timeout: Duration) -> String {
    let err = LinkError::HeartbeatTimeout(timeout);
    let reason = err.to_string();
    shared.emit(LinkEvent::Error(err));
    reason
}

async fn finish(identity: &DeviceIdentity, shared: &LinkShared, reason: String) {
    let was_open = shared.with_machine(|m| m.on_closed()).await;
    if was_open {
        info!("link to {identity} closed: {reason}");
        shared.emit(LinkEvent::Closed { reason });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
