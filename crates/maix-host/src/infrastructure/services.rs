//! Service wiring for the host application.
//!
//! [`HostServices`] is built once in `main` and handed to whatever drives the
//! application (the CLI today).  It owns the discovery registry, the session
//! manager, and the frame store, and connects them:
//!
//! ```text
//! DiscoveryRegistry ──devices()──► SessionManager ──creates──► Link
//!                                                               │ LinkEvent::Image
//!                                                    frame pump ▼
//!                                                         FrameStore ──► viewers
//! ```
//!
//! There are no globals: tests build a `HostServices` with their own link
//! factory and get a fully isolated instance.

use std::sync::Arc;
use std::time::Duration;

use maix_core::{parse_ipv4, DeviceIdentity};
use maix_frame_hub::FrameStore;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::application::link_state::{LinkError, LinkEvent, LinkState};
use crate::application::session_manager::{
    ConnectTarget, DeviceDirectory, DeviceLink, LinkFactory, SessionError, SessionManager,
};
use crate::infrastructure::network::discovery::DiscoveryRegistry;
use crate::infrastructure::network::link::WsLinkFactory;
use crate::infrastructure::storage::config::{AppConfig, KnownDevice};

/// Everything the host application runs on.
pub struct HostServices {
    pub discovery: Arc<DiscoveryRegistry>,
    pub sessions: Arc<SessionManager>,
    pub frames: Arc<FrameStore>,
    known_devices: Vec<KnownDevice>,
}

impl HostServices {
    /// Wires the services from `config` with WebSocket links.
    pub fn new(config: &AppConfig) -> Self {
        let factory = Arc::new(WsLinkFactory::new(config.link.settings()));
        Self::with_factory(config, factory)
    }

    /// Wires the services around a caller-supplied link factory.
    pub fn with_factory(config: &AppConfig, factory: Arc<dyn LinkFactory>) -> Self {
        let discovery = DiscoveryRegistry::new(config.discovery.settings());
        let frames = FrameStore::new(&config.frame_hub.settings());
        let pump = Arc::new(FramePumpFactory {
            inner: factory,
            frames: Arc::clone(&frames),
        });
        let directory: Arc<dyn DeviceDirectory> = Arc::clone(&discovery) as Arc<dyn DeviceDirectory>;
        let sessions = Arc::new(SessionManager::new(pump, directory));
        Self {
            discovery,
            sessions,
            frames,
            known_devices: config.devices.clone(),
        }
    }

    /// Connects to every configured device marked `auto_connect`.  Returns the
    /// number of connections started.
    pub async fn connect_known_devices(&self) -> usize {
        let mut started = 0;
        for device in self.known_devices.iter().filter(|d| d.auto_connect) {
            let target = match &device.name {
                Some(name) => ConnectTarget::Pair {
                    name: name.clone(),
                    ip: device.ip.clone(),
                },
                None => ConnectTarget::Ip(device.ip.clone()),
            };
            match self.sessions.connect(target).await {
                Ok(_) => started += 1,
                Err(e) => warn!("skipping configured device {}: {e}", device.ip),
            }
        }
        started
    }

    /// Resolves a user-supplied device string to a connect target.
    ///
    /// Accepts an IPv4 address or the name of a discovered device.
    pub fn target_for(&self, device: &str) -> ConnectTarget {
        if parse_ipv4(device).is_ok() {
            return ConnectTarget::Ip(device.to_string());
        }
        match self
            .discovery
            .devices()
            .into_iter()
            .find(|d| d.name == device || d.name.trim_end_matches(".local") == device)
        {
            Some(identity) => ConnectTarget::Identity(identity),
            // Let the session manager report the malformed address.
            None => ConnectTarget::Ip(device.to_string()),
        }
    }

    /// Connects to `target` and waits until its handshake completes.
    ///
    /// # Errors
    ///
    /// [`ConnectWaitError::Session`] if the connect is rejected, otherwise
    /// whatever [`wait_until_ready`] reports.
    pub async fn connect_and_wait(
        &self,
        target: ConnectTarget,
        timeout: Duration,
    ) -> Result<Arc<dyn DeviceLink>, ConnectWaitError> {
        let link = self.sessions.connect(target).await?;
        wait_until_ready(link.as_ref(), timeout).await?;
        Ok(link)
    }

    /// Asks the view layer to redraw.  No view is attached to the headless
    /// host, so this only logs.
    pub fn refresh_view(&self) {
        debug!("refresh view requested");
    }

    /// Stops discovery and closes every link.
    pub async fn shutdown(&self) {
        self.discovery.stop().await;
        self.sessions.disconnect_all().await;
        info!("host services stopped");
    }
}

/// Failure while connecting and waiting for a ready link.
#[derive(Debug, thiserror::Error)]
pub enum ConnectWaitError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("device did not become ready within {0:?}")]
    Timeout(Duration),
}

/// Waits until `link` is authenticated.
///
/// # Errors
///
/// Returns the error that closed the link, [`LinkError::NotConnected`] if it
/// closed without one, or [`ConnectWaitError::Timeout`].
pub async fn wait_until_ready(link: &dyn DeviceLink, timeout: Duration) -> Result<(), ConnectWaitError> {
    // Subscribe first, then check the state, so no transition is missed.
    let mut events = link.subscribe();
    match link.state() {
        state if state.is_connected() => return Ok(()),
        LinkState::Disconnected => return Err(LinkError::NotConnected.into()),
        _ => {}
    }

    let wait = async {
        let mut last_error = None;
        loop {
            match events.recv().await {
                Ok(LinkEvent::Authenticated) => return Ok::<(), ConnectWaitError>(()),
                Ok(LinkEvent::Error(e)) => last_error = Some(e),
                Ok(LinkEvent::Closed { .. }) | Err(broadcast::error::RecvError::Closed) => {
                    return Err(ConnectWaitError::Link(
                        last_error.unwrap_or(LinkError::NotConnected),
                    ));
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    if link.state().is_connected() {
                        return Ok(());
                    }
                }
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| ConnectWaitError::Timeout(timeout))?
}

// ── Frame pump ────────────────────────────────────────────────────────────────

/// Link factory decorator that forwards every camera frame of every link it
/// creates into the frame store, keyed by [`DeviceIdentity::key`].
struct FramePumpFactory {
    inner: Arc<dyn LinkFactory>,
    frames: Arc<FrameStore>,
}

impl LinkFactory for FramePumpFactory {
    fn create(&self, identity: DeviceIdentity) -> Arc<dyn DeviceLink> {
        let link = self.inner.create(identity.clone());
        tokio::spawn(pump_frames(
            identity.key(),
            link.subscribe(),
            Arc::clone(&self.frames),
        ));
        link
    }
}

/// Runs until the link's event channel closes, i.e. until the link is dropped.
async fn pump_frames(key: String, mut events: broadcast::Receiver<LinkEvent>, frames: Arc<FrameStore>) {
    loop {
        match events.recv().await {
            Ok(LinkEvent::Image { format_tag, data }) => {
                trace!(key = %key, format_tag, len = data.len(), "pumping frame");
                frames.set_image(&key, data, None).await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("frame pump for {key} skipped {n} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("frame pump for {key} finished");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
