//! SessionManager: which devices the host is connected to.
//!
//! The manager owns the registry of live [`DeviceLink`]s and enforces the one
//! rule that matters: at most one link per physical device.  Two identities
//! name the same device when [`DeviceIdentity::same_device`] says so.
//!
//! One link is the *current* session.  It is the link the runner executes
//! programs on and whose metadata the UI shows.
//!
//! # Architecture
//!
//! This use case depends only on traits ([`DeviceLink`], [`LinkFactory`],
//! [`DeviceDirectory`]).  The WebSocket link and the mDNS registry are injected
//! at construction time, so the registry rules are unit-testable with fakes.
//!
//! # Self-closing links
//!
//! A link can close on its own (heartbeat timeout, rejected handshake, socket
//! error).  A watcher task per link notices the `Closed` event, prunes the
//! link from the registry and publishes a [`SessionNotice::Lost`].

use std::sync::Arc;

use async_trait::async_trait;
use maix_core::{parse_ipv4, DeviceIdentity, DeviceMetadata, ImageFormat, ValidationError};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::application::link_state::{LinkError, LinkEvent, LinkState};

/// Capacity of the session notice channel.
const NOTICE_CAPACITY: usize = 32;

// ── Ports ─────────────────────────────────────────────────────────────────────

/// One persistent connection to a device.
///
/// The infrastructure implementation speaks the framed protocol over a
/// WebSocket; test implementations record calls.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    fn identity(&self) -> &DeviceIdentity;

    fn state(&self) -> LinkState;

    /// Receives every event emitted after this call.
    fn subscribe(&self) -> broadcast::Receiver<LinkEvent>;

    async fn device_info(&self) -> Option<DeviceMetadata>;

    /// Starts connecting.  Returns immediately; progress arrives as events.
    async fn connect(&self);

    /// Closes the link.  Calling it on a closed link does nothing.
    async fn disconnect(&self);

    async fn run_code(&self, code: &str) -> Result<(), LinkError>;

    async fn run_project(&self, archive: Vec<u8>) -> Result<(), LinkError>;

    async fn stop_code(&self) -> Result<(), LinkError>;

    async fn set_image_format(&self, format: ImageFormat) -> Result<(), LinkError>;

    async fn install_app(&self, package: Vec<u8>) -> Result<(), LinkError>;

    async fn update_runtime(&self) -> Result<(), LinkError>;
}

/// Builds a new, unconnected link for a device.
pub trait LinkFactory: Send + Sync {
    fn create(&self, identity: DeviceIdentity) -> Arc<dyn DeviceLink>;
}

/// Source of devices seen on the network.
pub trait DeviceDirectory: Send + Sync {
    fn devices(&self) -> Vec<DeviceIdentity>;
}

/// A directory that never knows anything, for IP-only use.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyDirectory;

impl DeviceDirectory for EmptyDirectory {
    fn devices(&self) -> Vec<DeviceIdentity> {
        Vec::new()
    }
}

// ── Types ─────────────────────────────────────────────────────────────────────

/// Error type for session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The connect target was rejected before any I/O.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no current device session")]
    NoCurrentSession,

    #[error("not connected to {0}")]
    UnknownDevice(DeviceIdentity),
}

/// What to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    /// A device picked from the discovery list.
    Identity(DeviceIdentity),
    /// An address typed by the user.
    Ip(String),
    /// A name and address typed by the user.
    Pair { name: String, ip: String },
}

/// Aggregate connectivity shown in the status bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Online,
    Offline,
}

/// User-facing notifications about the session registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// A new link was registered and is connecting.
    Added(DeviceIdentity),
    /// A link closed on its own and was removed.
    Lost {
        identity: DeviceIdentity,
        reason: String,
    },
}

#[derive(Default)]
struct Registry {
    links: Vec<Arc<dyn DeviceLink>>,
    current: Option<DeviceIdentity>,
}

impl Registry {
    fn find(&self, identity: &DeviceIdentity) -> Option<Arc<dyn DeviceLink>> {
        self.links
            .iter()
            .find(|l| l.identity().same_device(identity))
            .cloned()
    }

    /// Removes exactly `link` (by pointer).  Returns `true` if it was present.
    fn remove(&mut self, link: &Arc<dyn DeviceLink>) -> bool {
        let before = self.links.len();
        self.links.retain(|l| !Arc::ptr_eq(l, link));
        let removed = self.links.len() != before;
        if removed
            && self
                .current
                .as_ref()
                .is_some_and(|c| c.same_device(link.identity()))
        {
            self.current = None;
        }
        removed
    }
}

// ── SessionManager ────────────────────────────────────────────────────────────

/// Registry of device links with at most one link per device.
pub struct SessionManager {
    registry: Arc<Mutex<Registry>>,
    factory: Arc<dyn LinkFactory>,
    directory: Arc<dyn DeviceDirectory>,
    notices: broadcast::Sender<SessionNotice>,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn LinkFactory>, directory: Arc<dyn DeviceDirectory>) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            factory,
            directory,
            notices,
        }
    }

    /// Receives registry notifications emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    /// Connects to `target`, or returns the existing link to the same device.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Validation`] for a malformed IPv4 address.  No
    /// link is created in that case.
    pub async fn connect(&self, target: ConnectTarget) -> Result<Arc<dyn DeviceLink>, SessionError> {
        let identity = self.resolve(target)?;

        let mut registry = self.registry.lock().await;
        if let Some(existing) = registry.find(&identity) {
            debug!("already linked to {}; reusing", existing.identity());
            return Ok(existing);
        }

        let link = self.factory.create(identity.clone());
        // Subscribe before connecting so the watcher cannot miss an early close.
        let events = link.subscribe();
        registry.links.push(Arc::clone(&link));
        if registry.current.is_none() {
            registry.current = Some(identity.clone());
        }
        drop(registry);

        self.spawn_watcher(Arc::clone(&link), events);
        info!("connecting to {identity}");
        let _ = self.notices.send(SessionNotice::Added(identity));
        link.connect().await;
        Ok(link)
    }

    /// Disconnects and removes the current session.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let link = {
            let mut registry = self.registry.lock().await;
            let current = registry.current.clone().ok_or(SessionError::NoCurrentSession)?;
            let link = registry
                .find(&current)
                .ok_or(SessionError::NoCurrentSession)?;
            registry.remove(&link);
            registry.current = None;
            link
        };
        info!("disconnecting from {}", link.identity());
        link.disconnect().await;
        Ok(())
    }

    /// Disconnects and removes the link to `identity`.
    pub async fn disconnect_device(&self, identity: &DeviceIdentity) -> Result<(), SessionError> {
        let link = {
            let mut registry = self.registry.lock().await;
            let link = registry
                .find(identity)
                .ok_or_else(|| SessionError::UnknownDevice(identity.clone()))?;
            registry.remove(&link);
            link
        };
        info!("disconnecting from {}", link.identity());
        link.disconnect().await;
        Ok(())
    }

    /// Disconnects every link.  Used on shutdown.
    pub async fn disconnect_all(&self) {
        let links = {
            let mut registry = self.registry.lock().await;
            registry.current = None;
            std::mem::take(&mut registry.links)
        };
        for link in links {
            link.disconnect().await;
        }
    }

    pub async fn current(&self) -> Option<Arc<dyn DeviceLink>> {
        let registry = self.registry.lock().await;
        let current = registry.current.as_ref()?;
        registry.find(current)
    }

    /// Makes the link to `identity` the current session.
    pub async fn set_current(&self, identity: &DeviceIdentity) -> Result<(), SessionError> {
        let mut registry = self.registry.lock().await;
        let link = registry
            .find(identity)
            .ok_or_else(|| SessionError::UnknownDevice(identity.clone()))?;
        registry.current = Some(link.identity().clone());
        Ok(())
    }

    /// All registered links, in connection order.
    pub async fn links(&self) -> Vec<Arc<dyn DeviceLink>> {
        self.registry.lock().await.links.clone()
    }

    /// Links that have completed the handshake.
    pub async fn get_connected(&self) -> Vec<Arc<dyn DeviceLink>> {
        self.links()
            .await
            .into_iter()
            .filter(|l| l.state().is_connected())
            .collect()
    }

    pub async fn status(&self) -> SessionStatus {
        if self.get_connected().await.is_empty() {
            SessionStatus::Offline
        } else {
            SessionStatus::Online
        }
    }

    /// Metadata reported by the current session's device.
    pub async fn device_info(&self) -> Option<DeviceMetadata> {
        self.current().await?.device_info().await
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn resolve(&self, target: ConnectTarget) -> Result<DeviceIdentity, SessionError> {
        let known = self.directory.devices();
        let identity = match target {
            ConnectTarget::Identity(identity) => identity,
            ConnectTarget::Ip(ip) => {
                let ip = parse_ipv4(&ip)?;
                known
                    .into_iter()
                    .find(|d| d.ip == ip)
                    .unwrap_or_else(|| DeviceIdentity::placeholder(ip))
            }
            ConnectTarget::Pair { name, ip } => {
                let requested = DeviceIdentity::new(name, parse_ipv4(&ip)?);
                known
                    .into_iter()
                    .find(|d| d.same_device(&requested))
                    .unwrap_or(requested)
            }
        };
        Ok(identity)
    }

    fn spawn_watcher(&self, link: Arc<dyn DeviceLink>, mut events: broadcast::Receiver<LinkEvent>) {
        let registry = Arc::clone(&self.registry);
        let notices = self.notices.clone();
        tokio::spawn(async move {
            let reason = loop {
                match events.recv().await {
                    Ok(LinkEvent::Closed { reason }) => break reason,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("session watcher skipped {n} link events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break "link dropped".to_string(),
                };
            };

            // Removal fails when the user disconnected the link; no notice then.
            if registry.lock().await.remove(&link) {
                warn!("lost connection to {}: {reason}", link.identity());
                let _ = notices.send(SessionNotice::Lost {
                    identity: link.identity().clone(),
                    reason,
                });
            }
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    // ── Test doubles ──────────────────────────────────────────────────────────

    struct FakeLink {
        identity: DeviceIdentity,
        state: StdMutex<LinkState>,
        events: broadcast::Sender<LinkEvent>,
        connects: StdMutex<u32>,
        metadata: Option<DeviceMetadata>,
    }

    impl FakeLink {
        fn new(identity: DeviceIdentity) -> Self {
            let (events, _) = broadcast::channel(16);
            Self {
                identity,
                state: StdMutex::new(LinkState::Disconnected),
                events,
                connects: StdMutex::new(0),
                metadata: Some(DeviceMetadata {
                    sys_version: Some("sys-1".into()),
                    ..DeviceMetadata::default()
                }),
            }
        }

        /// Simulates the device dropping the connection.
        fn close_remotely(&self, reason: &str) {
            *self.state.lock().unwrap() = LinkState::Disconnected;
            let _ = self.events.send(LinkEvent::Closed {
                reason: reason.to_string(),
            });
        }
    }

    #[async_trait]
    impl DeviceLink for FakeLink {
        fn identity(&self) -> &DeviceIdentity {
            &self.identity
        }
        fn state(&self) -> LinkState {
            *self.state.lock().unwrap()
        }
        fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
            self.events.subscribe()
        }
        async fn device_info(&self) -> Option<DeviceMetadata> {
            self.metadata.clone()
        }
        async fn connect(&self) {
            *self.connects.lock().unwrap() += 1;
            *self.state.lock().unwrap() = LinkState::Ready;
        }
        async fn disconnect(&self) {
            let was_open = {
                let mut state = self.state.lock().unwrap();
                let was_open = *state != LinkState::Disconnected;
                *state = LinkState::Disconnected;
                was_open
            };
            if was_open {
                let _ = self.events.send(LinkEvent::Closed {
                    reason: "disconnected by host".into(),
                });
            }
        }
        async fn run_code(&self, _code: &str) -> Result<(), LinkError> {
            Ok(())
        }
        async fn run_project(&self, _archive: Vec<u8>) -> Result<(), LinkError> {
            Ok(())
        }
        async fn stop_code(&self) -> Result<(), LinkError> {
            Ok(())
        }
        async fn set_image_format(&self, _format: ImageFormat) -> Result<(), LinkError> {
            Ok(())
        }
        async fn install_app(&self, _package: Vec<u8>) -> Result<(), LinkError> {
            Ok(())
        }
        async fn update_runtime(&self) -> Result<(), LinkError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        created: StdMutex<Vec<Arc<FakeLink>>>,
    }

    impl RecordingFactory {
        fn created(&self) -> Vec<Arc<FakeLink>> {
            self.created.lock().unwrap().clone()
        }
    }

    impl LinkFactory for RecordingFactory {
        fn create(&self, identity: DeviceIdentity) -> Arc<dyn DeviceLink> {
            let link = Arc::new(FakeLink::new(identity));
            self.created.lock().unwrap().push(Arc::clone(&link));
            link
        }
    }

    struct StaticDirectory(Vec<DeviceIdentity>);

    impl DeviceDirectory for StaticDirectory {
        fn devices(&self) -> Vec<DeviceIdentity> {
            self.0.clone()
        }
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn manager_with(devices: Vec<DeviceIdentity>) -> (SessionManager, Arc<RecordingFactory>) {
        let factory = Arc::new(RecordingFactory::default());
        let manager = SessionManager::new(factory.clone(), Arc::new(StaticDirectory(devices)));
        (manager, factory)
    }

    // ── connect ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_repeated_connects_to_equal_identity_create_one_link() {
        // Arrange
        let (manager, factory) = manager_with(vec![]);
        let id = DeviceIdentity::new("maixcam-01", ip("192.168.1.20"));

        // Act
        for _ in 0..5 {
            manager.connect(ConnectTarget::Identity(id.clone())).await.unwrap();
        }
        manager.connect(ConnectTarget::Ip("192.168.1.20".into())).await.unwrap();
        manager
            .connect(ConnectTarget::Pair {
                name: "maixcam-01".into(),
                ip: "192.168.1.99".into(),
            })
            .await
            .unwrap();

        // Assert
        assert_eq!(manager.links().await.len(), 1);
        assert_eq!(factory.created().len(), 1);
        assert_eq!(*factory.created()[0].connects.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_connect_malformed_ip_creates_no_link() {
        let (manager, factory) = manager_with(vec![]);

        let result = manager.connect(ConnectTarget::Ip("300.1.1.1".into())).await;

        assert!(matches!(
            result,
            Err(SessionError::Validation(ValidationError::InvalidIpv4(_)))
        ));
        assert!(manager.links().await.is_empty());
        assert!(factory.created().is_empty());
    }

    #[tokio::test]
    async fn test_connect_by_ip_prefers_discovered_name() {
        let discovered = DeviceIdentity::new("maixcam-07", ip("192.168.1.20"));
        let (manager, _) = manager_with(vec![discovered.clone()]);

        let link = manager.connect(ConnectTarget::Ip("192.168.1.20".into())).await.unwrap();

        assert_eq!(link.identity(), &discovered);
    }

    #[tokio::test]
    async fn test_connect_by_unknown_ip_uses_placeholder_name() {
        let (manager, _) = manager_with(vec![]);
        let link = manager.connect(ConnectTarget::Ip("10.0.0.9".into())).await.unwrap();
        assert!(link.identity().is_placeholder());
        assert_eq!(link.identity().name, "unknown");
    }

    #[tokio::test]
    async fn test_two_ip_only_devices_get_separate_links() {
        let (manager, _) = manager_with(vec![]);
        manager.connect(ConnectTarget::Ip("10.0.0.1".into())).await.unwrap();
        manager.connect(ConnectTarget::Ip("10.0.0.2".into())).await.unwrap();
        assert_eq!(manager.links().await.len(), 2);
    }

    #[tokio::test]
    async fn test_first_link_becomes_current() {
        let (manager, _) = manager_with(vec![]);
        let first = manager.connect(ConnectTarget::Ip("10.0.0.1".into())).await.unwrap();
        manager.connect(ConnectTarget::Ip("10.0.0.2".into())).await.unwrap();

        let current = manager.current().await.unwrap();
        assert!(Arc::ptr_eq(&current, &first));
    }

    // ── status / info ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_status_follows_connected_links() {
        let (manager, _) = manager_with(vec![]);
        assert_eq!(manager.status().await, SessionStatus::Offline);

        manager.connect(ConnectTarget::Ip("10.0.0.1".into())).await.unwrap();

        assert_eq!(manager.status().await, SessionStatus::Online);
        assert_eq!(manager.get_connected().await.len(), 1);
    }

    #[tokio::test]
    async fn test_device_info_comes_from_current_link() {
        let (manager, _) = manager_with(vec![]);
        assert!(manager.device_info().await.is_none());

        manager.connect(ConnectTarget::Ip("10.0.0.1".into())).await.unwrap();

        let info = manager.device_info().await.unwrap();
        assert_eq!(info.sys_version.as_deref(), Some("sys-1"));
    }

    // ── disconnect ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_disconnect_removes_current() {
        // Arrange
        let (manager, factory) = manager_with(vec![]);
        manager.connect(ConnectTarget::Ip("10.0.0.1".into())).await.unwrap();

        // Act
        manager.disconnect().await.unwrap();

        // Assert
        assert!(manager.current().await.is_none());
        assert!(manager.links().await.is_empty());
        assert_eq!(factory.created()[0].state(), LinkState::Disconnected);
        assert!(matches!(
            manager.disconnect().await,
            Err(SessionError::NoCurrentSession)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_device_leaves_other_links() {
        let (manager, _) = manager_with(vec![]);
        manager.connect(ConnectTarget::Ip("10.0.0.1".into())).await.unwrap();
        let second = manager.connect(ConnectTarget::Ip("10.0.0.2".into())).await.unwrap();

        manager.disconnect_device(second.identity()).await.unwrap();

        assert_eq!(manager.links().await.len(), 1);
        assert!(manager.current().await.is_some());
    }

    #[tokio::test]
    async fn test_user_disconnect_publishes_no_lost_notice() {
        let (manager, _) = manager_with(vec![]);
        manager.connect(ConnectTarget::Ip("10.0.0.1".into())).await.unwrap();
        let mut notices = manager.subscribe();

        manager.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_self_closed_link_is_pruned_with_notice() {
        // Arrange
        let (manager, factory) = manager_with(vec![]);
        manager.connect(ConnectTarget::Ip("10.0.0.1".into())).await.unwrap();
        let mut notices = manager.subscribe();

        // Act
        factory.created()[0].close_remotely("no traffic from device for 10s");
        let notice = tokio::time::timeout(Duration::from_secs(2), notices.recv())
            .await
            .expect("notice must arrive")
            .unwrap();

        // Assert
        assert_eq!(
            notice,
            SessionNotice::Lost {
                identity: DeviceIdentity::placeholder(ip("10.0.0.1")),
                reason: "no traffic from device for 10s".into(),
            }
        );
        assert!(manager.links().await.is_empty());
        assert!(manager.current().await.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_after_loss_creates_fresh_link() {
        let (manager, factory) = manager_with(vec![]);
        manager.connect(ConnectTarget::Ip("10.0.0.1".into())).await.unwrap();
        let mut notices = manager.subscribe();
        factory.created()[0].close_remotely("socket closed");
        let _ = tokio::time::timeout(Duration::from_secs(2), notices.recv()).await;

        manager.connect(ConnectTarget::Ip("10.0.0.1".into())).await.unwrap();

        assert_eq!(factory.created().len(), 2);
        assert_eq!(manager.links().await.len(), 1);
    }
}
