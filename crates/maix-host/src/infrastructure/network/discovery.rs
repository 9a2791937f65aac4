//! mDNS-based device discovery.
//!
//! MaixCAM boards advertise an SSH service (`_ssh._tcp.local`) with an
//! instance name starting with `maixcam`.  The registry finds them by asking
//! every LAN interface, over and over, who offers that service.
//!
//! # One discovery tick (for beginners)
//!
//! 1. List the machine's IPv4 interfaces (skipping loopback) and bind one UDP
//!    socket per interface on `<interface-ip>:0`, with that interface set as
//!    the outgoing multicast interface so the query leaves through it.
//! 2. Send a `PTR` query for `_ssh._tcp.local` to the mDNS group
//!    `224.0.0.251:5353` through each socket.
//! 3. A board answers with a `PTR` record naming its instance, e.g.
//!    `maixcam-1a2b._ssh._tcp.local`.  We then ask for the `A` record of
//!    `maixcam-1a2b.local` to learn its IPv4 address.
//! 4. Every `A` answer whose name starts with the prefix counts as a sighting.
//! 5. When the collection window closes, all sockets are dropped, entries not
//!    seen for longer than the stale timeout are evicted, and observers are
//!    notified if the device list changed.
//!
//! The bookkeeping in steps 4 and 5 lives in [`DeviceTable`], which takes the
//! current time as a parameter so it can be tested without sockets or sleeps.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use maix_core::DeviceIdentity;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::mdns::{self, RecordData, RecordType, MDNS_GROUP, MDNS_PORT};
use crate::application::session_manager::DeviceDirectory;

/// Instance-name prefix of MaixCAM boards.
pub const DEFAULT_PREFIX: &str = "maixcam";

/// Service the boards advertise.
pub const DEFAULT_SERVICE: &str = "_ssh._tcp.local";

/// Multicast TTL used on every interface socket.
const MULTICAST_TTL: u32 = 255;

/// Largest datagram we expect from a responder.
const MAX_DATAGRAM: usize = 9000;

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to bind discovery socket on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send mDNS query from {addr}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to enumerate network interfaces")]
    Interfaces(#[source] std::io::Error),
}

/// Tunables for the discovery loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverySettings {
    pub prefix: String,
    pub service: String,
    /// Length of one tick's collection window.
    pub interval: Duration,
    /// Entries not seen for longer than this are evicted.
    pub stale_timeout: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            service: DEFAULT_SERVICE.to_string(),
            interval: Duration::from_millis(1000),
            stale_timeout: Duration::from_millis(4000),
        }
    }
}

// ── Bookkeeping ───────────────────────────────────────────────────────────────

/// One sighted device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEntry {
    pub identity: DeviceIdentity,
    pub last_seen: Instant,
}

/// Sighted devices keyed by IP, in first-seen order.
#[derive(Debug, Default)]
pub struct DeviceTable {
    entries: Vec<DiscoveryEntry>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sighting at `now`.
    ///
    /// A known IP only has its `last_seen` refreshed.  Returns `true` when a
    /// new entry was inserted.
    pub fn observe(&mut self, identity: DeviceIdentity, now: Instant) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.identity.ip == identity.ip) {
            entry.last_seen = now;
            return false;
        }
        debug!("discovered {identity}");
        self.entries.push(DiscoveryEntry {
            identity,
            last_seen: now,
        });
        true
    }

    /// Removes entries with `now - last_seen > stale_timeout`.  Returns `true`
    /// if anything was removed.
    pub fn evict_stale(&mut self, now: Instant, stale_timeout: Duration) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| {
            let keep = now.saturating_duration_since(e.last_seen) <= stale_timeout;
            if !keep {
                debug!("{} went stale", e.identity);
            }
            keep
        });
        self.entries.len() != before
    }

    pub fn entries(&self) -> &[DiscoveryEntry] {
        &self.entries
    }

    pub fn identities(&self) -> Vec<DeviceIdentity> {
        self.entries.iter().map(|e| e.identity.clone()).collect()
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Periodically probes the LAN and keeps the list of visible devices.
///
/// Observers either poll [`devices`](Self::devices) or wait for changes on
/// the channel returned by [`subscribe`](Self::subscribe).
pub struct DiscoveryRegistry {
    settings: DiscoverySettings,
    /// Held for the whole of a tick so ticks never overlap.
    table: Mutex<DeviceTable>,
    devices_tx: watch::Sender<Vec<DeviceIdentity>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryRegistry {
    pub fn new(settings: DiscoverySettings) -> Arc<Self> {
        let (devices_tx, _) = watch::channel(Vec::new());
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            settings,
            table: Mutex::new(DeviceTable::new()),
            devices_tx,
            shutdown,
            task: Mutex::new(None),
        })
    }

    /// Snapshot of the devices seen recently.
    pub fn devices(&self) -> Vec<DeviceIdentity> {
        self.devices_tx.borrow().clone()
    }

    /// Receives the full device list each time it changes.
    pub fn subscribe(&self) -> watch::Receiver<Vec<DeviceIdentity>> {
        self.devices_tx.subscribe()
    }

    /// Starts the background discovery loop.  Calling it again while the loop
    /// runs does nothing.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        self.shutdown.send_replace(false);
        let mut shutdown = self.shutdown.subscribe();
        let registry = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            info!(
                "discovery started (prefix {}, interval {:?})",
                registry.settings.prefix, registry.settings.interval
            );
            loop {
                tokio::select! {
                    result = registry.discover_now() => {
                        if let Err(e) = result {
                            warn!("discovery tick failed: {e}");
                            // Nothing was probed; wait before retrying.
                            tokio::select! {
                                _ = tokio::time::sleep(registry.settings.interval) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                    }
                    _ = shutdown.changed() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
            }
            info!("discovery stopped");
        }));
    }

    /// Stops the loop and releases its sockets.  Safe to call repeatedly.
    pub async fn stop(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            self.shutdown.send_replace(true);
            if let Err(e) = handle.await {
                warn!("discovery task ended abnormally: {e}");
            }
        }
    }

    /// Runs one discovery tick and waits for its collection window to close.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Interfaces`] if the interface list cannot be
    /// read.  Failures on individual interfaces are logged and skipped.
    pub async fn discover_now(&self) -> Result<(), DiscoveryError> {
        let mut table = self.table.lock().await;

        let sockets = bind_interfaces().await?;
        let query = mdns::encode_query(&self.settings.service, RecordType::Ptr, true);
        let destination = SocketAddr::from((MDNS_GROUP, MDNS_PORT));

        let (tx, mut rx) = mpsc::channel::<(usize, Vec<u8>)>(64);
        let mut readers = JoinSet::new();
        let mut live: Vec<Arc<UdpSocket>> = Vec::new();
        for socket in sockets {
            if let Err(source) = socket.send_to(&query, destination).await {
                let e = DiscoveryError::Send {
                    addr: local_addr(&socket),
                    source,
                };
                warn!("{e}");
                continue;
            }
            readers.spawn(read_datagrams(Arc::clone(&socket), live.len(), tx.clone()));
            live.push(socket);
        }
        drop(tx);

        let mut added = false;
        let window = tokio::time::sleep(self.settings.interval);
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => break,
                received = rx.recv() => match received {
                    Some((index, packet)) => {
                        added |= self.handle_packet(&mut table, &live[index], &packet).await;
                    }
                    None => {
                        // Every reader has gone; keep the tick length anyway.
                        (&mut window).await;
                        break;
                    }
                },
            }
        }

        readers.shutdown().await;
        drop(live);

        self.finish_tick(&mut table, added, Instant::now());
        Ok(())
    }

    /// Evicts stale entries and notifies observers if the list changed.
    fn finish_tick(&self, table: &mut DeviceTable, added: bool, now: Instant) {
        let evicted = table.evict_stale(now, self.settings.stale_timeout);
        if added || evicted {
            let devices = table.identities();
            info!("{} device(s) visible", devices.len());
            self.devices_tx.send_replace(devices);
        }
    }

    /// Processes one mDNS datagram.  Returns `true` if a device was added.
    async fn handle_packet(&self, table: &mut DeviceTable, socket: &UdpSocket, packet: &[u8]) -> bool {
        let records = match mdns::decode_records(packet) {
            Ok(records) => records,
            Err(e) => {
                debug!("ignoring malformed mDNS packet: {e}");
                return false;
            }
        };

        let mut added = false;
        for record in records {
            match record.data {
                RecordData::Ptr(instance)
                    if record.name == self.settings.service
                        && instance.starts_with(&self.settings.prefix) =>
                {
                    let domain = instance_domain(&instance, &self.settings.service);
                    let query = mdns::encode_query(&domain, RecordType::A, true);
                    let destination = SocketAddr::from((MDNS_GROUP, MDNS_PORT));
                    if let Err(e) = socket.send_to(&query, destination).await {
                        debug!("A query for {domain} failed: {e}");
                    }
                }
                RecordData::A(ip) if record.name.starts_with(&self.settings.prefix) => {
                    added |= table.observe(DeviceIdentity::new(record.name, ip), Instant::now());
                }
                _ => {}
            }
        }
        added
    }
}

impl DeviceDirectory for DiscoveryRegistry {
    fn devices(&self) -> Vec<DeviceIdentity> {
        DiscoveryRegistry::devices(self)
    }
}

/// `maixcam-1a2b._ssh._tcp.local` → `maixcam-1a2b.local`.
fn instance_domain(instance: &str, service: &str) -> String {
    let service_labels = service.strip_suffix(".local").unwrap_or(service);
    instance.replacen(&format!(".{service_labels}"), "", 1)
}

/// Binds one socket per non-loopback IPv4 interface.
async fn bind_interfaces() -> Result<Vec<Arc<UdpSocket>>, DiscoveryError> {
    let interfaces = if_addrs::get_if_addrs().map_err(DiscoveryError::Interfaces)?;

    let mut sockets = Vec::new();
    for iface in interfaces {
        if iface.is_loopback() {
            continue;
        }
        let IpAddr::V4(ip) = iface.ip() else {
            continue;
        };
        match bind_interface(ip) {
            Ok(socket) => sockets.push(Arc::new(socket)),
            Err(e) => warn!("skipping interface {}: {e}", iface.name),
        }
    }
    Ok(sockets)
}

/// Must be called inside a tokio runtime.
fn bind_interface(ip: Ipv4Addr) -> Result<UdpSocket, DiscoveryError> {
    let addr = SocketAddr::from((ip, 0));
    let bind_error = |source| DiscoveryError::Bind { addr, source };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_error)?;
    socket.set_multicast_if_v4(&ip).map_err(bind_error)?;
    socket.set_multicast_ttl_v4(MULTICAST_TTL).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;
    socket.bind(&addr.into()).map_err(bind_error)?;
    UdpSocket::from_std(socket.into()).map_err(bind_error)
}

async fn read_datagrams(socket: Arc<UdpSocket>, index: usize, tx: mpsc::Sender<(usize, Vec<u8>)>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, _)) => {
                if tx.send((index, buf[..len].to_vec())).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("mDNS receive failed on {}: {e}", local_addr(&socket));
                return;
            }
        }
    }
}

fn local_addr(socket: &UdpSocket) -> SocketAddr {
    socket
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, ip: [u8; 4]) -> DeviceIdentity {
        DeviceIdentity::new(name, Ipv4Addr::from(ip))
    }

    /// mDNS response carrying one `A` answer per `(name, ip)`.
    fn a_records(answers: &[(&str, [u8; 4])]) -> Vec<u8> {
        let mut packet = vec![0, 0, 0x84, 0, 0, 0, 0, answers.len() as u8, 0, 0, 0, 0];
        for (name, ip) in answers {
            for label in name.split('.') {
                packet.push(label.len() as u8);
                packet.extend_from_slice(label.as_bytes());
            }
            packet.push(0);
            packet.extend_from_slice(&[0, 1, 0x80, 1, 0, 0, 0, 120, 0, 4]);
            packet.extend_from_slice(ip);
        }
        packet
    }

    #[test]
    fn test_same_a_record_twice_keeps_one_entry_with_fresh_timestamp() {
        // Arrange
        let mut table = DeviceTable::new();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(900);

        // Act
        let first = table.observe(device("maixcam-07.local", [192, 168, 1, 20]), t0);
        let second = table.observe(device("maixcam-07.local", [192, 168, 1, 20]), t1);

        // Assert
        assert!(first);
        assert!(!second);
        assert_eq!(table.entries().len(), 1);
        assert_eq!(table.entries()[0].last_seen, t1);
    }

    #[test]
    fn test_entry_is_evicted_only_after_stale_timeout() {
        // Arrange
        let mut table = DeviceTable::new();
        let t0 = Instant::now();
        let stale = Duration::from_millis(4000);
        table.observe(device("maixcam-07.local", [192, 168, 1, 20]), t0);

        // Act / Assert
        assert!(!table.evict_stale(t0 + stale, stale), "exactly at the limit is kept");
        assert!(table.evict_stale(t0 + stale + Duration::from_millis(1), stale));
        assert!(table.identities().is_empty());
    }

    #[test]
    fn test_refreshed_entry_survives_while_other_goes_stale() {
        // Arrange
        let mut table = DeviceTable::new();
        let t0 = Instant::now();
        let stale = Duration::from_secs(4);
        table.observe(device("maixcam-a.local", [10, 0, 0, 1]), t0);
        table.observe(device("maixcam-b.local", [10, 0, 0, 2]), t0);

        // Act
        table.observe(device("maixcam-a.local", [10, 0, 0, 1]), t0 + Duration::from_secs(3));
        let changed = table.evict_stale(t0 + Duration::from_secs(5), stale);

        // Assert
        assert!(changed);
        assert_eq!(table.identities(), vec![device("maixcam-a.local", [10, 0, 0, 1])]);
    }

    #[test]
    fn test_instance_domain_strips_service_labels() {
        assert_eq!(
            instance_domain("maixcam-1a2b._ssh._tcp.local", DEFAULT_SERVICE),
            "maixcam-1a2b.local"
        );
    }

    #[tokio::test]
    async fn test_malformed_packet_adds_nothing() {
        // Arrange
        let registry = DiscoveryRegistry::new(DiscoverySettings::default());
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut table = DeviceTable::new();

        // Act
        let added = registry.handle_packet(&mut table, &socket, &[1, 2, 3]).await;

        // Assert
        assert!(!added);
        assert!(table.entries().is_empty());
    }

    #[tokio::test]
    async fn test_a_record_with_prefix_is_recorded_and_others_ignored() {
        // Arrange: response with two A answers, one for an unrelated host
        let packet = a_records(&[
            ("maixcam-07.local", [192, 168, 1, 20]),
            ("printer.local", [192, 168, 1, 30]),
        ]);
        let registry = DiscoveryRegistry::new(DiscoverySettings::default());
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut table = DeviceTable::new();

        // Act
        let added = registry.handle_packet(&mut table, &socket, &packet).await;

        // Assert
        assert!(added);
        assert_eq!(table.identities(), vec![device("maixcam-07.local", [192, 168, 1, 20])]);
    }

    #[tokio::test]
    async fn test_observers_are_notified_on_sighting_and_on_eviction() {
        // Arrange
        let registry = DiscoveryRegistry::new(DiscoverySettings::default());
        let mut devices = registry.subscribe();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let packet = a_records(&[("maixcam-07.local", [192, 168, 1, 20])]);

        // Act: one tick with a sighting
        {
            let mut table = registry.table.lock().await;
            let added = registry.handle_packet(&mut table, &socket, &packet).await;
            registry.finish_tick(&mut table, added, Instant::now());
        }

        // Assert
        assert!(devices.has_changed().unwrap());
        assert_eq!(
            *devices.borrow_and_update(),
            vec![device("maixcam-07.local", [192, 168, 1, 20])]
        );

        // Act: a quiet tick past the stale timeout
        let later = Instant::now() + registry.settings.stale_timeout + Duration::from_millis(1);
        {
            let mut table = registry.table.lock().await;
            registry.finish_tick(&mut table, false, later);
        }

        // Assert
        let notified = tokio::time::timeout(Duration::from_secs(1), devices.changed()).await;
        assert!(matches!(notified, Ok(Ok(()))));
        assert!(devices.borrow().is_empty());
        assert!(registry.devices().is_empty());
    }

    #[tokio::test]
    async fn test_quiet_tick_within_timeout_does_not_notify() {
        // Arrange
        let registry = DiscoveryRegistry::new(DiscoverySettings::default());
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let packet = a_records(&[("maixcam-07.local", [192, 168, 1, 20])]);
        {
            let mut table = registry.table.lock().await;
            let added = registry.handle_packet(&mut table, &socket, &packet).await;
            registry.finish_tick(&mut table, added, Instant::now());
        }
        let devices = registry.subscribe();

        // Act
        {
            let mut table = registry.table.lock().await;
            registry.finish_tick(&mut table, false, Instant::now());
        }

        // Assert
        assert!(!devices.has_changed().unwrap());
        assert_eq!(registry.devices().len(), 1);
    }

    #[tokio::test]
    async fn test_interface_socket_sends_multicast_through_its_own_address() {
        // Act
        let socket = bind_interface(Ipv4Addr::LOCALHOST).unwrap();

        // Assert
        assert_eq!(socket.local_addr().unwrap().ip(), Ipv4Addr::LOCALHOST);
        assert_eq!(socket.multicast_ttl_v4().unwrap(), MULTICAST_TTL);
        assert_eq!(
            socket2::SockRef::from(&socket).multicast_if_v4().unwrap(),
            Ipv4Addr::LOCALHOST
        );
    }

    #[tokio::test]
    async fn test_stop_without_start_is_a_no_op() {
        let registry = DiscoveryRegistry::new(DiscoverySettings::default());
        registry.stop().await;
        registry.stop().await;
        assert!(registry.devices().is_empty());
    }

    #[tokio::test]
    async fn test_start_then_stop_returns() {
        // Arrange
        let registry = DiscoveryRegistry::new(DiscoverySettings {
            interval: Duration::from_millis(50),
            ..DiscoverySettings::default()
        });

        // Act
        registry.start().await;
        registry.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stopped = tokio::time::timeout(Duration::from_secs(2), registry.stop()).await;

        // Assert
        assert!(stopped.is_ok(), "stop must end the loop promptly");
    }
}
