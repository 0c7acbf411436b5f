//! DHT UDP service
//!
//! One socket, one receive loop, one maintenance task. Requests carry a
//! monotonic transaction id; responses complete the matching pending query
//! through the registry. Malformed datagrams are dropped where they land.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace, warn};

use anonet_core::types::{K, MAX_PACKET_SIZE, PORT_PROBE_RANGE};
use anonet_core::{CoreEvent, EventBus};

use crate::announcement::PeerAnnouncement;
use crate::routing::RoutingTable;
use crate::store::AnnouncementStore;
use crate::wire::{Message, Packet};
use crate::{Contact, DhtError, NodeId, Result};

/// Pending queries older than this are reaped and count as failures.
pub(crate) const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Maintenance cadence: store sweep, stale pings, dead-contact eviction.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

struct PendingQuery {
    sent_at: Instant,
    /// Queried node, when known, for failure accounting.
    target: Option<NodeId>,
    reply: Option<oneshot::Sender<Message>>,
}

/// The DHT node: socket, routing table, store and query registry.
///
/// Cheap to clone; all clones share one socket and one state.
#[derive(Clone)]
pub struct DhtService {
    inner: Arc<DhtInner>,
}

pub(crate) struct DhtInner {
    local_id: NodeId,
    socket: UdpSocket,
    port: u16,
    pub(crate) routing: RoutingTable,
    pub(crate) store: AnnouncementStore,
    pending: Mutex<HashMap<u32, PendingQuery>>,
    next_tx: AtomicU32,
    events: EventBus,
    shutdown: watch::Sender<bool>,
}

impl DhtService {
    /// Bind the UDP socket, probing a few ports above `port` if taken.
    pub async fn bind(local_id: NodeId, port: u16, events: EventBus) -> Result<Self> {
        let (socket, bound_port) = bind_with_probe(port).await?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(DhtInner {
                local_id,
                socket,
                port: bound_port,
                routing: RoutingTable::new(local_id),
                store: AnnouncementStore::new(),
                pending: Mutex::new(HashMap::new()),
                next_tx: AtomicU32::new(1),
                events,
                shutdown,
            }),
        })
    }

    /// Spawn the receive loop and the maintenance task.
    pub fn start(&self) {
        let recv = self.clone();
        tokio::spawn(async move { recv.receive_loop().await });

        let maint = self.clone();
        tokio::spawn(async move { maint.maintenance_loop().await });

        self.inner.events.emit(CoreEvent::DhtStarted {
            port: self.inner.port,
        });
        debug!(port = self.inner.port, id = %self.inner.local_id, "DHT service started");
    }

    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    pub fn local_id(&self) -> &NodeId {
        &self.inner.local_id
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.inner.routing
    }

    pub fn store(&self) -> &AnnouncementStore {
        &self.inner.store
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Send a request and wait for its response, up to `timeout`.
    ///
    /// A timeout counts as a failed query against `target` when known.
    pub async fn query(
        &self,
        addr: SocketAddrV4,
        target: Option<NodeId>,
        message: Message,
        timeout: Duration,
    ) -> Result<Message> {
        let (tx_id, rx) = self.inner.register(target, true);
        self.inner.send(addr, tx_id, message).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            _ => {
                self.inner.pending.lock().remove(&tx_id);
                if let Some(id) = target {
                    self.inner.routing.mark_failed(&id);
                }
                Err(DhtError::QueryTimeout)
            }
        }
    }

    /// Send a request without waiting. The eventual response still clears
    /// the registry entry; a missing response is reaped as a failure.
    pub async fn notify(
        &self,
        addr: SocketAddrV4,
        target: Option<NodeId>,
        message: Message,
    ) -> Result<()> {
        let (tx_id, _) = self.inner.register(target, false);
        self.inner.send(addr, tx_id, message).await
    }

    /// Warm the routing table through `addr`: one PING plus one FIND_NODE
    /// for our own id. The peer only enters the table if it answers.
    pub async fn probe(&self, addr: SocketAddrV4) -> Result<()> {
        self.notify(addr, None, Message::Ping).await?;
        self.notify(
            addr,
            None,
            Message::FindNode {
                target: self.inner.local_id,
            },
        )
        .await
    }

    /// Publish an announcement: store locally under both keys, then send
    /// ANNOUNCE to the union of the K closest contacts to each key.
    pub async fn publish(&self, announcement: &PeerAnnouncement) -> Result<usize> {
        let value = announcement.to_bytes();
        let dht_key = announcement.dht_key();
        let fp_key = announcement.fingerprint_key();

        self.inner.store.insert(dht_key, value.clone())?;
        self.inner.store.insert(fp_key, value.clone())?;

        let mut targets = self.inner.routing.closest(&dht_key, K);
        for contact in self.inner.routing.closest(&fp_key, K) {
            if !targets.contains(&contact) {
                targets.push(contact);
            }
        }

        for contact in &targets {
            let send = self.notify(
                contact.addr,
                Some(contact.node_id),
                Message::Announce {
                    value: value.clone(),
                },
            );
            if let Err(e) = send.await {
                warn!(peer = %contact.node_id, "announce send failed: {e}");
            }
        }

        self.inner.events.emit(CoreEvent::AnnouncePublished {
            username: announcement.username.clone(),
            targets: targets.len(),
        });
        Ok(targets.len())
    }

    async fn receive_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.inner.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.inner.handle_datagram(&buf[..len], from).await,
                    Err(e) => {
                        warn!("UDP receive failed: {e}");
                        break;
                    }
                }
            }
        }
        debug!("DHT receive loop stopped");
    }

    async fn maintenance_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut reap = tokio::time::interval(QUERY_TIMEOUT);
        let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = reap.tick() => self.inner.reap_pending(),
                _ = tick.tick() => self.run_maintenance().await,
            }
        }
        debug!("DHT maintenance loop stopped");
    }

    async fn run_maintenance(&self) {
        let swept = self.inner.store.sweep_expired();
        if swept > 0 {
            debug!(swept, "evicted expired announcements");
        }

        for dead in self.inner.routing.bad() {
            self.inner.routing.remove(&dead.node_id);
            trace!(peer = %dead.node_id, "evicted unresponsive contact");
        }

        for stale in self.inner.routing.stale() {
            if let Err(e) = self
                .notify(stale.addr, Some(stale.node_id), Message::Ping)
                .await
            {
                warn!(peer = %stale.node_id, "stale ping failed: {e}");
            }
        }
    }
}

impl DhtInner {
    fn register(
        &self,
        target: Option<NodeId>,
        with_reply: bool,
    ) -> (u32, oneshot::Receiver<Message>) {
        let tx_id = self.next_tx.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            tx_id,
            PendingQuery {
                sent_at: Instant::now(),
                target,
                reply: with_reply.then_some(tx),
            },
        );
        (tx_id, rx)
    }

    async fn send(&self, addr: SocketAddrV4, tx_id: u32, message: Message) -> Result<()> {
        let packet = Packet::new(tx_id, self.local_id, message);
        let bytes = packet.encode()?;
        self.socket.send_to(&bytes, SocketAddr::V4(addr)).await?;
        Ok(())
    }

    fn reap_pending(&self) {
        let mut expired = Vec::new();
        {
            let mut pending = self.pending.lock();
            pending.retain(|tx_id, query| {
                if query.sent_at.elapsed() > QUERY_TIMEOUT {
                    expired.push((*tx_id, query.target));
                    false
                } else {
                    true
                }
            });
        }
        for (tx_id, target) in expired {
            trace!(tx_id, "reaped pending query");
            if let Some(id) = target {
                self.routing.mark_failed(&id);
            }
        }
    }

    fn complete_pending(&self, tx_id: u32, message: Message) {
        let entry = self.pending.lock().remove(&tx_id);
        if let Some(query) = entry {
            if let Some(reply) = query.reply {
                let _ = reply.send(message);
            }
        }
    }

    async fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let SocketAddr::V4(addr) = from else {
            return;
        };

        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(%from, "dropping malformed datagram: {e}");
                return;
            }
        };

        self.register_contact(Contact::new(packet.sender, addr)).await;

        match packet.message {
            Message::Ping => {
                let _ = self.send(addr, packet.tx_id, Message::Pong).await;
            }
            Message::FindNode { target } => {
                let contacts = self.routing.closest(&target, K);
                let _ = self
                    .send(addr, packet.tx_id, Message::Nodes { contacts })
                    .await;
            }
            Message::FindValue { key } => {
                let reply = match self.store.get(&key) {
                    Some(value) => Message::Value { value },
                    None => Message::Nodes {
                        contacts: self.routing.closest(&key, K),
                    },
                };
                let _ = self.send(addr, packet.tx_id, reply).await;
            }
            Message::Store { key, value } => {
                let ok = PeerAnnouncement::from_verified_bytes(&value).is_ok()
                    && self.store.insert(key, value).is_ok();
                let _ = self.send(addr, packet.tx_id, Message::Stored { ok }).await;
            }
            Message::Announce { value } => {
                let ok = match PeerAnnouncement::from_verified_bytes(&value) {
                    Ok(announcement) => {
                        let a = self.store.insert(announcement.dht_key(), value.clone());
                        let b = self.store.insert(announcement.fingerprint_key(), value);
                        a.is_ok() && b.is_ok()
                    }
                    Err(e) => {
                        debug!(%addr, "rejected announcement: {e}");
                        false
                    }
                };
                let _ = self
                    .send(addr, packet.tx_id, Message::Announced { ok })
                    .await;
            }
            Message::Nodes { ref contacts } => {
                // Learned third-party contacts enter the table; dead ones
                // age out through failed queries.
                for contact in contacts.clone() {
                    self.register_contact(contact).await;
                }
                self.complete_pending(packet.tx_id, packet.message);
            }
            Message::Pong
            | Message::Value { .. }
            | Message::Stored { .. }
            | Message::Announced { .. } => {
                self.complete_pending(packet.tx_id, packet.message);
            }
        }
    }

    async fn register_contact(&self, contact: Contact) {
        if contact.node_id == self.local_id {
            return;
        }

        let is_new = !self.routing.contains(&contact.node_id);
        let node_id = contact.node_id;
        let addr = contact.addr;

        if let Some(oldest) = self.routing.add_contact(contact) {
            // Bucket full: give the oldest resident a chance to answer
            // before the reaper counts it out.
            let (tx_id, _) = self.register(Some(oldest.node_id), false);
            let _ = self.send(oldest.addr, tx_id, Message::Ping).await;
            return;
        }

        if is_new {
            self.events.emit(CoreEvent::PeerDiscovered {
                node_id_hex: node_id.to_hex(),
                addr: addr.to_string(),
            });
        }
    }
}

async fn bind_with_probe(port: u16) -> Result<(UdpSocket, u16)> {
    let mut last_err = None;
    for offset in 0..=PORT_PROBE_RANGE {
        let candidate = port.saturating_add(offset);
        match UdpSocket::bind(("0.0.0.0", candidate)).await {
            Ok(socket) => {
                let bound = socket.local_addr()?.port();
                return Ok((socket, bound));
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(DhtError::BindFailed(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrInUse, "no port available")
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anonet_identity::Identity;
    use std::net::Ipv4Addr;

    async fn spawn_node(name: &str) -> DhtService {
        let service = DhtService::bind(NodeId::from_name(name), 0, EventBus::default())
            .await
            .unwrap();
        service.start();
        service
    }

    fn loopback(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let a = spawn_node("node-a").await;
        let b = spawn_node("node-b").await;

        let reply = a
            .query(loopback(b.port()), None, Message::Ping, QUERY_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(reply, Message::Pong);

        // Both sides learned each other
        assert!(b.routing().contains(a.local_id()));
    }

    #[tokio::test]
    async fn test_find_node_returns_contacts() {
        let a = spawn_node("find-a").await;
        let b = spawn_node("find-b").await;
        let c = spawn_node("find-c").await;

        // b learns about c
        c.query(loopback(b.port()), None, Message::Ping, QUERY_TIMEOUT)
            .await
            .unwrap();

        let reply = a
            .query(
                loopback(b.port()),
                None,
                Message::FindNode {
                    target: *c.local_id(),
                },
                QUERY_TIMEOUT,
            )
            .await
            .unwrap();

        match reply {
            Message::Nodes { contacts } => {
                assert!(contacts.iter().any(|ct| ct.node_id == *c.local_id()));
            }
            other => panic!("expected NODES, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_announce_stores_under_both_keys() {
        let a = spawn_node("ann-a").await;
        let b = spawn_node("ann-b").await;

        let identity = Identity::generate();
        let announcement = PeerAnnouncement::build(&identity, "alice", &[51823]).unwrap();

        let reply = a
            .query(
                loopback(b.port()),
                None,
                Message::Announce {
                    value: announcement.to_bytes(),
                },
                QUERY_TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(reply, Message::Announced { ok: true });

        assert!(b.store().contains(&announcement.dht_key()));
        assert!(b.store().contains(&announcement.fingerprint_key()));
    }

    #[tokio::test]
    async fn test_announce_rejects_tampered() {
        let a = spawn_node("tam-a").await;
        let b = spawn_node("tam-b").await;

        let identity = Identity::generate();
        let announcement = PeerAnnouncement::build(&identity, "mallory", &[51823]).unwrap();
        let mut bytes = announcement.to_bytes();
        bytes[3] ^= 0x01;

        let reply = a
            .query(
                loopback(b.port()),
                None,
                Message::Announce { value: bytes },
                QUERY_TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(reply, Message::Announced { ok: false });
        assert!(!b.store().contains(&announcement.dht_key()));
    }

    #[tokio::test]
    async fn test_store_requires_valid_announcement() {
        let a = spawn_node("st-a").await;
        let b = spawn_node("st-b").await;

        let reply = a
            .query(
                loopback(b.port()),
                None,
                Message::Store {
                    key: NodeId::from_name("junk"),
                    value: vec![0xDE, 0xAD],
                },
                QUERY_TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(reply, Message::Stored { ok: false });
    }

    #[tokio::test]
    async fn test_find_value_returns_value_or_nodes() {
        let a = spawn_node("fv-a").await;
        let b = spawn_node("fv-b").await;

        let identity = Identity::generate();
        let announcement = PeerAnnouncement::build(&identity, "carol", &[51823]).unwrap();
        b.store()
            .insert(announcement.dht_key(), announcement.to_bytes())
            .unwrap();

        let reply = a
            .query(
                loopback(b.port()),
                None,
                Message::FindValue {
                    key: announcement.dht_key(),
                },
                QUERY_TIMEOUT,
            )
            .await
            .unwrap();
        assert!(matches!(reply, Message::Value { .. }));

        let miss = a
            .query(
                loopback(b.port()),
                None,
                Message::FindValue {
                    key: NodeId::from_name("absent"),
                },
                QUERY_TIMEOUT,
            )
            .await
            .unwrap();
        assert!(matches!(miss, Message::Nodes { .. }));
    }

    #[tokio::test]
    async fn test_query_timeout_on_silent_peer() {
        let a = spawn_node("to-a").await;
        // Nothing listens on this socket once bound and dropped
        let dead = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let result = a
            .query(
                loopback(dead_port),
                None,
                Message::Ping,
                Duration::from_millis(300),
            )
            .await;
        assert!(matches!(result, Err(DhtError::QueryTimeout)));
    }
}
