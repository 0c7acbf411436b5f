//! Bootstrap sources: node cache, LAN beacons, hard-coded seeds
//!
//! Every source yields socket addresses that get a PING and a
//! FIND_NODE(local id). Peers only enter the routing table once they
//! answer, so a forged beacon cannot inject dead endpoints into it.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use anonet_core::types::{DEFAULT_LAN_BEACON_PORT, PORT_PROBE_RANGE};

use crate::{Contact, DhtError, DhtService, NodeId, Result};

const BEACON_PREFIX: &str = "ANONET_DHT_BOOTSTRAP";
const BEACON_INTERVAL: Duration = Duration::from_secs(5);
const NODE_CACHE_FILE: &str = "nodes.json";

/// Persisted bootstrap contacts, refreshed on shutdown.
pub struct NodeCache {
    path: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct CachedNode {
    node_id: String,
    addr: String,
}

impl NodeCache {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(NODE_CACHE_FILE),
        }
    }

    /// Addresses from the cache file; unparseable entries are skipped.
    pub fn load(&self) -> Vec<SocketAddrV4> {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let cached: Vec<CachedNode> = match serde_json::from_str(&content) {
            Ok(cached) => cached,
            Err(_) => {
                warn!("node cache unreadable, ignoring");
                return Vec::new();
            }
        };
        cached
            .iter()
            .filter_map(|node| node.addr.parse().ok())
            .collect()
    }

    /// Persist the current routing table residents.
    pub fn save(&self, contacts: &[Contact]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let cached: Vec<CachedNode> = contacts
            .iter()
            .map(|c| CachedNode {
                node_id: c.node_id.to_hex(),
                addr: c.addr.to_string(),
            })
            .collect();
        let content = serde_json::to_string_pretty(&cached)
            .map_err(|e| DhtError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

/// LAN peer discovery over UDP broadcast.
///
/// Broadcasts `ANONET_DHT_BOOTSTRAP|<id_hex>|<dht_port>` every 5 seconds
/// and collects addresses from beacons of other nodes.
#[derive(Clone)]
pub struct LanDiscovery {
    inner: Arc<LanInner>,
}

struct LanInner {
    socket: UdpSocket,
    local_id: NodeId,
    dht_port: u16,
    beacon_port: u16,
    discovered: Mutex<HashSet<SocketAddrV4>>,
    shutdown: watch::Sender<bool>,
}

impl LanDiscovery {
    /// Bind the beacon listener on the well-known port, probing upward if
    /// it is taken.
    pub async fn bind(local_id: NodeId, dht_port: u16) -> Result<Self> {
        let mut last_err = None;
        let mut bound = None;
        for offset in 0..=PORT_PROBE_RANGE {
            let candidate = DEFAULT_LAN_BEACON_PORT.saturating_add(offset);
            match UdpSocket::bind(("0.0.0.0", candidate)).await {
                Ok(socket) => {
                    let port = socket.local_addr()?.port();
                    bound = Some((socket, port));
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let (socket, beacon_port) = bound.ok_or_else(|| {
            DhtError::BindFailed(last_err.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::AddrInUse, "no beacon port available")
            }))
        })?;
        socket.set_broadcast(true)?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(LanInner {
                socket,
                local_id,
                dht_port,
                beacon_port,
                discovered: Mutex::new(HashSet::new()),
                shutdown,
            }),
        })
    }

    pub fn beacon_port(&self) -> u16 {
        self.inner.beacon_port
    }

    /// Spawn the broadcast and listener loops.
    pub fn start(&self) {
        let this = self.clone();
        tokio::spawn(async move { this.run().await });
    }

    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    /// Addresses heard from foreign beacons so far.
    pub fn discovered(&self) -> Vec<SocketAddrV4> {
        self.inner.discovered.lock().iter().copied().collect()
    }

    async fn run(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut ticker = tokio::time::interval(BEACON_INTERVAL);
        let mut buf = [0u8; 256];

        let beacon = format!(
            "{BEACON_PREFIX}|{}|{}",
            self.inner.local_id.to_hex(),
            self.inner.dht_port
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let target = SocketAddrV4::new(Ipv4Addr::BROADCAST, DEFAULT_LAN_BEACON_PORT);
                    if let Err(e) = self.inner.socket.send_to(beacon.as_bytes(), SocketAddr::V4(target)).await {
                        trace!("beacon broadcast failed: {e}");
                    }
                }
                received = self.inner.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.inner.handle_beacon(&buf[..len], from),
                    Err(e) => {
                        warn!("beacon receive failed: {e}");
                        break;
                    }
                }
            }
        }
        debug!("LAN discovery stopped");
    }
}

impl LanInner {
    fn handle_beacon(&self, bytes: &[u8], from: SocketAddr) {
        let SocketAddr::V4(from) = from else { return };
        let Some((node_id, dht_port)) = parse_beacon(bytes) else {
            return;
        };
        if node_id == self.local_id {
            return;
        }

        let addr = SocketAddrV4::new(*from.ip(), dht_port);
        if self.discovered.lock().insert(addr) {
            debug!(%node_id, %addr, "LAN peer beacon");
        }
    }
}

fn parse_beacon(bytes: &[u8]) -> Option<(NodeId, u16)> {
    let text = std::str::from_utf8(bytes).ok()?;
    let mut parts = text.split('|');
    if parts.next()? != BEACON_PREFIX {
        return None;
    }
    let node_id = NodeId::from_hex(parts.next()?).ok()?;
    let dht_port: u16 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((node_id, dht_port))
}

/// Bootstrap inputs in priority order.
#[derive(Debug, Default, Clone)]
pub struct BootstrapSources {
    pub cached: Vec<SocketAddrV4>,
    pub lan: Vec<SocketAddrV4>,
    pub seeds: Vec<SocketAddrV4>,
}

impl BootstrapSources {
    fn union(&self) -> Vec<SocketAddrV4> {
        let mut seen = HashSet::new();
        self.cached
            .iter()
            .chain(self.lan.iter())
            .chain(self.seeds.iter())
            .filter(|addr| seen.insert(**addr))
            .copied()
            .collect()
    }
}

/// Probe every bootstrap source through the DHT service. Returns how many
/// endpoints were probed; responders enter the routing table on reply.
pub async fn bootstrap(dht: &DhtService, sources: &BootstrapSources) -> usize {
    let endpoints = sources.union();
    let mut probed = 0;
    for addr in &endpoints {
        match dht.probe(*addr).await {
            Ok(()) => probed += 1,
            Err(e) => warn!(%addr, "bootstrap probe failed: {e}"),
        }
    }
    debug!(probed, "bootstrap complete");
    probed
}
