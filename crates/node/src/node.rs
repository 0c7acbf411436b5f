use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use anonet_channel::{handshake, ChannelError, SecureChannel};
use anonet_core::types::DEFAULT_RELAY_PORT;
use anonet_core::{AnonetConfig, AnonetError, CoreEvent, EventBus, Result};
use anonet_dht::{
    bootstrap, BootstrapSources, DhtError, DhtService, LanDiscovery, NodeCache, NodeId,
    PeerAnnouncement,
};
use anonet_identity::{load_or_generate_identity, Identity, KeystoreError};
use anonet_onion::{CircuitBuilder, ClientCircuit, OnionError, RelayDirectory, RelayInfo};
use anonet_relay::{InboundStreamEvent, RelayConfig, RelayError, RelayServer};

/// How often routing-table residents are folded into the relay directory.
const RELAY_HARVEST_INTERVAL: Duration = Duration::from_secs(60);

/// Map subsystem errors onto the shared taxonomy the facade surfaces.
fn from_keystore(e: KeystoreError) -> AnonetError {
    AnonetError::Identity(e.to_string())
}

fn from_dht(e: DhtError) -> AnonetError {
    match e {
        DhtError::InvalidNodeId(m)
        | DhtError::MalformedPacket(m)
        | DhtError::MalformedAnnouncement(m) => AnonetError::MalformedMessage(m),
        DhtError::AnnouncementRejected => AnonetError::InvalidSignature,
        DhtError::StoreFull => AnonetError::Capacity("announcement store full".into()),
        DhtError::QueryTimeout => AnonetError::Timeout,
        DhtError::BindFailed(e) => AnonetError::NetworkUnavailable(e.to_string()),
        DhtError::Io(e) => AnonetError::Io(e),
    }
}

fn from_relay(e: RelayError) -> AnonetError {
    match e {
        RelayError::BindFailed(e) => AnonetError::NetworkUnavailable(e.to_string()),
        RelayError::Unauthenticated => AnonetError::Unauthenticated,
        RelayError::ProtocolViolation(m) => AnonetError::ProtocolViolation(m),
        RelayError::Onion(e) => from_onion(e),
        RelayError::Timeout => AnonetError::Timeout,
        RelayError::Io(e) => AnonetError::Io(e),
    }
}

fn from_onion(e: OnionError) -> AnonetError {
    match e {
        OnionError::MalformedCell(m) => AnonetError::MalformedMessage(m),
        OnionError::ProtocolViolation(m) => AnonetError::ProtocolViolation(m),
        OnionError::BuildFailed(m) => AnonetError::CircuitBuildFailed(m),
        OnionError::LayerFailure | OnionError::DigestMismatch => AnonetError::AeadFailure,
        OnionError::KeyAgreement => AnonetError::KeyAgreementFailed,
        OnionError::NotEnoughRelays { needed, known } => AnonetError::CircuitBuildFailed(
            format!("need {needed} relays, know {known}"),
        ),
        OnionError::Timeout => AnonetError::Timeout,
        OnionError::Io(e) => AnonetError::Io(e),
    }
}

fn from_channel(e: ChannelError) -> AnonetError {
    match e {
        ChannelError::HandshakeFailed(m) => AnonetError::ProtocolViolation(m),
        ChannelError::InvalidSignature | ChannelError::FingerprintMismatch => {
            AnonetError::InvalidSignature
        }
        ChannelError::KeyAgreement => AnonetError::KeyAgreementFailed,
        ChannelError::Integrity => AnonetError::AeadFailure,
        ChannelError::ChannelClosed => AnonetError::ChannelClosed,
        ChannelError::FrameTooLarge(n) => {
            AnonetError::Capacity(format!("frame of {n} bytes"))
        }
        ChannelError::Io(e) => AnonetError::Io(e),
    }
}

/// Handle to the inbound circuit streams (terminal RELAY traffic), for
/// the transfer collaborator.
pub type NodeHandle = tokio::sync::mpsc::Receiver<InboundStreamEvent>;

/// A running anonet node.
pub struct AnonetNode {
    identity: Arc<Identity>,
    display_name: String,
    config: AnonetConfig,
    events: EventBus,
    dht: DhtService,
    lan: Option<LanDiscovery>,
    relay: Option<RelayServer>,
    builder: CircuitBuilder,
    directory: Arc<RelayDirectory>,
    cache: NodeCache,
    shutdown: watch::Sender<bool>,
}

impl AnonetNode {
    /// Bring the node up: load or create the identity, bind every
    /// service, bootstrap the DHT and start the periodic loops.
    ///
    /// Returns the node and the receiver for inbound circuit streams
    /// (empty and silent when the relay is disabled).
    pub async fn start(
        config: AnonetConfig,
        display_name: &str,
        wordlist: &[&str],
    ) -> Result<(Self, NodeHandle)> {
        let (identity, created) =
            load_or_generate_identity(&config.node.data_dir, wordlist).map_err(from_keystore)?;
        let identity = Arc::new(identity);
        if created {
            info!(
                "created identity {} (write down the mnemonic!)",
                identity.discriminator()
            );
        }

        let events = EventBus::default();
        let local_id = NodeId::from_name(&format!(
            "{display_name}#{}",
            identity.discriminator()
        ));

        let dht = DhtService::bind(local_id, config.network.dht_port, events.clone())
            .await
            .map_err(from_dht)?;
        dht.start();

        let lan = match LanDiscovery::bind(local_id, dht.port()).await {
            Ok(lan) => {
                lan.start();
                Some(lan)
            }
            Err(e) => {
                warn!("LAN discovery unavailable: {e}");
                None
            }
        };

        let (relay, inbound) = if config.node.run_relay {
            let relay_config = RelayConfig {
                port: config.network.relay_port,
                ..RelayConfig::default()
            };
            let (relay, inbound) = RelayServer::bind(identity.clone(), relay_config, events.clone())
                .await
                .map_err(from_relay)?;
            relay.start();
            (Some(relay), inbound)
        } else {
            // Closed channel stands in when the relay is disabled
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            (None, rx)
        };

        let directory = Arc::new(RelayDirectory::new());
        let builder = CircuitBuilder::new(identity.clone(), directory.clone(), events.clone());
        let cache = NodeCache::new(&config.node.data_dir);
        let (shutdown, _) = watch::channel(false);

        let node = Self {
            identity,
            display_name: display_name.to_string(),
            config,
            events,
            dht,
            lan,
            relay,
            builder,
            directory,
            cache,
            shutdown,
        };

        node.bootstrap().await;
        node.spawn_announce_loop();
        node.spawn_relay_harvest_loop();
        Ok((node, inbound))
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn dht(&self) -> &DhtService {
        &self.dht
    }

    pub fn relay_port(&self) -> Option<u16> {
        self.relay.as_ref().map(|r| r.port())
    }

    pub fn relay_directory(&self) -> &RelayDirectory {
        &self.directory
    }

    /// Username this node announces under.
    pub fn username(&self) -> String {
        format!("{}#{}", self.display_name, self.identity.discriminator())
    }

    /// Look a peer up by full username (`name#DISCRIMINATOR`).
    pub async fn lookup_user(&self, username: &str) -> Option<PeerAnnouncement> {
        self.dht.lookup(NodeId::from_name(username)).await
    }

    /// Look a peer up by fingerprint.
    pub async fn lookup_fingerprint(&self, fingerprint: &str) -> Option<PeerAnnouncement> {
        self.dht.lookup(NodeId::from_name(fingerprint)).await
    }

    /// Publish our announcement now.
    pub async fn announce(&self) -> Result<usize> {
        let announcement = self.build_announcement()?;
        self.dht.publish(&announcement).await.map_err(from_dht)
    }

    /// Open an onion circuit through `hops` random relays.
    pub async fn open_circuit(&self, hops: usize) -> Result<ClientCircuit> {
        self.builder.build(hops).await.map_err(from_onion)
    }

    /// Open a direct TCP connection to a peer and run the secure-channel
    /// handshake, pinning the expected fingerprint when given.
    pub async fn secure_channel_to(
        &self,
        addr: SocketAddrV4,
        expected_fingerprint: Option<&str>,
    ) -> Result<(SecureChannel, TcpStream)> {
        let mut stream = TcpStream::connect(addr).await?;
        let channel = handshake(&mut stream, &self.identity, expected_fingerprint)
            .await
            .map_err(from_channel)?;
        self.events.emit(CoreEvent::ChannelEstablished {
            peer_fingerprint: channel.peer_fingerprint().to_string(),
        });
        Ok((channel, stream))
    }

    /// Register a relay endpoint directly (manual adds, LAN finds).
    pub fn add_relay(&self, addr: SocketAddrV4, fingerprint: Option<String>) {
        self.directory.add(RelayInfo { addr, fingerprint });
    }

    /// Pair an announcement's advertised ports with the address it was
    /// fetched from, feeding the relay directory.
    pub fn add_relays_from_announcement(
        &self,
        announcement: &PeerAnnouncement,
        ip: std::net::Ipv4Addr,
    ) {
        for port in &announcement.port_candidates {
            self.directory.add(RelayInfo {
                addr: SocketAddrV4::new(ip, *port),
                fingerprint: Some(announcement.fingerprint.clone()),
            });
        }
    }

    /// Persist the node cache and stop every service.
    pub fn shutdown(&self) {
        if let Err(e) = self.cache.save(&self.dht.routing().all()) {
            warn!("node cache save failed: {e}");
        }
        let _ = self.shutdown.send(true);
        self.dht.shutdown();
        if let Some(lan) = &self.lan {
            lan.shutdown();
        }
        if let Some(relay) = &self.relay {
            relay.shutdown();
        }
        info!("node stopped");
    }

    fn build_announcement(&self) -> Result<PeerAnnouncement> {
        let mut ports = Vec::new();
        if let Some(port) = self.relay_port() {
            ports.push(port);
        }
        ports.push(self.dht.port());

        PeerAnnouncement::build(&self.identity, &self.display_name, &ports).map_err(from_dht)
    }

    async fn bootstrap(&self) {
        let sources = BootstrapSources {
            cached: self.cache.load(),
            lan: self
                .lan
                .as_ref()
                .map(|lan| lan.discovered())
                .unwrap_or_default(),
            seeds: self
                .config
                .network
                .bootstrap_seeds
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
        };
        let probed = bootstrap(&self.dht, &sources).await;
        debug!(probed, "bootstrap finished");
    }

    /// Re-announce every interval and whenever freshly started.
    fn spawn_announce_loop(&self) {
        let dht = self.dht.clone();
        let identity = self.identity.clone();
        let display_name = self.display_name.clone();
        let relay_port = self.relay_port();
        let dht_port = self.dht.port();
        let interval = Duration::from_secs(self.config.node.announce_interval_secs);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let mut ports = Vec::new();
                        if let Some(port) = relay_port {
                            ports.push(port);
                        }
                        ports.push(dht_port);

                        match PeerAnnouncement::build(&identity, &display_name, &ports) {
                            Ok(announcement) => {
                                if let Err(e) = dht.publish(&announcement).await {
                                    warn!("announce failed: {e}");
                                }
                            }
                            Err(e) => warn!("announcement build failed: {e}"),
                        }
                    }
                }
            }
        });
    }

    /// Routing-table residents are relay candidates on the default port;
    /// LAN finds get probed into the table by the bootstrap path.
    fn spawn_relay_harvest_loop(&self) {
        let dht = self.dht.clone();
        let directory = self.directory.clone();
        let lan = self.lan.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RELAY_HARVEST_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        for contact in dht.routing().all() {
                            directory.add(RelayInfo {
                                addr: SocketAddrV4::new(*contact.addr.ip(), DEFAULT_RELAY_PORT),
                                fingerprint: None,
                            });
                        }
                        if let Some(lan) = &lan {
                            for addr in lan.discovered() {
                                if let Err(e) = dht.probe(addr).await {
                                    debug!(%addr, "LAN probe failed: {e}");
                                }
                            }
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_wordlist() -> Vec<String> {
        (0..2048).map(|i| format!("word{i:04}")).collect()
    }

    fn test_config(tag: &str) -> AnonetConfig {
        let mut config = AnonetConfig::default();
        config.node.data_dir =
            std::env::temp_dir().join(format!("anonet-node-{tag}-{}", std::process::id()));
        config.network.dht_port = 0;
        config.network.relay_port = 0;
        config
    }

    #[tokio::test]
    async fn test_node_starts_and_announces_locally() {
        let list = test_wordlist();
        let wordlist: Vec<&str> = list.iter().map(|s| s.as_str()).collect();
        let config = test_config("start");

        let (node, _inbound) = AnonetNode::start(config.clone(), "alice", &wordlist)
            .await
            .unwrap();

        let published = node.announce().await.unwrap();
        // No peers yet, but the local store holds both keys
        assert_eq!(published, 0);

        let username = node.username();
        let found = node.lookup_user(&username).await.unwrap();
        assert_eq!(found.username, username);
        assert!(found.verify());

        let by_fp = node
            .lookup_fingerprint(node.identity().fingerprint())
            .await
            .unwrap();
        assert_eq!(by_fp.fingerprint, node.identity().fingerprint());

        node.shutdown();
        std::fs::remove_dir_all(&config.node.data_dir).ok();
    }

    #[tokio::test]
    async fn test_identity_persists_across_restarts() {
        let list = test_wordlist();
        let wordlist: Vec<&str> = list.iter().map(|s| s.as_str()).collect();
        let config = test_config("persist");

        let (node, _inbound) = AnonetNode::start(config.clone(), "bob", &wordlist)
            .await
            .unwrap();
        let fingerprint = node.identity().fingerprint().to_string();
        node.shutdown();

        let (restarted, _inbound) = AnonetNode::start(config.clone(), "bob", &wordlist)
            .await
            .unwrap();
        assert_eq!(restarted.identity().fingerprint(), fingerprint);
        restarted.shutdown();

        std::fs::remove_dir_all(&config.node.data_dir).ok();
    }

    #[tokio::test]
    async fn test_add_relays_from_announcement() {
        let list = test_wordlist();
        let wordlist: Vec<&str> = list.iter().map(|s| s.as_str()).collect();
        let config = test_config("relays");

        let (node, _inbound) = AnonetNode::start(config.clone(), "carol", &wordlist)
            .await
            .unwrap();

        let peer = Identity::generate();
        let announcement = PeerAnnouncement::build(&peer, "dave", &[51823, 51824]).unwrap();
        node.add_relays_from_announcement(&announcement, std::net::Ipv4Addr::new(10, 0, 0, 9));

        assert_eq!(node.relay_directory().len(), 2);

        node.shutdown();
        std::fs::remove_dir_all(&config.node.data_dir).ok();
    }
}
