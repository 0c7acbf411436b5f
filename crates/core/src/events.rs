//! Core event bus
//!
//! Subsystems publish state transitions as tagged events on a single
//! broadcast channel; collaborators (UI, logging widgets) drain it. No
//! component holds a callback into another.

use tokio::sync::broadcast;

/// State transitions the core publishes.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// DHT listener bound and serving.
    DhtStarted { port: u16 },
    /// A new contact entered the routing table.
    PeerDiscovered { node_id_hex: String, addr: String },
    /// Our announcement was pushed to the network.
    AnnouncePublished { username: String, targets: usize },
    /// A lookup finished (found or not).
    LookupFinished { key_hex: String, found: bool },
    /// The relay accepted an authenticated peer.
    RelayPeerAuthenticated { addr: String },
    /// The relay refused a connection.
    RelayPeerRejected { addr: String },
    /// A circuit reached the Ready state.
    CircuitReady { circuit_id: u32, hops: usize },
    /// A circuit was torn down.
    CircuitDestroyed { circuit_id: u32 },
    /// A circuit build failed.
    CircuitFailed { circuit_id: u32, reason: String },
    /// A secure channel finished its handshake.
    ChannelEstablished { peer_fingerprint: String },
}

/// Broadcast bus for [`CoreEvent`].
///
/// Cloneable; all clones share the same channel. Events published with no
/// live subscribers are dropped silently.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Lagging or absent subscribers are not an error.
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
