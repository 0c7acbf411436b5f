//! anonet DHT
//!
//! Kademlia-style distributed hash table carrying signed peer
//! announcements. Nodes are identified by 160-bit SHA-1 ids, contacts live
//! in 160 LRU k-buckets, and the wire protocol is a fixed big-endian UDP
//! datagram format. Lookup is iterative with parallelism 3; bootstrap
//! seeds come from a node cache, LAN beacons and hard-coded seeds.

mod announcement;
mod bootstrap;
mod bucket;
mod contact;
mod lookup;
mod node_id;
mod routing;
mod service;
mod store;
mod wire;

pub use announcement::PeerAnnouncement;
pub use bootstrap::{bootstrap, BootstrapSources, LanDiscovery, NodeCache};
pub use bucket::{BucketInsert, KBucket};
pub use contact::Contact;
pub use node_id::NodeId;
pub use routing::RoutingTable;
pub use service::DhtService;
pub use store::AnnouncementStore;
pub use wire::{Message, MessageType, Packet};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("Invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Malformed announcement: {0}")]
    MalformedAnnouncement(String),

    #[error("Announcement failed verification")]
    AnnouncementRejected,

    #[error("Store is full")]
    StoreFull,

    #[error("Query timed out")]
    QueryTimeout,

    #[error("Bind failed: {0}")]
    BindFailed(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DhtError>;
