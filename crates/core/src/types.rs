//! Network-wide constants and shared aliases

/// Default UDP port for the DHT.
pub const DEFAULT_DHT_PORT: u16 = 51820;

/// Default TCP port for file transfer (consumed by collaborators).
pub const DEFAULT_TRANSFER_PORT: u16 = 51821;

/// Well-known UDP port for LAN bootstrap beacons.
pub const DEFAULT_LAN_BEACON_PORT: u16 = 51819;

/// Default TCP port for the onion relay.
pub const DEFAULT_RELAY_PORT: u16 = 51823;

/// How many ports above the default to probe when the default is bound.
pub const PORT_PROBE_RANGE: u16 = 8;

/// Kademlia bucket capacity.
pub const K: usize = 20;

/// Iterative lookup parallelism.
pub const ALPHA: usize = 3;

/// Number of k-buckets (one per bit of the 160-bit id space).
pub const BUCKET_COUNT: usize = 160;

/// Upper bound on stored announcements.
pub const MAX_STORE_ENTRIES: usize = 10_000;

/// Upper bound on concurrent circuits terminated at one relay.
pub const MAX_RELAY_CIRCUITS: usize = 1000;

/// Maximum advertised port candidates in one announcement.
pub const MAX_PORT_CANDIDATES: usize = 5;

/// Largest DHT datagram we will build or accept.
pub const MAX_PACKET_SIZE: usize = 1400;

/// Per-IP rate limiter burst size at the relay.
pub const RATE_LIMIT_TOKENS: u32 = 10;

/// Current time as milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
