//! Routing table contacts and their 26-byte wire form

use std::net::{Ipv4Addr, SocketAddrV4};

use anonet_core::types::now_ms;

use crate::node_id::NODE_ID_LEN;
use crate::{DhtError, NodeId};

/// Wire size: 20-byte id, 4-byte IPv4, 2-byte port.
pub const CONTACT_WIRE_LEN: usize = NODE_ID_LEN + 4 + 2;

/// A contact is stale once unseen for this long.
const STALE_AFTER_MS: i64 = 15 * 60 * 1000;

/// A contact is bad after this many unanswered queries.
const MAX_FAILED_QUERIES: u32 = 3;

/// A known DHT node. Equality is by node id only.
#[derive(Debug, Clone)]
pub struct Contact {
    pub node_id: NodeId,
    pub addr: SocketAddrV4,
    pub last_seen: i64,
    pub failed_queries: u32,
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for Contact {}

impl Contact {
    pub fn new(node_id: NodeId, addr: SocketAddrV4) -> Self {
        Self {
            node_id,
            addr,
            last_seen: now_ms(),
            failed_queries: 0,
        }
    }

    /// Refresh last_seen and clear the failure counter
    pub fn touch(&mut self) {
        self.last_seen = now_ms();
        self.failed_queries = 0;
    }

    pub fn mark_failed(&mut self) {
        self.failed_queries += 1;
    }

    /// Unseen for more than 15 minutes
    pub fn is_stale(&self) -> bool {
        now_ms() - self.last_seen > STALE_AFTER_MS
    }

    /// Three or more consecutive unanswered queries
    pub fn is_bad(&self) -> bool {
        self.failed_queries >= MAX_FAILED_QUERIES
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.node_id.as_bytes());
        buf.extend_from_slice(&self.addr.ip().octets());
        buf.extend_from_slice(&self.addr.port().to_be_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() < CONTACT_WIRE_LEN {
            return Err(DhtError::MalformedPacket(format!(
                "contact needs {CONTACT_WIRE_LEN} bytes, got {}",
                bytes.len()
            )));
        }

        let node_id = NodeId::new(&bytes[..NODE_ID_LEN])?;
        let ip = Ipv4Addr::new(bytes[20], bytes[21], bytes[22], bytes[23]);
        let port = u16::from_be_bytes([bytes[24], bytes[25]]);

        Ok(Self::new(node_id, SocketAddrV4::new(ip, port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 7), port)
    }

    #[test]
    fn test_wire_roundtrip() {
        let contact = Contact::new(NodeId::random(), addr(51820));

        let mut buf = Vec::new();
        contact.encode(&mut buf);
        assert_eq!(buf.len(), CONTACT_WIRE_LEN);

        let decoded = Contact::decode(&buf).unwrap();
        assert_eq!(decoded.node_id, contact.node_id);
        assert_eq!(decoded.addr, contact.addr);
    }

    #[test]
    fn test_decode_short_buffer_fails() {
        assert!(Contact::decode(&[0u8; 25]).is_err());
    }

    #[test]
    fn test_equality_is_by_node_id() {
        let id = NodeId::random();
        let a = Contact::new(id, addr(1000));
        let b = Contact::new(id, addr(2000));
        let c = Contact::new(NodeId::random(), addr(1000));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_fresh_contact_is_not_stale() {
        let contact = Contact::new(NodeId::random(), addr(51820));
        assert!(!contact.is_stale());
        assert!(!contact.is_bad());
    }

    #[test]
    fn test_old_contact_is_stale() {
        let mut contact = Contact::new(NodeId::random(), addr(51820));
        contact.last_seen = now_ms() - STALE_AFTER_MS - 1;
        assert!(contact.is_stale());

        contact.touch();
        assert!(!contact.is_stale());
    }

    #[test]
    fn test_failed_queries_make_contact_bad() {
        let mut contact = Contact::new(NodeId::random(), addr(51820));
        contact.mark_failed();
        contact.mark_failed();
        assert!(!contact.is_bad());

        contact.mark_failed();
        assert!(contact.is_bad());

        contact.touch();
        assert!(!contact.is_bad());
    }
}
