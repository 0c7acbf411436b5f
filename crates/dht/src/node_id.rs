//! 160-bit node identifiers with the XOR metric

use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::DhtError;

pub const NODE_ID_LEN: usize = 20;

/// Opaque 160-bit identifier for nodes and keys.
///
/// Ordering is unsigned big-endian lexicographic, which is what XOR
/// distances are compared with.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Random id from OS entropy
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// SHA-1 of an arbitrary UTF-8 string (usernames, fingerprints)
    pub fn from_name(name: &str) -> Self {
        let digest = Sha1::digest(name.as_bytes());
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Exactly 20 bytes
    pub fn new(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != NODE_ID_LEN {
            return Err(DhtError::InvalidNodeId(format!(
                "expected {NODE_ID_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    /// Exactly 40 hex chars
    pub fn from_hex(hex_str: &str) -> Result<Self, DhtError> {
        if hex_str.len() != NODE_ID_LEN * 2 {
            return Err(DhtError::InvalidNodeId(format!(
                "expected {} hex chars, got {}",
                NODE_ID_LEN * 2,
                hex_str.len()
            )));
        }
        let bytes =
            hex::decode(hex_str).map_err(|e| DhtError::InvalidNodeId(e.to_string()))?;
        Self::new(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Elementwise XOR, compared as a 160-bit unsigned big-endian number
    pub fn xor_distance(&self, other: &NodeId) -> [u8; NODE_ID_LEN] {
        let mut distance = [0u8; NODE_ID_LEN];
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        distance
    }

    /// Whether `self` is strictly closer to `target` than `other` is
    pub fn is_closer_to(&self, target: &NodeId, other: &NodeId) -> bool {
        self.xor_distance(target) < other.xor_distance(target)
    }

    /// Routing bucket for `other` relative to `self`: 159 minus the index
    /// of the highest set bit of the XOR distance. Equal ids map to 0 by
    /// convention.
    pub fn bucket_index(&self, other: &NodeId) -> usize {
        let distance = self.xor_distance(other);
        for (byte_idx, byte) in distance.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        0
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form for logs
        write!(f, "{}", &self.to_hex()[..8])
    }
}
