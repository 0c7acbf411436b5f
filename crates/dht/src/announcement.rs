//! Signed peer announcements
//!
//! The only value type the DHT carries: a self-certifying record binding a
//! username to a fingerprint, public key and reachable ports, signed by the
//! owner. Stored under SHA1(username) and SHA1(fingerprint).

use anonet_core::types::{now_ms, MAX_PORT_CANDIDATES};
use anonet_identity::{fingerprint_of_der, verify_signature, Identity};

use crate::{DhtError, NodeId};

/// Signed, self-certifying peer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAnnouncement {
    /// `displayName#DISCRIMINATOR`
    pub username: String,
    /// Lowercase hex SHA-256 of the public key DER
    pub fingerprint: String,
    /// X.509 SubjectPublicKeyInfo DER
    pub public_key: Vec<u8>,
    /// Reachable UDP/TCP ports, at most 5
    pub port_candidates: Vec<u16>,
    /// Milliseconds since the Unix epoch at signing time
    pub timestamp_ms: i64,
    /// ECDSA/SHA-256 DER signature over the signable bytes
    pub signature: Vec<u8>,
}

impl PeerAnnouncement {
    /// Build and sign an announcement for the local identity.
    pub fn build(
        identity: &Identity,
        display_name: &str,
        port_candidates: &[u16],
    ) -> Result<Self, DhtError> {
        if port_candidates.len() > MAX_PORT_CANDIDATES {
            return Err(DhtError::MalformedAnnouncement(format!(
                "at most {MAX_PORT_CANDIDATES} port candidates, got {}",
                port_candidates.len()
            )));
        }

        let username = format!("{display_name}#{}", identity.discriminator());
        let fingerprint = identity.fingerprint().to_string();
        let public_key = identity.public_key_der();
        let timestamp_ms = now_ms();

        let signable = signable_bytes(
            &username,
            &fingerprint,
            &public_key,
            port_candidates,
            timestamp_ms,
        );
        let signature = identity.sign(&signable);

        Ok(Self {
            username,
            fingerprint,
            public_key,
            port_candidates: port_candidates.to_vec(),
            timestamp_ms,
            signature,
        })
    }

    /// DHT key for username lookups: SHA1(username)
    pub fn dht_key(&self) -> NodeId {
        NodeId::from_name(&self.username)
    }

    /// DHT key for fingerprint lookups: SHA1(fingerprint)
    pub fn fingerprint_key(&self) -> NodeId {
        NodeId::from_name(&self.fingerprint)
    }

    /// Check the signature under the embedded key, and that the embedded
    /// key actually hashes to the claimed fingerprint. Records failing the
    /// binding check are forgeries regardless of signature validity.
    pub fn verify(&self) -> bool {
        if fingerprint_of_der(&self.public_key) != self.fingerprint {
            return false;
        }

        let signable = signable_bytes(
            &self.username,
            &self.fingerprint,
            &self.public_key,
            &self.port_candidates,
            self.timestamp_ms,
        );
        verify_signature(&self.public_key, &signable, &self.signature)
    }

    /// Wire form: every variable field prefixed with a u16 big-endian
    /// length, the port list with a one-byte count.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            2 + self.username.len()
                + 2 + self.fingerprint.len()
                + 2 + self.public_key.len()
                + 1 + self.port_candidates.len() * 2
                + 8
                + 2 + self.signature.len(),
        );

        write_field(&mut buf, self.username.as_bytes());
        write_field(&mut buf, self.fingerprint.as_bytes());
        write_field(&mut buf, &self.public_key);
        buf.push(self.port_candidates.len() as u8);
        for port in &self.port_candidates {
            buf.extend_from_slice(&port.to_be_bytes());
        }
        buf.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        write_field(&mut buf, &self.signature);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let mut cursor = Cursor { bytes, pos: 0 };

        let username = String::from_utf8(cursor.read_field()?.to_vec())
            .map_err(|_| DhtError::MalformedAnnouncement("username not UTF-8".into()))?;
        let fingerprint = String::from_utf8(cursor.read_field()?.to_vec())
            .map_err(|_| DhtError::MalformedAnnouncement("fingerprint not UTF-8".into()))?;
        let public_key = cursor.read_field()?.to_vec();

        let num_ports = cursor.read_u8()? as usize;
        if num_ports > MAX_PORT_CANDIDATES {
            return Err(DhtError::MalformedAnnouncement(format!(
                "too many port candidates: {num_ports}"
            )));
        }
        let mut port_candidates = Vec::with_capacity(num_ports);
        for _ in 0..num_ports {
            port_candidates.push(cursor.read_u16()?);
        }

        let timestamp_ms = cursor.read_i64()?;
        let signature = cursor.read_field()?.to_vec();

        if cursor.pos != bytes.len() {
            return Err(DhtError::MalformedAnnouncement(format!(
                "{} trailing bytes",
                bytes.len() - cursor.pos
            )));
        }

        Ok(Self {
            username,
            fingerprint,
            public_key,
            port_candidates,
            timestamp_ms,
            signature,
        })
    }

    /// Parse and verify in one step; the only constructor used for
    /// network-supplied bytes.
    pub fn from_verified_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let announcement = Self::from_bytes(bytes)?;
        if !announcement.verify() {
            return Err(DhtError::AnnouncementRejected);
        }
        Ok(announcement)
    }
}

/// Canonical signed bytes: raw field values, no length prefixes, no
/// signature.
fn signable_bytes(
    username: &str,
    fingerprint: &str,
    public_key: &[u8],
    ports: &[u16],
    timestamp_ms: i64,
) -> Vec<u8> {
    let mut buf =
        Vec::with_capacity(username.len() + fingerprint.len() + public_key.len() + ports.len() * 2 + 8);
    buf.extend_from_slice(username.as_bytes());
    buf.extend_from_slice(fingerprint.as_bytes());
    buf.extend_from_slice(public_key);
    for port in ports {
        buf.extend_from_slice(&port.to_be_bytes());
    }
    buf.extend_from_slice(&timestamp_ms.to_be_bytes());
    buf
}

fn write_field(buf: &mut Vec<u8>, field: &[u8]) {
    buf.extend_from_slice(&(field.len() as u16).to_be_bytes());
    buf.extend_from_slice(field);
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_u8(&mut self) -> Result<u8, DhtError> {
        let value = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| DhtError::MalformedAnnouncement("truncated".into()))?;
        self.pos += 1;
        Ok(value)
    }

    fn read_u16(&mut self) -> Result<u16, DhtError> {
        let end = self.pos + 2;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| DhtError::MalformedAnnouncement("truncated".into()))?;
        self.pos = end;
        Ok(u16::from_be_bytes([slice[0], slice[1]]))
    }

    fn read_i64(&mut self) -> Result<i64, DhtError> {
        let end = self.pos + 8;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| DhtError::MalformedAnnouncement("truncated".into()))?;
        self.pos = end;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(slice);
        Ok(i64::from_be_bytes(arr))
    }

    fn read_field(&mut self) -> Result<&'a [u8], DhtError> {
        let len = self.read_u16()? as usize;
        let end = self.pos + len;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| DhtError::MalformedAnnouncement("field length overruns buffer".into()))?;
        self.pos = end;
        Ok(slice)
    }
}
