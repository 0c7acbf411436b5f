//! Per-hop onion crypto
//!
//! Each hop owns forward and backward AES-256-GCM keys plus digest seeds,
//! all derived from the CREATE/CREATED shared secret with HKDF-SHA256.
//! Nonces come from monotonic per-direction counters; the transport (TCP)
//! guarantees the two ends count in step.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::{OnionError, Result};

/// Bytes one encryption layer adds (the GCM tag).
pub const LAYER_OVERHEAD: usize = 16;

/// Circuits never exceed three hops.
pub const MAX_CIRCUIT_HOPS: usize = 3;

const ONION_SALT: &[u8] = b"anonet-onion-v1";
const INFO_FORWARD_KEY: &[u8] = b"onion-forward-key";
const INFO_BACKWARD_KEY: &[u8] = b"onion-backward-key";
const INFO_FORWARD_DIGEST: &[u8] = b"onion-forward-digest";
const INFO_BACKWARD_DIGEST: &[u8] = b"onion-backward-digest";

/// Key schedule for one hop.
///
/// "Forward" is always the client-to-exit direction; the initiator
/// encrypts forward and decrypts backward, the responder the reverse.
pub struct HopCrypto {
    forward: Aes256Gcm,
    backward: Aes256Gcm,
    forward_digest: [u8; 32],
    backward_digest: [u8; 32],
    forward_counter: u64,
    backward_counter: u64,
    initiator: bool,
}

impl HopCrypto {
    pub fn new(shared_secret: &[u8], initiator: bool) -> Result<Self> {
        let hkdf = hkdf::Hkdf::<Sha256>::new(Some(ONION_SALT), shared_secret);

        let mut forward_key = Zeroizing::new([0u8; 32]);
        let mut backward_key = Zeroizing::new([0u8; 32]);
        let mut forward_digest = [0u8; 32];
        let mut backward_digest = [0u8; 32];

        hkdf.expand(INFO_FORWARD_KEY, forward_key.as_mut())
            .map_err(|_| OnionError::KeyAgreement)?;
        hkdf.expand(INFO_BACKWARD_KEY, backward_key.as_mut())
            .map_err(|_| OnionError::KeyAgreement)?;
        hkdf.expand(INFO_FORWARD_DIGEST, &mut forward_digest)
            .map_err(|_| OnionError::KeyAgreement)?;
        hkdf.expand(INFO_BACKWARD_DIGEST, &mut backward_digest)
            .map_err(|_| OnionError::KeyAgreement)?;

        Ok(Self {
            forward: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(forward_key.as_ref())),
            backward: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(backward_key.as_ref())),
            forward_digest,
            backward_digest,
            forward_counter: 0,
            backward_counter: 0,
            initiator,
        })
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Add one forward layer (client side).
    pub fn encrypt_forward(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let nonce = counter_nonce(self.forward_counter);
        let out = self
            .forward
            .encrypt(Nonce::from_slice(&nonce), data)
            .map_err(|_| OnionError::LayerFailure)?;
        self.forward_counter += 1;
        Ok(out)
    }

    /// Peel one forward layer (relay side).
    pub fn decrypt_forward(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let nonce = counter_nonce(self.forward_counter);
        let out = self
            .forward
            .decrypt(Nonce::from_slice(&nonce), data)
            .map_err(|_| OnionError::LayerFailure)?;
        self.forward_counter += 1;
        Ok(out)
    }

    /// Add one backward layer (relay side).
    pub fn encrypt_backward(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let nonce = counter_nonce(self.backward_counter);
        let out = self
            .backward
            .encrypt(Nonce::from_slice(&nonce), data)
            .map_err(|_| OnionError::LayerFailure)?;
        self.backward_counter += 1;
        Ok(out)
    }

    /// Peel one backward layer (client side).
    pub fn decrypt_backward(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let nonce = counter_nonce(self.backward_counter);
        let out = self
            .backward
            .decrypt(Nonce::from_slice(&nonce), data)
            .map_err(|_| OnionError::LayerFailure)?;
        self.backward_counter += 1;
        Ok(out)
    }

    /// First four digest bytes over `bytes`, keyed for the forward
    /// direction.
    pub fn forward_digest32(&self, bytes: &[u8]) -> u32 {
        keyed_digest32(&self.forward_digest, bytes)
    }

    pub fn backward_digest32(&self, bytes: &[u8]) -> u32 {
        keyed_digest32(&self.backward_digest, bytes)
    }
}

fn keyed_digest32(seed: &[u8; 32], bytes: &[u8]) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(bytes);
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// 12-byte nonce: four zero bytes then the big-endian counter.
fn counter_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (HopCrypto, HopCrypto) {
        let secret = [0x42u8; 32];
        (
            HopCrypto::new(&secret, true).unwrap(),
            HopCrypto::new(&secret, false).unwrap(),
        )
    }

    #[test]
    fn test_forward_roundtrip() {
        let (mut client, mut relay) = pair();

        let layered = client.encrypt_forward(b"payload").unwrap();
        assert_eq!(layered.len(), 7 + LAYER_OVERHEAD);
        assert_eq!(relay.decrypt_forward(&layered).unwrap(), b"payload");
    }

    #[test]
    fn test_backward_roundtrip() {
        let (mut client, mut relay) = pair();

        let layered = relay.encrypt_backward(b"reply").unwrap();
        assert_eq!(client.decrypt_backward(&layered).unwrap(), b"reply");
    }

    #[test]
    fn test_counters_stay_in_step() {
        let (mut client, mut relay) = pair();

        for i in 0..10u8 {
            let layered = client.encrypt_forward(&[i]).unwrap();
            assert_eq!(relay.decrypt_forward(&layered).unwrap(), vec![i]);
        }
    }

    #[test]
    fn test_skipped_counter_fails() {
        let (mut client, mut relay) = pair();

        let _dropped = client.encrypt_forward(b"first").unwrap();
        let second = client.encrypt_forward(b"second").unwrap();

        // Relay still expects counter 0
        assert!(relay.decrypt_forward(&second).is_err());
    }

    #[test]
    fn test_directions_use_distinct_keys() {
        let (mut client, mut relay) = pair();

        let forward = client.encrypt_forward(b"x").unwrap();
        // Decrypting forward traffic with the backward schedule fails
        assert!(client.decrypt_backward(&forward).is_err());

        let backward = relay.encrypt_backward(b"x").unwrap();
        assert!(relay.decrypt_forward(&backward).is_err());
    }

    #[test]
    fn test_tampered_layer_fails() {
        let (mut client, mut relay) = pair();

        let mut layered = client.encrypt_forward(b"payload").unwrap();
        layered[0] ^= 1;
        assert!(relay.decrypt_forward(&layered).is_err());
    }

    #[test]
    fn test_different_secrets_differ() {
        let mut a = HopCrypto::new(&[1u8; 32], true).unwrap();
        let mut b = HopCrypto::new(&[2u8; 32], false).unwrap();

        let layered = a.encrypt_forward(b"data").unwrap();
        assert!(b.decrypt_forward(&layered).is_err());
    }

    #[test]
    fn test_digest_is_keyed_and_deterministic() {
        let (client, relay) = pair();

        assert_eq!(client.forward_digest32(b"abc"), relay.forward_digest32(b"abc"));
        assert_ne!(client.forward_digest32(b"abc"), client.forward_digest32(b"abd"));
        assert_ne!(
            client.forward_digest32(b"abc"),
            client.backward_digest32(b"abc")
        );
    }

    #[test]
    fn test_three_nested_layers() {
        // Client wraps through three hop schedules; each relay peels one.
        let secrets = [[1u8; 32], [2u8; 32], [3u8; 32]];
        let mut client: Vec<HopCrypto> = secrets
            .iter()
            .map(|s| HopCrypto::new(s, true).unwrap())
            .collect();
        let mut relays: Vec<HopCrypto> = secrets
            .iter()
            .map(|s| HopCrypto::new(s, false).unwrap())
            .collect();

        let payload = b"onion payload".to_vec();
        let mut blob = payload.clone();
        for hop in client.iter_mut().rev() {
            blob = hop.encrypt_forward(&blob).unwrap();
        }
        assert_eq!(blob.len(), payload.len() + 3 * LAYER_OVERHEAD);

        // Peel in path order; omitting any hop leaves the payload sealed
        for (i, relay) in relays.iter_mut().enumerate() {
            blob = relay.decrypt_forward(&blob).unwrap();
            if i < 2 {
                assert_ne!(blob, payload);
            }
        }
        assert_eq!(blob, payload);
    }

    #[test]
    fn test_omitting_a_hop_leaves_payload_sealed() {
        let secrets = [[1u8; 32], [2u8; 32], [3u8; 32]];
        let mut client: Vec<HopCrypto> = secrets
            .iter()
            .map(|s| HopCrypto::new(s, true).unwrap())
            .collect();

        let mut blob = b"secret".to_vec();
        for hop in client.iter_mut().rev() {
            blob = hop.encrypt_forward(&blob).unwrap();
        }

        // Skip the first relay and try the second directly
        let mut middle = HopCrypto::new(&secrets[1], false).unwrap();
        assert!(middle.decrypt_forward(&blob).is_err());
    }
}
