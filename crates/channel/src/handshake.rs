//! Signed-ephemeral ECDH handshake
//!
//! Both sides send `{ephemeral_pub_DER, signature, identity_pub_DER}`
//! with 16-bit length prefixes, verify the peer's signature over its
//! ephemeral key, run ECDH on the ephemerals and derive identical session
//! keys. Ephemeral secrets die with this function.

use p256::ecdh::EphemeralSecret;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use p256::PublicKey;
use rand::rngs::OsRng;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use zeroize::Zeroizing;

use anonet_identity::{fingerprint_of_der, verify_signature, Identity};

use crate::channel::SecureChannel;
use crate::{ChannelError, Result};

const HKDF_INFO: &[u8] = b"anonet-secure-channel";

/// Largest acceptable handshake field (keys and signatures are all under
/// 200 bytes).
const MAX_FIELD_LEN: usize = 1024;

/// Run the handshake over `stream`.
///
/// `expected_fingerprint` pins the peer when the caller already knows who
/// it is talking to; `None` accepts any authenticated peer. Returns the
/// established channel; the peer's fingerprint is available on it.
pub async fn handshake<S>(
    stream: &mut S,
    identity: &Identity,
    expected_fingerprint: Option<&str>,
) -> Result<SecureChannel>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ephemeral_pub_der = ephemeral
        .public_key()
        .to_public_key_der()
        .map_err(|e| ChannelError::HandshakeFailed(e.to_string()))?
        .into_vec();
    let signature = identity.sign(&ephemeral_pub_der);
    let identity_pub_der = identity.public_key_der();

    // Send ours, then read theirs; both sides write first so neither
    // blocks on a silent peer.
    write_field(stream, &ephemeral_pub_der).await?;
    write_field(stream, &signature).await?;
    write_field(stream, &identity_pub_der).await?;
    stream.flush().await?;

    let peer_ephemeral_der = read_field(stream).await?;
    let peer_signature = read_field(stream).await?;
    let peer_identity_der = read_field(stream).await?;

    if !verify_signature(&peer_identity_der, &peer_ephemeral_der, &peer_signature) {
        return Err(ChannelError::InvalidSignature);
    }

    let peer_fingerprint = fingerprint_of_der(&peer_identity_der);
    if let Some(expected) = expected_fingerprint {
        if peer_fingerprint != expected {
            return Err(ChannelError::FingerprintMismatch);
        }
    }

    let peer_ephemeral = PublicKey::from_public_key_der(&peer_ephemeral_der)
        .map_err(|_| ChannelError::KeyAgreement)?;
    let shared = ephemeral.diffie_hellman(&peer_ephemeral);

    // 32-byte AEAD key plus 12-byte nonce base; both sides derive the
    // same values from the same shared secret.
    let hkdf = hkdf::Hkdf::<Sha256>::new(None, shared.raw_secret_bytes().as_slice());
    let mut okm = Zeroizing::new([0u8; 44]);
    hkdf.expand(HKDF_INFO, okm.as_mut())
        .map_err(|_| ChannelError::KeyAgreement)?;

    let mut key = [0u8; 32];
    let mut nonce_base = [0u8; 12];
    key.copy_from_slice(&okm[..32]);
    nonce_base.copy_from_slice(&okm[32..]);

    debug!(peer = %&peer_fingerprint[..8], "secure channel established");
    Ok(SecureChannel::new(key, nonce_base, peer_fingerprint))
}

async fn write_field<S: AsyncWrite + Unpin>(stream: &mut S, field: &[u8]) -> Result<()> {
    stream.write_all(&(field.len() as u16).to_be_bytes()).await?;
    stream.write_all(field).await?;
    Ok(())
}

async fn read_field<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 2];
    stream.read_exact(&mut len_bytes).await?;
    let len = u16::from_be_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_FIELD_LEN {
        return Err(ChannelError::HandshakeFailed(format!(
            "field length {len} out of range"
        )));
    }
    let mut field = vec![0u8; len];
    stream.read_exact(&mut field).await?;
    Ok(field)
}
