//! AEAD framing over an established channel
//!
//! Each direction counts its own sequence; the nonce is the shared base
//! XORed with the big-endian sequence in the low eight bytes. On the wire
//! every message is `u32 length || ciphertext+tag || u64 sequence`.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ChannelError, Result};

/// Upper bound on one encrypted frame (tag included).
const MAX_FRAME_LEN: usize = 1024 * 1024;

const TAG_LEN: usize = 16;

/// An established secure channel.
///
/// Sequences are strictly monotonic per direction. Any tampering with the
/// ciphertext, tag or sequence fails the AEAD check; use after [`close`]
/// fails with [`ChannelError::ChannelClosed`].
///
/// [`close`]: SecureChannel::close
pub struct SecureChannel {
    cipher: Aes256Gcm,
    key: [u8; 32],
    nonce_base: [u8; 12],
    send_seq: u64,
    recv_seq: u64,
    closed: bool,
    peer_fingerprint: String,
}

impl SecureChannel {
    pub(crate) fn new(key: [u8; 32], nonce_base: [u8; 12], peer_fingerprint: String) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Self {
            cipher,
            key,
            nonce_base,
            send_seq: 0,
            recv_seq: 0,
            closed: false,
            peer_fingerprint,
        }
    }

    /// Fingerprint of the authenticated peer.
    pub fn peer_fingerprint(&self) -> &str {
        &self.peer_fingerprint
    }

    pub fn send_sequence(&self) -> u64 {
        self.send_seq
    }

    pub fn recv_sequence(&self) -> u64 {
        self.recv_seq
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Encrypt one message into its wire frame, advancing the send
    /// sequence.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if self.closed {
            return Err(ChannelError::ChannelClosed);
        }
        if plaintext.len() + TAG_LEN > MAX_FRAME_LEN {
            return Err(ChannelError::FrameTooLarge(plaintext.len()));
        }

        let seq = self.send_seq;
        let nonce_bytes = self.nonce_for(seq);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .map_err(|_| ChannelError::Integrity)?;
        self.send_seq += 1;

        let mut frame = Vec::with_capacity(4 + ciphertext.len() + 8);
        frame.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
        frame.extend_from_slice(&ciphertext);
        frame.extend_from_slice(&seq.to_be_bytes());
        Ok(frame)
    }

    /// Decrypt one wire frame, advancing the receive sequence.
    ///
    /// The frame's sequence must equal the local receive counter; any
    /// reuse, reorder or tamper is an integrity failure.
    pub fn decrypt(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        if self.closed {
            return Err(ChannelError::ChannelClosed);
        }
        if frame.len() < 4 + TAG_LEN + 8 {
            return Err(ChannelError::Integrity);
        }

        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if len > MAX_FRAME_LEN || frame.len() != 4 + len + 8 {
            return Err(ChannelError::Integrity);
        }
        let ciphertext = &frame[4..4 + len];
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&frame[4 + len..]);
        let seq = u64::from_be_bytes(seq_bytes);

        if seq != self.recv_seq {
            return Err(ChannelError::Integrity);
        }

        let nonce_bytes = self.nonce_for(seq);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: &[],
                },
            )
            .map_err(|_| ChannelError::Integrity)?;
        self.recv_seq += 1;
        Ok(plaintext)
    }

    /// Encrypt and write one message to `stream`.
    pub async fn send<S: AsyncWrite + Unpin>(
        &mut self,
        stream: &mut S,
        plaintext: &[u8],
    ) -> Result<()> {
        let frame = self.encrypt(plaintext)?;
        stream.write_all(&frame).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read and decrypt one message from `stream`.
    pub async fn recv<S: AsyncRead + Unpin>(&mut self, stream: &mut S) -> Result<Vec<u8>> {
        if self.closed {
            return Err(ChannelError::ChannelClosed);
        }

        let mut len_bytes = [0u8; 4];
        stream.read_exact(&mut len_bytes).await?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len < TAG_LEN || len > MAX_FRAME_LEN {
            return Err(ChannelError::Integrity);
        }

        let mut rest = vec![0u8; len + 8];
        stream.read_exact(&mut rest).await?;

        let mut frame = Vec::with_capacity(4 + len + 8);
        frame.extend_from_slice(&len_bytes);
        frame.extend_from_slice(&rest);
        self.decrypt(&frame)
    }

    /// Close the channel; all later operations fail.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// nonce = base XOR big-endian sequence in the low 8 bytes
    fn nonce_for(&self, seq: u64) -> [u8; 12] {
        let mut nonce = self.nonce_base;
        for (i, byte) in seq.to_be_bytes().iter().enumerate() {
            nonce[4 + i] ^= byte;
        }
        nonce
    }

    #[cfg(test)]
    pub(crate) fn session_key(&self) -> &[u8; 32] {
        &self.key
    }

    #[cfg(test)]
    pub(crate) fn nonce_base(&self) -> &[u8; 12] {
        &self.nonce_base
    }
}

impl Drop for SecureChannel {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.key.zeroize();
        self.nonce_base.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SecureChannel, SecureChannel) {
        let key = [7u8; 32];
        let base = [3u8; 12];
        (
            SecureChannel::new(key, base, "peer-b".into()),
            SecureChannel::new(key, base, "peer-a".into()),
        )
    }

    #[test]
    fn test_roundtrip() {
        let (mut tx, mut rx) = pair();

        let frame = tx.encrypt(b"hello").unwrap();
        let plaintext = rx.decrypt(&frame).unwrap();

        assert_eq!(plaintext, b"hello");
        assert_eq!(tx.send_sequence(), 1);
        assert_eq!(rx.recv_sequence(), 1);
    }

    #[test]
    fn test_sequences_advance_once_per_message() {
        let (mut tx, mut rx) = pair();

        for i in 0..5u8 {
            let frame = tx.encrypt(&[i]).unwrap();
            assert_eq!(rx.decrypt(&frame).unwrap(), vec![i]);
        }
        assert_eq!(tx.send_sequence(), 5);
        assert_eq!(rx.recv_sequence(), 5);
    }

    #[test]
    fn test_empty_message_roundtrip() {
        let (mut tx, mut rx) = pair();
        let frame = tx.encrypt(b"").unwrap();
        assert_eq!(rx.decrypt(&frame).unwrap(), Vec::<u8>::new());
    }

    // ==================== TAMPER TESTS ====================

    #[test]
    fn test_ciphertext_tamper_detected() {
        let (mut tx, mut rx) = pair();
        let mut frame = tx.encrypt(b"payload").unwrap();
        frame[5] ^= 0x01;
        assert!(matches!(rx.decrypt(&frame), Err(ChannelError::Integrity)));
    }

    #[test]
    fn test_tag_tamper_detected() {
        let (mut tx, mut rx) = pair();
        let mut frame = tx.encrypt(b"payload").unwrap();
        let tag_byte = frame.len() - 9;
        frame[tag_byte] ^= 0x80;
        assert!(matches!(rx.decrypt(&frame), Err(ChannelError::Integrity)));
    }

    #[test]
    fn test_sequence_tamper_detected() {
        let (mut tx, mut rx) = pair();
        let mut frame = tx.encrypt(b"payload").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(matches!(rx.decrypt(&frame), Err(ChannelError::Integrity)));
    }

    #[test]
    fn test_replay_detected() {
        let (mut tx, mut rx) = pair();
        let frame = tx.encrypt(b"once").unwrap();
        rx.decrypt(&frame).unwrap();
        assert!(matches!(rx.decrypt(&frame), Err(ChannelError::Integrity)));
    }

    #[test]
    fn test_reorder_detected() {
        let (mut tx, mut rx) = pair();
        let first = tx.encrypt(b"first").unwrap();
        let second = tx.encrypt(b"second").unwrap();

        assert!(matches!(rx.decrypt(&second), Err(ChannelError::Integrity)));
        // The in-order frame still decrypts
        assert_eq!(rx.decrypt(&first).unwrap(), b"first");
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let (mut tx, mut rx) = pair();
        let frame = tx.encrypt(b"payload").unwrap();
        assert!(matches!(
            rx.decrypt(&frame[..frame.len() - 1]),
            Err(ChannelError::Integrity)
        ));
        assert!(matches!(rx.decrypt(&[]), Err(ChannelError::Integrity)));
    }

    #[test]
    fn test_use_after_close_fails() {
        let (mut tx, mut rx) = pair();
        let frame = tx.encrypt(b"x").unwrap();

        tx.close();
        rx.close();
        assert!(matches!(tx.encrypt(b"y"), Err(ChannelError::ChannelClosed)));
        assert!(matches!(rx.decrypt(&frame), Err(ChannelError::ChannelClosed)));
    }

    #[test]
    fn test_oversized_plaintext_rejected() {
        let (mut tx, _) = pair();
        let big = vec![0u8; MAX_FRAME_LEN];
        assert!(matches!(
            tx.encrypt(&big),
            Err(ChannelError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_send_recv_over_duplex() {
        let (mut left, mut right) = tokio::io::duplex(4096);
        let (mut tx, mut rx) = pair();

        tx.send(&mut left, b"over the wire").await.unwrap();
        let received = rx.recv(&mut right).await.unwrap();
        assert_eq!(received, b"over the wire");
    }

    #[test]
    fn test_different_keys_cannot_decrypt() {
        let mut tx = SecureChannel::new([1u8; 32], [0u8; 12], "x".into());
        let mut rx = SecureChannel::new([2u8; 32], [0u8; 12], "y".into());

        let frame = tx.encrypt(b"secret").unwrap();
        assert!(matches!(rx.decrypt(&frame), Err(ChannelError::Integrity)));
    }
}
