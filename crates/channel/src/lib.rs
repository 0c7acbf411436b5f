//! anonet secure channel
//!
//! Pairwise authenticated, forward-secret channel: a symmetric
//! signed-ephemeral ECDH handshake derives AES-256-GCM session keys; each
//! direction runs a sequence-numbered nonce schedule. Long-term identity
//! keys sign the ephemerals but never enter the key agreement.

mod channel;
mod handshake;

pub use channel::SecureChannel;
pub use handshake::handshake;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Peer signature invalid")]
    InvalidSignature,

    #[error("Peer fingerprint mismatch")]
    FingerprintMismatch,

    #[error("Key agreement failed")]
    KeyAgreement,

    #[error("Message failed integrity check")]
    Integrity,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
