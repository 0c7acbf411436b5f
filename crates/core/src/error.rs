use thiserror::Error;

/// Cross-subsystem error taxonomy.
///
/// Subsystem crates define their own narrower errors; this enum is what the
/// node facade and the binary surface to callers.
#[derive(Error, Debug)]
pub enum AnonetError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("AEAD authentication failed")]
    AeadFailure,

    #[error("Key agreement failed")]
    KeyAgreementFailed,

    #[error("Timeout")]
    Timeout,

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Peer failed authentication")]
    Unauthenticated,

    #[error("Rate limited")]
    RateLimited,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Circuit build failed: {0}")]
    CircuitBuildFailed(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AnonetError>;
