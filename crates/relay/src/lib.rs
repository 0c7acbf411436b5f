//! anonet relay
//!
//! TCP server terminating one hop of an onion circuit: authenticates
//! peers with a nonce signature, rate-limits by source IP, peels one
//! forward layer per RELAY cell and forwards or terminates it. A relay
//! knows its predecessor and at most its successor, never the full path.

mod limiter;
mod server;

pub use limiter::{RateLimiter, RateLimiterConfig};
pub use server::{InboundStreamEvent, RelayConfig, RelayServer};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Bind failed: {0}")]
    BindFailed(std::io::Error),

    #[error("Peer failed authentication")]
    Unauthenticated,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Onion error: {0}")]
    Onion(#[from] anonet_onion::OnionError),

    #[error("Timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
