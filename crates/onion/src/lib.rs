//! anonet onion routing
//!
//! Fixed-size cells over TCP, per-hop AES-GCM layers derived with HKDF,
//! and the client-side circuit builder that extends hop by hop with nested
//! RELAY_EXTEND cells. Three hops by default; no relay sees more than its
//! neighbors.

mod builder;
mod cell;
mod circuit;
mod crypto;

pub use builder::{CircuitBuilder, ClientCircuit, RelayDirectory, RelayInfo};
pub use cell::{
    decode_key_payload, encode_key_payload, frame_blob, read_cell, unframe_blob, write_cell,
    Cell, CellCommand, ExtendPayload, RelayCell, RelayCommand, CELL_PAYLOAD_SIZE, CELL_SIZE,
    MAX_RELAY_DATA, RELAY_INNER_SIZE,
};
pub use circuit::{CircuitHop, CircuitState, OnionCircuit};
pub use crypto::{HopCrypto, LAYER_OVERHEAD, MAX_CIRCUIT_HOPS};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OnionError {
    #[error("Malformed cell: {0}")]
    MalformedCell(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Circuit build failed: {0}")]
    BuildFailed(String),

    #[error("AEAD layer failed")]
    LayerFailure,

    #[error("Key agreement failed")]
    KeyAgreement,

    #[error("Relay digest mismatch")]
    DigestMismatch,

    #[error("No relays available: need {needed}, know {known}")]
    NotEnoughRelays { needed: usize, known: usize },

    #[error("Timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OnionError>;
