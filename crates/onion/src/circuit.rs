//! Client-side circuit state

use std::net::SocketAddrV4;

use rand::RngCore;

use crate::crypto::HopCrypto;
use crate::Result;

/// Circuit lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Building,
    Extending,
    Ready,
    Destroyed,
    Failed,
}

/// One established hop: where it is, what it proved, and its key
/// schedule.
pub struct CircuitHop {
    pub addr: SocketAddrV4,
    pub peer_ephemeral_der: Vec<u8>,
    pub crypto: HopCrypto,
    pub peer_fingerprint: Option<String>,
}

/// An onion circuit under construction or in use.
///
/// Layer order: outbound blobs are encrypted innermost-hop first, so the
/// guard peels the outermost layer; inbound blobs are peeled guard first.
pub struct OnionCircuit {
    circuit_id: u32,
    hops: Vec<CircuitHop>,
    state: CircuitState,
    next_stream_id: u16,
}

impl OnionCircuit {
    pub fn new() -> Self {
        Self {
            circuit_id: random_circuit_id(),
            hops: Vec::new(),
            state: CircuitState::Building,
            next_stream_id: 1,
        }
    }

    pub fn circuit_id(&self) -> u32 {
        self.circuit_id
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn set_state(&mut self, state: CircuitState) {
        self.state = state;
    }

    pub fn hops(&self) -> &[CircuitHop] {
        &self.hops
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    pub fn push_hop(&mut self, hop: CircuitHop) {
        self.hops.push(hop);
    }

    /// Monotonic stream ids, starting at 1.
    pub fn allocate_stream_id(&mut self) -> u16 {
        let id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.wrapping_add(1).max(1);
        id
    }

    /// Wrap an outbound blob in every hop's forward layer.
    pub fn encrypt_outbound(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut blob = plaintext.to_vec();
        for hop in self.hops.iter_mut().rev() {
            blob = hop.crypto.encrypt_forward(&blob)?;
        }
        Ok(blob)
    }

    /// Peel every hop's backward layer from an inbound blob.
    pub fn decrypt_inbound(&mut self, blob: &[u8]) -> Result<Vec<u8>> {
        let mut blob = blob.to_vec();
        for hop in self.hops.iter_mut() {
            blob = hop.crypto.decrypt_backward(&blob)?;
        }
        Ok(blob)
    }

    /// The current last hop, which parses terminal relay cells.
    pub fn tail_mut(&mut self) -> Option<&mut CircuitHop> {
        self.hops.last_mut()
    }
}

impl Default for OnionCircuit {
    fn default() -> Self {
        Self::new()
    }
}

/// Random 31-bit non-zero circuit id.
fn random_circuit_id() -> u32 {
    loop {
        let id = rand::rngs::OsRng.next_u32() & 0x7FFF_FFFF;
        if id != 0 {
            return id;
        }
    }
}
