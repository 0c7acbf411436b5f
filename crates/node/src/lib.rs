//! anonet node
//!
//! The facade that wires the identity, DHT, relay server and circuit
//! builder into one running node, and exposes the operations collaborators
//! consume: lookup, announce, circuit open, secure channel handshake.

mod node;

pub use node::{AnonetNode, NodeHandle};
