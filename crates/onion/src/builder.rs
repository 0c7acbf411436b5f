//! Circuit construction
//!
//! The builder picks random relays without replacement, authenticates to
//! the guard with a nonce signature, establishes the guard hop with
//! CREATE/CREATED, then extends hop by hop: each RELAY_EXTEND is wrapped
//! in every existing hop's forward layer, and the returning
//! RELAY_EXTENDED carries the new hop's ephemeral key back through the
//! same layers.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use p256::ecdh::EphemeralSecret;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use p256::PublicKey;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use anonet_core::{CoreEvent, EventBus};
use anonet_identity::Identity;

use crate::cell::{
    decode_key_payload, encode_key_payload, frame_blob, read_cell, unframe_blob, write_cell,
    Cell, CellCommand, ExtendPayload, RelayCell, RelayCommand,
};
use crate::circuit::{CircuitHop, CircuitState, OnionCircuit};
use crate::crypto::{HopCrypto, MAX_CIRCUIT_HOPS};
use crate::{OnionError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CELL_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect failures before a relay is dropped from the directory.
const MAX_CONNECT_FAILURES: u32 = 3;

/// A relay the builder may route through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayInfo {
    pub addr: SocketAddrV4,
    /// Known identity, when the relay was learned from an announcement.
    pub fingerprint: Option<String>,
}

struct DirectoryEntry {
    relay: RelayInfo,
    connect_failures: u32,
}

/// The known-relay set: seeded from DHT announcements plus direct adds.
#[derive(Default)]
pub struct RelayDirectory {
    entries: Mutex<Vec<DirectoryEntry>>,
}

impl RelayDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a relay; duplicates by address refresh the fingerprint.
    pub fn add(&self, relay: RelayInfo) {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.iter_mut().find(|e| e.relay.addr == relay.addr) {
            if relay.fingerprint.is_some() {
                existing.relay.fingerprint = relay.fingerprint;
            }
            return;
        }
        entries.push(DirectoryEntry {
            relay,
            connect_failures: 0,
        });
    }

    pub fn remove(&self, addr: &SocketAddrV4) {
        self.entries.lock().retain(|e| e.relay.addr != *addr);
    }

    /// Count a connect failure; the third removes the relay.
    pub fn record_failure(&self, addr: &SocketAddrV4) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.relay.addr == *addr) {
            entry.connect_failures += 1;
            if entry.connect_failures >= MAX_CONNECT_FAILURES {
                warn!(%addr, "relay dropped after repeated connect failures");
                entries.retain(|e| e.relay.addr != *addr);
            }
        }
    }

    pub fn record_success(&self, addr: &SocketAddrV4) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.relay.addr == *addr) {
            entry.connect_failures = 0;
        }
    }

    /// Random path of `count` distinct relays.
    pub fn sample(&self, count: usize) -> Result<Vec<RelayInfo>> {
        let entries = self.entries.lock();
        if entries.len() < count {
            return Err(OnionError::NotEnoughRelays {
                needed: count,
                known: entries.len(),
            });
        }
        let mut relays: Vec<RelayInfo> = entries.iter().map(|e| e.relay.clone()).collect();
        drop(entries);

        relays.shuffle(&mut OsRng);
        relays.truncate(count);
        Ok(relays)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn all(&self) -> Vec<RelayInfo> {
        self.entries.lock().iter().map(|e| e.relay.clone()).collect()
    }
}

/// Builds onion circuits from the relay directory.
pub struct CircuitBuilder {
    identity: Arc<Identity>,
    directory: Arc<RelayDirectory>,
    events: EventBus,
}

impl CircuitBuilder {
    pub fn new(identity: Arc<Identity>, directory: Arc<RelayDirectory>, events: EventBus) -> Self {
        Self {
            identity,
            directory,
            events,
        }
    }

    pub fn directory(&self) -> &RelayDirectory {
        &self.directory
    }

    /// Build a circuit of `hops` relays (1 to 3).
    pub async fn build(&self, hops: usize) -> Result<ClientCircuit> {
        if hops == 0 || hops > MAX_CIRCUIT_HOPS {
            return Err(OnionError::BuildFailed(format!(
                "hop count {hops} outside 1..={MAX_CIRCUIT_HOPS}"
            )));
        }

        let path = self.directory.sample(hops)?;
        match self.try_build(&path).await {
            Ok(client) => {
                self.events.emit(CoreEvent::CircuitReady {
                    circuit_id: client.circuit_id(),
                    hops: client.hop_count(),
                });
                Ok(client)
            }
            Err(e) => {
                self.events.emit(CoreEvent::CircuitFailed {
                    circuit_id: 0,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn try_build(&self, path: &[RelayInfo]) -> Result<ClientCircuit> {
        let guard = &path[0];
        let mut stream = match connect(guard.addr).await {
            Ok(stream) => {
                self.directory.record_success(&guard.addr);
                stream
            }
            Err(e) => {
                self.directory.record_failure(&guard.addr);
                return Err(e);
            }
        };

        authenticate(&mut stream, &self.identity).await?;

        let mut circuit = OnionCircuit::new();
        let circuit_id = circuit.circuit_id();
        debug!(circuit_id, guard = %guard.addr, "building circuit");

        if let Err(e) = self.establish(&mut stream, &mut circuit, path).await {
            circuit.set_state(CircuitState::Failed);
            // Best effort: tell the guard to drop the partial circuit.
            let destroy = Cell::new(circuit_id, CellCommand::Destroy, Vec::new());
            let _ = write_cell(&mut stream, &destroy).await;
            return Err(e);
        }

        circuit.set_state(CircuitState::Ready);
        Ok(ClientCircuit {
            circuit,
            stream,
            events: self.events.clone(),
        })
    }

    async fn establish(
        &self,
        stream: &mut TcpStream,
        circuit: &mut OnionCircuit,
        path: &[RelayInfo],
    ) -> Result<()> {
        let guard = &path[0];

        // Guard hop: CREATE straight over the link
        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let create = Cell::new(
            circuit.circuit_id(),
            CellCommand::Create,
            encode_key_payload(&ephemeral_der(&ephemeral)?)?,
        );
        write_cell(stream, &create).await?;

        let created = read_cell_timed(stream).await?;
        let peer_der = match created.command {
            CellCommand::Created => decode_key_payload(&created.payload)?,
            CellCommand::Destroy => {
                return Err(OnionError::BuildFailed("guard refused circuit".into()))
            }
            other => {
                return Err(OnionError::ProtocolViolation(format!(
                    "expected CREATED, got {other:?}"
                )))
            }
        };
        circuit.push_hop(CircuitHop {
            addr: guard.addr,
            crypto: derive_hop(ephemeral, &peer_der, true)?,
            peer_ephemeral_der: peer_der,
            peer_fingerprint: guard.fingerprint.clone(),
        });

        // Each further hop rides inside the existing layers
        for relay in &path[1..] {
            circuit.set_state(CircuitState::Extending);
            self.extend(stream, circuit, relay).await?;
        }
        Ok(())
    }

    async fn extend(
        &self,
        stream: &mut TcpStream,
        circuit: &mut OnionCircuit,
        relay: &RelayInfo,
    ) -> Result<()> {
        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let extend = ExtendPayload {
            addr: relay.addr,
            ephemeral_der: ephemeral_der(&ephemeral)?,
        };

        let mut relay_cell = RelayCell::new(RelayCommand::Extend, 0, extend.encode());
        seal_forward(circuit, &mut relay_cell)?;

        let blob = circuit.encrypt_outbound(&relay_cell.encode()?)?;
        let cell = Cell::new(
            circuit.circuit_id(),
            CellCommand::Relay,
            frame_blob(&blob)?,
        );
        write_cell(stream, &cell).await?;

        let reply = read_cell_timed(stream).await?;
        match reply.command {
            CellCommand::Relay => {}
            CellCommand::Destroy => {
                return Err(OnionError::BuildFailed(format!(
                    "path refused extension to {}",
                    relay.addr
                )))
            }
            other => {
                return Err(OnionError::ProtocolViolation(format!(
                    "expected RELAY_EXTENDED, got {other:?}"
                )))
            }
        }

        let blob = unframe_blob(&reply.payload)?;
        let plaintext = circuit.decrypt_inbound(&blob)?;
        let extended = RelayCell::decode(&plaintext)?;
        if extended.command != RelayCommand::Extended {
            return Err(OnionError::ProtocolViolation(format!(
                "expected RELAY_EXTENDED, got {:?}",
                extended.command
            )));
        }
        verify_backward(circuit, &extended)?;

        debug!(circuit_id = circuit.circuit_id(), hop = %relay.addr, "extended");
        circuit.push_hop(CircuitHop {
            addr: relay.addr,
            crypto: derive_hop(ephemeral, &extended.data, true)?,
            peer_ephemeral_der: extended.data.clone(),
            peer_fingerprint: relay.fingerprint.clone(),
        });
        Ok(())
    }
}

/// A built circuit plus its guard link.
pub struct ClientCircuit {
    circuit: OnionCircuit,
    stream: TcpStream,
    events: EventBus,
}

impl ClientCircuit {
    pub fn circuit_id(&self) -> u32 {
        self.circuit.circuit_id()
    }

    pub fn state(&self) -> CircuitState {
        self.circuit.state()
    }

    pub fn hop_count(&self) -> usize {
        self.circuit.hop_count()
    }

    pub fn hops(&self) -> &[CircuitHop] {
        self.circuit.hops()
    }

    /// Open a stream to the circuit's terminal hop.
    pub async fn open_stream(&mut self) -> Result<u16> {
        let stream_id = self.circuit.allocate_stream_id();
        self.send_relay(RelayCommand::Begin, stream_id, Vec::new())
            .await?;

        let reply = self.recv_relay().await?;
        if reply.command != RelayCommand::Connected || reply.stream_id != stream_id {
            return Err(OnionError::ProtocolViolation(format!(
                "expected RELAY_CONNECTED on stream {stream_id}, got {:?} on {}",
                reply.command, reply.stream_id
            )));
        }
        Ok(stream_id)
    }

    /// Send one data cell on an open stream.
    pub async fn send_data(&mut self, stream_id: u16, data: &[u8]) -> Result<()> {
        self.send_relay(RelayCommand::Data, stream_id, data.to_vec())
            .await
    }

    /// Receive the next data cell; RELAY_END closes the stream.
    pub async fn recv_data(&mut self) -> Result<(u16, Vec<u8>)> {
        loop {
            let cell = self.recv_relay().await?;
            match cell.command {
                RelayCommand::Data => return Ok((cell.stream_id, cell.data)),
                RelayCommand::End => {
                    return Err(OnionError::ProtocolViolation(format!(
                        "stream {} ended by peer",
                        cell.stream_id
                    )))
                }
                RelayCommand::Drop => continue,
                other => {
                    return Err(OnionError::ProtocolViolation(format!(
                        "unexpected relay command {other:?}"
                    )))
                }
            }
        }
    }

    /// Close a stream.
    pub async fn end_stream(&mut self, stream_id: u16) -> Result<()> {
        self.send_relay(RelayCommand::End, stream_id, Vec::new())
            .await
    }

    /// Tear the circuit down.
    pub async fn destroy(mut self) -> Result<()> {
        let destroy = Cell::new(self.circuit_id(), CellCommand::Destroy, Vec::new());
        write_cell(&mut self.stream, &destroy).await?;
        self.circuit.set_state(CircuitState::Destroyed);
        self.events.emit(CoreEvent::CircuitDestroyed {
            circuit_id: self.circuit_id(),
        });
        Ok(())
    }

    async fn send_relay(
        &mut self,
        command: RelayCommand,
        stream_id: u16,
        data: Vec<u8>,
    ) -> Result<()> {
        let mut relay_cell = RelayCell::new(command, stream_id, data);
        seal_forward(&mut self.circuit, &mut relay_cell)?;

        let blob = self.circuit.encrypt_outbound(&relay_cell.encode()?)?;
        let cell = Cell::new(
            self.circuit.circuit_id(),
            CellCommand::Relay,
            frame_blob(&blob)?,
        );
        write_cell(&mut self.stream, &cell).await
    }

    async fn recv_relay(&mut self) -> Result<RelayCell> {
        loop {
            let cell = read_cell_timed(&mut self.stream).await?;
            match cell.command {
                CellCommand::Relay => {
                    let blob = unframe_blob(&cell.payload)?;
                    let plaintext = self.circuit.decrypt_inbound(&blob)?;
                    let relay_cell = RelayCell::decode(&plaintext)?;
                    verify_backward(&mut self.circuit, &relay_cell)?;
                    return Ok(relay_cell);
                }
                CellCommand::Padding => continue,
                CellCommand::Destroy => {
                    self.circuit.set_state(CircuitState::Destroyed);
                    return Err(OnionError::ProtocolViolation(
                        "circuit destroyed by peer".into(),
                    ));
                }
                other => {
                    return Err(OnionError::ProtocolViolation(format!(
                        "unexpected command {other:?}"
                    )))
                }
            }
        }
    }
}

/// Client authentication at the guard: sign the relay's nonce.
async fn authenticate(stream: &mut TcpStream, identity: &Identity) -> Result<()> {
    let mut challenge = [0u8; 32];
    stream.read_exact(&mut challenge).await?;

    let signature = identity.sign(&challenge);
    let key = identity.public_key_der();

    stream
        .write_all(&(signature.len() as u32).to_be_bytes())
        .await?;
    stream.write_all(&signature).await?;
    stream.write_all(&(key.len() as u32).to_be_bytes()).await?;
    stream.write_all(&key).await?;
    stream.flush().await?;
    Ok(())
}

async fn connect(addr: SocketAddrV4) -> Result<TcpStream> {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(OnionError::BuildFailed(format!("connect {addr}: {e}"))),
        Err(_) => Err(OnionError::Timeout),
    }
}

async fn read_cell_timed(stream: &mut TcpStream) -> Result<Cell> {
    match tokio::time::timeout(CELL_TIMEOUT, read_cell(stream)).await {
        Ok(result) => result,
        Err(_) => Err(OnionError::Timeout),
    }
}

fn ephemeral_der(ephemeral: &EphemeralSecret) -> Result<Vec<u8>> {
    Ok(ephemeral
        .public_key()
        .to_public_key_der()
        .map_err(|e| OnionError::BuildFailed(e.to_string()))?
        .into_vec())
}

fn derive_hop(ephemeral: EphemeralSecret, peer_der: &[u8], initiator: bool) -> Result<HopCrypto> {
    let peer = PublicKey::from_public_key_der(peer_der).map_err(|_| OnionError::KeyAgreement)?;
    let shared = ephemeral.diffie_hellman(&peer);
    HopCrypto::new(shared.raw_secret_bytes().as_slice(), initiator)
}

/// Stamp the digest for the hop that will parse this cell (the tail).
fn seal_forward(circuit: &mut OnionCircuit, relay_cell: &mut RelayCell) -> Result<()> {
    let input = relay_cell.digest_input()?;
    let tail = circuit
        .tail_mut()
        .ok_or_else(|| OnionError::ProtocolViolation("circuit has no hops".into()))?;
    relay_cell.digest = tail.crypto.forward_digest32(&input);
    Ok(())
}

/// Check a terminal cell's digest against the tail's backward seed.
fn verify_backward(circuit: &mut OnionCircuit, relay_cell: &RelayCell) -> Result<()> {
    let input = relay_cell.digest_input()?;
    let tail = circuit
        .tail_mut()
        .ok_or_else(|| OnionError::ProtocolViolation("circuit has no hops".into()))?;
    if tail.crypto.backward_digest32(&input) != relay_cell.digest {
        return Err(OnionError::DigestMismatch);
    }
    Ok(())
}
