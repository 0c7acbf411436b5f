//! Relay TCP server
//!
//! One accept loop, one task per authenticated connection. Circuits are
//! kept in a per-connection table keyed by circuit id (a circuit is
//! addressed by inbound socket plus id); next-hop links are a writer
//! handle and a backward pump task, never a back-reference, so teardown
//! just walks the table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use p256::ecdh::EphemeralSecret;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use p256::PublicKey;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use anonet_core::types::{DEFAULT_RELAY_PORT, MAX_RELAY_CIRCUITS, PORT_PROBE_RANGE};
use anonet_core::{CoreEvent, EventBus};
use anonet_identity::{fingerprint_of_der, verify_signature, Identity};
use anonet_onion::{
    decode_key_payload, encode_key_payload, frame_blob, read_cell, unframe_blob, write_cell,
    Cell, CellCommand, ExtendPayload, HopCrypto, OnionError, RelayCell, RelayCommand,
};

use crate::limiter::{RateLimiter, RateLimiterConfig};
use crate::{RelayError, Result};

/// Relay server settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub max_circuits: usize,
    pub auth_timeout: Duration,
    pub cell_timeout: Duration,
    pub connect_timeout: Duration,
    pub limiter: RateLimiterConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_RELAY_PORT,
            max_circuits: MAX_RELAY_CIRCUITS,
            auth_timeout: Duration::from_secs(10),
            cell_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            limiter: RateLimiterConfig::default(),
        }
    }
}

/// Terminal traffic surfaced to the transfer collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundStreamEvent {
    Opened { circuit_id: u32, stream_id: u16 },
    Data { circuit_id: u32, stream_id: u16, data: Vec<u8> },
    Closed { circuit_id: u32, stream_id: u16 },
}

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;
type CircuitMap = Arc<Mutex<HashMap<u32, RelayCircuit>>>;

struct RelayCircuit {
    crypto: HopCrypto,
    next_hop: Option<NextHop>,
}

struct NextHop {
    writer: SharedWriter,
    pump: JoinHandle<()>,
}

/// The relay server handle. Cheap to clone.
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    identity: Arc<Identity>,
    listener: TcpListener,
    port: u16,
    config: RelayConfig,
    limiter: RateLimiter,
    circuit_count: AtomicUsize,
    events: EventBus,
    inbound_tx: mpsc::Sender<InboundStreamEvent>,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    /// Bind the listener, probing a few ports above the configured one.
    /// Returns the server and the receiver for terminal stream traffic.
    pub async fn bind(
        identity: Arc<Identity>,
        config: RelayConfig,
        events: EventBus,
    ) -> Result<(Self, mpsc::Receiver<InboundStreamEvent>)> {
        let mut last_err = None;
        let mut bound = None;
        for offset in 0..=PORT_PROBE_RANGE {
            let candidate = config.port.saturating_add(offset);
            match TcpListener::bind(("0.0.0.0", candidate)).await {
                Ok(listener) => {
                    let port = listener.local_addr()?.port();
                    bound = Some((listener, port));
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let (listener, port) = bound.ok_or_else(|| {
            RelayError::BindFailed(last_err.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::AddrInUse, "no relay port available")
            }))
        })?;

        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (shutdown, _) = watch::channel(false);
        let limiter = RateLimiter::new(config.limiter.clone());

        Ok((
            Self {
                inner: Arc::new(ServerInner {
                    identity,
                    listener,
                    port,
                    config,
                    limiter,
                    circuit_count: AtomicUsize::new(0),
                    events,
                    inbound_tx,
                    shutdown,
                }),
            },
            inbound_rx,
        ))
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn active_circuits(&self) -> usize {
        self.inner.circuit_count.load(Ordering::Relaxed)
    }

    pub fn start(&self) {
        let server = self.clone();
        tokio::spawn(async move { server.accept_loop().await });
        debug!(port = self.inner.port, "relay server started");
    }

    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    async fn accept_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut prune = tokio::time::interval(Duration::from_secs(60));

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = prune.tick() => self.inner.limiter.prune_idle(Duration::from_secs(300)),
                accepted = self.inner.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if !self.inner.limiter.allow(addr.ip()) {
                            // Closed before the challenge is even sent
                            self.inner.events.emit(CoreEvent::RelayPeerRejected {
                                addr: addr.to_string(),
                            });
                            trace!(%addr, "rate limited");
                            drop(stream);
                            continue;
                        }
                        let inner = self.inner.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(inner, stream, addr).await {
                                debug!(%addr, "connection ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        break;
                    }
                }
            }
        }
        debug!("relay accept loop stopped");
    }
}

async fn handle_connection(
    inner: Arc<ServerInner>,
    mut stream: TcpStream,
    addr: SocketAddr,
) -> Result<()> {
    let auth = tokio::time::timeout(inner.config.auth_timeout, challenge(&mut stream)).await;
    let peer_fingerprint = match auth {
        Ok(Ok(fingerprint)) => fingerprint,
        _ => {
            inner.events.emit(CoreEvent::RelayPeerRejected {
                addr: addr.to_string(),
            });
            return Err(RelayError::Unauthenticated);
        }
    };
    inner.events.emit(CoreEvent::RelayPeerAuthenticated {
        addr: addr.to_string(),
    });
    debug!(%addr, peer = %&peer_fingerprint[..8], "relay peer authenticated");

    let (mut read_half, write_half) = stream.into_split();
    let inbound: SharedWriter = Arc::new(tokio::sync::Mutex::new(write_half));
    let circuits: CircuitMap = Arc::new(Mutex::new(HashMap::new()));

    let served = serve_cells(&inner, &mut read_half, &inbound, &circuits).await;
    teardown_all(&inner, &circuits);
    served
}

/// Send the 32-byte nonce, read the signature and key, verify.
async fn challenge(stream: &mut TcpStream) -> Result<String> {
    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);
    stream.write_all(&nonce).await?;
    stream.flush().await?;

    let signature = read_len_prefixed(stream, 256).await?;
    let key = read_len_prefixed(stream, 1024).await?;

    if !verify_signature(&key, &nonce, &signature) {
        return Err(RelayError::Unauthenticated);
    }
    Ok(fingerprint_of_der(&key))
}

async fn read_len_prefixed(stream: &mut TcpStream, max: usize) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 || len > max {
        return Err(RelayError::Unauthenticated);
    }
    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes).await?;
    Ok(bytes)
}

async fn serve_cells(
    inner: &Arc<ServerInner>,
    read_half: &mut OwnedReadHalf,
    inbound: &SharedWriter,
    circuits: &CircuitMap,
) -> Result<()> {
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        let cell = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            read = tokio::time::timeout(inner.config.cell_timeout, read_cell(read_half)) => {
                match read {
                    Ok(Ok(cell)) => cell,
                    Ok(Err(OnionError::Io(e)))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        return Ok(());
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Err(RelayError::Timeout),
                }
            }
        };

        match cell.command {
            CellCommand::Padding => {}
            CellCommand::Create => handle_create(inner, &cell, inbound, circuits).await?,
            CellCommand::Relay | CellCommand::RelayEarly => {
                handle_relay(inner, cell, inbound, circuits).await?;
            }
            CellCommand::Destroy => destroy_circuit(inner, circuits, cell.circuit_id),
            CellCommand::Created | CellCommand::CreateFast | CellCommand::CreatedFast => {
                trace!(command = ?cell.command, "dropping unexpected cell");
            }
        }
    }
}

async fn handle_create(
    inner: &Arc<ServerInner>,
    cell: &Cell,
    inbound: &SharedWriter,
    circuits: &CircuitMap,
) -> Result<()> {
    if circuits.lock().contains_key(&cell.circuit_id)
        || inner.circuit_count.load(Ordering::Relaxed) >= inner.config.max_circuits
    {
        let destroy = Cell::new(cell.circuit_id, CellCommand::Destroy, Vec::new());
        write_cell(&mut *inbound.lock().await, &destroy).await?;
        return Ok(());
    }

    let created = match respond_create(&cell.payload) {
        Ok((crypto, payload)) => {
            circuits.lock().insert(
                cell.circuit_id,
                RelayCircuit {
                    crypto,
                    next_hop: None,
                },
            );
            inner.circuit_count.fetch_add(1, Ordering::Relaxed);
            Cell::new(cell.circuit_id, CellCommand::Created, payload)
        }
        Err(e) => {
            debug!(circuit_id = cell.circuit_id, "CREATE rejected: {e}");
            Cell::new(cell.circuit_id, CellCommand::Destroy, Vec::new())
        }
    };
    write_cell(&mut *inbound.lock().await, &created).await?;
    Ok(())
}

/// Responder half of the key agreement: fresh ephemeral, shared secret,
/// CREATED payload.
fn respond_create(payload: &[u8]) -> Result<(HopCrypto, Vec<u8>)> {
    let client_der = decode_key_payload(payload)?;
    let client_key =
        PublicKey::from_public_key_der(&client_der).map_err(|_| OnionError::KeyAgreement)?;

    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let our_der = ephemeral
        .public_key()
        .to_public_key_der()
        .map_err(|_| OnionError::KeyAgreement)?
        .into_vec();

    let shared = ephemeral.diffie_hellman(&client_key);
    let crypto = HopCrypto::new(shared.raw_secret_bytes().as_slice(), false)?;
    Ok((crypto, encode_key_payload(&our_der)?))
}

async fn handle_relay(
    inner: &Arc<ServerInner>,
    cell: Cell,
    inbound: &SharedWriter,
    circuits: &CircuitMap,
) -> Result<()> {
    let circuit_id = cell.circuit_id;

    // Peel one layer and decide forward-vs-terminal under the lock.
    enum Outcome {
        Ok(Vec<u8>, Option<SharedWriter>),
        UnknownCircuit,
        Destroy,
    }

    let outcome = {
        let mut map = circuits.lock();
        if let Some(circuit) = map.get_mut(&circuit_id) {
            match unframe_blob(&cell.payload) {
                Ok(blob) => match circuit.crypto.decrypt_forward(&blob) {
                    Ok(peeled) => {
                        let next = circuit.next_hop.as_ref().map(|n| n.writer.clone());
                        Outcome::Ok(peeled, next)
                    }
                    Err(_) => Outcome::Destroy,
                },
                Err(_) => Outcome::Destroy,
            }
        } else {
            Outcome::UnknownCircuit
        }
    };

    let (peeled, next) = match outcome {
        Outcome::Ok(peeled, next) => (peeled, next),
        Outcome::UnknownCircuit => {
            // RELAY on an unknown circuit
            let destroy = Cell::new(circuit_id, CellCommand::Destroy, Vec::new());
            write_cell(&mut *inbound.lock().await, &destroy).await?;
            return Ok(());
        }
        Outcome::Destroy => {
            destroy_circuit(inner, circuits, circuit_id);
            return Ok(());
        }
    };

    if let Some(next_writer) = next {
        // Mid-path: pass the cell on unchanged but one layer lighter
        let forwarded = Cell::new(circuit_id, CellCommand::Relay, frame_blob(&peeled)?);
        write_cell(&mut *next_writer.lock().await, &forwarded).await?;
        return Ok(());
    }

    // Terminal: this relay is the current tail
    let relay_cell = match RelayCell::decode(&peeled) {
        Ok(relay_cell) => relay_cell,
        Err(_) => {
            destroy_circuit(inner, circuits, circuit_id);
            return Ok(());
        }
    };

    let digest_ok = {
        let map = circuits.lock();
        match (map.get(&circuit_id), relay_cell.digest_input()) {
            (Some(circuit), Ok(input)) => {
                circuit.crypto.forward_digest32(&input) == relay_cell.digest
            }
            _ => false,
        }
    };
    if !digest_ok {
        destroy_circuit(inner, circuits, circuit_id);
        return Ok(());
    }

    match relay_cell.command {
        RelayCommand::Extend => {
            handle_extend(inner, circuit_id, &relay_cell.data, inbound, circuits).await
        }
        RelayCommand::Begin => {
            push_event(
                inner,
                InboundStreamEvent::Opened {
                    circuit_id,
                    stream_id: relay_cell.stream_id,
                },
            );
            send_backward(
                inbound,
                circuits,
                circuit_id,
                RelayCell::new(RelayCommand::Connected, relay_cell.stream_id, Vec::new()),
            )
            .await
        }
        RelayCommand::Data => {
            push_event(
                inner,
                InboundStreamEvent::Data {
                    circuit_id,
                    stream_id: relay_cell.stream_id,
                    data: relay_cell.data,
                },
            );
            Ok(())
        }
        RelayCommand::End => {
            push_event(
                inner,
                InboundStreamEvent::Closed {
                    circuit_id,
                    stream_id: relay_cell.stream_id,
                },
            );
            Ok(())
        }
        RelayCommand::Drop => Ok(()),
        RelayCommand::Extended | RelayCommand::Connected => {
            destroy_circuit(inner, circuits, circuit_id);
            Ok(())
        }
    }
}

/// Open the next link, pass the client's CREATE through, wire the
/// backward pump and answer RELAY_EXTENDED.
async fn handle_extend(
    inner: &Arc<ServerInner>,
    circuit_id: u32,
    data: &[u8],
    inbound: &SharedWriter,
    circuits: &CircuitMap,
) -> Result<()> {
    let extend = match ExtendPayload::decode(data) {
        Ok(extend) => extend,
        Err(_) => {
            destroy_circuit(inner, circuits, circuit_id);
            return Ok(());
        }
    };

    let next_der = match open_next_hop(inner, circuit_id, &extend).await {
        Ok((next_stream, next_der)) => {
            let (next_read, next_write) = next_stream.into_split();
            let writer = Arc::new(tokio::sync::Mutex::new(next_write));
            let pump = tokio::spawn(backward_pump(
                next_read,
                circuits.clone(),
                inbound.clone(),
                circuit_id,
            ));

            let mut map = circuits.lock();
            match map.get_mut(&circuit_id) {
                Some(circuit) => {
                    circuit.next_hop = Some(NextHop { writer, pump });
                    next_der
                }
                None => {
                    // Circuit vanished while we were connecting
                    pump.abort();
                    return Ok(());
                }
            }
        }
        Err(e) => {
            debug!(circuit_id, next = %extend.addr, "extension failed: {e}");
            destroy_circuit(inner, circuits, circuit_id);
            let destroy = Cell::new(circuit_id, CellCommand::Destroy, Vec::new());
            write_cell(&mut *inbound.lock().await, &destroy).await?;
            return Ok(());
        }
    };

    debug!(circuit_id, next = %extend.addr, "circuit extended");
    send_backward(
        inbound,
        circuits,
        circuit_id,
        RelayCell::new(RelayCommand::Extended, 0, next_der),
    )
    .await
}

async fn open_next_hop(
    inner: &Arc<ServerInner>,
    circuit_id: u32,
    extend: &ExtendPayload,
) -> Result<(TcpStream, Vec<u8>)> {
    let connect = tokio::time::timeout(
        inner.config.connect_timeout,
        TcpStream::connect(extend.addr),
    )
    .await;
    let mut next_stream = match connect {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(RelayError::Io(e)),
        Err(_) => return Err(RelayError::Timeout),
    };

    answer_challenge(&mut next_stream, &inner.identity).await?;

    let create = Cell::new(
        circuit_id,
        CellCommand::Create,
        encode_key_payload(&extend.ephemeral_der)?,
    );
    write_cell(&mut next_stream, &create).await?;

    let created =
        match tokio::time::timeout(inner.config.cell_timeout, read_cell(&mut next_stream)).await {
            Ok(Ok(cell)) => cell,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(RelayError::Timeout),
        };
    if created.command != CellCommand::Created || created.circuit_id != circuit_id {
        return Err(RelayError::ProtocolViolation(format!(
            "next hop answered {:?}",
            created.command
        )));
    }

    let next_der = decode_key_payload(&created.payload)?;
    Ok((next_stream, next_der))
}

/// The extending relay is a client on the next link: sign its nonce.
async fn answer_challenge(stream: &mut TcpStream, identity: &Identity) -> Result<()> {
    let mut nonce = [0u8; 32];
    stream.read_exact(&mut nonce).await?;

    let signature = identity.sign(&nonce);
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

/// Relay backward traffic from the next hop, adding this hop's layer.
async fn backward_pump(
    mut next_read: OwnedReadHalf,
    circuits: CircuitMap,
    inbound: SharedWriter,
    circuit_id: u32,
) {
    loop {
        let cell = match read_cell(&mut next_read).await {
            Ok(cell) => cell,
            Err(_) => break,
        };

        match cell.command {
            CellCommand::Relay | CellCommand::RelayEarly => {
                let framed = {
                    let mut map = circuits.lock();
                    let Some(circuit) = map.get_mut(&circuit_id) else {
                        break;
                    };
                    let Ok(blob) = unframe_blob(&cell.payload) else {
                        break;
                    };
                    let Ok(layered) = circuit.crypto.encrypt_backward(&blob) else {
                        break;
                    };
                    match frame_blob(&layered) {
                        Ok(framed) => framed,
                        Err(_) => break,
                    }
                };
                let backward = Cell::new(circuit_id, CellCommand::Relay, framed);
                if write_cell(&mut *inbound.lock().await, &backward)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            CellCommand::Destroy => {
                let destroy = Cell::new(circuit_id, CellCommand::Destroy, Vec::new());
                let _ = write_cell(&mut *inbound.lock().await, &destroy).await;
                break;
            }
            _ => {}
        }
    }
    trace!(circuit_id, "backward pump stopped");
}

/// Seal, layer and send a relay cell back toward the client.
async fn send_backward(
    inbound: &SharedWriter,
    circuits: &CircuitMap,
    circuit_id: u32,
    mut relay_cell: RelayCell,
) -> Result<()> {
    let framed = {
        let mut map = circuits.lock();
        let Some(circuit) = map.get_mut(&circuit_id) else {
            return Ok(());
        };
        let input = relay_cell.digest_input()?;
        relay_cell.digest = circuit.crypto.backward_digest32(&input);
        let blob = circuit.crypto.encrypt_backward(&relay_cell.encode()?)?;
        frame_blob(&blob)?
    };

    let cell = Cell::new(circuit_id, CellCommand::Relay, framed);
    write_cell(&mut *inbound.lock().await, &cell).await?;
    Ok(())
}

fn push_event(inner: &Arc<ServerInner>, event: InboundStreamEvent) {
    if inner.inbound_tx.try_send(event).is_err() {
        trace!("inbound stream event dropped (no consumer)");
    }
}

fn destroy_circuit(inner: &Arc<ServerInner>, circuits: &CircuitMap, circuit_id: u32) {
    let mut map = circuits.lock();
    if let Some(circuit) = map.remove(&circuit_id) {
        if let Some(next) = circuit.next_hop {
            next.pump.abort();
        }
        inner.circuit_count.fetch_sub(1, Ordering::Relaxed);
        trace!(circuit_id, "circuit destroyed");
    }
}

fn teardown_all(inner: &Arc<ServerInner>, circuits: &CircuitMap) {
    let mut map = circuits.lock();
    let count = map.len();
    for (_, circuit) in map.drain() {
        if let Some(next) = circuit.next_hop {
            next.pump.abort();
        }
    }
    if count > 0 {
        inner.circuit_count.fetch_sub(count, Ordering::Relaxed);
        debug!(count, "connection circuits torn down");
    }
}
