//! Three-relay circuit construction and stream traffic over loopback.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anonet_core::EventBus;
use anonet_identity::Identity;
use anonet_onion::{CircuitBuilder, CircuitState, RelayDirectory, RelayInfo};
use anonet_relay::{InboundStreamEvent, RelayConfig, RelayServer};
use tokio::sync::mpsc;

async fn spawn_relay() -> (RelayServer, mpsc::Receiver<InboundStreamEvent>) {
    let identity = Arc::new(Identity::generate());
    let config = RelayConfig {
        port: 0,
        ..RelayConfig::default()
    };
    let (server, inbound) = RelayServer::bind(identity, config, EventBus::default())
        .await
        .unwrap();
    server.start();
    (server, inbound)
}

fn builder_for(relays: &[&RelayServer]) -> CircuitBuilder {
    let directory = Arc::new(RelayDirectory::new());
    for relay in relays {
        directory.add(RelayInfo {
            addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, relay.port()),
            fingerprint: None,
        });
    }
    CircuitBuilder::new(Arc::new(Identity::generate()), directory, EventBus::default())
}

#[tokio::test]
async fn three_hop_circuit_reaches_ready() {
    let (r1, i1) = spawn_relay().await;
    let (r2, i2) = spawn_relay().await;
    let (r3, i3) = spawn_relay().await;

    let builder = builder_for(&[&r1, &r2, &r3]);
    let circuit = builder.build(3).await.unwrap();

    assert_eq!(circuit.state(), CircuitState::Ready);
    assert_eq!(circuit.hop_count(), 3);

    // All three relays participate, each terminating exactly one circuit
    let hop_ports: Vec<u16> = circuit.hops().iter().map(|h| h.addr.port()).collect();
    let mut sorted = hop_ports.clone();
    sorted.sort_unstable();
    let mut relay_ports = vec![r1.port(), r2.port(), r3.port()];
    relay_ports.sort_unstable();
    assert_eq!(sorted, relay_ports);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(r1.active_circuits(), 1);
    assert_eq!(r2.active_circuits(), 1);
    assert_eq!(r3.active_circuits(), 1);

    drop((i1, i2, i3));
    circuit.destroy().await.unwrap();
}

#[tokio::test]
async fn stream_data_arrives_at_the_tail_only() {
    let (r1, i1) = spawn_relay().await;
    let (r2, i2) = spawn_relay().await;
    let (r3, i3) = spawn_relay().await;

    let builder = builder_for(&[&r1, &r2, &r3]);
    let mut circuit = builder.build(3).await.unwrap();

    let mut inbounds: HashMap<u16, mpsc::Receiver<InboundStreamEvent>> = HashMap::new();
    inbounds.insert(r1.port(), i1);
    inbounds.insert(r2.port(), i2);
    inbounds.insert(r3.port(), i3);

    let stream_id = circuit.open_stream().await.unwrap();
    assert_eq!(stream_id, 1);
    circuit.send_data(stream_id, b"through three hops").await.unwrap();

    let tail_port = circuit.hops().last().unwrap().addr.port();
    let tail_inbound = inbounds.get_mut(&tail_port).unwrap();

    let opened = tail_inbound.recv().await.unwrap();
    assert_eq!(
        opened,
        InboundStreamEvent::Opened {
            circuit_id: circuit.circuit_id(),
            stream_id,
        }
    );
    let data = tail_inbound.recv().await.unwrap();
    assert_eq!(
        data,
        InboundStreamEvent::Data {
            circuit_id: circuit.circuit_id(),
            stream_id,
            data: b"through three hops".to_vec(),
        }
    );

    // The other two relays saw no terminal traffic
    for (port, inbound) in inbounds.iter_mut() {
        if *port == tail_port {
            continue;
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(200), inbound.recv())
                .await
                .is_err(),
            "relay on port {port} unexpectedly terminated a stream"
        );
    }

    circuit.end_stream(stream_id).await.unwrap();
    let tail_inbound = inbounds.get_mut(&tail_port).unwrap();
    let closed = tail_inbound.recv().await.unwrap();
    assert_eq!(
        closed,
        InboundStreamEvent::Closed {
            circuit_id: circuit.circuit_id(),
            stream_id,
        }
    );

    circuit.destroy().await.unwrap();
}

#[tokio::test]
async fn single_hop_circuit_works() {
    let (r1, mut i1) = spawn_relay().await;

    let builder = builder_for(&[&r1]);
    let mut circuit = builder.build(1).await.unwrap();
    assert_eq!(circuit.hop_count(), 1);

    let stream_id = circuit.open_stream().await.unwrap();
    circuit.send_data(stream_id, b"direct").await.unwrap();

    assert!(matches!(
        i1.recv().await.unwrap(),
        InboundStreamEvent::Opened { .. }
    ));
    assert!(matches!(
        i1.recv().await.unwrap(),
        InboundStreamEvent::Data { .. }
    ));

    circuit.destroy().await.unwrap();
}

#[tokio::test]
async fn build_fails_against_closed_port() {
    let directory = Arc::new(RelayDirectory::new());
    // Nothing listens here
    directory.add(RelayInfo {
        addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1),
        fingerprint: None,
    });
    let builder = CircuitBuilder::new(
        Arc::new(Identity::generate()),
        directory.clone(),
        EventBus::default(),
    );

    assert!(builder.build(1).await.is_err());
}
