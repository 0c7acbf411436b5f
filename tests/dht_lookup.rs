//! Two-node and three-node DHT announcement flow over loopback UDP.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use anonet_core::EventBus;
use anonet_dht::{DhtService, Message, NodeId, PeerAnnouncement};
use anonet_identity::Identity;

async fn spawn_node(name: &str) -> DhtService {
    let service = DhtService::bind(NodeId::from_name(name), 0, EventBus::default())
        .await
        .unwrap();
    service.start();
    service
}

fn loopback(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

#[tokio::test]
async fn two_node_announce_and_lookup() {
    let alice_dht = spawn_node("alice#A1B2C3D4").await;
    let bob_dht = spawn_node("bob#DEADBEEF").await;

    // Alice announces directly to Bob
    let alice = Identity::generate();
    let announcement = PeerAnnouncement::build(&alice, "alice", &[51823, 51821]).unwrap();

    let reply = alice_dht
        .query(
            loopback(bob_dht.port()),
            None,
            Message::Announce {
                value: announcement.to_bytes(),
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(reply, Message::Announced { ok: true });

    // Bob resolves the username and the record still verifies
    let found = bob_dht.lookup(announcement.dht_key()).await.unwrap();
    assert_eq!(found.username, announcement.username);
    assert_eq!(found.port_candidates, vec![51823, 51821]);
    assert!(found.verify());

    // The fingerprint key resolves to the same record
    let by_fp = bob_dht.lookup(announcement.fingerprint_key()).await.unwrap();
    assert_eq!(by_fp, found);

    alice_dht.shutdown();
    bob_dht.shutdown();
}

#[tokio::test]
async fn lookup_traverses_intermediate_node() {
    // alice knows bob, bob knows carol; only carol stores the value.
    let alice_dht = spawn_node("walk-alice").await;
    let bob_dht = spawn_node("walk-bob").await;
    let carol_dht = spawn_node("walk-carol").await;

    alice_dht
        .query(
            loopback(bob_dht.port()),
            None,
            Message::Ping,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    bob_dht
        .query(
            loopback(carol_dht.port()),
            None,
            Message::Ping,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    let carol = Identity::generate();
    let announcement = PeerAnnouncement::build(&carol, "carol", &[51823]).unwrap();
    carol_dht
        .store()
        .insert(announcement.dht_key(), announcement.to_bytes())
        .unwrap();

    let found = alice_dht.lookup(announcement.dht_key()).await.unwrap();
    assert_eq!(found.username, announcement.username);
    assert!(found.verify());

    // The walk also taught alice about carol
    assert!(alice_dht.routing().contains(carol_dht.local_id()));

    alice_dht.shutdown();
    bob_dht.shutdown();
    carol_dht.shutdown();
}

#[tokio::test]
async fn tampered_announcement_is_not_stored() {
    let alice_dht = spawn_node("tamper-alice").await;
    let bob_dht = spawn_node("tamper-bob").await;

    let alice = Identity::generate();
    let announcement = PeerAnnouncement::build(&alice, "alice", &[51820, 51821]).unwrap();

    // Flip one bit in the serialized ports region and re-send without
    // re-signing
    let mut bytes = announcement.to_bytes();
    let port_offset = 2 + announcement.username.len()
        + 2 + announcement.fingerprint.len()
        + 2 + announcement.public_key.len()
        + 1;
    bytes[port_offset] ^= 0x01;

    let reply = alice_dht
        .query(
            loopback(bob_dht.port()),
            None,
            Message::Announce { value: bytes },
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(reply, Message::Announced { ok: false });
    assert!(bob_dht.lookup(announcement.dht_key()).await.is_none());

    alice_dht.shutdown();
    bob_dht.shutdown();
}
