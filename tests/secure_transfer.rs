//! Secure-channel handshake and framed transfer over real TCP.

use anonet_channel::{handshake, ChannelError};
use anonet_identity::Identity;
use tokio::net::{TcpListener, TcpStream};

#[tokio::test]
async fn handshake_and_exchange_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let alice = Identity::generate();
    let bob = Identity::generate();
    let alice_fp = alice.fingerprint().to_string();
    let bob_fp = bob.fingerprint().to_string();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut channel = handshake(&mut stream, &bob, Some(&alice_fp)).await.unwrap();

        let request = channel.recv(&mut stream).await.unwrap();
        assert_eq!(request, b"hello");
        channel.send(&mut stream, b"hello yourself").await.unwrap();

        (channel.send_sequence(), channel.recv_sequence())
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut channel = handshake(&mut stream, &alice, Some(&bob_fp)).await.unwrap();

    channel.send(&mut stream, b"hello").await.unwrap();
    let reply = channel.recv(&mut stream).await.unwrap();
    assert_eq!(reply, b"hello yourself");

    // One message each way: both sides advanced both counters once
    assert_eq!(channel.send_sequence(), 1);
    assert_eq!(channel.recv_sequence(), 1);
    let (server_send, server_recv) = server.await.unwrap();
    assert_eq!(server_send, 1);
    assert_eq!(server_recv, 1);
}

#[tokio::test]
async fn pinned_fingerprint_rejects_unknown_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let imposter = Identity::generate();
    let expected = Identity::generate();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // The imposter runs an honest handshake under its own identity
        let _ = handshake(&mut stream, &imposter, None).await;
    });

    let alice = Identity::generate();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let result = handshake(&mut stream, &alice, Some(expected.fingerprint())).await;
    assert!(matches!(result, Err(ChannelError::FingerprintMismatch)));

    server.await.unwrap();
}

#[tokio::test]
async fn large_payload_roundtrip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let alice = Identity::generate();
    let bob = Identity::generate();

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut channel = handshake(&mut stream, &bob, None).await.unwrap();
        channel.recv(&mut stream).await.unwrap()
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut channel = handshake(&mut stream, &alice, None).await.unwrap();
    channel.send(&mut stream, &payload).await.unwrap();

    assert_eq!(server.await.unwrap(), expected);
}
