//! End-to-end tests over loopback TCP

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

use super::TunnelSet;
use crate::channel::{KeyDerivation, SecureChannel};
use crate::config::TunnelConfig;

const INBOUND_SECRET: &str = "inbound-secret";
const TARGET_SECRET: &str = "target-secret";

/// Plain echo server; counts accepted connections
async fn spawn_echo_target() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let accepts = Arc::new(AtomicUsize::new(0));

    let counted = accepts.clone();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            counted.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let (mut r, mut w) = sock.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });

    (addr, accepts)
}

/// Echo server that expects the handshake and a compressed cipher stream
async fn spawn_secure_echo_target(secret: &'static str, compression: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        while let Ok((sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut channel = SecureChannel::new(sock);
                let negotiated = channel
                    .authenticate_as_responder(secret.as_bytes())
                    .await
                    .unwrap();
                channel.upgrade(
                    &negotiated.session_key(secret.as_bytes(), KeyDerivation::Secret),
                    compression,
                );
                let mut buf = vec![0u8; 32 * 1024];
                loop {
                    match channel.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if channel.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

async fn start_tunnel(config: TunnelConfig) -> (TunnelSet, String) {
    let mut set = TunnelSet::new(vec![config]).unwrap();
    set.start().await.unwrap();
    let addr = set.listeners()[0].local_addr().to_string();
    (set, addr)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Counts bytes the client puts on the wire
struct CountingStream {
    inner: TcpStream,
    written: Arc<AtomicU64>,
}

impl AsyncRead for CountingStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CountingStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            self.written.fetch_add(*n as u64, Ordering::SeqCst);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

fn repetitive_payload(len: usize) -> Vec<u8> {
    b"the quick brown fox jumps over the lazy dog\n"
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

/// Send `payload` through a client channel and read the echo back.
/// Returns the echoed bytes and how many bytes the client wrote on the wire.
async fn round_trip(
    tunnel_addr: &str,
    secret: Option<&str>,
    compression: bool,
    payload: Vec<u8>,
) -> (Vec<u8>, u64) {
    let written = Arc::new(AtomicU64::new(0));
    let stream = CountingStream {
        inner: TcpStream::connect(tunnel_addr).await.unwrap(),
        written: written.clone(),
    };

    let mut channel = SecureChannel::new(stream);
    if let Some(secret) = secret {
        let negotiated = channel.authenticate_as_initiator(secret.as_bytes()).await.unwrap();
        channel.upgrade(
            &negotiated.session_key(secret.as_bytes(), KeyDerivation::Secret),
            compression,
        );
    }
    let handshake_bytes = written.load(Ordering::SeqCst);

    let expected = payload.len();
    let (mut reader, mut writer) = channel.into_split();
    let sender = tokio::spawn(async move {
        for chunk in payload.chunks(16 * 1024) {
            writer.write_all(chunk).await.unwrap();
        }
        writer
    });

    let mut echoed = Vec::with_capacity(expected);
    let mut buf = vec![0u8; 32 * 1024];
    while echoed.len() < expected {
        let n = reader.read(&mut buf).await.unwrap();
        assert!(n > 0, "tunnel closed early after {} bytes", echoed.len());
        echoed.extend_from_slice(&buf[..n]);
    }
    let _writer = sender.await.unwrap();

    (echoed, written.load(Ordering::SeqCst) - handshake_bytes)
}

#[tokio::test]
async fn test_plain_passthrough() {
    let (target, _) = spawn_echo_target().await;
    let (mut set, addr) = start_tunnel(TunnelConfig::tcp("127.0.0.1:0", target)).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    client.write_all(b"hello through the tunnel").await.unwrap();
    let mut buf = [0u8; 24];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello through the tunnel");

    set.stop().await;
}

#[tokio::test]
async fn test_inbound_auth_gates_dial() {
    let (target, accepts) = spawn_echo_target().await;
    let mut config = TunnelConfig::tcp("127.0.0.1:0", target);
    config.inbound_password = Some(INBOUND_SECRET.into());
    let (mut set, addr) = start_tunnel(config).await;

    // Wrong password: disconnected, target never dialed
    let mut intruder = TcpStream::connect(&addr).await.unwrap();
    crate::channel::handshake::authenticate_as_initiator(&mut intruder, b"guess")
        .await
        .unwrap();
    let mut buf = [0u8; 1];
    let closed = tokio::time::timeout(Duration::from_secs(5), intruder.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(closed, Ok(0) | Err(_)));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 0);

    // Right password: reaches the target
    let (echoed, _) = round_trip(&addr, Some(INBOUND_SECRET), false, b"let me in".to_vec()).await;
    assert_eq!(echoed, b"let me in");
    assert_eq!(accepts.load(Ordering::SeqCst), 1);

    set.stop().await;
}

#[tokio::test]
async fn test_compression_reduces_wire_bytes() {
    const PAYLOAD: usize = 1024 * 1024;

    // Baseline: uncompressed passthrough
    let (plain_target, _) = spawn_echo_target().await;
    let (mut plain_set, plain_addr) = start_tunnel(TunnelConfig::tcp("127.0.0.1:0", plain_target)).await;
    let (echoed, plain_wire) = round_trip(&plain_addr, None, false, repetitive_payload(PAYLOAD)).await;
    assert_eq!(echoed, repetitive_payload(PAYLOAD));
    assert_eq!(plain_wire, PAYLOAD as u64);

    // Both legs authenticated and compressed
    let secure_target = spawn_secure_echo_target(TARGET_SECRET, true).await;
    let mut config = TunnelConfig::tcp("127.0.0.1:0", secure_target);
    config.inbound_password = Some(INBOUND_SECRET.into());
    config.target_password = Some(TARGET_SECRET.into());
    config.compression = true;
    let (mut secure_set, secure_addr) = start_tunnel(config).await;

    let (echoed, compressed_wire) =
        round_trip(&secure_addr, Some(INBOUND_SECRET), true, repetitive_payload(PAYLOAD)).await;
    assert_eq!(echoed, repetitive_payload(PAYLOAD));
    assert!(
        compressed_wire < plain_wire / 2,
        "compressed {} vs plain {}",
        compressed_wire,
        plain_wire
    );

    plain_set.stop().await;
    secure_set.stop().await;
}

#[tokio::test]
async fn test_live_connection_count_tracks_sessions() {
    const K: usize = 5;

    let (target, _) = spawn_echo_target().await;
    let (mut set, addr) = start_tunnel(TunnelConfig::tcp("127.0.0.1:0", target)).await;

    let mut clients = Vec::new();
    for i in 0..K {
        let mut client = TcpStream::connect(&addr).await.unwrap();
        let msg = [i as u8; 8];
        client.write_all(&msg).await.unwrap();
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, msg);
        clients.push(client);
    }

    wait_until(|| set.live_connections() == K).await;
    assert_eq!(set.listeners()[0].live_connections(), K);

    drop(clients);
    wait_until(|| set.live_connections() == 0).await;

    set.stop().await;
}
