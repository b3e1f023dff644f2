//! End-to-end tests over loopback sockets

use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use asura::config::ProxyConfig;
use asura::core::{hook, Hook, HookKey, Packet, Phase, Plugin, ProxyBuilder, StatsSnapshot};
use asura::plugins::{DirectiveCodec, HostPortCodec, ReconnectPlugin};
use asura::server_runner::{bind_listener, run_proxy};
use asura::{Proxy, ProxyHandle, ReconnectMode, Target};

const WAIT: Duration = Duration::from_secs(3);
const RECONNECT_ID: u8 = 45;

struct DropPlugin(u8);

impl Plugin for DropPlugin {
    fn name(&self) -> &str {
        "drop"
    }

    fn hooks(&self) -> Vec<(HookKey, Hook)> {
        vec![(HookKey::Packet(self.0), hook(|_p, _id| Ok(Bytes::new())))]
    }
}

struct Running {
    handle: ProxyHandle,
    addr: SocketAddr,
    task: JoinHandle<asura::Result<StatsSnapshot>>,
}

async fn start(builder: ProxyBuilder) -> Running {
    let config = ProxyConfig::local(0);
    let listener = bind_listener(&config).unwrap();
    let addr = listener.local_addr().unwrap();
    let proxy = builder.config(config).build().unwrap();
    let handle = proxy.handle();
    let task = tokio::spawn(run_proxy(proxy, listener));
    Running { handle, addr, task }
}

async fn fake_server() -> (TcpListener, Target) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = Target::from(listener.local_addr().unwrap());
    (listener, target)
}

async fn accept(listener: &TcpListener) -> TcpStream {
    tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("proxy did not dial")
        .unwrap()
        .0
}

async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("timed out reading")
        .unwrap();
    buf
}

async fn read_packet(stream: &mut TcpStream) -> Packet {
    let header = read_exact(stream, 4).await;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let body = read_exact(stream, len).await;
    let mut raw = header;
    raw.extend_from_slice(&body);
    Packet::parse(Bytes::from(raw)).unwrap()
}

async fn expect_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(WAIT, stream.read(&mut buf))
        .await
        .expect("socket was not closed")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

async fn wait_for_phase(handle: &ProxyHandle, phase: Phase) {
    tokio::time::timeout(WAIT, async {
        while handle.info().phase != phase {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("phase never became {}", phase));
}

async fn stop(running: Running) -> StatsSnapshot {
    running.handle.shutdown();
    tokio::time::timeout(WAIT, running.task)
        .await
        .expect("proxy did not stop")
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_unhooked_packets_pass_through_both_ways() {
    let (server, target) = fake_server().await;
    let running = start(Proxy::builder().remote(target)).await;

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    let mut upstream = accept(&server).await;

    client.write_all(&[0x01, 0x00, 0x00, 0x00, 0x2A]).await.unwrap();
    assert_eq!(read_exact(&mut upstream, 5).await, vec![0x01, 0x00, 0x00, 0x00, 0x2A]);

    let reply = Packet::from_parts(9, b"hello client");
    upstream.write_all(reply.as_bytes()).await.unwrap();
    assert_eq!(read_packet(&mut client).await, reply);

    let stats = stop(running).await;
    assert_eq!(stats.upstream_packets, 1);
    assert_eq!(stats.downstream_packets, 1);
}

#[tokio::test]
async fn test_packet_split_across_writes_is_reassembled() {
    let (server, target) = fake_server().await;
    let running = start(Proxy::builder().remote(target)).await;

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    let mut upstream = accept(&server).await;

    let payload = vec![0xAB; 5000];
    let packet = Packet::from_parts(3, &payload);
    let raw = packet.as_bytes().clone();
    for chunk in raw.chunks(777) {
        client.write_all(chunk).await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert_eq!(read_packet(&mut upstream).await, packet);
    stop(running).await;
}

#[tokio::test]
async fn test_dropped_packet_never_reaches_server() {
    let (server, target) = fake_server().await;
    let running = start(
        Proxy::builder()
            .remote(target)
            .plugin(|_handle| DropPlugin(7)),
    )
    .await;

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    let mut upstream = accept(&server).await;

    client
        .write_all(Packet::from_parts(7, b"secret").as_bytes())
        .await
        .unwrap();
    let kept = Packet::from_parts(8, b"kept");
    client.write_all(kept.as_bytes()).await.unwrap();

    // The first bytes the server sees belong to id 8
    assert_eq!(read_packet(&mut upstream).await, kept);

    let stats = stop(running).await;
    assert_eq!(stats.dropped, 1);
}

#[tokio::test]
async fn test_plugin_injected_packet_reaches_client() {
    let (server, target) = fake_server().await;
    let running = start(Proxy::builder().remote(target)).await;

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    let _upstream = accept(&server).await;
    wait_for_phase(&running.handle, Phase::Active).await;

    let greeting = Packet::from_parts(20, b"Connected to proxy");
    running
        .handle
        .send_to_client(greeting.as_bytes().clone())
        .unwrap();
    assert_eq!(read_packet(&mut client).await, greeting);

    stop(running).await;
}

#[tokio::test]
async fn test_seamless_reconnect_keeps_client() {
    let (first, first_target) = fake_server().await;
    let (second, second_target) = fake_server().await;
    let running = start(
        Proxy::builder()
            .remote(first_target)
            .plugin(|handle| ReconnectPlugin::new(handle, RECONNECT_ID, ReconnectMode::Seamless)),
    )
    .await;

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    let mut upstream = accept(&first).await;

    let payload = HostPortCodec.encode(&second_target).unwrap();
    upstream
        .write_all(Packet::from_parts(RECONNECT_ID, &payload).as_bytes())
        .await
        .unwrap();

    // Old upstream is closed, new one carries the same client's traffic
    expect_eof(&mut upstream).await;
    let mut upstream2 = accept(&second).await;
    assert_eq!(running.handle.info().remote, second_target);
    let after = Packet::from_parts(1, b"still here");
    client.write_all(after.as_bytes()).await.unwrap();
    assert_eq!(read_packet(&mut upstream2).await, after);

    // The directive never reached the client: the first thing it reads is
    // the new server's reply
    let reply = Packet::from_parts(2, b"welcome");
    upstream2.write_all(reply.as_bytes()).await.unwrap();
    assert_eq!(read_packet(&mut client).await, reply);

    let stats = stop(running).await;
    assert_eq!(stats.dropped, 1);
}

#[tokio::test]
async fn test_await_client_reconnect_dials_after_reattach() {
    let (first, first_target) = fake_server().await;
    let (second, second_target) = fake_server().await;
    let running = start(
        Proxy::builder()
            .remote(first_target)
            .plugin(|handle| ReconnectPlugin::new(handle, RECONNECT_ID, ReconnectMode::AwaitClient)),
    )
    .await;

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    let mut upstream = accept(&first).await;

    let payload = HostPortCodec.encode(&second_target).unwrap();
    upstream
        .write_all(Packet::from_parts(RECONNECT_ID, &payload).as_bytes())
        .await
        .unwrap();
    read_packet(&mut client).await;
    assert_eq!(running.handle.info().phase, Phase::Reconnecting);

    // Nothing is dialed until the client comes back
    assert!(
        tokio::time::timeout(Duration::from_millis(100), second.accept())
            .await
            .is_err()
    );

    let mut client2 = TcpStream::connect(running.addr).await.unwrap();
    let mut upstream2 = accept(&second).await;
    let hello = Packet::from_parts(2, b"hello again");
    client2.write_all(hello.as_bytes()).await.unwrap();
    assert_eq!(read_packet(&mut upstream2).await, hello);

    // The replaced client connection is closed
    expect_eof(&mut client).await;
    stop(running).await;
}

#[tokio::test]
async fn test_server_loss_closes_client_and_waits() {
    let (server, target) = fake_server().await;
    let running = start(Proxy::builder().remote(target)).await;

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    let upstream = accept(&server).await;
    wait_for_phase(&running.handle, Phase::Active).await;

    drop(upstream);
    expect_eof(&mut client).await;
    wait_for_phase(&running.handle, Phase::Reconnecting).await;

    // A returning client gets a fresh upstream
    let mut client2 = TcpStream::connect(running.addr).await.unwrap();
    let mut upstream2 = accept(&server).await;
    let packet = Packet::from_parts(5, b"back");
    client2.write_all(packet.as_bytes()).await.unwrap();
    assert_eq!(read_packet(&mut upstream2).await, packet);

    stop(running).await;
}

#[tokio::test]
async fn test_last_server_packet_reaches_client_before_close() {
    let (server, target) = fake_server().await;
    let running = start(Proxy::builder().remote(target)).await;
    let farewell = Packet::from_parts(9, b"goodbye: server full");

    for _ in 0..20 {
        let mut client = TcpStream::connect(running.addr).await.unwrap();
        let mut upstream = accept(&server).await;
        wait_for_phase(&running.handle, Phase::Active).await;

        upstream.write_all(farewell.as_bytes()).await.unwrap();
        drop(upstream);

        let mut received = Vec::new();
        tokio::time::timeout(WAIT, client.read_to_end(&mut received))
            .await
            .expect("client was not closed")
            .unwrap();
        assert_eq!(received, farewell.as_bytes().to_vec());
        wait_for_phase(&running.handle, Phase::Reconnecting).await;
    }

    stop(running).await;
}

#[tokio::test]
async fn test_new_client_takes_over_active_upstream() {
    let (server, target) = fake_server().await;
    let running = start(Proxy::builder().remote(target)).await;

    let mut client1 = TcpStream::connect(running.addr).await.unwrap();
    let mut upstream = accept(&server).await;
    wait_for_phase(&running.handle, Phase::Active).await;
    let generation = running.handle.info().generation;

    let mut client2 = TcpStream::connect(running.addr).await.unwrap();
    expect_eof(&mut client1).await;
    tokio::time::timeout(WAIT, async {
        while running.handle.info().generation == generation {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(running.handle.info().phase, Phase::Active);

    // Same upstream socket serves the new client in both directions
    let request = Packet::from_parts(4, b"from the new client");
    client2.write_all(request.as_bytes()).await.unwrap();
    assert_eq!(read_packet(&mut upstream).await, request);

    let reply = Packet::from_parts(5, b"to the new client");
    upstream.write_all(reply.as_bytes()).await.unwrap();
    assert_eq!(read_packet(&mut client2).await, reply);

    // No second dial happened
    assert!(
        tokio::time::timeout(Duration::from_millis(100), server.accept())
            .await
            .is_err()
    );

    stop(running).await;
}

#[tokio::test]
async fn test_malformed_length_drops_connection() {
    let (server, target) = fake_server().await;
    let running = start(Proxy::builder().remote(target)).await;

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    let mut upstream = accept(&server).await;
    wait_for_phase(&running.handle, Phase::Active).await;

    // Zero length leaves no room for the id byte
    client.write_all(&[0, 0, 0, 0, 1]).await.unwrap();
    expect_eof(&mut client).await;
    expect_eof(&mut upstream).await;
    assert!(!running.handle.info().killed);

    stop(running).await;
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let (server, target) = fake_server().await;
    let running = start(Proxy::builder().remote(target)).await;
    let addr = running.addr;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut upstream = accept(&server).await;
    wait_for_phase(&running.handle, Phase::Active).await;

    let handle = running.handle.clone();
    stop(running).await;

    expect_eof(&mut client).await;
    expect_eof(&mut upstream).await;
    assert_eq!(handle.info().phase, Phase::Killed);
    assert!(handle
        .reconnect(Target::new("127.0.0.1", 1), ReconnectMode::Seamless)
        .is_err());
}
