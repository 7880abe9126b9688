//! Integration tests for the tunnel state machine
//!
//! Each test runs a real local SOCKS5 front-end (accept loop + tunnels)
//! and, where the scenario needs one, a mock SSR server speaking the same
//! chunk codec. Clients are plain `TcpStream`s issuing raw SOCKS5 bytes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use shadow_tunnel::cipher::{Method, Obfs, Protocol, TunnelCipher};
use shadow_tunnel::tunnel::Tunnel;
use shadow_tunnel::{Config, ServerEnv, MAX_CHUNK_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const PASSWORD: &str = "integration-test-password";

/// Initial package for a CONNECT to 8.8.8.8:80
const INIT_PKG: [u8; 7] = [0x01, 8, 8, 8, 8, 0x00, 0x50];

fn test_config(remote: SocketAddr, protocol: &str) -> Config {
    Config {
        remote_host: remote.ip().to_string(),
        remote_port: remote.port(),
        listen_host: "127.0.0.1".to_string(),
        listen_port: 1080,
        udp: true,
        method: "chacha20-poly1305".to_string(),
        protocol: protocol.to_string(),
        obfs: "plain".to_string(),
        password: PASSWORD.to_string(),
        ..Config::default()
    }
}

fn reference_cipher(protocol: Protocol) -> TunnelCipher {
    TunnelCipher::create(
        Method::Chacha20Poly1305,
        protocol,
        Obfs::Plain,
        PASSWORD,
        MAX_CHUNK_SIZE,
    )
    .unwrap()
}

/// Bind an ephemeral SOCKS5 listener and spawn tunnels per connection.
async fn spawn_proxy(env: Arc<ServerEnv>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            Tunnel::spawn(Arc::clone(&env), stream);
        }
    });
    addr
}

/// Drive the SOCKS5 greeting + CONNECT request for 8.8.8.8:80 and assert
/// the success reply echoes the initial package.
async fn socks5_connect(proxy: SocketAddr) -> TcpStream {
    let mut client = TcpStream::connect(proxy).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00];
    request.extend_from_slice(&INIT_PKG);
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..3], &[0x05, 0x00, 0x00]);
    assert_eq!(&reply[3..], &INIT_PKG);

    client
}

/// Mock SSR server for one session. Verifies the initial package both as
/// raw wire bytes (against a reference encoder) and decoded, optionally
/// runs the challenge round, then expects "Hello" and answers "World".
async fn run_mock_ssr_server(listener: TcpListener, with_challenge: bool) {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut server = reference_cipher(Protocol::Origin);

    // The first wire bytes must be byte-equal to a reference encoding of
    // the initial package under the same key.
    let mut expected_wire = INIT_PKG.to_vec();
    reference_cipher(Protocol::Origin)
        .encrypt(&mut expected_wire)
        .unwrap();
    let mut wire = vec![0u8; expected_wire.len()];
    stream.read_exact(&mut wire).await.unwrap();
    assert_eq!(wire, expected_wire, "initial package must match reference encoder");

    let feedback = server.decrypt(&mut wire).unwrap();
    assert!(feedback.is_none());
    assert_eq!(wire, INIT_PKG);

    if with_challenge {
        // Issue the challenge and verify the client's receipt against a
        // reference decoder fed the same wire bytes.
        let mut challenge_wire = b"prove-it".to_vec();
        server.encrypt(&mut challenge_wire).unwrap();
        stream.write_all(&challenge_wire).await.unwrap();

        let mut reference = reference_cipher(Protocol::AuthChallenge);
        let mut copy = challenge_wire.clone();
        let expected_receipt = reference.decrypt(&mut copy).unwrap().unwrap();

        let mut receipt = vec![0u8; expected_receipt.len()];
        stream.read_exact(&mut receipt).await.unwrap();
        assert_eq!(receipt, expected_receipt);
    }

    // Client application data
    let mut plain = Vec::new();
    let mut tmp = [0u8; 2048];
    while plain.len() < 5 {
        let n = stream.read(&mut tmp).await.unwrap();
        assert!(n > 0, "upstream closed before payload arrived");
        let mut chunk = tmp[..n].to_vec();
        server.decrypt(&mut chunk).unwrap();
        plain.extend_from_slice(&chunk);
    }
    assert_eq!(plain, b"Hello");

    // Server application data
    let mut out = b"World".to_vec();
    server.encrypt(&mut out).unwrap();
    stream.write_all(&out).await.unwrap();

    // Hold the connection open until the client side goes away.
    let _ = stream.read(&mut tmp).await;
}

#[tokio::test]
async fn test_happy_path_connect() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let server = tokio::spawn(run_mock_ssr_server(upstream, false));

    let env = Arc::new(ServerEnv::new(test_config(upstream_addr, "origin")));
    let proxy = spawn_proxy(Arc::clone(&env)).await;

    let mut client = socks5_connect(proxy).await;

    client.write_all(b"Hello").await.unwrap();

    let mut world = [0u8; 5];
    client.read_exact(&mut world).await.unwrap();
    assert_eq!(&world, b"World");

    drop(client);
    server.await.unwrap();
}

#[tokio::test]
async fn test_feedback_handshake() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let server = tokio::spawn(run_mock_ssr_server(upstream, true));

    let env = Arc::new(ServerEnv::new(test_config(upstream_addr, "auth-challenge")));
    let proxy = spawn_proxy(Arc::clone(&env)).await;

    // The success reply only arrives after the challenge round completed.
    let mut client = socks5_connect(proxy).await;

    client.write_all(b"Hello").await.unwrap();
    let mut world = [0u8; 5];
    client.read_exact(&mut world).await.unwrap();
    assert_eq!(&world, b"World");

    drop(client);
    server.await.unwrap();
}

#[tokio::test]
async fn test_password_only_method_rejected() {
    let unused: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let env = Arc::new(ServerEnv::new(test_config(unused, "origin")));
    let proxy = spawn_proxy(env).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0xFF]);

    // The tunnel terminates after the rejection lands.
    let mut probe = [0u8; 1];
    assert_eq!(client.read(&mut probe).await.unwrap(), 0);
}

#[tokio::test]
async fn test_bind_rejected_without_reply() {
    let unused: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let env = Arc::new(ServerEnv::new(test_config(unused, "origin")));
    let proxy = spawn_proxy(env).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    client
        .write_all(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50])
        .await
        .unwrap();

    let mut probe = [0u8; 1];
    assert_eq!(client.read(&mut probe).await.unwrap(), 0);
}

#[tokio::test]
async fn test_udp_associate_reply() {
    let unused: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let env = Arc::new(ServerEnv::new(test_config(unused, "origin")));
    let proxy = spawn_proxy(env).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();

    client
        .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();

    // Reply carries the configured local bind: 127.0.0.1:1080.
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(
        reply,
        [0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38]
    );

    let mut probe = [0u8; 1];
    assert_eq!(client.read(&mut probe).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unresolvable_host_replies_host_unreachable() {
    let mut config = test_config("127.0.0.1:9".parse().unwrap(), "origin");
    config.remote_host = "definitely-not-a-real-host.invalid".to_string();
    let env = Arc::new(ServerEnv::new(config));
    let proxy = spawn_proxy(env).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();

    let mut request = vec![0x05, 0x01, 0x00];
    request.extend_from_slice(&INIT_PKG);
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[..4], [0x05, 0x04, 0x00, 0x01]);
}

#[tokio::test]
async fn test_connect_refused_reply() {
    // Nothing listens on the upstream port; the dial must fail and the
    // client must see connection-refused.
    let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let env = Arc::new(ServerEnv::new(test_config(dead_addr, "origin")));
    let proxy = spawn_proxy(env).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();

    let mut request = vec![0x05, 0x01, 0x00];
    request.extend_from_slice(&INIT_PKG);
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[..4], [0x05, 0x05, 0x00, 0x01]);
}

#[tokio::test]
async fn test_shutdown_all_terminates_every_tunnel() {
    let unused: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let env = Arc::new(ServerEnv::new(test_config(unused, "origin")));
    let proxy = spawn_proxy(Arc::clone(&env)).await;

    // Three idle sessions parked in the handshake stage.
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(proxy).await.unwrap());
    }

    wait_until(|| env.registry().len() == 3).await;

    env.registry().shutdown_all();

    wait_until(|| env.registry().is_empty()).await;

    // Every client observes its connection going away.
    for mut client in clients {
        let mut probe = [0u8; 1];
        assert_eq!(client.read(&mut probe).await.unwrap_or(0), 0);
    }
}

/// Poll a condition for up to ~2 seconds of event-loop turns.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
