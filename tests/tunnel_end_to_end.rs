//! End-to-end scenarios from spec.md §8, driven against a real
//! `TunnelAgent`/`Client` pair over loopback TCP, with a hand-rolled
//! "fake tunnel client" standing in for the real remote client this
//! crate is designed to serve.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use tunnelhub::config::Config;
use tunnelhub::manager::ClientManager;
use tunnelhub::server;
use tunnelhub::state::{AppState, HubMetrics};

fn test_config(domain: &str, max_tcp_sockets: usize, socket_timeout_ms: u64) -> Config {
    Config {
        bind_addr: "127.0.0.1:0".to_string(),
        domain: domain.to_string(),
        secure: false,
        landing: None,
        max_tcp_sockets,
        socket_timeout_ms,
        max_clients: None,
        public_ip_timeout_ms: 50,
        log_level: "error".to_string(),
        log_json: false,
    }
}

/// Boots a public hub server on an OS-chosen loopback port and returns its
/// state, address, and the shutdown handle (which must be kept alive for
/// the duration of the test — dropping it tears the server down).
async fn spawn_hub(config: Config) -> (Arc<AppState>, SocketAddr, watch::Sender<bool>) {
    let manager = ClientManager::new(
        config.max_clients,
        config.max_tcp_sockets,
        Duration::from_millis(config.socket_timeout_ms),
        config.domain.clone(),
        config.url_scheme(),
    );
    let state = Arc::new(AppState {
        config: Arc::new(config),
        manager,
        reqwest_client: reqwest::Client::new(),
        metrics: Arc::new(HubMetrics::new()),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let serve_state = Arc::clone(&state);
    tokio::spawn(server::serve(listener, serve_state, shutdown_rx));

    (state, addr, shutdown_tx)
}

/// Connects a raw TCP socket to the public server, writes `request` and
/// reads the full response until the peer closes (works for any response
/// that sets `Connection: close`, which every plain-request reply here
/// does by virtue of the client only issuing one request per socket).
async fn http_roundtrip(addr: SocketAddr, request: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let text = String::from_utf8_lossy(&buf).to_string();

    let status_line = text.lines().next().unwrap_or_default();
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    (status, text)
}

/// Reads bytes off `stream` until the header block (`\r\n\r\n`) is
/// complete, returning the parsed status code and any bytes already read
/// past the header block (relevant for upgrade responses, where the raw
/// spliced stream may start in the same TCP segment as the 101 response).
async fn read_status_and_leftover(stream: &mut TcpStream) -> (u16, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before headers completed");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_double_crlf(&buf) {
            let header_text = String::from_utf8_lossy(&buf[..pos]).to_string();
            let status = header_text
                .lines()
                .next()
                .unwrap_or_default()
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let leftover = buf[pos + 4..].to_vec();
            return (status, leftover);
        }
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[tokio::test]
async fn happy_path_request_is_bridged_through_a_tunnel_socket() {
    let (state, addr, _keepalive) = spawn_hub(test_config("example.com", 10, 60_000)).await;

    let info = state.manager.new_client(Some("foo")).await.unwrap();
    assert_eq!(info.id, "foo");

    // The remote client dials in, waits for the proxied request, and
    // answers with a canned response.
    let fake_client = tokio::spawn(async move {
        let mut tunnel = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
        let mut buf = [0u8; 4096];
        let n = tunnel.read(&mut buf).await.unwrap();
        let req = String::from_utf8_lossy(&buf[..n]);
        assert!(req.starts_with("GET /hello HTTP/1.1"));
        tunnel
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
    });

    let request = format!(
        "GET /hello HTTP/1.1\r\nHost: foo.example.com\r\nConnection: close\r\n\r\n"
    );
    let (status, text) = http_roundtrip(addr, &request).await;

    fake_client.await.unwrap();
    assert_eq!(status, 200);
    assert!(text.ends_with("hello"));
}

#[tokio::test]
async fn missing_client_id_yields_404() {
    let (_state, addr, _keepalive) = spawn_hub(test_config("example.com", 10, 60_000)).await;

    let request =
        "GET /anything HTTP/1.1\r\nHost: nosuchclient.example.com\r\nConnection: close\r\n\r\n";
    let (status, text) = http_roundtrip(addr, request).await;

    assert_eq!(status, 404);
    assert!(text.ends_with("404"));
}

#[tokio::test]
async fn queueing_second_request_waits_for_a_fresh_dial() {
    let (state, addr, _keepalive) = spawn_hub(test_config("example.com", 1, 60_000)).await;
    let info = state.manager.new_client(Some("bar")).await.unwrap();
    let port = info.port;

    // R1 gets the only dialed-in socket.
    let fake_client_1 = tokio::spawn(async move {
        let mut tunnel = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = tunnel.read(&mut buf).await.unwrap();
        tunnel
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nr1")
            .await
            .unwrap();
    });
    // Give R1's dial a moment to be admitted before R1 fires.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let request = "GET /one HTTP/1.1\r\nHost: bar.example.com\r\nConnection: close\r\n\r\n";
    let (status1, text1) = http_roundtrip(addr, request).await;
    fake_client_1.await.unwrap();
    assert_eq!(status1, 200);
    assert!(text1.ends_with("r1"));

    // R2 is issued before any socket is available and must park until a
    // fresh dial satisfies it.
    let addr2 = addr;
    let r2 = tokio::spawn(async move {
        let request = "GET /two HTTP/1.1\r\nHost: bar.example.com\r\nConnection: close\r\n\r\n";
        http_roundtrip(addr2, request).await
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    let fake_client_2 = tokio::spawn(async move {
        let mut tunnel = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = tunnel.read(&mut buf).await.unwrap();
        tunnel
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nr2")
            .await
            .unwrap();
    });

    let (status2, text2) = tokio::time::timeout(Duration::from_secs(2), r2)
        .await
        .unwrap()
        .unwrap();
    fake_client_2.await.unwrap();
    assert_eq!(status2, 200);
    assert!(text2.ends_with("r2"));

    // Once R2's socket closes with nothing left parked, the agent has
    // genuinely gone idle and is torn down immediately (spec.md §4.3: no
    // grace period), removing "bar" from the registry entirely.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(state.manager.get_client("bar").await.is_none());
}

#[tokio::test]
async fn over_budget_dial_is_dropped_without_affecting_the_counter() {
    let (state, _addr, _keepalive) = spawn_hub(test_config("example.com", 2, 60_000)).await;
    let info = state.manager.new_client(Some("cap")).await.unwrap();

    let _s1 = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
    let _s2 = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
    let _s3 = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = state.manager.get_client("cap").await.unwrap();
    assert_eq!(client.tunnel_stats().await.connected_sockets, 2);
}

#[tokio::test]
async fn client_disconnect_before_response_headers_yields_502() {
    let (state, addr, _keepalive) = spawn_hub(test_config("example.com", 10, 60_000)).await;
    let info = state.manager.new_client(Some("bad")).await.unwrap();
    let port = info.port;

    // Dial in, then close without ever writing a response.
    let fake_client = tokio::spawn(async move {
        let mut tunnel = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = tunnel.read(&mut buf).await.unwrap();
        // Drop without responding: the in-flight request sees the
        // connection reset before any response headers arrive.
    });
    fake_client.await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let request = "GET /x HTTP/1.1\r\nHost: bad.example.com\r\nConnection: close\r\n\r\n";
    let (status, text) = http_roundtrip(addr, request).await;

    assert_eq!(status, 502);
    assert!(text.contains("client bad failed"));

    // The disconnected socket closes with no waiter parked behind it, so
    // "bad" loses its identifier immediately rather than lingering with a
    // zero socket count (spec.md §4.3: no grace period).
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(state.manager.get_client("bad").await.is_none());
}

#[tokio::test]
async fn identifier_collision_falls_back_to_a_random_id() {
    let (state, _addr, _keepalive) = spawn_hub(test_config("example.com", 10, 60_000)).await;

    let first = state.manager.new_client(Some("dup")).await.unwrap();
    assert_eq!(first.id, "dup");

    let second = state.manager.new_client(Some("dup")).await.unwrap();
    assert_ne!(second.id, "dup");
    assert_ne!(second.port, first.port);
}

#[tokio::test]
async fn upgrade_splices_bytes_in_both_directions() {
    let (state, addr, _keepalive) = spawn_hub(test_config("example.com", 10, 60_000)).await;
    let info = state.manager.new_client(Some("ws")).await.unwrap();
    let port = info.port;

    let fake_client = tokio::spawn(async move {
        let mut tunnel = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 4096];
        let n = tunnel.read(&mut buf).await.unwrap();
        let req = String::from_utf8_lossy(&buf[..n]);
        assert!(req.to_ascii_lowercase().contains("upgrade: websocket"));

        tunnel
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
            .await
            .unwrap();

        let mut from_public = [0u8; 5];
        tunnel.read_exact(&mut from_public).await.unwrap();
        assert_eq!(&from_public, b"ABCDE");

        tunnel.write_all(b"FGHIJ").await.unwrap();
    });

    let mut public_stream = TcpStream::connect(addr).await.unwrap();
    let request = "GET /socket HTTP/1.1\r\nHost: ws.example.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n";
    public_stream.write_all(request.as_bytes()).await.unwrap();

    let (status, leftover) = read_status_and_leftover(&mut public_stream).await;
    assert_eq!(status, 101);
    assert!(leftover.is_empty());

    public_stream.write_all(b"ABCDE").await.unwrap();

    let mut from_tunnel = [0u8; 5];
    public_stream.read_exact(&mut from_tunnel).await.unwrap();
    assert_eq!(&from_tunnel, b"FGHIJ");

    fake_client.await.unwrap();
    drop(public_stream);
    // Both spliced sides have closed and nothing is parked behind "ws",
    // so the agent is destroyed immediately rather than left registered
    // with a zero socket count.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(state.manager.get_client("ws").await.is_none());
}
