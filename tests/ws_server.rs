//! End-to-end server tests: health endpoint, connection cap, envelope
//! delivery over real WebSockets (TCP and Unix socket), and shutdown on
//! upstream failure. The upstream is a stub stream injected through the
//! factory, so no ZeroMQ endpoint is needed.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eddnws::config::{Config, RelayOptions, UpstreamOptions};
use eddnws::decode::decode_message;
use eddnws::relay::{StopReason, UpstreamFactory};
use eddnws::server::{self, ServeError};
use eddnws::upstream::{MessageStream, UpstreamError};
use flate2::Compression;
use flate2::write::ZlibEncoder;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite;

type Feed = mpsc::UnboundedSender<Result<Vec<u8>, UpstreamError>>;

#[derive(Clone)]
struct StubUpstream {
    feeds: Arc<Mutex<Vec<Feed>>>,
}

impl StubUpstream {
    fn send(&self, envelope: &[u8]) {
        let feeds = self.feeds.lock().expect("feeds lock");
        feeds
            .last()
            .expect("no subscription opened yet")
            .send(Ok(envelope.to_vec()))
            .expect("stub send");
    }

    fn fail(&self, reason: &str) {
        let feeds = self.feeds.lock().expect("feeds lock");
        feeds
            .last()
            .expect("no subscription opened yet")
            .send(Err(UpstreamError::Worker(reason.to_owned())))
            .expect("stub fail");
    }
}

fn stub_factory() -> (UpstreamFactory, StubUpstream) {
    let stub = StubUpstream {
        feeds: Arc::new(Mutex::new(Vec::new())),
    };
    let factory_stub = stub.clone();
    let factory: UpstreamFactory = Box::new(move || {
        let (feed, receiver) = mpsc::unbounded_channel();
        factory_stub.feeds.lock().expect("feeds lock").push(feed);
        let stream: MessageStream = Box::pin(UnboundedReceiverStream::new(receiver));
        stream
    });
    (factory, stub)
}

fn start_tcp(
    mut opts: RelayOptions,
) -> (
    SocketAddr,
    StubUpstream,
    JoinHandle<Result<StopReason, ServeError>>,
) {
    opts.listen_addr = "127.0.0.1".to_owned();
    opts.listen_port = 0;
    let listener = server::bind(&opts, None).expect("bind");
    let addr = listener.local_addr().expect("tcp address");
    let (factory, stub) = stub_factory();
    let cfg = Config {
        upstream: UpstreamOptions::default(),
        relay: opts,
    };
    let task = tokio::spawn(server::serve(cfg, factory, listener));
    (addr, stub, task)
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("compress test payload");
    encoder.finish().expect("finish test payload")
}

// Helper: make an HTTP request over a raw TCP stream.
async fn http_get(addr: SocketAddr, path: &str) -> (u16, String) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    let mut stream = TcpStream::connect(addr).await.expect("connect failed");
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    stream
        .write_all(request.as_bytes())
        .await
        .expect("write failed");

    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .expect("read failed");

    let status: u16 = response
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("could not parse status code");

    (status, response)
}

#[tokio::test]
async fn ping_path_answers_without_upgrading() {
    let opts = RelayOptions {
        ping_path: Some("/ping".to_owned()),
        ..RelayOptions::default()
    };
    let (addr, _stub, _server) = start_tcp(opts);

    let (status, response) = http_get(addr, "/ping").await;
    assert_eq!(status, 200, "/ping must return 200");
    assert!(
        response.to_lowercase().contains("content-type: text/plain"),
        "ping response must be text/plain, got: {response}"
    );
    assert!(response.ends_with("OK\n"), "ping body must be OK, got: {response}");
}

#[tokio::test]
async fn over_capacity_upgrade_is_rejected_with_503() {
    let opts = RelayOptions {
        connection_limit: 2,
        ..RelayOptions::default()
    };
    let (addr, _stub, _server) = start_tcp(opts);
    let url = format!("ws://{addr}/");

    let (_first, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .expect("first client connects");
    let (_second, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .expect("second client connects");

    // Let both sessions register with the engine before the third tries.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let error = tokio_tungstenite::connect_async(url.as_str())
        .await
        .expect_err("third client must be rejected");
    match error {
        tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 503);
            assert_eq!(
                response.body().as_deref(),
                Some(&b"Connection limit reached\n"[..])
            );
        }
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn relays_canonical_envelopes_over_tcp() {
    let (addr, stub, _server) = start_tcp(RelayOptions::default());

    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
        .await
        .expect("client connects");
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The same document the upstream would deliver: keys out of order,
    // canonicalized by the decoder before it reaches the broadcast path.
    let payload = deflate(br#"{"b":1,"$schemaRef":"x","a":[2,{"d":4,"c":3}]}"#);
    let envelope = decode_message(&payload, 0).expect("decode");
    stub.send(&envelope);

    let received = timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended")
        .expect("frame error");
    assert_eq!(
        received.into_text().expect("text frame").as_str(),
        r#"{"$schemaRef":"x","a":[2,{"c":3,"d":4}],"b":1}"#
    );
}

#[tokio::test]
async fn relays_envelopes_over_a_unix_socket() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("eddnws.sock");
    let opts = RelayOptions {
        listen_path: Some(path.display().to_string()),
        ..RelayOptions::default()
    };

    let listener = server::bind(&opts, None).expect("bind unix socket");
    assert!(listener.local_addr().is_none(), "unix listeners have no TCP address");
    let (factory, stub) = stub_factory();
    let cfg = Config {
        upstream: UpstreamOptions::default(),
        relay: opts,
    };
    let _server = tokio::spawn(server::serve(cfg, factory, listener));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stream = tokio::net::UnixStream::connect(&path)
        .await
        .expect("connect to socket path");
    let (mut client, _) = tokio_tungstenite::client_async("ws://localhost/", stream)
        .await
        .expect("websocket handshake over unix socket");
    tokio::time::sleep(Duration::from_millis(100)).await;

    stub.send(br#"{"$schemaRef":"unix"}"#);

    let received = timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended")
        .expect("frame error");
    assert_eq!(
        received.into_text().expect("text frame").as_str(),
        r#"{"$schemaRef":"unix"}"#
    );
}

#[tokio::test]
async fn upstream_failure_stops_the_server_with_a_reason() {
    let (addr, stub, server) = start_tcp(RelayOptions::default());

    let (_client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
        .await
        .expect("client connects");
    tokio::time::sleep(Duration::from_millis(100)).await;

    stub.fail("subscription lost");

    let result = timeout(Duration::from_secs(5), server)
        .await
        .expect("server must stop")
        .expect("server task panicked")
        .expect("serve returned an error");
    match result {
        StopReason::Upstream(reason) => assert!(reason.contains("subscription lost")),
        other => panic!("expected an upstream stop, got {other:?}"),
    }
}

#[tokio::test]
async fn stale_socket_file_is_reclaimed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("stale.sock");

    // A listener that went away without unlinking its socket file.
    let stale = std::os::unix::net::UnixListener::bind(&path).expect("bind stale");
    drop(stale);
    assert!(path.exists(), "socket file must survive the dead listener");

    let opts = RelayOptions {
        listen_path: Some(path.display().to_string()),
        ..RelayOptions::default()
    };
    let listener = server::bind(&opts, None).expect("stale socket file must be reclaimed");
    drop(listener);
}

#[tokio::test]
async fn live_socket_path_refuses_to_bind() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("live.sock");

    let opts = RelayOptions {
        listen_path: Some(path.display().to_string()),
        ..RelayOptions::default()
    };
    let first = server::bind(&opts, None).expect("first bind");

    let error = server::bind(&opts, None).expect_err("second bind must fail");
    assert!(matches!(error, ServeError::SocketTaken(_)));
    drop(first);
}
