//! HTTP/WebSocket front door and server runner.
//!
//! A single fallback route serves every path: the configured ping path gets a
//! plain-text health reply, WebSocket upgrades are capped and promoted into
//! the relay engine, and anything else receives the framework's upgrade
//! rejection.
//!
//! The runner picks its listener in priority order — pre-opened socket from
//! the init system, Unix socket path, TCP address — and serves until the stop
//! channel resolves (termination signal or upstream failure).

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{Config, RelayOptions};
use crate::relay::{
    CLOSE_TRY_AGAIN_LATER, ClientCommand, ClientHandle, Relay, RelayHandle, StopReason,
    UpstreamFactory,
};
use crate::systemd::PreopenedListener;

/// Clients are expected to send nothing but pongs; anything larger than this
/// is a protocol violation.
const MAX_INBOUND_MESSAGE: usize = 4 * 1024;

/// Startup failures.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("failed to bind {0}: {1}")]
    Bind(String, #[source] std::io::Error),
    #[error("socket path {} is already in use by a live listener", .0.display())]
    SocketTaken(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A bound listening endpoint, ready to serve.
#[derive(Debug)]
pub enum BoundListener {
    Tcp(tokio::net::TcpListener),
    /// The path is kept so the socket file can be removed at shutdown;
    /// pre-opened sockets carry no path.
    Unix(tokio::net::UnixListener, Option<PathBuf>),
}

impl BoundListener {
    /// The bound TCP address, when listening on TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            BoundListener::Tcp(listener) => listener.local_addr().ok(),
            BoundListener::Unix(..) => None,
        }
    }
}

/// Bind the configured endpoint and serve until stopped.
pub async fn run(
    cfg: Config,
    factory: UpstreamFactory,
    preopened: Option<PreopenedListener>,
) -> Result<StopReason, ServeError> {
    let listener = bind(&cfg.relay, preopened)?;
    serve(cfg, factory, listener).await
}

/// Pick and bind the listening endpoint: pre-opened socket, then Unix path,
/// then TCP address.
pub fn bind(
    opts: &RelayOptions,
    preopened: Option<PreopenedListener>,
) -> Result<BoundListener, ServeError> {
    if let Some(listener) = preopened {
        return match listener {
            PreopenedListener::Tcp(listener) => {
                listener.set_nonblocking(true)?;
                Ok(BoundListener::Tcp(tokio::net::TcpListener::from_std(listener)?))
            }
            PreopenedListener::Unix(listener) => {
                listener.set_nonblocking(true)?;
                Ok(BoundListener::Unix(
                    tokio::net::UnixListener::from_std(listener)?,
                    None,
                ))
            }
        };
    }

    if let Some(path) = &opts.listen_path {
        return bind_unix(Path::new(path));
    }

    let addr = format!("{}:{}", opts.listen_addr, opts.listen_port);
    let listener = std::net::TcpListener::bind(&addr).map_err(|err| ServeError::Bind(addr, err))?;
    listener.set_nonblocking(true)?;
    Ok(BoundListener::Tcp(tokio::net::TcpListener::from_std(listener)?))
}

/// Bind a Unix socket, reclaiming a stale socket file when nothing answers it.
fn bind_unix(path: &Path) -> Result<BoundListener, ServeError> {
    match tokio::net::UnixListener::bind(path) {
        Ok(listener) => Ok(BoundListener::Unix(listener, Some(path.to_path_buf()))),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                return Err(ServeError::SocketTaken(path.to_path_buf()));
            }
            warn!(path = %path.display(), "removing stale socket file");
            std::fs::remove_file(path)?;
            let listener = tokio::net::UnixListener::bind(path)
                .map_err(|err| ServeError::Bind(path.display().to_string(), err))?;
            Ok(BoundListener::Unix(listener, Some(path.to_path_buf())))
        }
        Err(err) => Err(ServeError::Bind(path.display().to_string(), err)),
    }
}

/// Serve a bound listener until a signal or an upstream failure stops it.
pub async fn serve(
    cfg: Config,
    factory: UpstreamFactory,
    listener: BoundListener,
) -> Result<StopReason, ServeError> {
    let (stop_tx, mut stop_rx) = mpsc::channel::<StopReason>(4);
    let (relay, handle) = Relay::new(cfg.relay.clone(), factory, stop_tx.clone());
    let engine = tokio::spawn(relay.run());
    spawn_signal_listener(stop_tx);

    let reason = match listener {
        BoundListener::Tcp(listener) => {
            if let Ok(addr) = listener.local_addr() {
                info!(addr = %addr, "websocket server listening");
            }
            let router = build_router(handle.clone(), cfg.relay, true);
            let server =
                axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
                    .into_future();
            tokio::select! {
                result = server => {
                    result?;
                    StopReason::Upstream("listener closed".to_owned())
                }
                reason = stop_rx.recv() => reason.unwrap_or(StopReason::Signal("stop channel closed")),
            }
        }
        BoundListener::Unix(listener, bound_path) => {
            if let Some(path) = &bound_path {
                info!(path = %path.display(), "websocket server listening");
            }
            let router = build_router(handle.clone(), cfg.relay, false);
            let server = axum::serve(listener, router.into_make_service()).into_future();
            let reason = tokio::select! {
                result = server => {
                    result?;
                    StopReason::Upstream("listener closed".to_owned())
                }
                reason = stop_rx.recv() => reason.unwrap_or(StopReason::Signal("stop channel closed")),
            };
            if let Some(path) = bound_path {
                let _ = std::fs::remove_file(path);
            }
            reason
        }
    };

    info!(reason = %reason, "stopping websocket server");
    handle.shutdown().await;
    let _ = engine.await;
    Ok(reason)
}

/// Resolve the stop channel on SIGTERM, SIGINT or SIGHUP.
fn spawn_signal_listener(stop: mpsc::Sender<StopReason>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut interrupt =
            signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut hangup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

        let name = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
            _ = hangup.recv() => "SIGHUP",
        };
        let _ = stop.send(StopReason::Signal(name)).await;
    });
}

#[derive(Clone)]
struct AppState {
    relay: RelayHandle,
    opts: Arc<RelayOptions>,
}

fn build_router(relay: RelayHandle, opts: RelayOptions, with_peer_addr: bool) -> Router {
    let state = AppState {
        relay,
        opts: Arc::new(opts),
    };
    let router = if with_peer_addr {
        Router::new().fallback(front_door_tcp)
    } else {
        Router::new().fallback(front_door_local)
    };
    router.with_state(state)
}

async fn front_door_tcp(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    uri: Uri,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    accept(state, uri, upgrade, peer.to_string()).await
}

async fn front_door_local(
    State(state): State<AppState>,
    uri: Uri,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    accept(state, uri, upgrade, "unix".to_owned()).await
}

/// Answer health checks, enforce the connection cap, upgrade the rest.
async fn accept(
    state: AppState,
    uri: Uri,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    remote: String,
) -> Response {
    if let Some(ping_path) = &state.opts.ping_path {
        if uri.path() == ping_path {
            return ([(header::CONTENT_TYPE, "text/plain")], "OK\n").into_response();
        }
    }

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    // Cheap pre-upgrade check against the advertised count; the engine
    // re-checks on join since parallel handshakes can race past this.
    let limit = state.opts.connection_limit;
    if limit > 0 && state.relay.active() >= limit {
        info!(
            remote = %remote,
            active = state.relay.active(),
            "client rejected, connection limit reached"
        );
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain")],
            "Connection limit reached\n",
        )
            .into_response();
    }

    upgrade
        .max_message_size(MAX_INBOUND_MESSAGE)
        .max_frame_size(MAX_INBOUND_MESSAGE)
        .on_upgrade(move |socket| client_session(socket, state, remote))
}

/// Drive one client connection from admission to deregistration.
async fn client_session(socket: WebSocket, state: AppState, remote: String) {
    let (handle, commands) = ClientHandle::new(remote);
    let id = handle.id();
    let buffered = handle.buffered_counter();
    let open = handle.open_flag();

    if !state.relay.join(handle).await {
        let mut socket = socket;
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_TRY_AGAIN_LATER,
                reason: Utf8Bytes::from_static("Connection limit reached"),
            })))
            .await;
        return;
    }

    let (sink, stream) = socket.split();
    tokio::select! {
        () = write_loop(sink, commands, buffered, open.clone()) => {}
        () = read_loop(stream) => {}
    }

    open.store(false, Ordering::Relaxed);
    state.relay.leave(id).await;
}

/// Drain the command queue into the socket, keeping the buffered-byte
/// counter honest.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    buffered: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            ClientCommand::Frame(frame) => {
                let len = frame_len(&frame);
                if sink.send(frame).await.is_err() {
                    break;
                }
                buffered.fetch_sub(len, Ordering::Relaxed);
            }
            ClientCommand::Close { code, reason } => {
                open.store(false, Ordering::Relaxed);
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: Utf8Bytes::from_static(reason),
                    })))
                    .await;
                break;
            }
        }
    }
}

/// Drain inbound frames until the peer goes away. Pings are answered by the
/// protocol layer; everything else is ignored.
async fn read_loop(mut stream: SplitStream<WebSocket>) {
    while let Some(received) = stream.next().await {
        match received {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

fn frame_len(frame: &Message) -> usize {
    match frame {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    }
}
