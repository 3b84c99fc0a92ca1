//! The relay engine: connection set, broadcast loop, buffer monitor and
//! upstream lifecycle, all owned by a single task.
//!
//! The engine is the only writer of the connection set and the lifecycle
//! state. Everything else — the front door, client sessions, the server
//! runner — talks to it through [`RelayHandle`] events, so concurrent joins
//! and leaves can never race the broadcast loop.
//!
//! # Lifecycle
//! With a non-negative `close_delay` the upstream subscription is on-demand:
//!
//! - idle + first client     → open the subscription, start the monitor
//! - running + last client   → arm a shutdown deadline (`close_delay` seconds)
//! - deadline + new client   → cancel the deadline
//! - deadline expires        → drop the subscription and monitor
//! - subscription ends/fails → resolve the stop channel (server shutdown)
//!
//! A negative `close_delay` keeps the subscription up for the whole server
//! life regardless of client presence.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RelayOptions;
use crate::upstream::{MessageStream, UpstreamError};

/// Policy violation: the client cannot drain frames fast enough.
pub const CLOSE_SLOW_CONSUMER: u16 = 1008;
/// Try again later: the connection cap was hit after the handshake.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
/// Going away: the server is shutting down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Creates a fresh upstream stream each time the engine starts the relay.
pub type UpstreamFactory = Box<dyn Fn() -> MessageStream + Send>;

/// Why the server is stopping; determines the process exit code.
#[derive(Debug, Clone)]
pub enum StopReason {
    Signal(&'static str),
    Upstream(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Signal(name) => write!(f, "received {name}"),
            StopReason::Upstream(reason) => write!(f, "upstream failed: {reason}"),
        }
    }
}

/// Commands the engine enqueues to a client's writer task.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    Frame(Message),
    Close { code: u16, reason: &'static str },
}

/// One connected WebSocket client as the engine sees it.
///
/// The handle never touches the socket itself; frames and closes go through
/// the unbounded command queue and are executed by the client's own writer
/// task. `buffered` counts enqueued-but-unsent frame bytes — the engine's
/// view of the transport write buffer.
pub struct ClientHandle {
    id: Uuid,
    remote: String,
    commands: mpsc::UnboundedSender<ClientCommand>,
    buffered: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
}

impl ClientHandle {
    /// Create a handle plus the command receiver for the writer task.
    pub fn new(remote: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<ClientCommand>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let handle = ClientHandle {
            id: Uuid::new_v4(),
            remote: remote.into(),
            commands,
            buffered: Arc::new(AtomicUsize::new(0)),
            open: Arc::new(AtomicBool::new(true)),
        };
        (handle, receiver)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Shared counter of enqueued outbound bytes.
    pub fn buffered_counter(&self) -> Arc<AtomicUsize> {
        self.buffered.clone()
    }

    /// Shared OPEN flag; cleared once a close is underway.
    pub fn open_flag(&self) -> Arc<AtomicBool> {
        self.open.clone()
    }
}

/// Events the front door and client sessions send to the engine.
pub enum RelayEvent {
    Join {
        handle: ClientHandle,
        admitted: oneshot::Sender<bool>,
    },
    Leave {
        id: Uuid,
    },
    Shutdown,
}

/// Cheap cloneable handle for talking to the engine task.
#[derive(Clone)]
pub struct RelayHandle {
    events: mpsc::Sender<RelayEvent>,
    active: Arc<AtomicUsize>,
}

impl RelayHandle {
    /// Register a client. Returns false if the connection cap rejected it
    /// or the engine is gone; the caller must then close the socket itself.
    pub async fn join(&self, handle: ClientHandle) -> bool {
        let (admitted, decision) = oneshot::channel();
        if self
            .events
            .send(RelayEvent::Join { handle, admitted })
            .await
            .is_err()
        {
            return false;
        }
        decision.await.unwrap_or(false)
    }

    /// Remove a client after its session ended.
    pub async fn leave(&self, id: Uuid) {
        let _ = self.events.send(RelayEvent::Leave { id }).await;
    }

    /// Stop the engine task.
    pub async fn shutdown(&self) {
        let _ = self.events.send(RelayEvent::Shutdown).await;
    }

    /// Advertised connection count, for the pre-upgrade limit check.
    /// The engine re-checks authoritatively on join.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

enum Step {
    Event(Option<RelayEvent>),
    Upstream(Option<Result<Vec<u8>, UpstreamError>>),
    Deadline,
    Sweep,
}

/// The engine itself; run it with [`Relay::run`] on its own task.
pub struct Relay {
    opts: RelayOptions,
    factory: UpstreamFactory,
    events: mpsc::Receiver<RelayEvent>,
    stop: mpsc::Sender<StopReason>,
    clients: HashMap<Uuid, ClientHandle>,
    active: Arc<AtomicUsize>,
    upstream: Option<MessageStream>,
    monitor: Option<Interval>,
    close_deadline: Option<Instant>,
}

impl Relay {
    pub fn new(
        opts: RelayOptions,
        factory: UpstreamFactory,
        stop: mpsc::Sender<StopReason>,
    ) -> (Self, RelayHandle) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let active = Arc::new(AtomicUsize::new(0));
        let relay = Relay {
            opts,
            factory,
            events: events_rx,
            stop,
            clients: HashMap::new(),
            active: active.clone(),
            upstream: None,
            monitor: None,
            close_deadline: None,
        };
        let handle = RelayHandle {
            events: events_tx,
            active,
        };
        (relay, handle)
    }

    /// Drive the engine until shutdown.
    pub async fn run(mut self) {
        if !self.opts.on_demand() {
            self.relay_start();
        }

        loop {
            let step = tokio::select! {
                event = self.events.recv() => Step::Event(event),
                item = next_message(&mut self.upstream) => Step::Upstream(item),
                () = close_timer(self.close_deadline) => Step::Deadline,
                () = monitor_tick(&mut self.monitor) => Step::Sweep,
            };

            match step {
                Step::Event(None) | Step::Event(Some(RelayEvent::Shutdown)) => break,
                Step::Event(Some(RelayEvent::Join { handle, admitted })) => {
                    self.handle_join(handle, admitted);
                }
                Step::Event(Some(RelayEvent::Leave { id })) => self.handle_leave(id),
                Step::Upstream(Some(Ok(envelope))) => {
                    self.broadcast(envelope);
                    // Yield between envelopes so bursts cannot starve joins,
                    // leaves and the monitor.
                    tokio::task::yield_now().await;
                }
                Step::Upstream(Some(Err(err))) => {
                    error!(error = %err, "upstream subscription failed");
                    let _ = self.stop.try_send(StopReason::Upstream(err.to_string()));
                    self.relay_stop();
                }
                Step::Upstream(None) => {
                    warn!("upstream subscription ended");
                    let _ = self
                        .stop
                        .try_send(StopReason::Upstream("subscription ended".to_owned()));
                    self.relay_stop();
                }
                Step::Deadline => {
                    info!("grace period expired with no clients");
                    self.relay_stop();
                }
                Step::Sweep => self.sweep_buffers(),
            }
        }

        self.shutdown_clients();
        if self.upstream.is_some() {
            self.relay_stop();
        }
    }

    fn handle_join(&mut self, handle: ClientHandle, admitted: oneshot::Sender<bool>) {
        if self.opts.connection_limit > 0 && self.clients.len() >= self.opts.connection_limit {
            info!(
                client = %handle.id,
                remote = %handle.remote,
                active = self.clients.len(),
                "client rejected, connection limit reached"
            );
            let _ = admitted.send(false);
            return;
        }

        if self.opts.on_demand() {
            if self.close_deadline.take().is_some() {
                debug!("pending relay shutdown cancelled");
            }
            if self.upstream.is_none() {
                self.relay_start();
            }
        }

        info!(
            client = %handle.id,
            remote = %handle.remote,
            active = self.clients.len() + 1,
            "client connected"
        );
        self.clients.insert(handle.id, handle);
        self.active.store(self.clients.len(), Ordering::Relaxed);
        let _ = admitted.send(true);
    }

    fn handle_leave(&mut self, id: Uuid) {
        if let Some(client) = self.clients.remove(&id) {
            self.active.store(self.clients.len(), Ordering::Relaxed);
            info!(
                client = %id,
                remote = %client.remote,
                active = self.clients.len(),
                "client disconnected"
            );
        }

        if self.opts.on_demand()
            && self.clients.is_empty()
            && self.upstream.is_some()
            && self.close_deadline.is_none()
        {
            debug!(delay = self.opts.close_delay, "last client gone, scheduling relay shutdown");
            self.close_deadline =
                Some(Instant::now() + Duration::from_secs_f64(self.opts.close_delay));
        }
    }

    fn relay_start(&mut self) {
        if self.upstream.is_some() {
            warn!("relay already running, ignoring duplicate start");
            return;
        }
        info!("starting relay");
        self.upstream = Some((self.factory)());
        self.monitor = self.opts.monitor_enabled().then(|| {
            tokio::time::interval(Duration::from_secs_f64(self.opts.client_check_interval))
        });
        self.close_deadline = None;
    }

    fn relay_stop(&mut self) {
        if self.upstream.is_none() {
            warn!("relay already stopped, ignoring duplicate stop");
            return;
        }
        info!("stopping relay");
        // Dropping the stream closes the upstream socket.
        self.upstream = None;
        self.monitor = None;
        self.close_deadline = None;
    }

    /// Enqueue one envelope to every open client.
    fn broadcast(&mut self, envelope: Vec<u8>) {
        let len = envelope.len();
        let frame = if self.opts.send_text {
            match String::from_utf8(envelope) {
                Ok(text) => Message::Text(text.into()),
                Err(err) => {
                    error!(error = %err, "envelope is not valid UTF-8, dropping");
                    return;
                }
            }
        } else {
            Message::Binary(envelope.into())
        };

        for client in self.clients.values() {
            if !client.open.load(Ordering::Relaxed) {
                continue;
            }
            if self.opts.client_buffer_limit > 0
                && client.buffered.load(Ordering::Relaxed) >= self.opts.client_buffer_limit
            {
                info!(client = %client.id, "write buffer limit reached, disconnecting");
                client.open.store(false, Ordering::Relaxed);
                let _ = client.commands.send(ClientCommand::Close {
                    code: CLOSE_SLOW_CONSUMER,
                    reason: "Write buffer overrun",
                });
                continue;
            }

            client.buffered.fetch_add(len, Ordering::Relaxed);
            if client.commands.send(ClientCommand::Frame(frame.clone())).is_err() {
                // The client's problem, not the broadcast's: its session is
                // tearing down and will deregister itself.
                client.buffered.fetch_sub(len, Ordering::Relaxed);
                warn!(client = %client.id, "failed to enqueue frame");
            }
        }
    }

    /// Periodic sweep disconnecting clients over the buffer limit.
    fn sweep_buffers(&mut self) {
        for client in self.clients.values() {
            if !client.open.load(Ordering::Relaxed) {
                continue;
            }
            let buffered = client.buffered.load(Ordering::Relaxed);
            if buffered > self.opts.client_buffer_limit {
                info!(
                    client = %client.id,
                    buffered,
                    limit = self.opts.client_buffer_limit,
                    "write buffer limit exceeded, disconnecting"
                );
                client.open.store(false, Ordering::Relaxed);
                let _ = client.commands.send(ClientCommand::Close {
                    code: CLOSE_SLOW_CONSUMER,
                    reason: "Write buffer overrun",
                });
            }
        }
    }

    fn shutdown_clients(&mut self) {
        for client in self.clients.values() {
            let _ = client.commands.send(ClientCommand::Close {
                code: CLOSE_GOING_AWAY,
                reason: "Server shutting down",
            });
        }
        self.clients.clear();
        self.active.store(0, Ordering::Relaxed);
    }
}

async fn next_message(
    stream: &mut Option<MessageStream>,
) -> Option<Result<Vec<u8>, UpstreamError>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn close_timer(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn monitor_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
