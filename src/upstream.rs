//! Upstream ZeroMQ subscription.
//!
//! `subscribe` returns a lazy, single-consumer stream of canonical message
//! envelopes. The stream owns the SUB socket for its whole life: dropping the
//! stream (cancellation) closes the socket immediately, on every exit path.
//!
//! # Reconnection
//! The first connection attempt failing is fatal — it almost always means a
//! bad endpoint. After that, receive errors and liveness-window expiries tear
//! the socket down and reconnect with exponential backoff capped at
//! `reconnect_ivl_max`; consumers observe nothing but a gap in the stream.
//!
//! Decompression and canonicalization are CPU-bound and run on the blocking
//! worker pool, one payload at a time so arrival order is preserved.

use std::time::Duration;

use async_stream::stream;
use futures_util::stream::BoxStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use zeromq::{Socket, SocketRecv, SubSocket, ZmqError};

use crate::config::UpstreamOptions;
use crate::decode::{DecodeError, decode_message};

/// A stream of canonical envelopes; ends after yielding an error.
pub type MessageStream = BoxStream<'static, Result<Vec<u8>, UpstreamError>>;

/// Initial reconnect backoff; doubles up to `reconnect_ivl_max`.
const RECONNECT_IVL_MIN: Duration = Duration::from_millis(100);

/// Failures that terminate the subscription stream.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream transport error: {0}")]
    Transport(#[from] ZmqError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("decode worker failed: {0}")]
    Worker(String),
}

/// Open a subscription to `options.zmq_url` and stream envelopes from it.
pub fn subscribe(options: UpstreamOptions) -> MessageStream {
    Box::pin(stream! {
        let liveness = options.liveness_window();
        let backoff_max = Duration::from_secs_f64(options.reconnect_ivl_max.max(0.1));
        let mut backoff = RECONNECT_IVL_MIN;
        let mut connected_once = false;

        'session: loop {
            let mut socket = match open(&options).await {
                Ok(socket) => {
                    backoff = RECONNECT_IVL_MIN;
                    connected_once = true;
                    socket
                }
                Err(err) if connected_once => {
                    warn!(error = %err, delay = ?backoff, "reconnect failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(backoff_max);
                    continue 'session;
                }
                Err(err) => {
                    yield Err(UpstreamError::Transport(err));
                    break 'session;
                }
            };

            loop {
                let message = match timeout(liveness, socket.recv()).await {
                    Err(_) => {
                        warn!(window = ?liveness, "no upstream traffic within the liveness window, reconnecting");
                        break;
                    }
                    Ok(Err(err)) => {
                        warn!(error = %err, "upstream receive failed, reconnecting");
                        break;
                    }
                    Ok(Ok(message)) => message,
                };

                let Some(payload) = message.get(0).map(|frame| frame.to_vec()) else {
                    warn!("empty multipart message from upstream");
                    continue;
                };
                if options.max_msg_size >= 0 && payload.len() as i64 > options.max_msg_size {
                    warn!(
                        size = payload.len(),
                        limit = options.max_msg_size,
                        "compressed frame over size cap, dropping"
                    );
                    continue;
                }

                let limit = options.msg_size_limit;
                match tokio::task::spawn_blocking(move || decode_message(&payload, limit)).await {
                    Ok(Ok(envelope)) => yield Ok(envelope),
                    Ok(Err(err)) => {
                        if options.ignore_decode_errors {
                            error!(error = %err, "dropping malformed upstream payload");
                        } else {
                            yield Err(UpstreamError::Decode(err));
                            break 'session;
                        }
                    }
                    Err(err) => {
                        yield Err(UpstreamError::Worker(err.to_string()));
                        break 'session;
                    }
                }
            }

            drop(socket);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(backoff_max);
        }

        debug!("upstream subscription closed");
    })
}

/// Connect a fresh SUB socket subscribed to all topics.
async fn open(options: &UpstreamOptions) -> Result<SubSocket, ZmqError> {
    info!(url = %options.zmq_url, "connecting to upstream");
    let mut socket = SubSocket::new();
    socket.connect(&options.zmq_url).await?;
    socket.subscribe("").await?;
    Ok(socket)
}
