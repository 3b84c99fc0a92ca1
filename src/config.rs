//! Relay configuration.
//!
//! Both option structs are immutable after startup and are built once from
//! the command line in `cli::config_from_matches`. Defaults match the public
//! EDDN endpoint and conservative client-protection limits.

use std::time::Duration;

/// Options for the upstream ZeroMQ subscription.
#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    /// ZeroMQ endpoint to subscribe to.
    pub zmq_url: String,
    /// Maximum decompressed payload size in bytes. 0 disables the limit.
    pub msg_size_limit: usize,
    /// If true, malformed payloads are logged and dropped; if false they
    /// terminate the subscription (and with it the server).
    pub ignore_decode_errors: bool,
    /// Expected upstream heartbeat interval in seconds.
    pub heartbeat_ivl: f64,
    /// Additional slack on top of the heartbeat interval in seconds.
    pub heartbeat_timeout: f64,
    /// Cap on the reconnect backoff in seconds.
    pub reconnect_ivl_max: f64,
    /// Maximum size of a raw compressed frame in bytes. -1 disables the cap.
    pub max_msg_size: i64,
    /// Upstream receive queue high-water mark.
    pub recv_hwm: i32,
}

impl Default for UpstreamOptions {
    fn default() -> Self {
        UpstreamOptions {
            // https://github.com/EDCD/EDDN#eddn-endpoints
            zmq_url: "tcp://eddn.edcd.io:9500".to_owned(),
            msg_size_limit: 0,
            ignore_decode_errors: true,
            heartbeat_ivl: 180.0,
            heartbeat_timeout: 20.0,
            reconnect_ivl_max: 60.0,
            max_msg_size: -1,
            recv_hwm: 1000,
        }
    }
}

impl UpstreamOptions {
    /// How long the subscription tolerates silence before reconnecting.
    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs_f64((self.heartbeat_ivl + self.heartbeat_timeout).max(1.0))
    }
}

/// Options for the WebSocket relay server.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// TCP bind address.
    pub listen_addr: String,
    /// TCP bind port.
    pub listen_port: u16,
    /// Unix socket path; wins over addr/port when set.
    pub listen_path: Option<String>,
    /// Grace period in seconds before an idle upstream is torn down.
    /// Negative disables lifecycle gating entirely (upstream always on).
    pub close_delay: f64,
    /// HTTP path answering health checks, e.g. "/ping".
    pub ping_path: Option<String>,
    /// Maximum number of concurrent WebSocket clients. 0 disables the cap.
    pub connection_limit: usize,
    /// Per-client outbound buffer cap in bytes. 0 disables the cap.
    pub client_buffer_limit: usize,
    /// Buffer monitor sweep period in seconds. 0 leaves only inline checks.
    pub client_check_interval: f64,
    /// Send text frames instead of binary frames.
    pub send_text: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        RelayOptions {
            listen_addr: "127.0.0.1".to_owned(),
            listen_port: 8081,
            listen_path: None,
            close_delay: 3.3,
            ping_path: None,
            connection_limit: 1000,
            client_buffer_limit: 2 * 1024 * 1024,
            client_check_interval: 1.0,
            send_text: true,
        }
    }
}

impl RelayOptions {
    /// True when the upstream subscription follows client presence.
    pub fn on_demand(&self) -> bool {
        self.close_delay >= 0.0
    }

    /// True when the periodic buffer monitor should run.
    pub fn monitor_enabled(&self) -> bool {
        self.client_check_interval > 0.0 && self.client_buffer_limit > 0
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub upstream: UpstreamOptions,
    pub relay: RelayOptions,
}
