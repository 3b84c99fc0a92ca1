//! Socket activation via the sd_listen_fds protocol.
//!
//! systemd passes listening sockets as fds starting at 3 and announces them
//! through `LISTEN_PID` / `LISTEN_FDS`. Only the first fd is consumed; the
//! address family is probed so both `ListenStream` TCP and Unix sockets work.

use std::env;
use std::os::fd::{FromRawFd, IntoRawFd, RawFd};

use tracing::warn;

/// First fd used for passed sockets (SD_LISTEN_FDS_START).
pub const LISTEN_FDS_START: RawFd = 3;

/// A listening socket handed in by the init system.
#[derive(Debug)]
pub enum PreopenedListener {
    Tcp(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SystemdError {
    #[error("LISTEN_PID={0} does not match this process (pid {1})")]
    PidMismatch(String, u32),
    #[error("invalid {name} value {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

/// Consume the socket passed by the init system, if any.
pub fn take_listener() -> Result<Option<PreopenedListener>, SystemdError> {
    let pid = env::var("LISTEN_PID").ok();
    let fds = env::var("LISTEN_FDS").ok();
    let count = match check_listen_env(pid.as_deref(), fds.as_deref(), std::process::id())? {
        Some(count) => count,
        None => return Ok(None),
    };
    if count > 1 {
        warn!(count, "multiple sockets passed, using the first");
    }

    // SAFETY: fd 3 is the first passed socket per the sd_listen_fds contract;
    // this process takes sole ownership of it from here on.
    let tcp = unsafe { std::net::TcpListener::from_raw_fd(LISTEN_FDS_START) };
    if tcp.local_addr().is_ok() {
        return Ok(Some(PreopenedListener::Tcp(tcp)));
    }

    // Not an inet socket; re-wrap the same fd as a Unix listener.
    let fd = tcp.into_raw_fd();
    // SAFETY: ownership of the fd moves straight from the TcpListener above.
    let unix = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
    Ok(Some(PreopenedListener::Unix(unix)))
}

/// Validate `LISTEN_PID` / `LISTEN_FDS` and return the passed fd count.
fn check_listen_env(
    pid: Option<&str>,
    fds: Option<&str>,
    own_pid: u32,
) -> Result<Option<u32>, SystemdError> {
    let Some(pid) = pid else { return Ok(None) };
    let parsed: u32 = pid.trim().parse().map_err(|_| SystemdError::InvalidValue {
        name: "LISTEN_PID",
        value: pid.to_owned(),
    })?;
    if parsed != own_pid {
        return Err(SystemdError::PidMismatch(pid.to_owned(), own_pid));
    }

    let Some(fds) = fds else { return Ok(None) };
    let count: u32 = fds.trim().parse().map_err(|_| SystemdError::InvalidValue {
        name: "LISTEN_FDS",
        value: fds.to_owned(),
    })?;
    if count == 0 {
        return Ok(None);
    }
    Ok(Some(count))
}
