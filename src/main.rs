// eddnws: Subscribes to the EDDN ZeroMQ firehose and relays normalized
// messages to WebSocket clients over TCP or a Unix socket.

use std::process::ExitCode;

use tracing::{error, info};

use eddnws::relay::{StopReason, UpstreamFactory};
use eddnws::{cli, server, systemd, upstream};

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli::command().get_matches();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(cli::verbosity_filter(
                    matches.get_count("verbose"),
                ))
            }),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "eddnws starting");

    let cfg = cli::config_from_matches(&matches);

    let preopened = if matches.get_flag("systemd") {
        match systemd::take_listener() {
            Ok(Some(listener)) => Some(listener),
            Ok(None) => {
                eprintln!("FATAL: --systemd set but no socket was passed");
                return ExitCode::FAILURE;
            }
            Err(err) => {
                eprintln!("FATAL: {err}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        None
    };

    let upstream_opts = cfg.upstream.clone();
    let factory: UpstreamFactory = Box::new(move || upstream::subscribe(upstream_opts.clone()));

    match server::run(cfg, factory, preopened).await {
        Ok(StopReason::Signal(name)) => {
            info!(signal = name, "clean shutdown");
            ExitCode::SUCCESS
        }
        Ok(StopReason::Upstream(reason)) => {
            error!(reason = %reason, "shut down after upstream failure");
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("FATAL: {err}");
            ExitCode::FAILURE
        }
    }
}
