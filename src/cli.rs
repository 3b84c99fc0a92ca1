//! Command line definition and option assembly.

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};

use crate::config::{Config, RelayOptions, UpstreamOptions};

pub fn command() -> Command {
    Command::new("eddnws")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Relays the EDDN ZeroMQ firehose to WebSocket subscribers")
        .arg(
            Arg::new("verbose")
                .help("Increase log verbosity (-v info, -vv debug)")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("systemd")
                .help("Consume a listening socket passed by systemd")
                .long("systemd")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("ping_path")
                .help("Answer HTTP health checks on this path, e.g. /ping")
                .long("ping-path")
                .value_name("PATH"),
        )
        .arg(
            Arg::new("url")
                .help("ZeroMQ endpoint to subscribe to")
                .short('u')
                .long("url")
                .value_name("URL")
                .default_value("tcp://eddn.edcd.io:9500"),
        )
        .arg(
            Arg::new("close_delay")
                .help("Seconds to keep the upstream alive after the last client leaves; negative keeps it always on")
                .short('d')
                .long("zmq-close-delay")
                .value_name("SECONDS")
                .value_parser(value_parser!(f64))
                .allow_hyphen_values(true)
                .default_value("3.3"),
        )
        .arg(
            Arg::new("size_limit")
                .help("Decompressed payload size limit in bytes (0 = unlimited)")
                .long("size-limit")
                .value_name("BYTES")
                .value_parser(value_parser!(usize))
                .default_value("0"),
        )
        .arg(
            Arg::new("heartbeat_ivl")
                .help("Expected upstream heartbeat interval in seconds")
                .long("zmq-HEARTBEAT_IVL")
                .value_name("SECONDS")
                .value_parser(value_parser!(f64))
                .default_value("180"),
        )
        .arg(
            Arg::new("heartbeat_timeout")
                .help("Extra seconds of upstream silence tolerated past the heartbeat interval")
                .long("zmq-HEARTBEAT_TIMEOUT")
                .value_name("SECONDS")
                .value_parser(value_parser!(f64))
                .default_value("20"),
        )
        .arg(
            Arg::new("reconnect_ivl_max")
                .help("Upper bound on the upstream reconnect backoff in seconds")
                .long("zmq-RECONNECT_IVL_MAX")
                .value_name("SECONDS")
                .value_parser(value_parser!(f64))
                .default_value("60"),
        )
        .arg(
            Arg::new("maxmsgsize")
                .help("Compressed frame size limit in bytes (-1 = unlimited)")
                .long("zmq-MAXMSGSIZE")
                .value_name("BYTES")
                .value_parser(value_parser!(i64))
                .allow_hyphen_values(true)
                .default_value("-1"),
        )
        .arg(
            Arg::new("rcvhwm")
                .help("Upstream receive queue high-water mark")
                .long("zmq-RCVHWM")
                .value_name("NUM")
                .value_parser(value_parser!(i32))
                .default_value("1000"),
        )
        .arg(
            Arg::new("socket")
                .help("Listen on a Unix socket path instead of TCP")
                .short('s')
                .long("socket")
                .value_name("PATH"),
        )
        .arg(
            Arg::new("addr")
                .help("TCP address to bind to")
                .short('a')
                .long("addr")
                .value_name("ADDR")
                .default_value("127.0.0.1"),
        )
        .arg(
            Arg::new("port")
                .help("TCP port to bind to")
                .short('p')
                .long("port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .default_value("8081"),
        )
        .arg(
            Arg::new("connection_limit")
                .help("Maximum number of concurrent WebSocket clients (0 = unlimited)")
                .long("connection-limit")
                .value_name("NUM")
                .value_parser(value_parser!(usize))
                .default_value("1000"),
        )
        .arg(
            Arg::new("client_buffer_limit")
                .help("Per-client outbound buffer limit in bytes (0 = unlimited)")
                .long("client-buffer-limit")
                .value_name("BYTES")
                .value_parser(value_parser!(usize))
                .default_value("2097152"),
        )
        .arg(
            Arg::new("client_check_interval")
                .help("Buffer monitor sweep period in seconds (0 = inline checks only)")
                .long("client-check-interval")
                .value_name("SECONDS")
                .value_parser(value_parser!(f64))
                .default_value("1"),
        )
        .arg(
            Arg::new("binary")
                .help("Send binary WebSocket frames instead of text")
                .long("binary")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("strict_decode")
                .help("Exit on malformed upstream payloads instead of dropping them")
                .long("strict-decode")
                .action(ArgAction::SetTrue),
        )
}

/// Map `-v` repetitions to a default log filter, clamped between warn and
/// debug. `RUST_LOG` overrides this when set.
pub fn verbosity_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

pub fn config_from_matches(matches: &ArgMatches) -> Config {
    let upstream = UpstreamOptions {
        zmq_url: matches
            .get_one::<String>("url")
            .expect("url has a default")
            .clone(),
        msg_size_limit: *matches
            .get_one::<usize>("size_limit")
            .expect("size-limit has a default"),
        ignore_decode_errors: !matches.get_flag("strict_decode"),
        heartbeat_ivl: *matches
            .get_one::<f64>("heartbeat_ivl")
            .expect("heartbeat interval has a default"),
        heartbeat_timeout: *matches
            .get_one::<f64>("heartbeat_timeout")
            .expect("heartbeat timeout has a default"),
        reconnect_ivl_max: *matches
            .get_one::<f64>("reconnect_ivl_max")
            .expect("reconnect interval has a default"),
        max_msg_size: *matches
            .get_one::<i64>("maxmsgsize")
            .expect("maxmsgsize has a default"),
        recv_hwm: *matches
            .get_one::<i32>("rcvhwm")
            .expect("rcvhwm has a default"),
    };

    let relay = RelayOptions {
        listen_addr: matches
            .get_one::<String>("addr")
            .expect("addr has a default")
            .clone(),
        listen_port: *matches.get_one::<u16>("port").expect("port has a default"),
        listen_path: matches.get_one::<String>("socket").cloned(),
        close_delay: *matches
            .get_one::<f64>("close_delay")
            .expect("close delay has a default"),
        ping_path: matches.get_one::<String>("ping_path").cloned(),
        connection_limit: *matches
            .get_one::<usize>("connection_limit")
            .expect("connection limit has a default"),
        client_buffer_limit: *matches
            .get_one::<usize>("client_buffer_limit")
            .expect("buffer limit has a default"),
        client_check_interval: *matches
            .get_one::<f64>("client_check_interval")
            .expect("check interval has a default"),
        send_text: !matches.get_flag("binary"),
    };

    Config { upstream, relay }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        command().debug_assert();
    }

    #[test]
    fn defaults_match_the_public_endpoint() {
        let matches = command().try_get_matches_from(["eddnws"]).expect("parse");
        let cfg = config_from_matches(&matches);
        assert_eq!(cfg.upstream.zmq_url, "tcp://eddn.edcd.io:9500");
        assert_eq!(cfg.upstream.msg_size_limit, 0);
        assert!(cfg.upstream.ignore_decode_errors);
        assert_eq!(cfg.upstream.max_msg_size, -1);
        assert_eq!(cfg.upstream.recv_hwm, 1000);
        assert_eq!(cfg.relay.listen_addr, "127.0.0.1");
        assert_eq!(cfg.relay.listen_port, 8081);
        assert_eq!(cfg.relay.listen_path, None);
        assert_eq!(cfg.relay.close_delay, 3.3);
        assert_eq!(cfg.relay.connection_limit, 1000);
        assert_eq!(cfg.relay.client_buffer_limit, 2 * 1024 * 1024);
        assert!(cfg.relay.send_text);
        assert!(!matches.get_flag("systemd"));
    }

    #[test]
    fn all_flags_are_recognized() {
        let matches = command()
            .try_get_matches_from([
                "eddnws",
                "-vv",
                "--systemd",
                "--ping-path",
                "/ping",
                "-u",
                "tcp://localhost:9500",
                "-d",
                "-1",
                "--size-limit",
                "1048576",
                "--zmq-HEARTBEAT_IVL",
                "60",
                "--zmq-HEARTBEAT_TIMEOUT",
                "10",
                "--zmq-RECONNECT_IVL_MAX",
                "30",
                "--zmq-MAXMSGSIZE",
                "4194304",
                "--zmq-RCVHWM",
                "500",
                "-s",
                "/run/eddn/eddnws.sock",
                "-a",
                "0.0.0.0",
                "-p",
                "9000",
                "--connection-limit",
                "10",
                "--client-buffer-limit",
                "1024",
                "--client-check-interval",
                "0.5",
                "--binary",
                "--strict-decode",
            ])
            .expect("parse");
        let cfg = config_from_matches(&matches);
        assert_eq!(matches.get_count("verbose"), 2);
        assert!(matches.get_flag("systemd"));
        assert_eq!(cfg.relay.ping_path.as_deref(), Some("/ping"));
        assert_eq!(cfg.upstream.zmq_url, "tcp://localhost:9500");
        assert_eq!(cfg.relay.close_delay, -1.0);
        assert!(!cfg.relay.on_demand());
        assert_eq!(cfg.upstream.msg_size_limit, 1_048_576);
        assert_eq!(cfg.upstream.heartbeat_ivl, 60.0);
        assert_eq!(cfg.upstream.heartbeat_timeout, 10.0);
        assert_eq!(cfg.upstream.reconnect_ivl_max, 30.0);
        assert_eq!(cfg.upstream.max_msg_size, 4_194_304);
        assert_eq!(cfg.upstream.recv_hwm, 500);
        assert_eq!(cfg.relay.listen_path.as_deref(), Some("/run/eddn/eddnws.sock"));
        assert_eq!(cfg.relay.listen_addr, "0.0.0.0");
        assert_eq!(cfg.relay.listen_port, 9000);
        assert_eq!(cfg.relay.connection_limit, 10);
        assert_eq!(cfg.relay.client_buffer_limit, 1024);
        assert_eq!(cfg.relay.client_check_interval, 0.5);
        assert!(!cfg.relay.send_text);
        assert!(!cfg.upstream.ignore_decode_errors);
    }

    #[test]
    fn verbosity_clamps_between_warn_and_debug() {
        assert_eq!(verbosity_filter(0), "warn");
        assert_eq!(verbosity_filter(1), "info");
        assert_eq!(verbosity_filter(2), "debug");
        assert_eq!(verbosity_filter(9), "debug");
    }
}
