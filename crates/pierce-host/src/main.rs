#![forbid(unsafe_code)]

//! Pierce Host - makes a local HTTP service reachable through a relay.
//!
//! `serve` reserves a circuit on the relay and forwards `/http/1.1` streams to
//! the upstream service. `fetch` and `ping` are the caller side: they dial a
//! host's circuit address and issue one request or measure round trips.
//! `fetch` goes through the gateway, which prefers a direct connection to the
//! host when one is given and fast enough.

mod forward;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::Method;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use pierce_p2p::{Gateway, GatewayConfig, HostConfig, Multiaddr, PeerClient, PeerHost};
use tracing::info;
use url::Url;

const DEFAULT_RELAY_ADDR: &str =
    "/ip4/127.0.0.1/udp/4002/quic-v1/p2p/12D3KooWG53rJbdyC1yqdNuMgVTeE1s4QdFZbtCbkHRraNPbCWLh";

#[derive(Parser, Debug)]
#[command(name = "pierce-host")]
#[command(about = "Pierce peer host - reach an HTTP service behind NAT through a relay")]
struct Args {
    /// Seconds allowed for each connect or reservation step
    #[arg(long, global = true, default_value_t = 30)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reserve a relay slot and serve the upstream service over it
    Serve {
        /// Relay multiaddr including /p2p/<relay peer id>
        #[arg(long, env = "RELAY_ADDR", default_value = DEFAULT_RELAY_ADDR)]
        relay: Multiaddr,

        /// Port of the local service when --upstream is not given
        #[arg(long, env = "LISTEN_PORT", default_value_t = 8081)]
        listen_port: u16,

        /// Full base URL of the upstream service
        #[arg(long, env = "PIERCE_UPSTREAM")]
        upstream: Option<Url>,

        /// Keep the host identity in this file
        #[arg(long, env = "PIERCE_HOST_KEY_FILE")]
        key_file: Option<PathBuf>,
    },
    /// Send one HTTP request to a host through its circuit address
    Fetch {
        /// Host circuit address, <relay>/p2p-circuit/p2p/<host id>
        target: Multiaddr,

        /// Request path, e.g. /api/data
        #[arg(default_value = "/")]
        path: String,

        #[arg(long, short = 'X', default_value = "GET")]
        method: String,

        /// Request body, sent as JSON
        #[arg(long, short = 'd')]
        data: Option<String>,

        /// Direct address of the host, tried before the relay when fast enough
        #[arg(long = "direct", value_name = "MULTIADDR")]
        direct: Vec<Multiaddr>,

        /// Direct routes slower than this many milliseconds may lose to the relay
        #[arg(long, default_value_t = 200)]
        rtt_threshold_ms: u64,
    },
    /// Measure round-trip time to a host with /ping/1.0.0
    Ping {
        target: Multiaddr,

        #[arg(long, short = 'n', default_value_t = 3)]
        count: u32,
    },
}

fn upstream_url(listen_port: u16, upstream: Option<Url>) -> Result<Url> {
    match upstream {
        Some(url) => Ok(url),
        None => Url::parse(&format!("http://127.0.0.1:{listen_port}"))
            .context("invalid upstream url"),
    }
}

async fn serve(
    relay: Multiaddr,
    upstream: Url,
    key_file: Option<PathBuf>,
    timeout: Duration,
) -> Result<()> {
    let mut config = HostConfig::new(relay);
    config.key_file = key_file;
    config.timeout = timeout;

    let mut host = PeerHost::start(config)
        .await
        .context("failed to join the relay")?;

    let client = reqwest::Client::builder()
        .timeout(pierce_common::PROXY_TIMEOUT)
        .build()?;
    let upstream_router = forward::router(forward::Upstream::new(upstream.clone(), client));
    host.serve_http(upstream_router)?;

    info!("forwarding tunnel traffic to {}", upstream);
    info!("reach this host at {}", host.circuit_addr());

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    Ok(())
}

struct FetchArgs {
    target: Multiaddr,
    path: String,
    method: String,
    data: Option<String>,
    direct: Vec<Multiaddr>,
    rtt_threshold: Duration,
}

async fn fetch(args: FetchArgs, timeout: Duration) -> Result<()> {
    let method = args
        .method
        .to_ascii_uppercase()
        .parse::<Method>()
        .with_context(|| format!("invalid method {}", args.method))?;

    let config = GatewayConfig {
        rtt_threshold: args.rtt_threshold,
        timeout,
        ..Default::default()
    };
    let gateway = Gateway::connect(&args.target, args.direct, config).await?;
    info!("using {} route", gateway.selected());

    let body = args.data.map(Bytes::from).unwrap_or_default();
    let response = gateway.fetch(method, &args.path, body).await?;

    println!("{}", response.status());
    println!("{}", String::from_utf8_lossy(response.body()));
    Ok(())
}

async fn ping(target: Multiaddr, count: u32, timeout: Duration) -> Result<()> {
    let client = PeerClient::connect(&target, timeout).await?;
    for seq in 1..=count {
        let rtt = client.rtt().await?;
        println!("pong from {}: seq={} time={:.2?}", client.target(), seq, rtt);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    pierce_common::init_tracing_with_default("pierce_host=info,pierce_p2p=info");

    let args = Args::parse();
    let timeout = Duration::from_secs(args.timeout_secs.max(1));

    match args.command {
        Command::Serve {
            relay,
            listen_port,
            upstream,
            key_file,
        } => {
            let upstream = upstream_url(listen_port, upstream)?;
            serve(relay, upstream, key_file, timeout).await
        }
        Command::Fetch {
            target,
            path,
            method,
            data,
            direct,
            rtt_threshold_ms,
        } => {
            let args = FetchArgs {
                target,
                path,
                method,
                data,
                direct,
                rtt_threshold: Duration::from_millis(rtt_threshold_ms),
            };
            fetch(args, timeout).await
        }
        Command::Ping { target, count } => ping(target, count, timeout).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        let args = Args::parse_from(["pierce-host", "serve"]);
        let Command::Serve {
            relay,
            listen_port,
            upstream,
            ..
        } = args.command
        else {
            panic!("expected serve");
        };
        assert_eq!(relay.to_string(), DEFAULT_RELAY_ADDR);
        assert_eq!(listen_port, 8081);
        assert_eq!(
            upstream_url(listen_port, upstream).unwrap().as_str(),
            "http://127.0.0.1:8081/"
        );
    }

    const HOST_ID: &str = "12D3KooWG53rJbdyC1yqdNuMgVTeE1s4QdFZbtCbkHRraNPbCWLh";

    #[test]
    fn test_fetch_arguments() {
        let target = format!("{DEFAULT_RELAY_ADDR}/p2p-circuit/p2p/{HOST_ID}");
        let args = Args::parse_from(["pierce-host", "fetch", &target, "/api/data", "-X", "post"]);
        let Command::Fetch {
            path,
            method,
            direct,
            rtt_threshold_ms,
            ..
        } = args.command
        else {
            panic!("expected fetch");
        };
        assert_eq!(path, "/api/data");
        assert_eq!(method, "post");
        assert!(direct.is_empty());
        assert_eq!(rtt_threshold_ms, 200);
    }

    #[test]
    fn test_fetch_direct_addresses() {
        let target = format!("{DEFAULT_RELAY_ADDR}/p2p-circuit/p2p/{HOST_ID}");
        let direct = format!("/ip4/192.168.1.20/tcp/4100/p2p/{HOST_ID}");
        let args = Args::parse_from([
            "pierce-host",
            "fetch",
            &target,
            "--direct",
            &direct,
            "--rtt-threshold-ms",
            "50",
        ]);
        let Command::Fetch {
            direct: parsed,
            rtt_threshold_ms,
            ..
        } = args.command
        else {
            panic!("expected fetch");
        };
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].to_string(), direct);
        assert_eq!(rtt_threshold_ms, 50);
    }
}
