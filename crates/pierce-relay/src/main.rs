#![forbid(unsafe_code)]

//! Pierce Relay - rendezvous point for peers that cannot reach each other.
//!
//! The relay:
//! 1. Keeps a stable peer id across restarts (key file)
//! 2. Listens on TCP, QUIC and WebSocket as configured
//! 3. Grants circuit reservations and splices circuits between peers

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use pierce_p2p::{RelayConfig, RelayServer};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "pierce-relay")]
#[command(about = "Pierce relay node - circuit relay for peers behind NAT")]
struct Args {
    /// Interface to bind
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// TCP port; QUIC uses the same number on UDP, WebSocket the next one
    #[arg(long, env = "RELAY_PORT", default_value_t = 4002)]
    port: u16,

    /// Listen for QUIC v1
    #[arg(
        long,
        env = "ENABLE_QUIC",
        default_value_t = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    enable_quic: bool,

    /// Listen for WebSocket
    #[arg(
        long,
        env = "ENABLE_WS",
        default_value_t = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    enable_ws: bool,

    /// Where the relay identity is kept
    #[arg(long, env = "RELAY_KEY_FILE", default_value = "relay.key")]
    key_file: PathBuf,
}

impl From<Args> for RelayConfig {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            enable_quic: args.enable_quic,
            enable_ws: args.enable_ws,
            key_file: args.key_file,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    pierce_common::init_tracing_with_default("pierce_relay=info,pierce_p2p=info");

    let config = RelayConfig::from(Args::parse());
    let relay = RelayServer::start(&config)
        .await
        .context("failed to start relay")?;
    info!(
        "relay {} up (quic: {}, ws: {})",
        relay.local_peer_id(),
        config.enable_quic,
        config.enable_ws
    );

    tokio::select! {
        _ = relay.run() => {}
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_relay_config() {
        let config = RelayConfig::from(Args::parse_from(["pierce-relay"]));
        assert_eq!(config.port, 4002);
        assert!(config.enable_quic);
        assert!(config.enable_ws);
        assert_eq!(config.key_file, PathBuf::from("relay.key"));
    }

    #[test]
    fn test_toggles_accept_boolish_values() {
        let args = Args::parse_from(["pierce-relay", "--enable-quic", "no", "--enable-ws", "0"]);
        assert!(!args.enable_quic);
        assert!(!args.enable_ws);
    }
}
