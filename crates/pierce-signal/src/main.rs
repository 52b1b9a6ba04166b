use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pierce_signal::{app, AppState};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "pierce-signal")]
#[command(about = "Pierce signaling server and HTTP proxy bridge")]
struct Args {
    /// Listen address for HTTP and WebSocket signaling
    #[arg(long, env = "PIERCE_SIGNAL_BIND", default_value = "0.0.0.0:8888")]
    bind: SocketAddr,

    /// Seconds to wait for a device to answer a /proxy call
    #[arg(long, env = "PIERCE_PROXY_TIMEOUT_SECS", default_value_t = 30)]
    proxy_timeout_secs: u64,
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pierce_common::init_tracing_with_default("pierce_signal=info,tower_http=info");

    let args = Args::parse();
    let state = AppState::new(Duration::from_secs(args.proxy_timeout_secs.max(1)));

    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    let bound_addr = listener.local_addr()?;
    info!("signaling server listening on {}", bound_addr);
    info!("signaling url ws://{}/ws", bound_addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
