use std::time::Duration;

use clap::Parser;
use pierce_device::AgentConfig;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "pierce-device")]
#[command(about = "Pierce device agent")]
struct Args {
    /// Signaling server WebSocket URL
    #[arg(long, env = "PIERCE_SERVER", default_value = "ws://127.0.0.1:8888/ws")]
    server: String,

    /// Id this device registers under
    #[arg(long = "id", env = "PIERCE_DEVICE_ID", default_value = "device-1")]
    device_id: String,

    /// STUN/TURN urls, comma separated
    #[arg(
        long,
        env = "PIERCE_STUN",
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302"
    )]
    stun: Vec<String>,

    /// Upper bound for each proxied HTTP call, in seconds
    #[arg(long, env = "PIERCE_PROXY_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pierce_common::init_tracing_with_default("pierce_device=info");

    let args = Args::parse();
    let config = AgentConfig {
        server: args.server,
        device_id: args.device_id,
        ice_servers: args.stun.into_iter().filter(|url| !url.trim().is_empty()).collect(),
        request_timeout: Duration::from_secs(args.request_timeout_secs.max(1)),
    };

    tokio::select! {
        result = pierce_device::run(config) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
    }
}
