use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use pierce_common::{Envelope, MessageType, PeerRole};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::handshake::HandshakeOrchestrator;
use crate::rtc::RtcDriver;
use crate::service::DeviceService;
use crate::signaling::{Outbox, SignalingClient};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Signaling endpoint, e.g. `ws://127.0.0.1:8888/ws`.
    pub server: String,
    pub device_id: String,
    pub ice_servers: Vec<String>,
    pub request_timeout: Duration,
}

/// Run the device until signaling is gone and no session remains.
pub async fn run(config: AgentConfig) -> Result<()> {
    let mut signaling =
        SignalingClient::connect(&config.server, &config.device_id, PeerRole::Device).await?;
    let outbox = signaling.outbox();
    let service = Arc::new(DeviceService::new(
        config.device_id.clone(),
        config.request_timeout,
    )?);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut orchestrator = HandshakeOrchestrator::new(config.device_id.clone());
    let mut driver = RtcDriver::new(
        config.ice_servers.clone(),
        outbox.clone(),
        Arc::clone(&service),
        events_tx,
    )?;

    info!("device {} is running", config.device_id);

    let mut signaling_open = true;
    loop {
        tokio::select! {
            envelope = signaling.recv(), if signaling_open => {
                let Some(envelope) = envelope else {
                    signaling_open = false;
                    if orchestrator.is_empty() {
                        info!("signaling connection closed");
                        break;
                    }
                    info!("signaling connection closed; open data channels keep running");
                    continue;
                };

                match envelope.kind {
                    MessageType::Offer | MessageType::Candidate => {
                        driver.dispatch(orchestrator.on_signal(&envelope));
                    }
                    MessageType::ProxyRequest => {
                        spawn_proxy(Arc::clone(&service), outbox.clone(), envelope);
                    }
                    ref other => debug!("ignoring {} from {}", other, envelope.from),
                }
            }
            Some((key, event)) = events_rx.recv() => {
                driver.dispatch(orchestrator.on_event(&key, event));

                if !signaling_open && orchestrator.is_empty() {
                    info!("last session closed");
                    break;
                }
            }
        }
    }

    debug!("{} session worker(s) left at shutdown", driver.session_count());
    Ok(())
}

fn spawn_proxy(service: Arc<DeviceService>, outbox: Outbox, envelope: Envelope) {
    tokio::spawn(async move {
        let Some(reply) = service.handle_proxy_envelope(&envelope).await else {
            return;
        };
        let request_id = reply.data["requestId"].as_str().unwrap_or_default().to_string();
        match outbox.send(reply).await {
            Ok(()) => info!("proxy response sent for {}", request_id),
            Err(e) => warn!("failed to send proxy response {}: {}", request_id, e),
        }
    });
}
