//! Circuit-relay v2 server.
//!
//! Binds TCP always, QUIC on the same port number over UDP and WebSocket on
//! the next TCP port. Any bind failure is fatal at startup.

use std::borrow::Cow;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use futures::StreamExt;
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{identify, noise, ping, relay, tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder};
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::identity;
use crate::node::IDENTIFY_PROTOCOL;

const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: IpAddr,
    pub port: u16,
    pub enable_quic: bool,
    pub enable_ws: bool,
    pub key_file: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 4002,
            enable_quic: true,
            enable_ws: true,
            key_file: PathBuf::from("relay.key"),
        }
    }
}

impl RelayConfig {
    /// One address per enabled transport.
    ///
    /// Port 0 asks the OS for an ephemeral port on every transport, including
    /// WebSocket.
    pub fn listen_addrs(&self) -> Result<Vec<Multiaddr>, RelayError> {
        let ip = match self.host {
            IpAddr::V4(v4) => Protocol::Ip4(v4),
            IpAddr::V6(v6) => Protocol::Ip6(v6),
        };
        let base = Multiaddr::empty().with(ip);

        let mut addrs = vec![base.clone().with(Protocol::Tcp(self.port))];
        if self.enable_quic {
            addrs.push(
                base.clone()
                    .with(Protocol::Udp(self.port))
                    .with(Protocol::QuicV1),
            );
        }
        if self.enable_ws {
            let ws_port = match self.port {
                0 => 0,
                port => port
                    .checked_add(1)
                    .ok_or(RelayError::WsPortOutOfRange(port))?,
            };
            addrs.push(
                base.with(Protocol::Tcp(ws_port))
                    .with(Protocol::Ws(Cow::Borrowed("/"))),
            );
        }
        Ok(addrs)
    }
}

#[derive(NetworkBehaviour)]
pub struct RelayBehaviour {
    relay: relay::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
}

pub struct RelayServer {
    swarm: Swarm<RelayBehaviour>,
}

impl RelayServer {
    /// Load (or create) the identity from `config.key_file` and bind.
    pub async fn start(config: &RelayConfig) -> Result<Self, RelayError> {
        let keypair = identity::load_or_generate(&config.key_file)?;
        Self::with_keypair(keypair, config).await
    }

    pub async fn with_keypair(keypair: Keypair, config: &RelayConfig) -> Result<Self, RelayError> {
        let addrs = config.listen_addrs()?;

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(transport_error)?
            .with_quic()
            .with_dns()
            .map_err(transport_error)?
            .with_websocket(noise::Config::new, yamux::Config::default)
            .await
            .map_err(transport_error)?
            .with_behaviour(|key| RelayBehaviour {
                relay: relay::Behaviour::new(key.public().to_peer_id(), relay::Config::default()),
                identify: identify::Behaviour::new(identify::Config::new(
                    IDENTIFY_PROTOCOL.to_string(),
                    key.public(),
                )),
                ping: ping::Behaviour::default(),
            })
            .map_err(transport_error)?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
            .build();

        for addr in addrs {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| RelayError::Listen {
                    addr,
                    reason: e.to_string(),
                })?;
        }

        info!("relay peer id: {}", swarm.local_peer_id());
        Ok(Self { swarm })
    }

    pub fn local_peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }

    /// Poll until the next listen address is bound and return it with the
    /// `/p2p/<peer id>` suffix.
    pub async fn next_listen_addr(&mut self) -> Result<Multiaddr, RelayError> {
        loop {
            let event = self.swarm.next().await.ok_or(RelayError::Stopped)?;
            if let Some(addr) = self.handle_event(event) {
                return Ok(addr);
            }
        }
    }

    /// Serve reservations and circuits until the task is dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.swarm.next().await {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<RelayBehaviourEvent>) -> Option<Multiaddr> {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                // Reservation responses carry the relay's external addresses.
                self.swarm.add_external_address(address.clone());
                let full = address.with(Protocol::P2p(self.local_peer_id()));
                info!("listening on {}", full);
                return Some(full);
            }
            SwarmEvent::Behaviour(RelayBehaviourEvent::Relay(event)) => log_relay_event(event),
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                debug!("peer {} connected from {}", peer_id, endpoint.get_remote_address());
            }
            SwarmEvent::ListenerError { error, .. } => warn!("listener error: {}", error),
            SwarmEvent::ListenerClosed {
                addresses, reason, ..
            } => warn!("listener on {:?} closed: {:?}", addresses, reason),
            _ => {}
        }
        None
    }
}

fn log_relay_event(event: relay::Event) {
    match event {
        relay::Event::ReservationReqAccepted { src_peer_id, renewed } => {
            info!("reservation for {} accepted (renewed: {})", src_peer_id, renewed);
        }
        relay::Event::ReservationTimedOut { src_peer_id } => {
            info!("reservation for {} expired", src_peer_id);
        }
        relay::Event::CircuitReqAccepted {
            src_peer_id,
            dst_peer_id,
        } => {
            info!("circuit {} -> {} opened", src_peer_id, dst_peer_id);
        }
        relay::Event::CircuitClosed {
            src_peer_id,
            dst_peer_id,
            error,
        } => {
            debug!("circuit {} -> {} closed: {:?}", src_peer_id, dst_peer_id, error);
        }
        other => debug!("relay event: {:?}", other),
    }
}

fn transport_error(e: impl std::fmt::Display) -> RelayError {
    RelayError::Transport(e.to_string())
}
