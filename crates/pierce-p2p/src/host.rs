//! Peer host: reserves a slot on a relay and serves application protocols to
//! whoever reaches it through the circuit (or, after a successful hole punch,
//! directly).

use std::path::PathBuf;
use std::time::Duration;

use axum::Router;
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use libp2p_stream::{Control, IncomingStreams};
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::HostError;
use crate::http_transport::{self, HTTP_PROTOCOL};
use crate::identity;
use crate::node::{self, relay_peer_id};
use crate::ping::{self, PING_PROTOCOL};

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Relay multiaddr, must end in `/p2p/<relay peer id>`.
    pub relay_addr: Multiaddr,
    /// Persist the host identity here; a fresh one is generated otherwise.
    pub key_file: Option<PathBuf>,
    pub listen_addrs: Vec<Multiaddr>,
    /// Bound for connecting to the relay and for the reservation each.
    pub timeout: Duration,
}

impl HostConfig {
    pub fn new(relay_addr: Multiaddr) -> Self {
        Self {
            relay_addr,
            key_file: None,
            listen_addrs: node::default_listen_addrs(),
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct PeerHost {
    peer_id: PeerId,
    circuit_addr: Multiaddr,
    direct_addrs: Vec<Multiaddr>,
    control: Control,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerHost {
    /// Connect to the relay, hold a reservation and start answering pings.
    pub async fn start(config: HostConfig) -> Result<Self, HostError> {
        let relay_peer = relay_peer_id(&config.relay_addr)
            .ok_or_else(|| HostError::MissingRelayPeerId(config.relay_addr.clone()))?;

        let keypair = match &config.key_file {
            Some(path) => identity::load_or_generate(path)?,
            None => Keypair::generate_ed25519(),
        };

        let mut swarm = node::build_swarm(keypair)?;
        node::listen(&mut swarm, &config.listen_addrs)?;

        node::connect(&mut swarm, &config.relay_addr, relay_peer, config.timeout).await?;
        let circuit_addr = node::reserve(&mut swarm, &config.relay_addr, config.timeout).await?;

        let peer_id = *swarm.local_peer_id();
        let direct_addrs: Vec<Multiaddr> = swarm
            .listeners()
            .filter(|addr| !node::is_relayed(addr))
            .map(|addr| addr.clone().with(Protocol::P2p(peer_id)))
            .collect();
        info!("peer id: {}", peer_id);
        info!("relayed address: {}", circuit_addr);
        for addr in &direct_addrs {
            info!("direct address: {}", addr);
        }

        let control = swarm.behaviour().stream.new_control();
        let mut host = Self {
            peer_id,
            circuit_addr,
            direct_addrs,
            control,
            tasks: vec![node::spawn_driver(swarm)],
        };

        let pings = host.accept(PING_PROTOCOL)?;
        host.tasks.push(tokio::spawn(ping::serve(pings)));

        Ok(host)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// `<relay addr>/p2p-circuit/p2p/<own id>`.
    pub fn circuit_addr(&self) -> &Multiaddr {
        &self.circuit_addr
    }

    /// Local listen addresses with `/p2p/<own id>`, for callers that can
    /// reach this host without the relay.
    pub fn direct_addrs(&self) -> &[Multiaddr] {
        &self.direct_addrs
    }

    /// Register a handler for `protocol`; each protocol can be accepted once.
    pub fn accept(&mut self, protocol: StreamProtocol) -> Result<IncomingStreams, HostError> {
        self.control
            .accept(protocol.clone())
            .map_err(|_| HostError::ProtocolTaken(protocol))
    }

    /// Serve `router` on the `/http/1.1` protocol.
    pub fn serve_http(&mut self, router: Router) -> Result<(), HostError> {
        let incoming = self.accept(HTTP_PROTOCOL)?;
        self.tasks
            .push(tokio::spawn(http_transport::serve(incoming, router)));
        info!("serving {} to relayed peers", HTTP_PROTOCOL);
        Ok(())
    }
}

impl Drop for PeerHost {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
