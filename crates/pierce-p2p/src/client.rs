//! Caller side of the tunnel: dials a host through its relay circuit and
//! talks to it over `/http/1.1` and `/ping/1.0.0`.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONNECTION, CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response};
use libp2p::identity::Keypair;
use libp2p::swarm::Stream;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use libp2p_stream::Control;
use tokio::task::JoinHandle;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, info};

use crate::error::HostError;
use crate::http_transport::{self, HTTP_PROTOCOL};
use crate::node::{self, split_circuit_addr};
use crate::ping::{self, PING_PROTOCOL};

pub struct PeerClient {
    target: PeerId,
    control: Control,
    driver: JoinHandle<()>,
}

impl PeerClient {
    /// Connect to the relay named in `target_addr`, then to the host behind it.
    ///
    /// `target_addr` is the host's circuit address,
    /// `<relay addr>/p2p-circuit/p2p/<host id>`.
    pub async fn connect(
        target_addr: &Multiaddr,
        timeout: Duration,
    ) -> Result<Self, HostError> {
        Self::connect_with(Keypair::generate_ed25519(), target_addr, timeout).await
    }

    pub async fn connect_with(
        keypair: Keypair,
        target_addr: &Multiaddr,
        timeout: Duration,
    ) -> Result<Self, HostError> {
        let (relay_addr, target) = split_circuit_addr(target_addr)
            .ok_or_else(|| HostError::NotACircuitAddr(target_addr.clone()))?;
        let relay_peer = node::relay_peer_id(&relay_addr)
            .ok_or_else(|| HostError::MissingRelayPeerId(relay_addr.clone()))?;

        let mut swarm = node::build_swarm(keypair)?;
        // Hole punching needs local listeners to upgrade the circuit.
        node::listen(&mut swarm, &node::default_listen_addrs())?;

        node::connect(&mut swarm, &relay_addr, relay_peer, timeout).await?;
        node::connect(&mut swarm, target_addr, target, timeout).await?;
        info!("connected to {} through relay {}", target, relay_peer);

        let control = swarm.behaviour().stream.new_control();
        Ok(Self {
            target,
            control,
            driver: node::spawn_driver(swarm),
        })
    }

    /// Dial `target` on its own listen addresses, skipping the relay.
    ///
    /// Circuit addresses in `addrs` are ignored. The first address that
    /// connects wins.
    pub async fn connect_direct(
        target: PeerId,
        addrs: &[Multiaddr],
        timeout: Duration,
    ) -> Result<Self, HostError> {
        let addrs: Vec<&Multiaddr> = addrs.iter().filter(|a| !node::is_relayed(a)).collect();
        if addrs.is_empty() {
            return Err(HostError::NoDirectAddr(target));
        }

        let mut swarm = node::build_swarm(Keypair::generate_ed25519())?;
        let mut last_error = HostError::NoDirectAddr(target);
        for addr in addrs {
            match node::connect(&mut swarm, addr, target, timeout).await {
                Ok(()) => {
                    info!("direct connection to {} via {}", target, addr);
                    let control = swarm.behaviour().stream.new_control();
                    return Ok(Self {
                        target,
                        control,
                        driver: node::spawn_driver(swarm),
                    });
                }
                Err(e) => {
                    debug!("direct dial of {} at {} failed: {}", target, addr, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    pub fn target(&self) -> PeerId {
        self.target
    }

    async fn open(&self, protocol: StreamProtocol) -> Result<Stream, HostError> {
        self.control
            .clone()
            .open_stream(self.target, protocol.clone())
            .await
            .map_err(|e| HostError::OpenStream {
                peer: self.target,
                protocol,
                reason: e.to_string(),
            })
    }

    /// Issue one HTTP request to the host. `body` is sent as JSON when not
    /// empty.
    pub async fn fetch(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
    ) -> Result<Response<Bytes>, HostError> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, self.target.to_string())
            .header(CONNECTION, "close");
        if !body.is_empty() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| HostError::Request(e.to_string()))?;

        let stream = self.open(HTTP_PROTOCOL).await?;
        let response = http_transport::send_request(stream.compat(), request).await?;
        debug!("{} answered {}", self.target, response.status());
        Ok(response)
    }

    /// Round-trip time of one `/ping/1.0.0` exchange.
    pub async fn rtt(&self) -> Result<Duration, HostError> {
        let mut stream = self.open(PING_PROTOCOL).await?;
        Ok(ping::measure(&mut stream).await?)
    }
}

impl Drop for PeerClient {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
