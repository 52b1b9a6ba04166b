//! Swarm construction and setup steps shared by the peer host and the
//! caller-side client.

use std::time::Duration;

use futures::StreamExt;
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{
    dcutr, identify, noise, ping, relay, tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::HostError;

/// Identify protocol version announced by every Pierce node.
pub const IDENTIFY_PROTOCOL: &str = "/pierce/1.0.0";

const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(NetworkBehaviour)]
pub struct PeerBehaviour {
    relay_client: relay::client::Behaviour,
    dcutr: dcutr::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
    pub(crate) stream: libp2p_stream::Behaviour,
}

/// TCP + QUIC + DNS with the relay client transport, hole punching and raw
/// application streams.
pub(crate) fn build_swarm(keypair: Keypair) -> Result<Swarm<PeerBehaviour>, HostError> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
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
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(transport_error)?
        .with_behaviour(|key, relay_client| PeerBehaviour {
            relay_client,
            dcutr: dcutr::Behaviour::new(key.public().to_peer_id()),
            identify: identify::Behaviour::new(identify::Config::new(
                IDENTIFY_PROTOCOL.to_string(),
                key.public(),
            )),
            ping: ping::Behaviour::default(),
            stream: libp2p_stream::Behaviour::new(),
        })
        .map_err(transport_error)?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();

    Ok(swarm)
}

fn transport_error(e: impl std::fmt::Display) -> HostError {
    HostError::Transport(e.to_string())
}

/// `/ip4/0.0.0.0/tcp/0` and `/ip4/0.0.0.0/udp/0/quic-v1`.
pub fn default_listen_addrs() -> Vec<Multiaddr> {
    let any = Multiaddr::empty().with(Protocol::Ip4(std::net::Ipv4Addr::UNSPECIFIED));
    vec![
        any.clone().with(Protocol::Tcp(0)),
        any.with(Protocol::Udp(0)).with(Protocol::QuicV1),
    ]
}

pub(crate) fn listen(
    swarm: &mut Swarm<PeerBehaviour>,
    addrs: &[Multiaddr],
) -> Result<(), HostError> {
    for addr in addrs {
        swarm.listen_on(addr.clone()).map_err(|e| HostError::Listen {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

/// The first `/p2p/<peer id>` component of `addr`.
pub fn relay_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

/// `<relay addr>/p2p-circuit/p2p/<peer>`.
pub fn circuit_addr(relay_addr: &Multiaddr, peer: PeerId) -> Multiaddr {
    relay_addr
        .clone()
        .with(Protocol::P2pCircuit)
        .with(Protocol::P2p(peer))
}

/// Split a circuit address back into the relay address and the target peer.
pub fn split_circuit_addr(addr: &Multiaddr) -> Option<(Multiaddr, PeerId)> {
    let protocols: Vec<Protocol<'_>> = addr.iter().collect();
    let circuit = protocols
        .iter()
        .position(|p| matches!(p, Protocol::P2pCircuit))?;
    if circuit + 2 != protocols.len() {
        return None;
    }
    let Some(Protocol::P2p(target)) = protocols.last() else {
        return None;
    };

    let relay: Multiaddr = protocols[..circuit].iter().cloned().collect();
    relay_peer_id(&relay)?;
    Some((relay, *target))
}

pub fn is_relayed(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

/// Poll the swarm until `step` produces an outcome or `timeout` elapses.
async fn drive_until<T>(
    swarm: &mut Swarm<PeerBehaviour>,
    timeout: Duration,
    mut step: impl FnMut(SwarmEvent<PeerBehaviourEvent>) -> Option<Result<T, HostError>>,
) -> Result<T, HostError> {
    let deadline = Instant::now() + timeout;
    loop {
        let event = tokio::time::timeout_at(deadline, swarm.select_next_some())
            .await
            .map_err(|_| HostError::Timeout(timeout))?;
        if let Some(outcome) = step(event) {
            return outcome;
        }
    }
}

/// Dial `peer` at `addr` and wait for the connection.
pub(crate) async fn connect(
    swarm: &mut Swarm<PeerBehaviour>,
    addr: &Multiaddr,
    peer: PeerId,
    timeout: Duration,
) -> Result<(), HostError> {
    let opts = DialOpts::peer_id(peer).addresses(vec![addr.clone()]).build();
    swarm.dial(opts).map_err(|e| HostError::Connect {
        addr: addr.clone(),
        reason: e.to_string(),
    })?;

    drive_until(swarm, timeout, |event| match event {
        SwarmEvent::ConnectionEstablished {
            peer_id, endpoint, ..
        } if peer_id == peer => {
            info!("connected to {} via {}", peer_id, endpoint.get_remote_address());
            Some(Ok(()))
        }
        SwarmEvent::OutgoingConnectionError {
            peer_id: Some(peer_id),
            error,
            ..
        } if peer_id == peer => Some(Err(HostError::Connect {
            addr: addr.clone(),
            reason: error.to_string(),
        })),
        _ => None,
    })
    .await
}

/// Listen on the relay's `/p2p-circuit` address and wait for the relay to
/// accept the reservation. Returns our own circuit address.
pub(crate) async fn reserve(
    swarm: &mut Swarm<PeerBehaviour>,
    relay_addr: &Multiaddr,
    timeout: Duration,
) -> Result<Multiaddr, HostError> {
    let listen_addr = relay_addr.clone().with(Protocol::P2pCircuit);
    let listener = swarm
        .listen_on(listen_addr.clone())
        .map_err(|e| HostError::Listen {
            addr: listen_addr,
            reason: e.to_string(),
        })?;
    let local = *swarm.local_peer_id();

    drive_until(swarm, timeout, |event| match event {
        SwarmEvent::Behaviour(PeerBehaviourEvent::RelayClient(
            relay::client::Event::ReservationReqAccepted { relay_peer_id, .. },
        )) => {
            info!("reservation accepted by relay {}", relay_peer_id);
            Some(Ok(circuit_addr(relay_addr, local)))
        }
        SwarmEvent::ListenerClosed {
            listener_id,
            reason,
            ..
        } if listener_id == listener => {
            let reason = match reason {
                Ok(()) => "circuit listener closed".to_string(),
                Err(e) => e.to_string(),
            };
            Some(Err(HostError::ReservationRejected(reason)))
        }
        _ => None,
    })
    .await
}

/// Keep the swarm polled for the rest of the node's life.
pub(crate) fn spawn_driver(mut swarm: Swarm<PeerBehaviour>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = swarm.select_next_some().await;
            log_event(event);
        }
    })
}

fn log_event(event: SwarmEvent<PeerBehaviourEvent>) {
    match event {
        SwarmEvent::ConnectionEstablished {
            peer_id, endpoint, ..
        } => {
            let route = if is_relayed(endpoint.get_remote_address()) {
                "relayed"
            } else {
                "direct"
            };
            debug!("{} connection to {} established", route, peer_id);
        }
        SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
            debug!("connection to {} closed: {:?}", peer_id, cause);
        }
        SwarmEvent::Behaviour(PeerBehaviourEvent::Dcutr(dcutr::Event {
            remote_peer_id,
            result,
        })) => match result {
            Ok(_) => info!("hole punch to {} succeeded", remote_peer_id),
            Err(e) => warn!("hole punch to {} failed, staying relayed: {}", remote_peer_id, e),
        },
        SwarmEvent::Behaviour(PeerBehaviourEvent::RelayClient(event)) => {
            debug!("relay client: {:?}", event);
        }
        SwarmEvent::ListenerClosed {
            addresses, reason, ..
        } => {
            warn!("listener on {:?} closed: {:?}", addresses, reason);
        }
        _ => {}
    }
}
