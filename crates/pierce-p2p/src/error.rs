//! Error types for relay and peer-host setup.

use std::time::Duration;

use libp2p::{Multiaddr, PeerId, StreamProtocol};
use thiserror::Error;

use crate::identity::IdentityError;

/// Startup failures of the relay process. All of them are fatal.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("transport setup failed: {0}")]
    Transport(String),

    #[error("failed to listen on {addr}: {reason}")]
    Listen { addr: Multiaddr, reason: String },

    #[error("websocket port would be {0} + 1, which is out of range")]
    WsPortOutOfRange(u16),

    #[error("relay swarm stopped before listening")]
    Stopped,
}

/// Failures of a peer host or caller-side client.
#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("relay address {0} does not name the relay with /p2p/<peer id>")]
    MissingRelayPeerId(Multiaddr),

    #[error("{0} is not a circuit address of the form <relay>/p2p-circuit/p2p/<peer id>")]
    NotACircuitAddr(Multiaddr),

    #[error("no direct address known for {0}")]
    NoDirectAddr(PeerId),

    #[error("transport setup failed: {0}")]
    Transport(String),

    #[error("failed to listen on {addr}: {reason}")]
    Listen { addr: Multiaddr, reason: String },

    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: Multiaddr, reason: String },

    #[error("relay rejected the reservation: {0}")]
    ReservationRejected(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol {0} already has a handler")]
    ProtocolTaken(StreamProtocol),

    #[error("failed to open {protocol} stream to {peer}: {reason}")]
    OpenStream {
        peer: PeerId,
        protocol: StreamProtocol,
        reason: String,
    },

    #[error("invalid request: {0}")]
    Request(String),

    #[error("http exchange failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
