//! Peer-to-peer plumbing for Pierce.
//!
//! - [`relay`]: the circuit-relay server with a persisted identity
//! - [`host`]: a NAT-bound peer that reserves a relay slot and serves HTTP
//! - [`client`]: the caller that reaches a host through its circuit address
//! - [`gateway`]: picks between a direct connection and the relay circuit by RTT

#![forbid(unsafe_code)]

pub mod client;
pub mod error;
pub mod gateway;
pub mod host;
pub mod http_transport;
pub mod identity;
pub mod node;
pub mod ping;
pub mod relay;

pub use client::PeerClient;
pub use error::{HostError, RelayError};
pub use gateway::{Gateway, GatewayConfig, RouteKind};
pub use host::{HostConfig, PeerHost};
pub use http_transport::HTTP_PROTOCOL;
pub use identity::IdentityError;
pub use ping::PING_PROTOCOL;
pub use relay::{RelayConfig, RelayServer};

pub use libp2p::{Multiaddr, PeerId};
