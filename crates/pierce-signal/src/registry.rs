//! Connection registry: which signaling peers are reachable right now.
//!
//! Every WebSocket connection registers under the id it presented. Messages
//! are routed by id into the target connection's outbox; the outbox writer
//! task owns the socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use pierce_common::{Envelope, PeerInfo, PeerRole};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Why a message could not be queued for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("peer outbox is full")]
    Full,
    #[error("peer connection is closed")]
    Closed,
}

/// Write side of one signaling connection.
///
/// Each handle carries a process-unique connection id so that a connection
/// tearing down never removes an entry that a newer connection replaced.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    connection_id: u64,
    tx: mpsc::Sender<Envelope>,
}

impl PeerHandle {
    pub fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Queue an envelope without waiting for outbox capacity.
    pub fn try_send(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        self.tx.try_send(envelope).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[derive(Debug)]
struct Peer {
    role: PeerRole,
    handle: PeerHandle,
}

/// Result of routing one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    UnknownTarget,
    DeliveryFailed(DeliveryError),
}

/// Registry of connected signaling peers keyed by caller-assigned id.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    peers: Arc<RwLock<HashMap<String, Peer>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `id`. Last write wins.
    ///
    /// Returns the handle that was displaced, if any. The displaced connection
    /// is left open; its read loop ends on its own.
    pub async fn register(
        &self,
        id: &str,
        role: PeerRole,
        handle: PeerHandle,
    ) -> Option<PeerHandle> {
        let connection_id = handle.connection_id();
        let replaced = self
            .peers
            .write()
            .await
            .insert(id.to_string(), Peer { role, handle })
            .map(|previous| previous.handle);

        match &replaced {
            Some(previous) => warn!(
                "peer {} re-registered as {} (connection {} replaces {})",
                id,
                role,
                connection_id,
                previous.connection_id()
            ),
            None => info!("peer registered: {} ({})", id, role),
        }
        replaced
    }

    /// Remove the entry for `id` if it still belongs to `connection_id`.
    ///
    /// Returns the role of the removed peer, or `None` when the id is unknown
    /// or now owned by a newer connection.
    pub async fn unregister(&self, id: &str, connection_id: u64) -> Option<PeerRole> {
        let mut peers = self.peers.write().await;
        match peers.get(id) {
            Some(peer) if peer.handle.connection_id() == connection_id => {
                let role = peer.role;
                peers.remove(id);
                info!("peer unregistered: {}", id);
                Some(role)
            }
            Some(_) => {
                debug!(
                    "connection {} for {} already superseded, keeping newer entry",
                    connection_id, id
                );
                None
            }
            None => None,
        }
    }

    /// Route a peer-originated envelope, stamping `from` with the sender's id.
    pub async fn route(&self, sender_id: &str, mut envelope: Envelope) -> RouteOutcome {
        envelope.from = sender_id.to_string();
        self.deliver(envelope).await
    }

    /// Deliver an envelope to `envelope.to` as-is.
    ///
    /// Used for messages the server itself originates, such as proxy requests.
    pub async fn deliver(&self, envelope: Envelope) -> RouteOutcome {
        let target = {
            let peers = self.peers.read().await;
            peers.get(&envelope.to).map(|peer| peer.handle.clone())
        };

        let Some(target) = target else {
            warn!(
                "dropping {} from {:?}: target not connected: {}",
                envelope.kind, envelope.from, envelope.to
            );
            return RouteOutcome::UnknownTarget;
        };

        let kind = envelope.kind.clone();
        let to = envelope.to.clone();
        match target.try_send(envelope) {
            Ok(()) => {
                debug!("routed {} to {}", kind, to);
                RouteOutcome::Delivered
            }
            Err(err) => {
                warn!("failed to deliver {} to {}: {}", kind, to, err);
                RouteOutcome::DeliveryFailed(err)
            }
        }
    }

    /// Whether a peer is currently registered under `id`.
    pub async fn contains(&self, id: &str) -> bool {
        self.peers.read().await.contains_key(id)
    }

    /// Role `id` registered with, if it is connected.
    pub async fn role_of(&self, id: &str) -> Option<PeerRole> {
        self.peers.read().await.get(id).map(|peer| peer.role)
    }

    /// Point-in-time snapshot of connected peers, sorted by id.
    pub async fn list(&self) -> Vec<PeerInfo> {
        let mut snapshot: Vec<PeerInfo> = {
            let peers = self.peers.read().await;
            peers
                .iter()
                .map(|(id, peer)| PeerInfo {
                    id: id.clone(),
                    role: peer.role,
                })
                .collect()
        };
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}
