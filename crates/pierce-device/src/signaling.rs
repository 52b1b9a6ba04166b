use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use pierce_common::{Envelope, PeerRole};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

const OUTBOX_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling url: {0}")]
    Url(#[from] url::ParseError),
    #[error("signaling connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("signaling connection closed")]
    Closed,
}

/// Cloneable write side of the signaling connection.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Envelope>,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        self.tx.send(envelope).await.map_err(|_| SignalingError::Closed)
    }
}

pub struct SignalingClient {
    outbox: Outbox,
    read: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl SignalingClient {
    /// `<server>?id=<peer id>&type=<role>`.
    pub fn connect_url(server: &str, peer_id: &str, role: PeerRole) -> Result<Url, SignalingError> {
        let mut url = Url::parse(server)?;
        url.query_pairs_mut()
            .append_pair("id", peer_id)
            .append_pair("type", role.as_str());
        Ok(url)
    }

    pub async fn connect(
        server: &str,
        peer_id: &str,
        role: PeerRole,
    ) -> Result<Self, SignalingError> {
        let url = Self::connect_url(server, peer_id, role)?;
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        info!("connected to signaling server {} as {}", server, peer_id);

        let (mut write, read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<Envelope>(OUTBOX_CAPACITY);

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let text = match envelope.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("failed to encode {} message: {}", envelope.kind, e);
                        continue;
                    }
                };
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    error!("failed to send signaling message: {}", e);
                    break;
                }
            }
        });

        Ok(Self {
            outbox: Outbox::new(tx),
            read,
        })
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Next well-formed envelope, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        while let Some(msg) = self.read.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => match Envelope::decode(&text) {
                    Ok(envelope) => return Some(envelope),
                    Err(e) => {
                        warn!("failed to parse signaling message: {}", e);
                    }
                },
                Ok(WsMessage::Close(_)) => break,
                Ok(other) => debug!("ignoring non-text signaling frame ({} bytes)", other.len()),
                Err(e) => {
                    error!("signaling websocket error: {}", e);
                    break;
                }
            }
        }
        None
    }
}
