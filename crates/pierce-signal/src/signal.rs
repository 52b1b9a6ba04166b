use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{stream::StreamExt, SinkExt};
use pierce_common::{Envelope, MessageType, PeerRole, ProxyResponse};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::pending::{ProxyCorrelationTable, ResolveOutcome};
use crate::proxy::ApiError;
use crate::registry::{ConnectionRegistry, PeerHandle};

const WS_OUTBOX_CAPACITY: usize = 128;
const WS_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Query string of the signaling upgrade: `/ws?id=<peer id>&type=<role>`.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub role: Option<String>,
}

impl ConnectParams {
    fn validate(self) -> Result<(String, PeerRole), ApiError> {
        let id = self
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::bad_request("missing id query parameter"))?;
        let role = self
            .role
            .filter(|role| !role.trim().is_empty())
            .ok_or_else(|| ApiError::bad_request("missing type query parameter"))?
            .parse::<PeerRole>()
            .map_err(|err| ApiError::bad_request(err.to_string()))?;
        Ok((id, role))
    }
}

pub async fn ws_handler(
    ws: Option<WebSocketUpgrade>,
    Query(params): Query<ConnectParams>,
    State(registry): State<ConnectionRegistry>,
    State(pending): State<ProxyCorrelationTable>,
) -> Response {
    let (id, role) = match params.validate() {
        Ok(identity) => identity,
        Err(err) => return err.into_response(),
    };

    let Some(ws) = ws else {
        return ApiError::new(StatusCode::UPGRADE_REQUIRED, "expected a websocket upgrade")
            .into_response();
    };

    ws.max_message_size(WS_MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, id, role, registry, pending))
        .into_response()
}

async fn handle_socket(
    stream: WebSocket,
    id: String,
    role: PeerRole,
    registry: ConnectionRegistry,
    pending: ProxyCorrelationTable,
) {
    info!("{} {} connected", role, id);
    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::channel::<Envelope>(WS_OUTBOX_CAPACITY);
    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    let writer_id = id.clone();
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match envelope.encode() {
                Ok(text) => text,
                Err(err) => {
                    warn!("failed to encode {} for {}: {}", envelope.kind, writer_id, err);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = disconnect_tx.try_send(());
    });

    // The read side keeps its own handle so the outbox stays open even after a
    // newer connection displaces this one in the registry.
    let handle = PeerHandle::new(tx);
    let connection_id = handle.connection_id();
    let _outbox = handle.clone();
    registry.register(&id, role, handle).await;

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => {
                break;
            }
            msg = receiver.next() => {
                let Some(msg) = msg else { break; };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(err) => {
                        debug!("websocket error from {}: {}", id, err);
                        break;
                    }
                };

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        warn!("ignoring binary frame from {}", id);
                        continue;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                let envelope = match Envelope::decode(&text) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!("dropping malformed message from {}: {}", id, err);
                        continue;
                    }
                };

                dispatch(&registry, &pending, &id, envelope).await;
            }
        }
    }

    if registry.unregister(&id, connection_id).await == Some(PeerRole::Device) {
        pending.evict_device(&id);
    }
    info!("{} {} disconnected", role, id);
}

/// Handle one inbound envelope from `sender_id`.
///
/// `proxy_response` messages answer a pending `/proxy` call when one is
/// waiting under their request id; everything else is routed to `to`.
async fn dispatch(
    registry: &ConnectionRegistry,
    pending: &ProxyCorrelationTable,
    sender_id: &str,
    envelope: Envelope,
) {
    if envelope.kind == MessageType::ProxyResponse {
        let response = match envelope.payload::<ProxyResponse>() {
            Ok(response) => response,
            Err(err) => {
                warn!("dropping proxy response from {}: {}", sender_id, err);
                return;
            }
        };
        let request_id = response.request_id.clone();
        match pending.resolve(sender_id, response) {
            ResolveOutcome::Delivered
            | ResolveOutcome::WaiterGone
            | ResolveOutcome::WrongSender => return,
            ResolveOutcome::Unknown if envelope.to.is_empty() => {
                warn!(
                    "discarding late or unknown proxy response {} from {}",
                    request_id, sender_id
                );
                return;
            }
            ResolveOutcome::Unknown => {}
        }
    }

    registry.route(sender_id, envelope).await;
}
