//! WebRTC driver: carries out handshake effects on real peer connections and
//! turns engine callbacks back into [`HandshakeEvent`]s.
//!
//! Answers, candidates and teardown of one session run in order on that
//! session's worker task; different sessions proceed independently.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::handshake::{Directive, Effect, HandshakeEvent, IceCandidate, SessionKey};
use crate::service::DeviceService;
use crate::signaling::Outbox;

pub type EventSender = mpsc::UnboundedSender<(SessionKey, HandshakeEvent)>;

fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

/// State shared by every session worker.
struct Shared {
    api: API,
    ice_servers: Vec<String>,
    outbox: Outbox,
    service: Arc<DeviceService>,
    events: EventSender,
}

/// Carries out handshake effects. Each session incarnation gets its own
/// worker task that runs its effects in order, so a slow negotiation never
/// holds up signaling or other sessions.
pub struct RtcDriver {
    shared: Arc<Shared>,
    sessions: HashMap<SessionKey, mpsc::UnboundedSender<Effect>>,
}

impl RtcDriver {
    pub fn new(
        ice_servers: Vec<String>,
        outbox: Outbox,
        service: Arc<DeviceService>,
        events: EventSender,
    ) -> Result<Self, webrtc::Error> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let api = APIBuilder::new().with_media_engine(media).build();

        Ok(Self {
            shared: Arc::new(Shared {
                api,
                ice_servers,
                outbox,
                service,
                events,
            }),
            sessions: HashMap::new(),
        })
    }

    /// Sessions with a live worker.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Queue `directives` on their sessions' workers. Never waits on the
    /// engine; results come back as events.
    pub fn dispatch(&mut self, directives: Vec<Directive>) {
        for Directive { key, effect } in directives {
            let teardown = matches!(effect, Effect::Teardown);
            if teardown && !self.sessions.contains_key(&key) {
                continue;
            }

            let worker = self
                .sessions
                .entry(key.clone())
                .or_insert_with(|| spawn_worker(Arc::clone(&self.shared), key.clone()));
            if worker.send(effect).is_err() {
                debug!("worker for session {} with {} is gone", key.generation, key.caller_id);
            }

            // Dropping the sender lets the worker drain and exit.
            if teardown {
                self.sessions.remove(&key);
            }
        }
    }
}

fn spawn_worker(shared: Arc<Shared>, key: SessionKey) -> mpsc::UnboundedSender<Effect> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut worker = SessionWorker {
            shared,
            key,
            pc: None,
        };
        while let Some(effect) = rx.recv().await {
            if !worker.execute(effect).await {
                break;
            }
        }
        worker.close().await;
    });
    tx
}

struct SessionWorker {
    shared: Arc<Shared>,
    key: SessionKey,
    pc: Option<Arc<RTCPeerConnection>>,
}

impl SessionWorker {
    /// Run one effect; `false` once the session is torn down.
    async fn execute(&mut self, effect: Effect) -> bool {
        let key = &self.key;
        match effect {
            Effect::Send(envelope) => {
                let kind = envelope.kind.clone();
                if let Err(e) = self.shared.outbox.send(envelope).await {
                    warn!("failed to send {} to {}: {}", kind, key.caller_id, e);
                }
            }
            Effect::ApplyRemoteOffer(offer) => {
                let event = match self.answer(offer.sdp).await {
                    Ok(sdp) => HandshakeEvent::AnswerReady { sdp },
                    Err(e) => HandshakeEvent::Failed {
                        reason: e.to_string(),
                    },
                };
                let _ = self.shared.events.send((self.key.clone(), event));
            }
            Effect::ApplyRemoteCandidate(candidate) => {
                if let Some(pc) = &self.pc {
                    if let Err(e) = pc.add_ice_candidate(to_init(candidate)).await {
                        warn!("failed to add ice candidate from {}: {}", key.caller_id, e);
                    }
                }
            }
            Effect::Teardown => {
                if self.pc.is_some() {
                    info!("session {} with {} torn down", key.generation, key.caller_id);
                }
                return false;
            }
        }
        true
    }

    async fn close(&mut self) {
        if let Some(pc) = self.pc.take() {
            if let Err(e) = pc.close().await {
                debug!("error closing connection with {}: {}", self.key.caller_id, e);
            }
        }
    }

    async fn answer(&mut self, offer_sdp: String) -> Result<String, webrtc::Error> {
        let shared = &self.shared;
        let ice_servers = if shared.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: shared.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(shared.api.new_peer_connection(config).await?);
        self.pc = Some(Arc::clone(&pc));
        shared.attach_callbacks(&self.key, &pc);

        pc.set_remote_description(RTCSessionDescription::offer(offer_sdp)?)
            .await?;
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer.clone()).await?;

        Ok(answer.sdp)
    }
}

impl Shared {
    fn attach_callbacks(&self, key: &SessionKey, pc: &RTCPeerConnection) {
        let events = self.events.clone();
        let session = key.clone();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let events = events.clone();
            let session = session.clone();
            Box::pin(async move {
                let Some(candidate) = c else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let event = HandshakeEvent::LocalCandidate(from_init(init));
                        let _ = events.send((session, event));
                    }
                    Err(e) => warn!("failed to serialize local candidate: {}", e),
                }
            })
        }));

        let events = self.events.clone();
        let session = key.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            let session = session.clone();
            Box::pin(async move {
                debug!("peer connection with {} is {}", session.caller_id, state);
                if state == RTCPeerConnectionState::Failed {
                    let _ = events.send((
                        session,
                        HandshakeEvent::Failed {
                            reason: "peer connection failed".to_string(),
                        },
                    ));
                }
            })
        }));

        let events = self.events.clone();
        let service = Arc::clone(&self.service);
        let session = key.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let events = events.clone();
            let service = Arc::clone(&service);
            let session = session.clone();
            Box::pin(async move {
                attach_channel(channel, session, events, service);
            })
        }));
    }
}

fn attach_channel(
    channel: Arc<RTCDataChannel>,
    session: SessionKey,
    events: EventSender,
    service: Arc<DeviceService>,
) {
    let label = channel.label().to_string();
    info!("data channel '{}' received from {}", label, session.caller_id);

    {
        let events = events.clone();
        let session = session.clone();
        channel.on_open(Box::new(move || {
            Box::pin(async move {
                let _ = events.send((session, HandshakeEvent::ChannelOpened { label }));
            })
        }));
    }

    let weak = Arc::downgrade(&channel);
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let weak = weak.clone();
        let service = Arc::clone(&service);
        Box::pin(async move {
            tokio::spawn(async move {
                let Some(reply) = service.handle_channel_message(&msg.data).await else {
                    return;
                };
                let Some(channel) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = channel.send_text(reply).await {
                    warn!("failed to send data channel reply: {}", e);
                }
            });
        })
    }));

    channel.on_close(Box::new(move || {
        let events = events.clone();
        let session = session.clone();
        Box::pin(async move {
            let _ = events.send((session, HandshakeEvent::ChannelClosed));
        })
    }));
}
