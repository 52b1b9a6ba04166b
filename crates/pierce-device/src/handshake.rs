//! Device-side handshake orchestration.
//!
//! Negotiation is a pure state machine: signaling messages and callbacks
//! from the real-time engine arrive as [`HandshakeEvent`]s, and every
//! transition returns the [`Effect`]s the driver must carry out. Nothing in
//! this module touches the network.
//!
//! Sessions are keyed by caller id. Each session also carries a generation
//! number so events produced by a torn-down session are recognised as stale.

use std::collections::HashMap;
use std::fmt;

use pierce_common::{Envelope, MessageType, SessionDescription};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// The caller's offer has been received and is being applied.
    OfferSent,
    /// Our answer is on its way to the caller.
    AnswerReceived,
    IceExchange,
    ChannelOpen,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::OfferSent => "offer-sent",
            SessionState::AnswerReceived => "answer-received",
            SessionState::IceExchange => "ice-exchange",
            SessionState::ChannelOpen => "channel-open",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Network-path candidate in the browser's JSON shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed offer: {0}")]
    MalformedOffer(String),
    #[error("malformed candidate: {0}")]
    MalformedCandidate(String),
}

fn parse_offer(data: &Value) -> Result<SessionDescription, HandshakeError> {
    let offer: SessionDescription = serde_json::from_value(data.clone())
        .map_err(|e| HandshakeError::MalformedOffer(e.to_string()))?;
    if offer.kind != "offer" {
        return Err(HandshakeError::MalformedOffer(format!(
            "expected type offer, got {:?}",
            offer.kind
        )));
    }
    if offer.sdp.trim().is_empty() {
        return Err(HandshakeError::MalformedOffer("empty sdp".to_string()));
    }
    Ok(offer)
}

fn parse_candidate(data: &Value) -> Result<IceCandidate, HandshakeError> {
    let candidate: IceCandidate = serde_json::from_value(data.clone())
        .map_err(|e| HandshakeError::MalformedCandidate(e.to_string()))?;
    if candidate.candidate.is_empty() {
        return Err(HandshakeError::MalformedCandidate("empty candidate".to_string()));
    }
    Ok(candidate)
}

/// Inputs to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeEvent {
    /// An `offer` envelope from `from`.
    Offer { from: String, data: Value },
    /// A `candidate` envelope from `from`.
    RemoteCandidate { from: String, data: Value },
    /// The engine produced our local answer.
    AnswerReady { sdp: String },
    /// The engine discovered a local candidate.
    LocalCandidate(IceCandidate),
    ChannelOpened { label: String },
    ChannelClosed,
    /// Negotiation or the underlying connection failed.
    Failed { reason: String },
}

/// Work the driver performs on behalf of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send an envelope over signaling.
    Send(Envelope),
    /// Build a responder, apply the offer and produce an answer.
    ApplyRemoteOffer(SessionDescription),
    ApplyRemoteCandidate(IceCandidate),
    /// Close the session's connection and forget it.
    Teardown,
}

/// One negotiation between this device and a caller.
#[derive(Debug)]
pub struct Session {
    caller_id: String,
    device_id: String,
    state: SessionState,
    buffered_candidates: Vec<IceCandidate>,
}

impl Session {
    pub fn new(caller_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            device_id: device_id.into(),
            state: SessionState::Idle,
            buffered_candidates: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    fn envelope(&self, kind: MessageType, payload: &impl Serialize) -> Option<Envelope> {
        match Envelope::new(kind, self.caller_id.clone(), payload) {
            Ok(mut envelope) => {
                envelope.from = self.device_id.clone();
                Some(envelope)
            }
            Err(e) => {
                warn!("failed to encode message for {}: {}", self.caller_id, e);
                None
            }
        }
    }

    fn close(&mut self) -> Vec<Effect> {
        self.state = SessionState::Closed;
        self.buffered_candidates.clear();
        vec![Effect::Teardown]
    }

    fn is_negotiating(&self) -> bool {
        matches!(
            self.state,
            SessionState::OfferSent
                | SessionState::AnswerReceived
                | SessionState::IceExchange
                | SessionState::ChannelOpen
        )
    }

    /// Apply one event, returning the effects it requires.
    pub fn handle(&mut self, event: HandshakeEvent) -> Vec<Effect> {
        use HandshakeEvent as E;
        use SessionState as S;

        match (self.state, event) {
            (S::Closed, _) => Vec::new(),

            (S::Idle, E::Offer { from, data }) => {
                if from != self.caller_id {
                    return Vec::new();
                }
                match parse_offer(&data) {
                    Ok(offer) => {
                        self.state = S::OfferSent;
                        vec![Effect::ApplyRemoteOffer(offer)]
                    }
                    Err(e) => {
                        warn!("abandoning session with {}: {}", self.caller_id, e);
                        self.close()
                    }
                }
            }
            (S::Idle, _) => Vec::new(),

            (S::OfferSent, E::AnswerReady { sdp }) => {
                let answer = SessionDescription {
                    kind: "answer".to_string(),
                    sdp,
                };
                let mut effects: Vec<Effect> = self
                    .envelope(MessageType::Answer, &answer)
                    .map(Effect::Send)
                    .into_iter()
                    .collect();

                let buffered = std::mem::take(&mut self.buffered_candidates);
                self.state = if buffered.is_empty() {
                    S::AnswerReceived
                } else {
                    S::IceExchange
                };
                effects.extend(
                    buffered
                        .iter()
                        .filter_map(|candidate| self.envelope(MessageType::Candidate, candidate))
                        .map(Effect::Send),
                );
                effects
            }

            (S::OfferSent, E::LocalCandidate(candidate)) => {
                self.buffered_candidates.push(candidate);
                Vec::new()
            }
            (_, E::LocalCandidate(candidate)) => {
                if self.state == S::AnswerReceived {
                    self.state = S::IceExchange;
                }
                self.envelope(MessageType::Candidate, &candidate)
                    .map(Effect::Send)
                    .into_iter()
                    .collect()
            }

            (_, E::RemoteCandidate { from, data }) => {
                if from != self.caller_id {
                    debug!(
                        "ignoring candidate from {} for session with {}",
                        from, self.caller_id
                    );
                    return Vec::new();
                }
                match parse_candidate(&data) {
                    Ok(candidate) => {
                        if self.state == S::AnswerReceived {
                            self.state = S::IceExchange;
                        }
                        vec![Effect::ApplyRemoteCandidate(candidate)]
                    }
                    Err(e) => {
                        warn!("skipping candidate from {}: {}", from, e);
                        Vec::new()
                    }
                }
            }

            (_, E::ChannelOpened { label }) if self.is_negotiating() => {
                info!("data channel '{}' open with {}", label, self.caller_id);
                self.state = S::ChannelOpen;
                Vec::new()
            }

            (_, E::ChannelClosed) => {
                info!("data channel with {} closed", self.caller_id);
                self.close()
            }
            (_, E::Failed { reason }) => {
                warn!("session with {} failed: {}", self.caller_id, reason);
                self.close()
            }

            (state, event) => {
                debug!("ignoring {:?} in state {}", event, state);
                Vec::new()
            }
        }
    }
}

/// Identifies one session incarnation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub caller_id: String,
    pub generation: u64,
}

/// An effect bound to the session that asked for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub key: SessionKey,
    pub effect: Effect,
}

/// All handshake sessions of one device.
#[derive(Debug)]
pub struct HandshakeOrchestrator {
    device_id: String,
    sessions: HashMap<String, (u64, Session)>,
    next_generation: u64,
}

impl HandshakeOrchestrator {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            sessions: HashMap::new(),
            next_generation: 1,
        }
    }

    pub fn state(&self, caller_id: &str) -> Option<SessionState> {
        self.sessions.get(caller_id).map(|(_, session)| session.state())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Feed a signaling envelope. Only `offer` and `candidate` are handled.
    pub fn on_signal(&mut self, envelope: &Envelope) -> Vec<Directive> {
        match envelope.kind {
            MessageType::Offer => {
                let mut directives = Vec::new();
                if let Some((generation, _)) = self.sessions.remove(&envelope.from) {
                    info!("fresh offer from {} replaces its previous session", envelope.from);
                    directives.push(Directive {
                        key: SessionKey {
                            caller_id: envelope.from.clone(),
                            generation,
                        },
                        effect: Effect::Teardown,
                    });
                }

                let generation = self.next_generation;
                self.next_generation += 1;
                info!("offer from {} (session {})", envelope.from, generation);
                self.sessions.insert(
                    envelope.from.clone(),
                    (generation, Session::new(envelope.from.clone(), self.device_id.clone())),
                );

                let key = SessionKey {
                    caller_id: envelope.from.clone(),
                    generation,
                };
                directives.extend(self.dispatch(
                    &key,
                    HandshakeEvent::Offer {
                        from: envelope.from.clone(),
                        data: envelope.data.clone(),
                    },
                ));
                directives
            }
            MessageType::Candidate => {
                let Some(generation) = self.sessions.get(&envelope.from).map(|(g, _)| *g) else {
                    debug!("candidate from {} without a session", envelope.from);
                    return Vec::new();
                };
                let key = SessionKey {
                    caller_id: envelope.from.clone(),
                    generation,
                };
                self.dispatch(
                    &key,
                    HandshakeEvent::RemoteCandidate {
                        from: envelope.from.clone(),
                        data: envelope.data.clone(),
                    },
                )
            }
            _ => Vec::new(),
        }
    }

    /// Feed an engine event for `key`. Events for stale generations are dropped.
    pub fn on_event(&mut self, key: &SessionKey, event: HandshakeEvent) -> Vec<Directive> {
        self.dispatch(key, event)
    }

    fn dispatch(&mut self, key: &SessionKey, event: HandshakeEvent) -> Vec<Directive> {
        let effects = match self.sessions.get_mut(&key.caller_id) {
            Some((generation, session)) if *generation == key.generation => session.handle(event),
            _ => {
                debug!("dropping event for stale session {:?}", key);
                return Vec::new();
            }
        };

        if self.state(&key.caller_id) == Some(SessionState::Closed) {
            self.sessions.remove(&key.caller_id);
        }

        effects
            .into_iter()
            .map(|effect| Directive {
                key: key.clone(),
                effect,
            })
            .collect()
    }
}
