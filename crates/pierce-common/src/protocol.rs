use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Default upper bound for a proxied HTTP call, end to end.
///
/// The signaling server waits this long for a `proxy_response` and the device
/// executor uses the same bound for the real HTTP request.
pub const PROXY_TIMEOUT: Duration = Duration::from_secs(30);

/// Role a peer declares when it opens its signaling connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Device,
    Frontend,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Device => "device",
            PeerRole::Frontend => "frontend",
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeerRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "device" => Ok(PeerRole::Device),
            "frontend" => Ok(PeerRole::Frontend),
            other => Err(Error::protocol(format!("unknown peer role: {other}"))),
        }
    }
}

/// Kind of a signaling envelope.
///
/// Unknown kinds are preserved verbatim so the registry can carry message
/// types it does not interpret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Offer,
    Answer,
    Candidate,
    ProxyRequest,
    ProxyResponse,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Offer => "offer",
            MessageType::Answer => "answer",
            MessageType::Candidate => "candidate",
            MessageType::ProxyRequest => "proxy_request",
            MessageType::ProxyResponse => "proxy_response",
            MessageType::Other(kind) => kind,
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "offer" => MessageType::Offer,
            "answer" => MessageType::Answer,
            "candidate" => MessageType::Candidate,
            "proxy_request" => MessageType::ProxyRequest,
            "proxy_response" => MessageType::ProxyResponse,
            _ => MessageType::Other(value),
        }
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signaling envelope exchanged over the WebSocket channel.
///
/// `from` is stamped by the signaling server on receipt; whatever a client
/// puts there is discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Build an envelope addressed to `to` carrying `payload` as its `data`.
    pub fn new(kind: MessageType, to: impl Into<String>, payload: &impl Serialize) -> Result<Self> {
        Ok(Self {
            kind,
            from: String::new(),
            to: to.into(),
            data: serde_json::to_value(payload)?,
        })
    }

    /// Parse an envelope from a text frame.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize the envelope into a text frame.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode `data` into a type-specific payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            Error::protocol(format!("malformed {} payload: {}", self.kind, e))
        })
    }
}

/// An instruction to perform an HTTP call on a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequest {
    pub request_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Result of a proxied HTTP call, correlated 1:1 with a [`ProxyRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    pub request_id: String,
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

impl ProxyResponse {
    /// Response describing a failure, with `{"error": message}` as its body.
    pub fn failure(
        request_id: impl Into<String>,
        status: u16,
        status_text: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            status_text: status_text.into(),
            headers: BTreeMap::new(),
            body: serde_json::json!({ "error": message.into() }),
        }
    }
}

/// Session description as browsers serialize it: `{"type": "offer", "sdp": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// One row of the registry diagnostic listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub role: PeerRole,
}
