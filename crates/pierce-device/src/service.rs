use std::time::Duration;

use pierce_common::{Envelope, MessageType, ProxyRequest};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::api::{ApiRequest, DeviceApi};
use crate::executor::{ExecutorError, GatewayExecutor};

/// Application side of the device: answers tunnel traffic from either path.
#[derive(Debug, Clone)]
pub struct DeviceService {
    device_id: String,
    executor: GatewayExecutor,
    api: DeviceApi,
}

impl DeviceService {
    pub fn new(
        device_id: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, ExecutorError> {
        let device_id = device_id.into();
        Ok(Self {
            executor: GatewayExecutor::new(request_timeout)?,
            api: DeviceApi::new(device_id.clone()),
            device_id,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Answer one data-channel message.
    ///
    /// Messages carrying a `requestId` are proxied HTTP calls; anything else
    /// is a built-in API request. Returns `None` for unparseable input.
    pub async fn handle_channel_message(&self, data: &[u8]) -> Option<String> {
        let raw: Value = match serde_json::from_slice(data) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("failed to parse data channel message: {}", err);
                return None;
            }
        };

        let is_gateway = raw
            .get("requestId")
            .and_then(Value::as_str)
            .is_some_and(|id| !id.is_empty());

        if is_gateway {
            let request: ProxyRequest = match serde_json::from_value(raw) {
                Ok(request) => request,
                Err(err) => {
                    warn!("failed to parse gateway request: {}", err);
                    return None;
                }
            };
            info!("gateway request over data channel: {} {}", request.method, request.url);
            encode(&self.executor.execute(&request).await)
        } else {
            let request: ApiRequest = match serde_json::from_value(raw) {
                Ok(request) => request,
                Err(err) => {
                    warn!("failed to parse api request: {}", err);
                    return None;
                }
            };
            info!("api request: {} {}", request.method, request.path);
            encode(&self.api.handle(&request))
        }
    }

    /// Execute a `proxy_request` that arrived over signaling.
    ///
    /// The `proxy_response` is addressed back to the envelope's sender.
    pub async fn handle_proxy_envelope(&self, envelope: &Envelope) -> Option<Envelope> {
        let request: ProxyRequest = match envelope.payload() {
            Ok(request) => request,
            Err(err) => {
                warn!("failed to parse proxy request: {}", err);
                return None;
            }
        };
        info!("proxy request via signaling: {} {}", request.method, request.url);

        let response = self.executor.execute(&request).await;
        match Envelope::new(MessageType::ProxyResponse, envelope.from.clone(), &response) {
            Ok(mut reply) => {
                reply.from = self.device_id.clone();
                Some(reply)
            }
            Err(err) => {
                warn!("failed to encode proxy response {}: {}", request.request_id, err);
                None
            }
        }
    }
}

fn encode(value: &impl Serialize) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(text) => Some(text),
        Err(err) => {
            warn!("failed to encode data channel reply: {}", err);
            None
        }
    }
}
