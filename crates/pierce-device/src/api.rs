//! Built-in device endpoints served directly over the data channel.

use chrono::{Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub id: String,
    pub status: u16,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeviceApi {
    device_id: String,
}

impl DeviceApi {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    pub fn handle(&self, request: &ApiRequest) -> ApiResponse {
        let data = match request.path.as_str() {
            "/info" => json!({
                "device_id": self.device_id,
                "status": "online",
                "type": "IoT Device",
                "version": env!("CARGO_PKG_VERSION"),
            }),
            "/time" => {
                let now = Local::now();
                json!({
                    "timestamp": now.timestamp(),
                    "datetime": now.to_rfc3339_opts(SecondsFormat::Secs, true),
                })
            }
            "/data" => json!({
                "temperature": 23.5,
                "humidity": 65.2,
                "pressure": 1013.25,
            }),
            "/echo" => Value::Object(request.params.clone()),
            _ => {
                return ApiResponse {
                    id: request.id.clone(),
                    status: 404,
                    data: Value::Null,
                    error: Some("Endpoint not found".to_string()),
                }
            }
        };

        ApiResponse {
            id: request.id.clone(),
            status: 200,
            data,
            error: None,
        }
    }
}
