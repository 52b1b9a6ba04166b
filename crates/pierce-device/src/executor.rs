//! Gateway executor: performs a proxied HTTP call on the device's network.
//!
//! Every outcome is encoded into the returned [`ProxyResponse`]; a failing
//! target never fails the session that carried the request.

use std::collections::BTreeMap;
use std::time::Duration;

use pierce_common::{ProxyRequest, ProxyResponse};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Url};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct GatewayExecutor {
    client: Client,
}

impl GatewayExecutor {
    /// Executor whose calls are bounded by `timeout` end to end.
    pub fn new(timeout: Duration) -> Result<Self, ExecutorError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub async fn execute(&self, request: &ProxyRequest) -> ProxyResponse {
        let built = match self.build(request) {
            Ok(built) => built,
            Err(message) => {
                warn!("proxy request {} rejected: {}", request.request_id, message);
                return ProxyResponse::failure(
                    &request.request_id,
                    500,
                    "Internal Server Error",
                    format!("Failed to create HTTP request: {message}"),
                );
            }
        };

        info!("sending {} {}", request.method, request.url);
        let response = match self.client.execute(built).await {
            Ok(response) => response,
            Err(err) => {
                warn!("proxy request {} failed: {}", request.request_id, err);
                return ProxyResponse::failure(
                    &request.request_id,
                    502,
                    "Bad Gateway",
                    format!("Failed to send HTTP request: {err}"),
                );
            }
        };

        let status = response.status();
        let status_text = match status.canonical_reason() {
            Some(reason) => format!("{} {}", status.as_u16(), reason),
            None => status.as_u16().to_string(),
        };
        let headers = copy_headers(response.headers());

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("proxy request {} body read failed: {}", request.request_id, err);
                return ProxyResponse::failure(
                    &request.request_id,
                    500,
                    "Internal Server Error",
                    format!("Failed to read response body: {err}"),
                );
            }
        };

        debug!("proxy request {} -> {}", request.request_id, status_text);
        ProxyResponse {
            request_id: request.request_id.clone(),
            status: status.as_u16(),
            status_text,
            headers,
            body: decode_body(&bytes),
        }
    }

    fn build(&self, request: &ProxyRequest) -> Result<reqwest::Request, String> {
        let method = Method::from_bytes(request.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| format!("invalid method {:?}", request.method))?;
        let url = Url::parse(&request.url)
            .map_err(|err| format!("invalid url {:?}: {err}", request.url))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| format!("invalid header name {name:?}"))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| format!("invalid value for header {name}"))?;
            headers.insert(name, value);
        }

        let mut builder = self.client.request(method, url).headers(headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }
        builder.build().map_err(|err| err.to_string())
    }
}

/// First value of every header, keyed by its canonical `Title-Case` name.
fn copy_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut copied = BTreeMap::new();
    for name in headers.keys() {
        if let Some(value) = headers.get(name) {
            copied.insert(
                canonical_header_name(name.as_str()),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            );
        }
    }
    copied
}

fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// JSON bodies become structured values; anything else passes through as a string.
fn decode_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}
