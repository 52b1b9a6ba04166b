//! Forwards every request arriving over the tunnel to the local upstream
//! HTTP service.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::header::{CONNECTION, HOST, TRANSFER_ENCODING};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct Upstream {
    client: reqwest::Client,
    base: Url,
}

impl Upstream {
    pub fn new(base: Url, client: reqwest::Client) -> Self {
        Self { client, base }
    }
}

pub fn router(upstream: Upstream) -> Router {
    Router::new()
        .fallback(forward)
        .with_state(Arc::new(upstream))
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    headers.remove(HOST);
    headers.remove(CONNECTION);
    headers.remove(TRANSFER_ENCODING);
}

async fn forward(State(upstream): State<Arc<Upstream>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let url = match upstream.base.join(path) {
        Ok(url) => url,
        Err(e) => return error(StatusCode::BAD_REQUEST, format!("invalid path {path}: {e}")),
    };
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => return error(StatusCode::PAYLOAD_TOO_LARGE, e.to_string()),
    };

    let mut headers = parts.headers;
    strip_hop_headers(&mut headers);

    debug!("forwarding {} {}", parts.method, url);
    let result = upstream
        .client
        .request(parts.method, url.clone())
        .headers(headers)
        .body(body)
        .send()
        .await;

    let upstream_response = match result {
        Ok(response) => response,
        Err(e) => {
            warn!("upstream {} unreachable: {}", url, e);
            return error(StatusCode::BAD_GATEWAY, format!("upstream unreachable: {e}"));
        }
    };

    let status = upstream_response.status();
    let mut headers = upstream_response.headers().clone();
    strip_hop_headers(&mut headers);
    match upstream_response.bytes().await {
        Ok(bytes) => (status, headers, Body::from(bytes)).into_response(),
        Err(e) => error(
            StatusCode::BAD_GATEWAY,
            format!("failed to read upstream response: {e}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use serde_json::Value;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn spawn(router: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    async fn spawn_forwarder(upstream: SocketAddr) -> SocketAddr {
        let base = Url::parse(&format!("http://{upstream}")).unwrap();
        spawn(router(Upstream::new(base, reqwest::Client::new()))).await
    }

    #[tokio::test]
    async fn test_get_with_query_is_forwarded() {
        let upstream = spawn(Router::new().route(
            "/data",
            get(|req: Request| async move {
                Json(json!({ "query": req.uri().query().unwrap_or_default() }))
            }),
        ))
        .await;
        let forwarder = spawn_forwarder(upstream).await;

        let resp = reqwest::get(format!("http://{forwarder}/data?unit=c"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["query"], "unit=c");
    }

    #[tokio::test]
    async fn test_post_body_and_status_pass_through() {
        let upstream = spawn(Router::new().route(
            "/items",
            post(|body: String| async move { (StatusCode::CREATED, body) }),
        ))
        .await;
        let forwarder = spawn_forwarder(upstream).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{forwarder}/items"))
            .body("{\"name\":\"sensor\"}")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        assert_eq!(resp.text().await.unwrap(), "{\"name\":\"sensor\"}");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let forwarder = spawn_forwarder(closed).await;

        let resp = reqwest::get(format!("http://{forwarder}/anything"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().starts_with("upstream unreachable"));
    }
}
