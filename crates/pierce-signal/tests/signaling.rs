//! Integration tests for the signaling server
//!
//! Tests the following:
//! - WebSocket upgrade parameter validation
//! - Message routing with sender stamping
//! - Peer listing (GET /clients)
//! - Proxy bridge (POST /proxy): success, unknown device, frontend target,
//!   response from the wrong device, timeout, duplicate request id,
//!   device disconnect, malformed body

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pierce_signal::{app, AppState};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server(proxy_timeout: Duration) -> (SocketAddr, AppState) {
    let state = AppState::new(proxy_timeout);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, state)
}

async fn connect(addr: SocketAddr, state: &AppState, id: &str, role: &str) -> Socket {
    let url = format!("ws://{addr}/ws?id={id}&type={role}");
    let (socket, _) = connect_async(url).await.expect("websocket connect");

    for _ in 0..200 {
        if state.registry.contains(id).await {
            return socket;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("peer {id} never registered");
}

async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a message")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn wait_for_pending(state: &AppState, request_id: &str) {
    for _ in 0..200 {
        if state.pending.contains(request_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("request {request_id} never became pending");
}

fn proxy_body(request_id: &str, device_id: &str) -> Value {
    json!({
        "requestId": request_id,
        "deviceId": device_id,
        "method": "GET",
        "url": "http://127.0.0.1:8081/data",
        "headers": {},
        "body": ""
    })
}

#[tokio::test]
async fn test_ws_missing_params_rejected() {
    let (addr, _state) = spawn_server(Duration::from_secs(1)).await;
    let client = reqwest::Client::new();

    for query in ["", "?id=dev-1", "?type=device", "?id=dev-1&type=robot"] {
        let resp = client
            .get(format!("http://{addr}/ws{query}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "query {query:?}");
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].is_string());
    }
}

#[tokio::test]
async fn test_routing_stamps_sender_and_lists_clients() {
    let (addr, state) = spawn_server(Duration::from_secs(1)).await;
    let mut device = connect(addr, &state, "dev-1", "device").await;
    let mut browser = connect(addr, &state, "browser-1", "frontend").await;

    browser
        .send(Message::Text(
            json!({
                "type": "offer",
                "from": "someone-else",
                "to": "dev-1",
                "data": {"type": "offer", "sdp": "v=0"}
            })
            .to_string(),
        ))
        .await
        .unwrap();

    let received = next_json(&mut device).await;
    assert_eq!(received["type"], "offer");
    assert_eq!(received["from"], "browser-1");
    assert_eq!(received["data"]["sdp"], "v=0");

    let clients: Value = reqwest::get(format!("http://{addr}/clients"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        clients,
        json!([
            {"id": "browser-1", "type": "frontend"},
            {"id": "dev-1", "type": "device"}
        ])
    );

    browser.close(None).await.unwrap();
    device.close(None).await.unwrap();
}

#[tokio::test]
async fn test_proxy_round_trip_over_signaling() {
    let (addr, state) = spawn_server(Duration::from_secs(5)).await;
    let mut device = connect(addr, &state, "dev-1", "device").await;

    let responder = tokio::spawn(async move {
        let request = next_json(&mut device).await;
        assert_eq!(request["type"], "proxy_request");
        assert_eq!(request["data"]["url"], "http://127.0.0.1:8081/data");
        let request_id = request["data"]["requestId"].as_str().unwrap().to_string();

        let reply = json!({
            "type": "proxy_response",
            "to": request["from"],
            "data": {
                "requestId": request_id,
                "status": 200,
                "statusText": "200 OK",
                "headers": {"Content-Type": "application/json"},
                "body": {"temperature": 23.5}
            }
        });
        device.send(Message::Text(reply.to_string())).await.unwrap();
        device
    });

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/proxy"))
        .json(&proxy_body("r-ok", "dev-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["requestId"], "r-ok");
    assert_eq!(body["status"], 200);
    assert_eq!(body["body"]["temperature"], 23.5);

    assert!(state.pending.is_empty());
    responder.await.unwrap();
}

#[tokio::test]
async fn test_proxy_unknown_device_is_404() {
    let (addr, state) = spawn_server(Duration::from_secs(1)).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/proxy"))
        .json(&proxy_body("r-404", "ghost"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("ghost"));
    assert!(state.pending.is_empty());
}

#[tokio::test]
async fn test_proxy_to_frontend_is_404() {
    let (addr, state) = spawn_server(Duration::from_secs(1)).await;
    let mut browser = connect(addr, &state, "browser-1", "frontend").await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/proxy"))
        .json(&proxy_body("r-fe", "browser-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    assert!(state.pending.is_empty());

    let nothing = tokio::time::timeout(Duration::from_millis(200), browser.next()).await;
    assert!(nothing.is_err(), "frontend must not receive a proxy request");
}

#[tokio::test]
async fn test_proxy_response_from_other_device_is_ignored() {
    let (addr, state) = spawn_server(Duration::from_secs(5)).await;
    let mut device = connect(addr, &state, "dev-1", "device").await;
    let mut impostor = connect(addr, &state, "dev-2", "device").await;

    let call = tokio::spawn(async move {
        reqwest::Client::new()
            .post(format!("http://{addr}/proxy"))
            .json(&proxy_body("r-spoof", "dev-1"))
            .send()
            .await
            .unwrap()
    });
    wait_for_pending(&state, "r-spoof").await;

    let spoofed = json!({
        "type": "proxy_response",
        "data": {"requestId": "r-spoof", "status": 500, "statusText": "500 Internal Server Error"}
    });
    impostor
        .send(Message::Text(spoofed.to_string()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(state.pending.contains("r-spoof"));

    let request = next_json(&mut device).await;
    assert_eq!(request["type"], "proxy_request");
    let reply = json!({
        "type": "proxy_response",
        "to": request["from"],
        "data": {"requestId": "r-spoof", "status": 200, "statusText": "200 OK"}
    });
    device.send(Message::Text(reply.to_string())).await.unwrap();

    let resp = call.await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], 200);
    assert!(state.pending.is_empty());
}

#[tokio::test]
async fn test_proxy_timeout_is_504_and_late_response_inert() {
    let (addr, state) = spawn_server(Duration::from_millis(300)).await;
    let mut device = connect(addr, &state, "dev-1", "device").await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/proxy"))
        .json(&proxy_body("r-slow", "dev-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 504);
    assert!(!state.pending.contains("r-slow"));

    let request = next_json(&mut device).await;
    assert_eq!(request["type"], "proxy_request");

    let late = json!({
        "type": "proxy_response",
        "data": {"requestId": "r-slow", "status": 200, "body": null}
    });
    device.send(Message::Text(late.to_string())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(state.pending.is_empty());
    assert!(state.registry.contains("dev-1").await);
}

#[tokio::test]
async fn test_proxy_duplicate_request_id_is_409() {
    let (addr, state) = spawn_server(Duration::from_millis(800)).await;
    let _device = connect(addr, &state, "dev-1", "device").await;
    let client = reqwest::Client::new();

    let first = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .post(format!("http://{addr}/proxy"))
                .json(&proxy_body("dup", "dev-1"))
                .send()
                .await
                .unwrap()
                .status()
        })
    };
    wait_for_pending(&state, "dup").await;

    let second = client
        .post(format!("http://{addr}/proxy"))
        .json(&proxy_body("dup", "dev-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 409);

    assert_eq!(first.await.unwrap(), 504);
}

#[tokio::test]
async fn test_device_disconnect_fails_pending_proxy_fast() {
    let (addr, state) = spawn_server(Duration::from_secs(10)).await;
    let mut device = connect(addr, &state, "dev-1", "device").await;

    let call = tokio::spawn(async move {
        reqwest::Client::new()
            .post(format!("http://{addr}/proxy"))
            .json(&proxy_body("r-gone", "dev-1"))
            .send()
            .await
            .unwrap()
    });
    wait_for_pending(&state, "r-gone").await;
    device.close(None).await.unwrap();

    let resp = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .expect("proxy call should fail before its deadline")
        .unwrap();
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "device disconnected");
}

#[tokio::test]
async fn test_proxy_malformed_body_is_400() {
    let (addr, _state) = spawn_server(Duration::from_secs(1)).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/proxy"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_health_reports_counts() {
    let (addr, state) = spawn_server(Duration::from_secs(1)).await;
    let _device = connect(addr, &state, "dev-1", "device").await;

    let health: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["peers"], 1);
    assert_eq!(health["pending_requests"], 0);
}
