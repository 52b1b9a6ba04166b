//! End-to-end tests: signaling server + device agent + local upstream service
//!
//! Tests the following:
//! - Proxy request relayed over signaling and executed on the device
//! - Offer/answer exchange driven by a real WebRTC offerer
//! - Proxy and built-in API requests over an opened data channel

use std::net::SocketAddr;
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use pierce_device::AgentConfig;
use pierce_signal::{app, AppState};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

async fn spawn_router(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn spawn_signal(proxy_timeout: Duration) -> (SocketAddr, AppState) {
    let state = AppState::new(proxy_timeout);
    let addr = spawn_router(app(state.clone())).await;
    (addr, state)
}

async fn spawn_device(signal: SocketAddr, state: &AppState, device_id: &str) {
    let config = AgentConfig {
        server: format!("ws://{signal}/ws"),
        device_id: device_id.to_string(),
        ice_servers: Vec::new(),
        request_timeout: Duration::from_secs(5),
    };
    tokio::spawn(async move {
        let _ = pierce_device::run(config).await;
    });

    for _ in 0..300 {
        if state.registry.contains(device_id).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("device {device_id} never registered");
}

#[tokio::test]
async fn test_proxy_request_reaches_device_upstream() {
    let upstream = spawn_router(
        Router::new().route("/data", get(|| async { Json(json!({"temperature": 23.5})) })),
    )
    .await;
    let (signal, state) = spawn_signal(Duration::from_secs(10)).await;
    spawn_device(signal, &state, "dev-1").await;

    let resp = reqwest::Client::new()
        .post(format!("http://{signal}/proxy"))
        .json(&json!({
            "requestId": "r1",
            "deviceId": "dev-1",
            "method": "GET",
            "url": format!("http://{upstream}/data"),
            "headers": {},
            "body": ""
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["requestId"], "r1");
    assert_eq!(body["status"], 200);
    assert_eq!(body["statusText"], "200 OK");
    assert_eq!(body["body"], json!({"temperature": 23.5}));
    assert!(state.pending.is_empty());
}

#[tokio::test]
async fn test_failed_upstream_is_reported_not_timed_out() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let (signal, state) = spawn_signal(Duration::from_secs(10)).await;
    spawn_device(signal, &state, "dev-2").await;

    let resp = reqwest::Client::new()
        .post(format!("http://{signal}/proxy"))
        .json(&json!({
            "requestId": "r2",
            "deviceId": "dev-2",
            "url": format!("http://{closed}/")
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], 502);
    assert!(body["body"]["error"].is_string());
}

async fn new_offerer() -> RTCPeerConnection {
    let mut media = MediaEngine::default();
    media.register_default_codecs().unwrap();
    let api = APIBuilder::new().with_media_engine(media).build();
    api.new_peer_connection(RTCConfiguration::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_offer_gets_exactly_one_answer() {
    let (signal, state) = spawn_signal(Duration::from_secs(10)).await;
    spawn_device(signal, &state, "dev-1").await;

    let offerer = new_offerer().await;
    offerer.create_data_channel("data", None).await.unwrap();
    let offer = offerer.create_offer(None).await.unwrap();
    offerer.set_local_description(offer.clone()).await.unwrap();

    let (mut browser, _) = connect_async(format!("ws://{signal}/ws?id=browser-1&type=frontend"))
        .await
        .unwrap();
    browser
        .send(Message::Text(
            json!({
                "type": "offer",
                "to": "dev-1",
                "data": {"type": "offer", "sdp": offer.sdp}
            })
            .to_string(),
        ))
        .await
        .unwrap();

    let mut answers = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while let Ok(Some(Ok(msg))) = tokio::time::timeout_at(deadline, browser.next()).await {
        let Message::Text(text) = msg else { continue };
        let envelope: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope["from"], "dev-1");
        assert_eq!(envelope["to"], "browser-1");
        match envelope["type"].as_str() {
            Some("answer") => answers.push(envelope),
            Some("candidate") => assert!(envelope["data"]["candidate"].is_string()),
            other => panic!("unexpected message type {other:?}"),
        }
    }

    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0]["data"]["type"], "answer");
    assert!(answers[0]["data"]["sdp"].as_str().unwrap().starts_with("v=0"));

    offerer.close().await.unwrap();
}

#[tokio::test]
async fn test_data_channel_carries_proxy_and_api_requests() {
    let upstream = spawn_router(
        Router::new().route("/data", get(|| async { Json(json!({"temperature": 23.5})) })),
    )
    .await;
    let (signal, state) = spawn_signal(Duration::from_secs(10)).await;
    spawn_device(signal, &state, "dev-3").await;

    let offerer = new_offerer().await;
    let channel = offerer.create_data_channel("data", None).await.unwrap();

    let (opened_tx, mut opened_rx) = mpsc::unbounded_channel();
    channel.on_open(Box::new(move || {
        let _ = opened_tx.send(());
        Box::pin(async {})
    }));
    let (replies_tx, mut replies_rx) = mpsc::unbounded_channel();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = replies_tx.send(String::from_utf8_lossy(&msg.data).into_owned());
        Box::pin(async {})
    }));
    let (local_tx, mut local_rx) = mpsc::unbounded_channel();
    offerer.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
        if let Some(init) = c.and_then(|c| c.to_json().ok()) {
            let _ = local_tx.send(init);
        }
        Box::pin(async {})
    }));

    let offer = offerer.create_offer(None).await.unwrap();
    offerer.set_local_description(offer.clone()).await.unwrap();

    let (mut browser, _) = connect_async(format!("ws://{signal}/ws?id=browser-1&type=frontend"))
        .await
        .unwrap();
    browser
        .send(Message::Text(
            json!({
                "type": "offer",
                "to": "dev-3",
                "data": {"type": "offer", "sdp": offer.sdp}
            })
            .to_string(),
        ))
        .await
        .unwrap();

    // Trickle candidates both ways until the channel opens.
    let mut answered = false;
    let mut early_candidates: Vec<RTCIceCandidateInit> = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => panic!("data channel never opened"),
            Some(()) = opened_rx.recv() => break,
            Some(init) = local_rx.recv() => {
                let envelope = json!({"type": "candidate", "to": "dev-3", "data": init});
                browser.send(Message::Text(envelope.to_string())).await.unwrap();
            }
            Some(Ok(Message::Text(text))) = browser.next() => {
                let envelope: Value = serde_json::from_str(&text).unwrap();
                match envelope["type"].as_str() {
                    Some("answer") => {
                        let sdp = envelope["data"]["sdp"].as_str().unwrap().to_string();
                        let answer = RTCSessionDescription::answer(sdp).unwrap();
                        offerer.set_remote_description(answer).await.unwrap();
                        answered = true;
                        for init in early_candidates.drain(..) {
                            offerer.add_ice_candidate(init).await.unwrap();
                        }
                    }
                    Some("candidate") => {
                        let init: RTCIceCandidateInit =
                            serde_json::from_value(envelope["data"].clone()).unwrap();
                        if answered {
                            offerer.add_ice_candidate(init).await.unwrap();
                        } else {
                            early_candidates.push(init);
                        }
                    }
                    other => panic!("unexpected message type {other:?}"),
                }
            }
        }
    }

    let proxy = json!({
        "requestId": "r1",
        "method": "GET",
        "url": format!("http://{upstream}/data"),
        "headers": {},
        "body": ""
    });
    channel.send_text(proxy.to_string()).await.unwrap();
    let reply = next_reply(&mut replies_rx).await;
    assert_eq!(reply["requestId"], "r1");
    assert_eq!(reply["status"], 200);
    assert_eq!(reply["statusText"], "200 OK");
    assert_eq!(reply["body"], json!({"temperature": 23.5}));

    let info = json!({"id": "a1", "method": "GET", "path": "/info"});
    channel.send_text(info.to_string()).await.unwrap();
    let reply = next_reply(&mut replies_rx).await;
    assert_eq!(reply["id"], "a1");
    assert_eq!(reply["status"], 200);
    assert_eq!(reply["data"]["device_id"], "dev-3");

    let missing = json!({"id": "a2", "method": "GET", "path": "/missing"});
    channel.send_text(missing.to_string()).await.unwrap();
    let reply = next_reply(&mut replies_rx).await;
    assert_eq!(reply["id"], "a2");
    assert_eq!(reply["status"], 404);
    assert_eq!(reply["error"], "Endpoint not found");

    offerer.close().await.unwrap();
}

async fn next_reply(replies: &mut mpsc::UnboundedReceiver<String>) -> Value {
    let text = tokio::time::timeout(Duration::from_secs(10), replies.recv())
        .await
        .expect("no reply on the data channel")
        .expect("data channel closed");
    serde_json::from_str(&text).unwrap()
}
