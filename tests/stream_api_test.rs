use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::time::Duration;
use stream_relay::Config;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;

/// Test harness running the relay in-process on a free port
struct TestServer {
    handle: JoinHandle<anyhow::Result<()>>,
    shutdown: Option<oneshot::Sender<()>>,
    port: u16,
    client: reqwest::Client,
}

impl TestServer {
    async fn start() -> Self {
        // Only open when debugging
        // tracing_subscriber::fmt::init();

        let port = portpicker::pick_unused_port().expect("No available port");
        let config = Config {
            listen_on_port: port,
            stun_servers: Vec::new(),
            ..Default::default()
        };

        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("Failed to bind test port");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            stream_relay::serve(listener, config, async {
                let _ = shutdown_rx.await;
            })
            .await
        });

        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap();

        // Poll until server is ready
        for _ in 0..50 {
            if let Ok(response) = client.get(format!("http://127.0.0.1:{port}/")).send().await
                && response.status().is_success()
            {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        Self {
            handle,
            shutdown: Some(shutdown_tx),
            port,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    async fn post_json(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("request failed")
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let result = tokio::time::timeout(Duration::from_secs(10), &mut self.handle)
            .await
            .expect("server stopped in time")
            .expect("server task panicked");
        assert!(result.is_ok(), "server returned {result:?}");
    }
}

#[tokio::test]
async fn test_liveness() {
    let server = TestServer::start().await;

    let response = server.client.get(server.url("/")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.text().await.unwrap().contains("running"));

    server.stop().await;
}

#[tokio::test]
async fn test_start_requires_fields() {
    let server = TestServer::start().await;

    let response = server
        .post_json("/stream/start", json!({ "streamKey": "abcd1234" }))
        .await;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "sessionId is required");

    let response = server
        .post_json("/stream/start", json!({ "sessionId": "S1", "streamKey": "  " }))
        .await;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["message"], "streamKey is required");

    // not JSON at all still gets the structured failure
    let response = server
        .client
        .post(server.url("/stream/start"))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);

    server.stop().await;
}

#[tokio::test]
async fn test_start_unknown_session() {
    let server = TestServer::start().await;
    let session_id = uuid::Uuid::new_v4().to_string();

    let response = server
        .post_json(
            "/stream/start",
            json!({ "sessionId": session_id, "streamKey": "abcd1234", "platform": "youtube" }),
        )
        .await;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().contains("Session not found"));

    server.stop().await;
}

#[tokio::test]
async fn test_stop_unknown_session() {
    let server = TestServer::start().await;

    let response = server
        .post_json("/stream/stop", json!({ "sessionId": "missing" }))
        .await;
    assert_eq!(response.status(), 400);
    assert!(response.text().await.unwrap().contains("Session not found"));

    let response = server.post_json("/stream/stop", json!({})).await;
    assert_eq!(response.status(), 400);
    assert_eq!(response.text().await.unwrap(), "sessionId is required");

    server.stop().await;
}

#[tokio::test]
async fn test_debug_sessions_empty() {
    let server = TestServer::start().await;

    let response = server
        .client
        .get(server.url("/stream/debug/sessions"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let ids: Vec<String> = response.json().await.unwrap();
    assert!(ids.is_empty());

    let response = server
        .client
        .get(server.url("/stream/debug/sessions/missing"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    server.stop().await;
}

#[tokio::test]
async fn test_signaling_offer_and_disconnect_cleanup() {
    let server = TestServer::start().await;
    let session_id = uuid::Uuid::new_v4().to_string();

    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/signaling", server.port))
            .await
            .expect("websocket upgrade");
    let set_session = json!({ "event": "set-session", "data": { "sessionId": session_id } });
    socket
        .send(Message::Text(set_session.to_string()))
        .await
        .unwrap();

    // the first signal for a fresh session is always the offer
    let first = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    break serde_json::from_str::<Value>(&text).unwrap();
                }
                Some(Ok(_)) => continue,
                other => panic!("socket ended before the offer: {other:?}"),
            }
        }
    })
    .await
    .expect("offer within timeout");
    assert_eq!(first["event"], "webrtc-signal");
    assert_eq!(first["data"]["sessionId"], session_id.as_str());
    assert_eq!(first["data"]["signal"]["type"], "offer");
    let sdp = first["data"]["signal"]["sdp"].as_str().unwrap();
    assert!(sdp.contains("m=video"));
    assert!(sdp.contains("m=audio"));
    assert!(sdp.contains("a=recvonly"));

    let ids: Vec<String> = server
        .client
        .get(server.url("/stream/debug/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(ids.contains(&session_id));

    // not stream-ready: no tracks have arrived
    let response = server
        .post_json(
            "/stream/start",
            json!({ "sessionId": session_id, "streamKey": "abcd1234" }),
        )
        .await;
    assert_eq!(response.status(), 400);

    socket.send(Message::Close(None)).await.unwrap();
    drop(socket);

    let mut removed = false;
    for _ in 0..100 {
        let ids: Vec<String> = server
            .client
            .get(server.url("/stream/debug/sessions"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if !ids.contains(&session_id) {
            removed = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(removed, "session removed after the socket closed");

    server.stop().await;
}
