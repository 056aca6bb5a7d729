//! End-to-end tests: a real WebSocket client against a listener on a
//! loopback port.

use futures_util::{SinkExt, StreamExt};
use hx_server::{HxServer, ServerConfig, UpgradeConfig, WebSocketListener};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

async fn start(server: &Arc<HxServer>) -> SocketAddr {
    let mut listener = WebSocketListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr();
    server.mount(&mut listener, "/ws");
    tokio::spawn(listener.run());
    addr
}

async fn wait_for_count(server: &HxServer, expected: usize) {
    for _ in 0..200 {
        if server.connection_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {expected} connections, have {}",
        server.connection_count().await
    );
}

async fn next_text<S>(ws: &mut S) -> String
where
    S: StreamExt<Item = Result<Message, WsError>> + Unpin,
{
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended")
        .expect("read failed");
    match msg {
        Message::Text(text) => text.to_string(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn toggle_over_websocket() {
    let server = Arc::new(HxServer::new(ServerConfig::default()));
    server.listen("some_message", |conn, env| async move {
        let state = env.get("state").and_then(|v| v.as_str()) == Some("true");
        conn.send_text(&format!("<button id=\"some_message\">{}</button>", !state))
            .await
    });
    let addr = start(&server).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    let frame = json!({ "HEADERS": { "HX-Trigger": "some_message" }, "state": "false" });
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
    assert_eq!(
        next_text(&mut ws).await,
        "<button id=\"some_message\">true</button>"
    );

    // malformed frame is dropped, the connection keeps working
    ws.send(Message::Text("{\"HEADERS\":1}".into())).await.unwrap();
    let frame = json!({ "HEADERS": { "HX-Trigger": "some_message" }, "state": "true" });
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
    assert_eq!(
        next_text(&mut ws).await,
        "<button id=\"some_message\">false</button>"
    );

    ws.close(None).await.unwrap();
    wait_for_count(&server, 0).await;
}

#[tokio::test]
async fn broadcast_reaches_every_client() {
    let server = Arc::new(HxServer::new(ServerConfig::default()));
    let addr = start(&server).await;
    let url = format!("ws://{addr}/ws");

    let (mut a, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (mut b, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    wait_for_count(&server, 2).await;

    let report = server.broadcast(b"<div id=\"clock\">12:00</div>").await.unwrap();
    assert_eq!(report.delivered.len(), 2);
    assert!(report.is_complete());
    assert_eq!(next_text(&mut a).await, "<div id=\"clock\">12:00</div>");
    assert_eq!(next_text(&mut b).await, "<div id=\"clock\">12:00</div>");

    drop(a);
    wait_for_count(&server, 1).await;
    b.close(None).await.unwrap();
    wait_for_count(&server, 0).await;
}

#[tokio::test]
async fn unmounted_path_is_refused() {
    let server = Arc::new(HxServer::new(ServerConfig::default()));
    let addr = start(&server).await;

    match tokio_tungstenite::connect_async(format!("ws://{addr}/elsewhere")).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("upgrade should have been refused"),
    }
    assert_eq!(server.connection_count().await, 0);
}

#[tokio::test]
async fn origin_allow_list_is_enforced() {
    let server = Arc::new(HxServer::new(ServerConfig {
        upgrade: UpgradeConfig {
            allowed_origins: vec!["http://localhost:3000".into()],
            ..UpgradeConfig::default()
        },
        ..ServerConfig::default()
    }));
    let addr = start(&server).await;
    let url = format!("ws://{addr}/ws");

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", HeaderValue::from_static("http://evil.example"));
    match tokio_tungstenite::connect_async(request).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::FORBIDDEN),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("upgrade should have been refused"),
    }

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", HeaderValue::from_static("http://localhost:3000"));
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    wait_for_count(&server, 1).await;
    ws.close(None).await.unwrap();
    wait_for_count(&server, 0).await;
}

#[tokio::test]
async fn connection_cap_returns_503() {
    let server = Arc::new(HxServer::new(ServerConfig {
        upgrade: UpgradeConfig {
            max_connections: 1,
            ..UpgradeConfig::default()
        },
        ..ServerConfig::default()
    }));
    let addr = start(&server).await;
    let url = format!("ws://{addr}/ws");

    let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    wait_for_count(&server, 1).await;
    match tokio_tungstenite::connect_async(url.as_str()).await {
        Err(WsError::Http(response)) => {
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE)
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("upgrade should have been refused"),
    }

    first.close(None).await.unwrap();
    wait_for_count(&server, 0).await;
}

#[tokio::test]
async fn shutdown_closes_clients() {
    let server = Arc::new(HxServer::new(ServerConfig::default()));
    let addr = start(&server).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    wait_for_count(&server, 1).await;

    tokio::time::timeout(Duration::from_secs(5), server.shutdown())
        .await
        .unwrap();
    assert_eq!(server.connection_count().await, 0);

    let closed = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap();
    assert!(matches!(closed, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
}
