//! End-to-end coverage for the websocket gateway (C10): a real client
//! connects over a loopback socket and exercises `subscribe`/`change`,
//! matching the request/response shapes of §4.10.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use gateway_server::ensemble::Ensemble;
use gateway_server::server::serve_ws_on;
use gateway_server::tags::structures::TagValue;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

async fn spawn_gateway(ensemble: Arc<Ensemble>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = serve_ws_on(listener, ensemble).await;
    });
    format!("ws://{addr}")
}

async fn recv_json(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) -> Value {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a gateway frame")
            .expect("connection closed before a frame arrived")
            .unwrap()
        {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn subscribe_reports_current_value_and_pushes_changes() {
    let ensemble = Arc::new(Ensemble::new());
    ensemble.store.create("plant.level", "tank level", None, None, None, true);
    ensemble
        .store
        .update("plant.level", TagValue::Int(42))
        .await
        .unwrap();

    let url = spawn_gateway(ensemble.clone()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    ws.send(Message::Text(json!({"action": "subscribe", "tags": ["plant.level"]}).to_string()))
        .await
        .unwrap();

    let response = recv_json(&mut ws).await;
    assert_eq!(response["action"], "values");
    assert_eq!(response["tags"][0][0], "plant.level");
    assert_eq!(response["tags"][0][1], "42");

    ensemble
        .store
        .update("plant.level", TagValue::Int(43))
        .await
        .unwrap();

    let pushed = recv_json(&mut ws).await;
    assert_eq!(pushed["action"], "values");
    assert_eq!(pushed["tags"][0], json!(["plant.level", "43"]));
}

#[tokio::test]
async fn subscribe_omits_null_valued_tags() {
    let ensemble = Arc::new(Ensemble::new());
    ensemble.store.create("plant.a", "", None, None, None, true);
    ensemble.store.create("plant.b", "", None, None, None, true);
    ensemble.store.update("plant.a", TagValue::Bool(true)).await.unwrap();

    let url = spawn_gateway(ensemble).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    ws.send(Message::Text(
        json!({"action": "subscribe", "tags": ["plant.a", "plant.b"]}).to_string(),
    ))
    .await
    .unwrap();

    let response = recv_json(&mut ws).await;
    let tags = response["tags"].as_array().unwrap();
    assert_eq!(tags.len(), 1, "plant.b is still null and must be omitted");
    assert_eq!(tags[0][0], "plant.a");
}

#[tokio::test]
async fn malformed_frame_is_logged_and_connection_stays_open() {
    let ensemble = Arc::new(Ensemble::new());
    ensemble.store.create("plant.c", "", None, None, None, true);
    ensemble.store.update("plant.c", TagValue::Int(1)).await.unwrap();

    let url = spawn_gateway(ensemble).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    ws.send(Message::Text("not json at all".to_string())).await.unwrap();
    ws.send(Message::Text(json!({"action": "subscribe", "tags": ["plant.c"]}).to_string()))
        .await
        .unwrap();

    let response = recv_json(&mut ws).await;
    assert_eq!(response["action"], "values");
    assert_eq!(response["tags"][0], json!(["plant.c", "1"]));
}
