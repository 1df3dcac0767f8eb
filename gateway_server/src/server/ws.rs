//! Websocket gateway (C10): the browser-facing half of the teacher's
//! two-listener split. Grounded on `UWServerModule.py`'s `WSHandle`:
//! `subscribe`/`change`/`set_row`/`trend` map directly onto the methods
//! below, and a connection itself plays both `TagSink` (value pushes) and
//! `Output` (alarm edge pushes) roles the same way `WSHandle` inherited
//! both `Output` and the websocket protocol class.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::drivers::database::DatabaseDriver;
use crate::ensemble::Ensemble;
use crate::error::{EngineError, EngineResult};
use crate::outputs::{Output, OutputInfo};
use crate::tags::store::{Subscription, TagSink};
use crate::tags::structures::TagValue;

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum WsRequest {
    Subscribe {
        tags: Vec<String>,
        #[serde(default)]
        alarmgroups: Vec<String>,
    },
    Change {
        tag: String,
        value: serde_json::Value,
    },
    SetRow {
        #[serde(default)]
        date: Option<i64>,
        tags: serde_json::Map<String, serde_json::Value>,
    },
    Trend {
        trend: String,
        from: i64,
        to: i64,
        tags: Vec<String>,
    },
}

fn json_to_tag_value(v: &serde_json::Value) -> TagValue {
    match v {
        serde_json::Value::Bool(b) => TagValue::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                TagValue::Int(i)
            } else {
                TagValue::Float(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => TagValue::Str(s.clone()),
        serde_json::Value::Null => TagValue::Null,
        other => TagValue::Str(other.to_string()),
    }
}

/// One websocket connection, playing both push-subscriber roles: raw tag
/// value changes (`TagSink`) and alarm edges once it has joined a group
/// (`Output`).
struct WsConnection {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl TagSink for WsConnection {
    async fn notify(&self, key: &str, value: &TagValue) {
        let Some(rendered) = value.render() else { return };
        let msg = json!({"action": "values", "tags": [[key, rendered]]});
        let _ = self.tx.send(msg.to_string());
    }
}

#[async_trait]
impl Output for WsConnection {
    async fn write(
        &self,
        store: &crate::tags::store::TagStore,
        expr_key: &str,
        ts: DateTime<Utc>,
        value: &TagValue,
        info: &OutputInfo,
    ) {
        let description = store
            .get(expr_key)
            .map(|e| e.description.read().clone())
            .unwrap_or_default();
        let group = info.alarmgroup.clone().unwrap_or_default();
        let msg = json!({
            "action": "alarms",
            "alarms": [[expr_key, ts.format("%Y-%m-%d %H:%M:%S").to_string(), description, value.is_truthy(), group]],
        });
        let _ = self.tx.send(msg.to_string());
    }
}

/// Binds the standalone websocket listener. Unlike the HTTP file server,
/// this never goes through axum — the original keeps the two transports
/// on separate listening sockets and this keeps that separation.
pub async fn serve_ws(ensemble: Arc<Ensemble>, config: &ServerConfig) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.ws_port));
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "websocket gateway listening");
    serve_ws_on(listener, ensemble).await
}

/// Accepts connections on an already-bound listener. Split out from
/// `serve_ws` so tests can bind an OS-assigned port instead of a fixed one.
pub async fn serve_ws_on(listener: TcpListener, ensemble: Arc<Ensemble>) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let ensemble = ensemble.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, ensemble).await {
                warn!(peer = %peer, error = %e, "websocket connection ended with error");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, ensemble: Arc<Ensemble>) -> EngineResult<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| EngineError::Protocol(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let conn = Arc::new(WsConnection { tx });

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = read.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(_) => break,
        };
        match msg {
            Message::Text(text) => {
                if let Err(e) = handle_message(&ensemble, &conn, &text).await {
                    warn!(error = %e, message = %text, "malformed websocket message");
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    Ok(())
}

async fn handle_message(ensemble: &Arc<Ensemble>, conn: &Arc<WsConnection>, text: &str) -> EngineResult<()> {
    let request: WsRequest = serde_json::from_str(text).map_err(|e| EngineError::Protocol(e.to_string()))?;
    match request {
        WsRequest::Subscribe { tags, alarmgroups } => handle_subscribe(ensemble, conn, tags, alarmgroups).await,
        WsRequest::Change { tag, value } => handle_change(ensemble, &tag, json_to_tag_value(&value)).await,
        WsRequest::SetRow { date, tags } => handle_set_row(ensemble, date, tags).await,
        WsRequest::Trend { trend, from, to, tags } => handle_trend(ensemble, conn, trend, from, to, tags).await,
    }
}

async fn handle_subscribe(
    ensemble: &Arc<Ensemble>,
    conn: &Arc<WsConnection>,
    tags: Vec<String>,
    alarmgroups: Vec<String>,
) -> EngineResult<()> {
    let mut tagvalues = Vec::new();
    for key in &tags {
        let Some(entry) = ensemble.store.get(key) else { continue };
        let Some(rendered) = entry.value.read().render() else { continue };
        tagvalues.push(json!([key, rendered]));
        ensemble
            .store
            .subscribe(key, Subscription::Sink(conn.clone() as Arc<dyn TagSink>))?;
    }
    let response = json!({"action": "values", "tags": tagvalues});
    let _ = conn.tx.send(response.to_string());

    if !alarmgroups.is_empty() {
        let mut alarms = Vec::new();
        for group_key in &alarmgroups {
            for (alarm_key, _) in ensemble.alarms.active_alarms(group_key, &ensemble.store) {
                let description = ensemble
                    .store
                    .get(&alarm_key)
                    .map(|e| e.description.read().clone())
                    .unwrap_or_default();
                alarms.push(json!([alarm_key, "", description, true, group_key]));
            }
            if let Some(group) = ensemble.alarms.get(group_key) {
                group.add_output(conn.clone() as Arc<dyn Output>);
            }
        }
        let response = json!({"action": "alarms", "alarms": alarms});
        let _ = conn.tx.send(response.to_string());
    }
    Ok(())
}

async fn handle_change(ensemble: &Arc<Ensemble>, tag_key: &str, value: TagValue) -> EngineResult<()> {
    let entry = ensemble
        .store
        .get(tag_key)
        .ok_or_else(|| EngineError::UnknownTag(tag_key.to_string()))?;

    let Some(plc_key) = entry.plc_key.clone() else {
        return Err(EngineError::ReadOnly(tag_key.to_string()));
    };
    let driver = ensemble
        .get_plc(&plc_key)
        .ok_or_else(|| EngineError::Config(format!("unknown PLC '{plc_key}'")))?;
    driver.write(&ensemble.store, tag_key, value).await
}

async fn handle_set_row(
    ensemble: &Arc<Ensemble>,
    date: Option<i64>,
    tags: serde_json::Map<String, serde_json::Value>,
) -> EngineResult<()> {
    let Some(first_key) = tags.keys().next() else {
        return Ok(());
    };
    let entry = ensemble
        .store
        .get(first_key)
        .ok_or_else(|| EngineError::UnknownTag(first_key.clone()))?;
    let (Some(plc_key), Some(memory_key)) = (entry.plc_key.clone(), entry.memory_key.clone()) else {
        return Err(EngineError::Config(format!("'{first_key}' has no backing table")));
    };
    let driver = ensemble
        .get_plc(&plc_key)
        .ok_or_else(|| EngineError::Config(format!("unknown PLC '{plc_key}'")))?;
    let Some(db) = driver.as_any().downcast_ref::<DatabaseDriver>() else {
        return Err(EngineError::Config(format!("'{plc_key}' is not a database driver")));
    };

    let values = tags
        .into_iter()
        .map(|(k, v)| (k, json_to_tag_value(&v)))
        .collect::<std::collections::BTreeMap<_, _>>();
    let ts = date.and_then(DateTime::from_timestamp_millis);
    db.set_row(&memory_key, &values, ts).await
}

async fn handle_trend(
    ensemble: &Arc<Ensemble>,
    conn: &Arc<WsConnection>,
    trend: String,
    from_ms: i64,
    to_ms: i64,
    tags: Vec<String>,
) -> EngineResult<()> {
    let from = DateTime::from_timestamp_millis(from_ms).unwrap_or_else(Utc::now);
    let to = DateTime::from_timestamp_millis(to_ms).unwrap_or_else(Utc::now);

    let mut series = Vec::new();
    for tag_key in &tags {
        let Some(entry) = ensemble.store.get(tag_key) else { continue };
        let label = format!("{}: {}", tag_key, entry.description.read());
        let Some(plc_key) = entry.plc_key.clone() else {
            series.push(json!({"label": label, "data": []}));
            continue;
        };
        let Some(driver) = ensemble.get_plc(&plc_key) else {
            series.push(json!({"label": label, "data": []}));
            continue;
        };
        let Some(db) = driver.as_any().downcast_ref::<DatabaseDriver>() else {
            series.push(json!({"label": label, "data": []}));
            continue;
        };
        let rows = db.get_data(tag_key, from, to).await.unwrap_or_default();
        let mut data: Vec<_> = rows.iter().map(|(ts, v)| json!([ts.timestamp_millis(), v])).collect();
        if let Some((_, first_v)) = rows.first() {
            data.insert(0, json!([from_ms, first_v]));
        }
        if let Some((_, last_v)) = rows.last() {
            data.push(json!([to_ms, last_v]));
        }
        series.push(json!({"label": label, "data": data}));
    }

    let response = json!({"action": "trend", "trend": trend, "from": from_ms, "to": to_ms, "tags": series});
    let _ = conn.tx.send(response.to_string());
    Ok(())
}
