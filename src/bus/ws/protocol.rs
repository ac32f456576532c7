// src/bus/ws/protocol.rs

use futures_util::SinkExt;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, trace, warn};

use super::WsSink;
use crate::bus::BusMessage;
use crate::error::BusError;

type HmacSha256 = Hmac<Sha256>;

// Входящий фрейм шлюза: либо ack на op, либо доставка по топику
#[derive(Deserialize, Debug)]
struct GatewayFrame {
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    ret_msg: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

fn get_expires() -> String {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    (now_ms + 5_000).to_string()
}

/// HMAC-SHA256 в hex
pub fn sign(api_secret: &str, payload: &str) -> Result<String, BusError> {
    let mut mac = HmacSha256::new_from_slice(api_secret.as_bytes())
        .map_err(|e| BusError::Connect(format!("invalid api secret: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn req_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

async fn send_op(ws_sender: &mut WsSink, msg: Value) -> Result<(), String> {
    let text = msg.to_string();
    debug!("Sending bus op: {}", text);
    ws_sender.send(Message::Text(text.into())).await.map_err(|e| e.to_string())
}

pub(super) async fn authenticate(ws_sender: &mut WsSink, api_key: &str, api_secret: &str) -> Result<(), BusError> {
    let expires = get_expires();
    let signature = sign(api_secret, &format!("GET/realtime{}", expires))?;
    send_op(ws_sender, json!({"op": "auth", "args": [api_key, expires, signature]}))
        .await
        .map_err(|e| BusError::Connect(format!("send auth failed: {}", e)))
}

pub(super) async fn subscribe(ws_sender: &mut WsSink, topic: &str) -> Result<(), BusError> {
    send_op(ws_sender, json!({"op": "subscribe", "req_id": req_id(), "args": [topic]}))
        .await
        .map_err(BusError::Subscribe)
}

pub(super) async fn publish(ws_sender: &mut WsSink, topic: &str, payload: &str) -> Result<(), BusError> {
    send_op(
        ws_sender,
        json!({"op": "publish", "req_id": req_id(), "topic": topic, "data": payload}),
    )
    .await
    .map_err(BusError::Publish)
}

pub(super) async fn ping(ws_sender: &mut WsSink) -> Result<(), BusError> {
    send_op(ws_sender, json!({"op": "ping", "req_id": req_id()}))
        .await
        .map_err(BusError::Transport)
}

/// Разбор текстового фрейма. `Ok(None)` для служебных фреймов (ack, pong).
/// Неуспешный ack превращается в ошибку.
pub fn parse_frame(text: &str) -> Result<Option<BusMessage>, BusError> {
    let frame: GatewayFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Unparseable gateway frame: {}. Raw: {}", e, text);
            return Ok(None);
        }
    };

    if let Some(op) = frame.op.as_deref() {
        if frame.success == Some(false) {
            let reason = frame.ret_msg.unwrap_or_else(|| "no ret_msg".into());
            return Err(match op {
                "auth" => BusError::Connect(format!("auth rejected: {}", reason)),
                "subscribe" => BusError::Subscribe(reason),
                "publish" => BusError::Publish(reason),
                _ => BusError::Transport(format!("op `{}` failed: {}", op, reason)),
            });
        }
        trace!(op, "Gateway ack.");
        return Ok(None);
    }

    match (frame.topic, frame.data) {
        (Some(topic), Some(data)) => {
            // data приходит строкой с JSON или уже объектом
            let payload = match data {
                Value::String(s) => s,
                other => other.to_string(),
            };
            Ok(Some(BusMessage { topic, id: frame.id, payload }))
        }
        _ => {
            trace!("Ignoring gateway frame without topic/data: {}", text);
            Ok(None)
        }
    }
}
