// src/bus/ws/mod.rs
//! Шина поверх WebSocket-шлюза (JSON-фреймы op/args, как у Bybit v5).

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::SinkExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use url::Url;

use super::{MessageBus, Subscription};
use crate::config::Config;
use crate::error::{BusError, ConfigError};

pub(super) type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
pub(super) type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub(super) const CONNECT_TIMEOUT_SECONDS: u64 = 10;
pub(super) const READ_TIMEOUT_SECONDS: u64 = 60;
const SUBSCRIPTION_BUFFER: usize = 1_024;

mod connection;
mod protocol;
mod read_loop;

pub use protocol::{parse_frame, sign};

/// Ключ и секрет для op=auth
#[derive(Clone)]
pub struct BusAuth {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for BusAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusAuth").field("api_key", &self.api_key).finish_non_exhaustive()
    }
}

pub struct WsBus {
    url: Url,
    auth: Option<BusAuth>,
    ping_interval: Duration,
    // Отдельное соединение под publish, поднимается лениво
    publisher: Mutex<Option<WsSink>>,
}

impl WsBus {
    pub fn new(url: Url, auth: Option<BusAuth>, ping_interval: Duration) -> Self {
        Self { url, auth, ping_interval, publisher: Mutex::new(None) }
    }

    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        let raw = cfg
            .bus_url
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("bus_url is required for websocket bus mode".into()))?;
        let url = Url::parse(raw).map_err(|e| ConfigError::Invalid(format!("invalid bus_url `{}`: {}", raw, e)))?;
        let auth = match (&cfg.bus_api_key, &cfg.bus_api_secret) {
            (Some(key), Some(secret)) => Some(BusAuth { api_key: key.clone(), api_secret: secret.clone() }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::Invalid(
                    "bus_api_key and bus_api_secret must be set together".into(),
                ))
            }
        };
        Ok(Self::new(url, auth, Duration::from_secs(cfg.ws_ping_interval_secs.max(1))))
    }
}

#[async_trait]
impl MessageBus for WsBus {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let (ws_reader, mut ws_sender) = connection::connect(&self.url, self.auth.as_ref()).await?;
        protocol::subscribe(&mut ws_sender, topic).await?;
        info!(topic, url = %self.url, "Subscribed to bus topic.");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(read_loop::read_loop(
            ws_reader,
            ws_sender,
            tx,
            topic.to_string(),
            self.ping_interval,
        ));
        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        let mut guard = self.publisher.lock().await;
        if guard.is_none() {
            let (ws_reader, ws_sender) = connection::connect(&self.url, self.auth.as_ref()).await?;
            tokio::spawn(read_loop::drain_acks(ws_reader));
            *guard = Some(ws_sender);
        }
        let Some(sink) = guard.as_mut() else {
            return Err(BusError::Publish("publisher connection unavailable".into()));
        };
        if let Err(e) = protocol::publish(sink, topic, payload).await {
            warn!(topic, "Publish failed, dropping publisher connection: {}", e);
            if let Some(mut stale) = guard.take() {
                let _ = stale.close().await;
            }
            return Err(e);
        }
        Ok(())
    }
}
