// src/bus/ws/connection.rs

use futures_util::StreamExt;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tracing::{error, info};
use url::Url;

use super::protocol::authenticate;
use super::{BusAuth, WsSink, WsStream, CONNECT_TIMEOUT_SECONDS};
use crate::error::BusError;

/// Открывает соединение со шлюзом и, если заданы ключи, шлёт op=auth
pub(super) async fn connect(url: &Url, auth: Option<&BusAuth>) -> Result<(WsStream, WsSink), BusError> {
    info!(url = %url, "Connecting to bus gateway...");
    match timeout(Duration::from_secs(CONNECT_TIMEOUT_SECONDS), connect_async(url.as_str())).await {
        Ok(Ok((ws_stream, response))) => {
            info!(status = %response.status(), "Bus gateway connection established.");
            let (mut ws_sender, ws_reader) = ws_stream.split();
            if let Some(auth) = auth {
                authenticate(&mut ws_sender, &auth.api_key, &auth.api_secret).await?;
            }
            Ok((ws_reader, ws_sender))
        }
        Ok(Err(e)) => {
            error!("Bus gateway connection error: {}", e);
            Err(BusError::Connect(e.to_string()))
        }
        Err(_) => {
            error!("Bus gateway connection timed out after {} seconds.", CONNECT_TIMEOUT_SECONDS);
            Err(BusError::Connect(format!("timed out after {}s", CONNECT_TIMEOUT_SECONDS)))
        }
    }
}
