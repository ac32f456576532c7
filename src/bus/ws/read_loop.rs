// src/bus/ws/read_loop.rs

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, trace, warn};

use super::protocol::{parse_frame, ping};
use super::{WsSink, WsStream, READ_TIMEOUT_SECONDS};
use crate::bus::BusMessage;
use crate::error::BusError;

/// Перекачивает фреймы подписки в канал. Переподключением занимается
/// вызывающая сторона: при любом разрыве шлём `Err` и выходим.
pub(super) async fn read_loop(
    mut ws_reader: WsStream,
    mut ws_sender: WsSink,
    tx: mpsc::Sender<Result<BusMessage, BusError>>,
    topic: String,
    ping_interval: Duration,
) {
    info!(topic = %topic, "Bus read_loop started.");
    let mut ping_timer = interval(ping_interval);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // первый tick срабатывает сразу
    ping_timer.tick().await;
    let read_timeout = ping_interval + Duration::from_secs(READ_TIMEOUT_SECONDS);

    let failure = loop {
        tokio::select! {
            _ = tx.closed() => {
                info!(topic = %topic, "Subscription dropped by consumer, closing bus connection.");
                let _ = ws_sender.close().await;
                return;
            }
            next = timeout(read_timeout, ws_reader.next()) => {
                match next {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        trace!("Received bus frame: {}", text);
                        match parse_frame(&text) {
                            Ok(Some(msg)) => {
                                if tx.send(Ok(msg)).await.is_err() {
                                    return;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => break e,
                        }
                    }
                    Ok(Some(Ok(Message::Close(frame)))) => {
                        info!(topic = %topic, "Bus gateway sent Close: {:?}", frame);
                        break BusError::Transport("connection closed by gateway".into());
                    }
                    Ok(Some(Ok(Message::Binary(data)))) => {
                        warn!("Unexpected binary bus frame ({} bytes)", data.len());
                    }
                    Ok(Some(Ok(other))) => {
                        debug!("Control frame: {:?}", other);
                    }
                    Ok(Some(Err(e))) => {
                        error!(topic = %topic, "Bus protocol error: {}", e);
                        break BusError::Transport(e.to_string());
                    }
                    Ok(None) => {
                        info!(topic = %topic, "Bus stream ended.");
                        break BusError::Transport("stream ended".into());
                    }
                    Err(_) => {
                        error!(topic = %topic, "No bus frames for {:?}.", read_timeout);
                        break BusError::Transport(format!("read timed out after {:?}", read_timeout));
                    }
                }
            }
            _ = ping_timer.tick() => {
                if let Err(e) = ping(&mut ws_sender).await {
                    error!(topic = %topic, "Failed to send bus ping: {}", e);
                    break e;
                }
            }
        }
    };

    let _ = tx.send(Err(failure)).await;
}

/// Читает ответы на publish-соединении, чтобы отказы были видны в логах
pub(super) async fn drain_acks(mut ws_reader: WsStream) {
    while let Some(frame) = ws_reader.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Err(e) = parse_frame(&text) {
                    warn!("Bus rejected publish: {}", e);
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Publisher connection read error: {}", e);
                break;
            }
        }
    }
    debug!("Publisher ack reader finished.");
}
