// src/models.rs
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DecodeError;

/// Тип действия мастер-счёта. Неизвестные строки сохраняются как есть.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TradeAction {
    Open,
    Close,
    Other(String),
}

impl TradeAction {
    pub fn as_str(&self) -> &str {
        match self {
            TradeAction::Open => "OPEN",
            TradeAction::Close => "CLOSE",
            TradeAction::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for TradeAction {
    fn from(s: String) -> Self {
        match s.as_str() {
            "OPEN" => TradeAction::Open,
            "CLOSE" => TradeAction::Close,
            _ => TradeAction::Other(s),
        }
    }
}

impl From<TradeAction> for String {
    fn from(action: TradeAction) -> Self {
        action.as_str().to_string()
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Событие мастер-счёта, как его публикует паблишер
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    #[serde(rename = "type")]
    pub action: TradeAction,
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub volume: Decimal,
    // None => рыночный ордер
    #[serde(default, with = "rust_decimal::serde::float_option", skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub magic: i64,
    #[serde(default)]
    pub timestamp: i64,
    pub sent_at_ns: i64,
    /// Идентичность события от паблишера, если он её передаёт
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl TradeEvent {
    /// Разбор payload с шины. Ошибка содержит JSON-путь до битого поля.
    pub fn decode(payload: &str) -> Result<Self, DecodeError> {
        let de = &mut serde_json::Deserializer::from_str(payload);
        let event: TradeEvent = serde_path_to_error::deserialize(de)?;
        if event.symbol.trim().is_empty() {
            return Err(DecodeError {
                path: "symbol".to_string(),
                message: "symbol must not be empty".to_string(),
            });
        }
        Ok(event)
    }

    /// Подставляет id сообщения шины, если паблишер не прислал свой `event_id`.
    pub fn with_bus_message_id(mut self, message_id: Option<&str>) -> Self {
        if self.event_id.is_none() {
            if let Some(id) = message_id.filter(|id| !id.is_empty()) {
                self.event_id = Some(format!("bus:{}", id));
            }
        }
        self
    }

    /// Стабильная идентичность события для correlation id.
    /// `sent_at_ns` сам по себе не уникален, поэтому без явного id берём составной ключ.
    pub fn identity(&self) -> String {
        match &self.event_id {
            Some(id) => id.clone(),
            None => format!(
                "{}:{}:{}:{}:{}",
                self.sent_at_ns, self.timestamp, self.magic, self.action, self.symbol
            ),
        }
    }
}

/// Ордер для конкретного подписчика, производный от TradeEvent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyOrder {
    pub subscriber_id: String,
    pub action: TradeAction,
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub volume: Decimal,
    #[serde(default, with = "rust_decimal::serde::float_option", skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    pub correlation_id: String,
}

impl CopyOrder {
    pub fn is_market(&self) -> bool {
        self.price.is_none()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
