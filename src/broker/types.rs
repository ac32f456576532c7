// src/broker/types.rs
use rust_decimal::Decimal;

use crate::models::CopyOrder;

/// Запрос на новый ордер у брокера подписчика
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrderRequest {
    pub account_id: String,
    pub symbol: String,
    pub side: String,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>, // None для рыночных
    pub client_order_id: String,
}

impl NewOrderRequest {
    pub fn from_order(account_id: &str, order: &CopyOrder) -> Self {
        Self {
            account_id: account_id.to_string(),
            symbol: order.symbol.clone(),
            side: order.action.as_str().to_string(),
            quantity: order.volume,
            limit_price: order.price,
            client_order_id: order.correlation_id.clone(),
        }
    }
}

/// Текстовый статус ответа брокера
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerStatus {
    Filled,
    Accepted,
    Rejected,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrderResponse {
    pub status: BrokerStatus,
    pub reject_reason: Option<String>,
}

impl NewOrderResponse {
    pub fn filled() -> Self {
        Self { status: BrokerStatus::Filled, reject_reason: None }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self { status: BrokerStatus::Rejected, reject_reason: Some(reason.into()) }
    }
}
