// src/broker/paper.rs

use async_trait::async_trait;
use std::collections::HashSet;
use tracing::{debug, info};

use super::{BrokerSession, NewOrderRequest, NewOrderResponse};
use crate::config::SubscriberConfig;
use crate::error::SessionError;

/// Paper-сессия: исполняет всё сразу, кроме символов из `reject_symbols`.
/// Используется, пока реальный клиент брокера не подключён.
#[derive(Debug)]
pub struct PaperSession {
    account_id: String,
    reject_symbols: HashSet<String>,
}

impl PaperSession {
    pub fn connect(sub: &SubscriberConfig) -> Result<Self, SessionError> {
        let account_id = sub.account().trim();
        if account_id.is_empty() {
            return Err(SessionError::Fatal(format!("empty broker account for subscriber {}", sub.id)));
        }
        info!(subscriber = %sub.id, account = %account_id, "Paper broker session established.");
        Ok(Self {
            account_id: account_id.to_string(),
            reject_symbols: sub.reject_symbols.iter().cloned().collect(),
        })
    }
}

#[async_trait]
impl BrokerSession for PaperSession {
    async fn send_new_order(&self, req: &NewOrderRequest) -> Result<NewOrderResponse, SessionError> {
        debug!(
            account = %self.account_id,
            symbol = %req.symbol,
            side = %req.side,
            qty = %req.quantity,
            client_order_id = %req.client_order_id,
            "Paper order"
        );
        if self.reject_symbols.contains(&req.symbol) {
            return Ok(NewOrderResponse::rejected(format!("symbol {} not tradable", req.symbol)));
        }
        Ok(NewOrderResponse::filled())
    }
}
