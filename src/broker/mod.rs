// src/broker/mod.rs
use async_trait::async_trait;

use crate::error::SessionError;

pub mod paper;
pub mod types;

pub use paper::PaperSession;
pub use types::{BrokerStatus, NewOrderRequest, NewOrderResponse};

/// Единственная точка контакта с брокером подписчика.
/// Реальный протокол (FIX и т.п.) подключается реализацией этого трейта.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn send_new_order(&self, req: &NewOrderRequest) -> Result<NewOrderResponse, SessionError>;
}
