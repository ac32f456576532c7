// src/bus/mod.rs
//! Шина pub/sub: откуда приходят события мастера и куда уходят команды.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BusError;

pub mod memory;
pub mod ws;

pub use memory::InMemoryBus;
pub use ws::WsBus;

/// Сообщение, доставленное шиной
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    /// Id, присвоенный шиной (если транспорт его даёт)
    pub id: Option<String>,
    pub payload: String,
}

/// Поток сообщений подписки. Закрытие канала или `Err` означает разрыв.
pub type Subscription = mpsc::Receiver<Result<BusMessage, BusError>>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError>;
}
