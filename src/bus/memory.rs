// src/bus/memory.rs

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use super::{BusMessage, MessageBus, Subscription};
use crate::error::BusError;

const SUBSCRIPTION_BUFFER: usize = 1_024;

type Subscriber = mpsc::Sender<Result<BusMessage, BusError>>;

#[derive(Default)]
struct Inner {
    topics: HashMap<String, Vec<Subscriber>>,
    failing_subscribes: u32,
}

/// Шина в памяти процесса. Доставка как у Redis pub/sub:
/// только текущим подписчикам, без хранения и без id сообщений.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, BusError> {
        self.inner
            .lock()
            .map_err(|_| BusError::Transport("in-memory bus state poisoned".to_string()))
    }

    /// Публикация с id транспорта, который стабилен при повторной доставке
    /// (как id записи в потоке). `publish` шлёт без id.
    pub async fn publish_with_id(&self, topic: &str, id: Option<String>, payload: &str) -> Result<(), BusError> {
        let targets = self.lock()?.topics.get(topic).cloned().unwrap_or_default();

        for sub in targets {
            let msg = BusMessage {
                topic: topic.to_string(),
                id: id.clone(),
                payload: payload.to_string(),
            };
            if sub.send(Ok(msg)).await.is_err() {
                debug!(topic, "Dropping closed in-memory subscription.");
            }
        }
        self.prune(topic);
        Ok(())
    }

    /// Обрывает все подписки, как при падении соединения
    pub fn disconnect_all(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.topics.clear();
        }
    }

    /// Отправляет подписчикам ошибку транспорта
    pub async fn inject_error(&self, topic: &str, err: BusError) {
        let targets = match self.inner.lock() {
            Ok(inner) => inner.topics.get(topic).cloned().unwrap_or_default(),
            Err(_) => return,
        };
        for sub in targets {
            let _ = sub.send(Err(err.clone())).await;
        }
    }

    /// Следующие `n` попыток подписки завершатся ошибкой
    pub fn fail_next_subscribes(&self, n: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failing_subscribes = n;
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.topics.get(topic).map_or(0, |subs| subs.iter().filter(|s| !s.is_closed()).count()))
            .unwrap_or(0)
    }

    fn prune(&self, topic: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(subs) = inner.topics.get_mut(topic) {
                subs.retain(|s| !s.is_closed());
            }
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let mut inner = self.lock()?;
        if inner.failing_subscribes > 0 {
            inner.failing_subscribes -= 1;
            return Err(BusError::Connect("in-memory bus refused connection".to_string()));
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        inner.topics.entry(topic.to_string()).or_default().push(tx);
        debug!(topic, "In-memory subscription created.");
        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        self.publish_with_id(topic, None, payload).await
    }
}
