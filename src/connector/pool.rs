// src/connector/pool.rs

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::info;

use super::connector::{Connector, ConnectorSettings};
use crate::broker::{BrokerSession, PaperSession};
use crate::config::SubscriberConfig;
use crate::error::{ConfigError, LookupError, SessionError};

/// Открывает брокерскую сессию для подписчика
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, sub: &SubscriberConfig) -> Result<Arc<dyn BrokerSession>, SessionError>;
}

/// Фабрика paper-сессий
#[derive(Debug, Default, Clone, Copy)]
pub struct PaperSessionFactory;

#[async_trait]
impl SessionFactory for PaperSessionFactory {
    async fn connect(&self, sub: &SubscriberConfig) -> Result<Arc<dyn BrokerSession>, SessionError> {
        Ok(Arc::new(PaperSession::connect(sub)?))
    }
}

/// Реестр subscriber_id -> Connector.
/// Собирается один раз при старте и дальше только читается, без блокировок.
#[derive(Debug, Clone)]
pub struct ConnectorPool {
    conns: Arc<HashMap<String, Arc<Connector>>>,
}

impl ConnectorPool {
    /// Поднимает коннектор на каждого подписчика. Любая ошибка роняет весь старт.
    pub async fn build(
        subscribers: &[SubscriberConfig],
        factory: &dyn SessionFactory,
        settings: ConnectorSettings,
    ) -> Result<Self, ConfigError> {
        let mut conns: HashMap<String, Arc<Connector>> = HashMap::with_capacity(subscribers.len());
        let send_permits = Arc::new(Semaphore::new(settings.max_in_flight.max(1)));

        for sub in subscribers {
            if conns.contains_key(&sub.id) {
                close_all(&conns).await;
                return Err(ConfigError::DuplicateSubscriber(sub.id.clone()));
            }
            let session = match factory.connect(sub).await {
                Ok(session) => session,
                Err(e) => {
                    close_all(&conns).await;
                    return Err(ConfigError::Connector {
                        subscriber: sub.id.clone(),
                        reason: e.to_string(),
                    });
                }
            };
            conns.insert(sub.id.clone(), Arc::new(Connector::with_send_permits(sub, session, settings, send_permits.clone())));
        }

        info!(connectors = conns.len(), max_in_flight = settings.max_in_flight, "Connector pool ready.");
        Ok(Self { conns: Arc::new(conns) })
    }

    pub fn get(&self, subscriber_id: &str) -> Result<Arc<Connector>, LookupError> {
        self.conns
            .get(subscriber_id)
            .cloned()
            .ok_or_else(|| LookupError::NotFound(subscriber_id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.conns.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Закрывает все линии и дожидается, пока они доработают
    pub async fn shutdown(&self) {
        close_all(&self.conns).await;
        info!("Connector pool closed.");
    }
}

async fn close_all(conns: &HashMap<String, Arc<Connector>>) {
    for conn in conns.values() {
        conn.close().await;
    }
}
