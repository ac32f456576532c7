// src/config.rs
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::time::Duration;
use config::{Config as Loader, Environment, File};
use rust_decimal::Decimal;

use crate::error::ConfigError;

/// Подписчик (slave-счёт)
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SubscriberConfig {
    pub id: String,
    /// 0 = подписчик выключен
    pub lot_ratio: Decimal,
    #[serde(default)]
    pub symbol_map: HashMap<String, String>,
    /// Счёт у брокера, если отличается от id
    #[serde(default)]
    pub account_id: Option<String>,
    /// Только для paper-брокера: символы, которые он отклоняет
    #[serde(default)]
    pub reject_symbols: Vec<String>,
}

impl SubscriberConfig {
    pub fn new(id: &str, lot_ratio: Decimal) -> Self {
        Self {
            id: id.to_string(),
            lot_ratio,
            symbol_map: HashMap::new(),
            account_id: None,
            reject_symbols: Vec::new(),
        }
    }

    pub fn with_symbol(mut self, master: &str, local: &str) -> Self {
        self.symbol_map.insert(master.to_string(), local.to_string());
        self
    }

    pub fn account(&self) -> &str {
        self.account_id.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    // Мастер
    pub master_id: String,

    // Шина (WebSocket-шлюз)
    #[serde(default)]
    pub bus_url: Option<String>,
    #[serde(default)]
    pub bus_api_key: Option<String>,
    #[serde(default)]
    pub bus_api_secret: Option<String>,
    #[serde(default = "default_commands_topic")]
    pub commands_topic: String,
    #[serde(default = "default_true")]
    pub publish_commands: bool,
    #[serde(default = "default_ws_ping_interval_secs")]
    pub ws_ping_interval_secs: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default)]
    pub max_reconnect_attempts: u32, // 0 = бесконечно

    // Диспетчер
    #[serde(default = "default_dispatch_max_concurrency")]
    pub dispatch_max_concurrency: usize,

    // Коннекторы
    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,
    #[serde(default = "default_send_max_attempts")]
    pub send_max_attempts: u32,
    #[serde(default = "default_send_backoff_base_ms")]
    pub send_backoff_base_ms: u64,
    #[serde(default = "default_send_backoff_max_ms")]
    pub send_backoff_max_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_dedupe_capacity")]
    pub dedupe_capacity: usize,
    #[serde(default = "default_dedupe_ttl_secs")]
    pub dedupe_ttl_secs: u64,

    // Остановка
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    #[serde(default)]
    pub subscribers: Vec<SubscriberConfig>,
}

fn default_commands_topic() -> String { "copier:commands".into() }
fn default_true() -> bool { true }
fn default_ws_ping_interval_secs() -> u64 { 20 }
fn default_reconnect_base_ms() -> u64 { 500 }
fn default_reconnect_max_ms() -> u64 { 30_000 }
fn default_dispatch_max_concurrency() -> usize { 64 }
fn default_lane_capacity() -> usize { 256 }
fn default_send_max_attempts() -> u32 { 3 }
fn default_send_backoff_base_ms() -> u64 { 200 }
fn default_send_backoff_max_ms() -> u64 { 5_000 }
fn default_send_timeout_ms() -> u64 { 10_000 }
fn default_dedupe_capacity() -> usize { 4_096 }
fn default_dedupe_ttl_secs() -> u64 { 3_600 }
fn default_drain_timeout_secs() -> u64 { 10 }

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let file = env::var("COPIER_CONFIG").unwrap_or_else(|_| "Config.toml".into());
        let loader = Loader::builder()
            .add_source(File::with_name(&file).required(false))
            .add_source(Environment::with_prefix("COPIER").separator("__"))
            .build()?;
        let cfg: Config = loader.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Топик событий мастера, как у паблишера: `master:<id>:events`
    pub fn events_topic(&self) -> String {
        format!("master:{}:events", self.master_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.master_id.trim().is_empty() {
            return Err(ConfigError::Invalid("master_id must not be empty".into()));
        }
        if self.subscribers.is_empty() {
            return Err(ConfigError::Invalid("at least one subscriber is required".into()));
        }
        let mut seen = HashSet::new();
        for sub in &self.subscribers {
            if sub.id.trim().is_empty() {
                return Err(ConfigError::Invalid("subscriber id must not be empty".into()));
            }
            if !seen.insert(sub.id.as_str()) {
                return Err(ConfigError::DuplicateSubscriber(sub.id.clone()));
            }
            if sub.lot_ratio < Decimal::ZERO {
                return Err(ConfigError::Invalid(format!(
                    "subscriber {}: lot_ratio must be >= 0, got {}",
                    sub.id, sub.lot_ratio
                )));
            }
        }
        if self.dispatch_max_concurrency == 0 {
            return Err(ConfigError::Invalid("dispatch_max_concurrency must be > 0".into()));
        }
        if self.lane_capacity == 0 || self.dedupe_capacity == 0 {
            return Err(ConfigError::Invalid("lane_capacity and dedupe_capacity must be > 0".into()));
        }
        if self.send_max_attempts == 0 {
            return Err(ConfigError::Invalid("send_max_attempts must be > 0".into()));
        }
        let raw = self
            .bus_url
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("bus_url is required".into()))?;
        url::Url::parse(raw)
            .map_err(|e| ConfigError::Invalid(format!("invalid bus_url `{}`: {}", raw, e)))?;
        Ok(())
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}
