// src/connector/retry.rs

use std::time::Duration;

use crate::config::Config;

/// Экспоненциальный backoff: base * 2^n, но не больше max
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base) }
    }

    /// Задержка после `failures` неудач подряд (1 => base)
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        let ms = (self.base.as_millis() as u64).saturating_mul(2u64.saturating_pow(exp));
        Duration::from_millis(ms).min(self.max)
    }
}

/// Политика повторов отправки ордера
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Таймаут одной попытки
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_attempts: cfg.send_max_attempts.max(1),
            backoff: Backoff::new(
                Duration::from_millis(cfg.send_backoff_base_ms),
                Duration::from_millis(cfg.send_backoff_max_ms),
            ),
            attempt_timeout: cfg.send_timeout(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::new(Duration::from_millis(200), Duration::from_secs(5)),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}
