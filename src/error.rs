// src/error.rs
use thiserror::Error;

/// Ошибки конфигурации и старта. Всегда фатальны для процесса.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Duplicate subscriber id: {0}")]
    DuplicateSubscriber(String),

    #[error("Failed to initialize connector for subscriber {subscriber}: {reason}")]
    Connector { subscriber: String, reason: String },
}

/// Битый payload события на шине.
#[derive(Error, Debug)]
#[error("Invalid TradeEvent JSON at `{path}`: {message}")]
pub struct DecodeError {
    pub path: String,
    pub message: String,
}

impl From<serde_path_to_error::Error<serde_json::Error>> for DecodeError {
    fn from(err: serde_path_to_error::Error<serde_json::Error>) -> Self {
        Self {
            path: err.path().to_string(),
            message: err.inner().to_string(),
        }
    }
}

/// Диспетчер не нашёл коннектор (или линия коннектора уже закрыта).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("No connector found for subscriber {0}")]
    NotFound(String),

    #[error("Connector lane for subscriber {0} is closed")]
    LaneClosed(String),
}

/// Ошибки брокерской сессии.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Сетевая ошибка, можно повторить
    #[error("Broker transport error: {0}")]
    Transport(String),

    /// Транспорт отказал так, что повтор бессмысленен
    #[error("Broker fatal error: {0}")]
    Fatal(String),
}

impl SessionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Transport(_))
    }
}

/// Ошибки транспорта шины сообщений.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Bus connection failed: {0}")]
    Connect(String),

    #[error("Bus subscription failed: {0}")]
    Subscribe(String),

    #[error("Bus publish failed: {0}")]
    Publish(String),

    #[error("Bus transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Dispatch cancelled before handoff completed")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Bus unrecoverable after {attempts} reconnect attempts: {last_error}")]
    Unrecoverable { attempts: u32, last_error: BusError },
}
