// src/shutdown.rs
//! Общий сигнал отмены: ingestor, диспетчер и линии коннекторов слушают один токен.

use tokio::sync::watch;
use tracing::{info, warn};

/// Токен отмены. Клонируется дёшево, отмена видна всем клонам.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Токен, который никогда не отменяется
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Ждёт отмены. Если источник сигнала пропал без отмены, ждёт вечно.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Владелец сигнала остановки процесса
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken { rx: self.tx.subscribe() }
    }

    pub fn trigger(&self) {
        // send_replace работает и без живых получателей
        if !self.tx.send_replace(true) {
            info!("Shutdown triggered.");
        }
    }

    /// Ждёт Ctrl-C и переводит токен в отменённое состояние
    pub async fn trigger_on_ctrl_c(&self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, stopping copier..."),
            Err(e) => warn!("Failed to listen for Ctrl-C: {}. Stopping.", e),
        }
        self.trigger();
    }
}
