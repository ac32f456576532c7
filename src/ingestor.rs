// src/ingestor.rs

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::bus::{BusMessage, MessageBus};
use crate::config::Config;
use crate::connector::Backoff;
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::error::{BusError, DispatchError, IngestError};
use crate::models::TradeEvent;
use crate::shutdown::CancelToken;

const COMMAND_QUEUE: usize = 1_024;

#[derive(Debug, Clone)]
pub struct IngestorSettings {
    pub events_topic: String,
    /// None = не публиковать команды
    pub commands_topic: Option<String>,
    pub reconnect: Backoff,
    /// 0 = переподключаться бесконечно
    pub max_reconnect_attempts: u32,
}

impl IngestorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            events_topic: cfg.events_topic(),
            commands_topic: cfg.publish_commands.then(|| cfg.commands_topic.clone()),
            reconnect: Backoff::new(
                Duration::from_millis(cfg.reconnect_base_ms),
                Duration::from_millis(cfg.reconnect_max_ms),
            ),
            max_reconnect_attempts: cfg.max_reconnect_attempts,
        }
    }
}

/// Читает события мастера с шины и отдаёт их диспетчеру строго по порядку
pub struct EventIngestor {
    bus: Arc<dyn MessageBus>,
    dispatcher: Dispatcher,
    settings: IngestorSettings,
    reporters: JoinSet<()>,
    reports: Option<mpsc::Sender<DispatchReport>>,
    commands: Option<mpsc::Sender<String>>,
    command_task: Option<JoinHandle<()>>,
}

impl EventIngestor {
    pub fn new(bus: Arc<dyn MessageBus>, dispatcher: Dispatcher, settings: IngestorSettings) -> Self {
        Self {
            bus,
            dispatcher,
            settings,
            reporters: JoinSet::new(),
            reports: None,
            commands: None,
            command_task: None,
        }
    }

    /// Каждый готовый DispatchReport дополнительно уходит в этот канал
    pub fn with_reports(mut self, tx: mpsc::Sender<DispatchReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    /// Основной цикл. `Ok(())` после отмены, `Err` когда шина не поднимается.
    pub async fn run(&mut self, cancel: CancelToken) -> Result<(), IngestError> {
        self.start_command_publisher();
        let result = self.consume(&cancel).await;
        // публикатор допишет очередь и завершится сам
        self.commands = None;
        result
    }

    async fn consume(&mut self, cancel: &CancelToken) -> Result<(), IngestError> {
        let topic = self.settings.events_topic.clone();
        let mut failures: u32 = 0;

        'reconnect: loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let subscribed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                res = self.bus.subscribe(&topic) => res,
            };

            let mut subscription = match subscribed {
                Ok(sub) => {
                    if failures > 0 {
                        info!(topic = %topic, after = failures, "Bus subscription restored.");
                    } else {
                        info!(topic = %topic, "Listening for master events.");
                    }
                    failures = 0;
                    sub
                }
                Err(e) => {
                    failures += 1;
                    let max = self.settings.max_reconnect_attempts;
                    if max > 0 && failures >= max {
                        error!(topic = %topic, attempts = failures, "Giving up on bus: {}", e);
                        return Err(IngestError::Unrecoverable { attempts: failures, last_error: e });
                    }
                    let delay = self.settings.reconnect.delay(failures);
                    warn!(topic = %topic, attempt = failures, "Bus subscribe failed: {}. Retrying in {:?}", e, delay);
                    if !sleep_or_cancel(delay, cancel).await {
                        return Ok(());
                    }
                    continue 'reconnect;
                }
            };

            let dropped: BusError = loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!(topic = %topic, "Ingestor cancelled, dropping subscription.");
                        return Ok(());
                    }
                    item = subscription.recv() => item,
                };

                match item {
                    Some(Ok(msg)) => {
                        if let Err(DispatchError::Cancelled) = self.handle(msg, cancel).await {
                            info!(topic = %topic, "Ingestor cancelled during dispatch.");
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => break e,
                    None => break BusError::Transport("subscription closed".into()),
                }
            };

            drop(subscription);
            let delay = self.settings.reconnect.delay(1);
            warn!(topic = %topic, "Bus connection lost: {}. Resubscribing in {:?}", dropped, delay);
            if !sleep_or_cancel(delay, cancel).await {
                return Ok(());
            }
        }
    }

    async fn handle(&mut self, msg: BusMessage, cancel: &CancelToken) -> Result<(), DispatchError> {
        let event = match TradeEvent::decode(&msg.payload) {
            Ok(event) => event.with_bus_message_id(msg.id.as_deref()),
            Err(e) => {
                warn!(
                    topic = %msg.topic,
                    message_id = ?msg.id,
                    path = %e.path,
                    "Skipping malformed trade event: {}", e.message
                );
                return Ok(());
            }
        };
        log_latency(&event);

        let pending = self.dispatcher.dispatch(&event, cancel).await?;

        if let Some(tx) = &self.commands {
            for order in pending.orders() {
                match order.to_json() {
                    Ok(json) => {
                        if let Err(e) = tx.try_send(json) {
                            warn!(correlation_id = %order.correlation_id, "Command not queued for publish: {}", e);
                        }
                    }
                    Err(e) => warn!(correlation_id = %order.correlation_id, "Failed to serialize CopyOrder: {}", e),
                }
            }
        }

        let reports = self.reports.clone();
        self.reporters.spawn(async move {
            let report = pending.wait().await;
            report.log_summary();
            if let Some(tx) = reports {
                let _ = tx.send(report).await;
            }
        });
        // подчищаем завершённые репортеры
        while self.reporters.try_join_next().is_some() {}
        Ok(())
    }

    fn start_command_publisher(&mut self) {
        let Some(topic) = self.settings.commands_topic.clone() else {
            return;
        };
        if self.command_task.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::channel::<String>(COMMAND_QUEUE);
        let bus = self.bus.clone();
        self.commands = Some(tx);
        self.command_task = Some(tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if let Err(e) = bus.publish(&topic, &payload).await {
                    warn!(topic = %topic, "Failed to publish copy command: {}", e);
                }
            }
            debug!(topic = %topic, "Command publisher stopped.");
        }));
    }

    /// Ждёт отчёты по уже переданным событиям и очередь команд.
    /// `false`, если не уложились в `timeout`.
    pub async fn drain(&mut self, timeout: Duration) -> bool {
        self.commands = None;
        let command_task = self.command_task.take();
        let reporters = &mut self.reporters;
        let drained = tokio::time::timeout(timeout, async move {
            while let Some(joined) = reporters.join_next().await {
                if let Err(e) = joined {
                    error!("Report task failed: {}", e);
                }
            }
            if let Some(handle) = command_task {
                let _ = handle.await;
            }
        })
        .await;

        match drained {
            Ok(()) => true,
            Err(_) => {
                warn!(pending = self.reporters.len(), "Drain timed out, abandoning in-flight reports.");
                self.reporters.abort_all();
                false
            }
        }
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancelToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

fn log_latency(event: &TradeEvent) {
    let Some(now_ns) = chrono::Utc::now().timestamp_nanos_opt() else {
        return;
    };
    if event.sent_at_ns > 0 {
        let latency_us = (now_ns - event.sent_at_ns) / 1_000;
        debug!(event = %event.identity(), latency_us, "Master event received.");
    }
}
