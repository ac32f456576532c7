// src/main.rs
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use copier::bus::{MessageBus, WsBus};
use copier::config::Config;
use copier::connector::{ConnectorPool, ConnectorSettings, PaperSessionFactory};
use copier::dispatcher::Dispatcher;
use copier::ingestor::{EventIngestor, IngestorSettings};
use copier::logger;
use copier::shutdown::Shutdown;

#[tokio::main]
async fn main() -> Result<()> {
    // 1) .env, конфиг и логгер
    dotenv::dotenv().ok();
    let cfg = Config::load().context("Failed to load copier configuration")?;
    logger::init(&cfg);

    // 2) коннекторы подписчиков
    let pool = ConnectorPool::build(
        &cfg.subscribers,
        &PaperSessionFactory,
        ConnectorSettings::from_config(&cfg),
    )
    .await
    .context("Failed to build connector pool")?;
    info!(subscribers = ?pool.ids(), "Connector pool ready.");
    let dispatcher = Dispatcher::new(cfg.subscribers.clone(), pool.clone());

    // 3) шина
    let bus: Arc<dyn MessageBus> =
        Arc::new(WsBus::from_config(&cfg).context("Invalid websocket bus settings")?);

    // 4) сигнал остановки
    let shutdown = Arc::new(Shutdown::new());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shutdown.trigger_on_ctrl_c().await });
    }

    // 5) приём событий до Ctrl-C или фатальной ошибки шины
    let mut ingestor = EventIngestor::new(bus, dispatcher, IngestorSettings::from_config(&cfg));
    info!(topic = %cfg.events_topic(), "Copier started.");
    let outcome = ingestor.run(shutdown.token()).await;
    shutdown.trigger();

    // 6) дожидаемся отчётов и закрываем линии
    if !ingestor.drain(cfg.drain_timeout()).await {
        warn!(timeout = ?cfg.drain_timeout(), "Some dispatches did not finish before shutdown.");
    }
    pool.shutdown().await;

    if let Err(e) = &outcome {
        error!("Copier stopped: {}", e);
    } else {
        info!("Copier stopped.");
    }
    outcome.context("Event ingestion failed")
}
