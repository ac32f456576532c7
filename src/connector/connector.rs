// src/connector/connector.rs

use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::cache::RecentIds;
use super::retry::RetryPolicy;
use crate::broker::{BrokerSession, BrokerStatus, NewOrderRequest, NewOrderResponse};
use crate::config::{Config, SubscriberConfig};
use crate::error::{LookupError, SessionError};
use crate::models::CopyOrder;
use crate::shutdown::{CancelToken, Shutdown};

/// Итог отправки одного ордера подписчику
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Filled,
    /// Брокер принял ордер, но исполнения ещё нет
    Accepted,
    Rejected(String),
    /// Повторы исчерпаны, нефатальная ошибка транспорта или отмена
    Failed(String),
}

impl Outcome {
    /// Терминальные исходы кэшируются; Failed можно попробовать снова при редоставке
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Failed(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Filled | Outcome::Accepted)
    }

    fn from_response(resp: NewOrderResponse) -> Self {
        match resp.status {
            BrokerStatus::Filled => Outcome::Filled,
            BrokerStatus::Accepted => Outcome::Accepted,
            BrokerStatus::Rejected => Outcome::Rejected(
                resp.reject_reason.unwrap_or_else(|| "no reason given".to_string()),
            ),
            BrokerStatus::Unknown(status) => {
                Outcome::Failed(format!("unexpected broker status `{}`", status))
            }
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Filled => write!(f, "Filled"),
            Outcome::Accepted => write!(f, "Accepted"),
            Outcome::Rejected(reason) => write!(f, "Rejected({})", reason),
            Outcome::Failed(reason) => write!(f, "Failed({})", reason),
        }
    }
}

/// Параметры линии коннектора
#[derive(Debug, Clone, Copy)]
pub struct ConnectorSettings {
    pub lane_capacity: usize,
    /// Сколько отправок брокерам может идти одновременно на весь пул
    pub max_in_flight: usize,
    pub dedupe_capacity: usize,
    pub dedupe_ttl: Duration,
    pub retry: RetryPolicy,
}

impl ConnectorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            lane_capacity: cfg.lane_capacity,
            max_in_flight: cfg.dispatch_max_concurrency,
            dedupe_capacity: cfg.dedupe_capacity,
            dedupe_ttl: Duration::from_secs(cfg.dedupe_ttl_secs),
            retry: RetryPolicy::from_config(cfg),
        }
    }
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            lane_capacity: 256,
            max_in_flight: 64,
            dedupe_capacity: 4_096,
            dedupe_ttl: Duration::from_secs(3_600),
            retry: RetryPolicy::default(),
        }
    }
}

struct Job {
    order: CopyOrder,
    cancel: CancelToken,
    reply: oneshot::Sender<Outcome>,
}

/// Ордер уже стоит в линии подписчика, результат придёт позже
#[derive(Debug)]
pub struct PendingOutcome {
    rx: oneshot::Receiver<Outcome>,
}

impl PendingOutcome {
    pub async fn wait(self) -> Outcome {
        self.rx
            .await
            .unwrap_or_else(|_| Outcome::Failed("connector lane dropped the order".to_string()))
    }
}

/// Коннектор одного подписчика: владеет брокерской сессией,
/// отправляет ордера строго по одному и в порядке поступления.
pub struct Connector {
    subscriber_id: String,
    lane: mpsc::Sender<Job>,
    closing: Shutdown,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("subscriber_id", &self.subscriber_id)
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// Запускает линию коннектора. Должен вызываться внутри tokio runtime.
    pub fn new(sub: &SubscriberConfig, session: Arc<dyn BrokerSession>, settings: ConnectorSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_in_flight.max(1)));
        Self::with_send_permits(sub, session, settings, permits)
    }

    /// Как `new`, но лимит одновременных отправок общий с другими коннекторами.
    /// Разрешение берётся только на время одной попытки у брокера.
    pub fn with_send_permits(
        sub: &SubscriberConfig,
        session: Arc<dyn BrokerSession>,
        settings: ConnectorSettings,
        send_permits: Arc<Semaphore>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.lane_capacity.max(1));
        let closing = Shutdown::new();
        let lane = Lane {
            subscriber_id: sub.id.clone(),
            account_id: sub.account().to_string(),
            session,
            send_permits,
            recent: RecentIds::new(settings.dedupe_capacity, settings.dedupe_ttl),
            retry: settings.retry,
        };
        let worker = tokio::spawn(lane.run(rx, closing.token()));
        Self {
            subscriber_id: sub.id.clone(),
            lane: tx,
            closing,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Ставит ордер в линию и возвращается, не дожидаясь отправки.
    /// Порядок вызовов `submit` = порядок отправки брокеру.
    /// Переполненная линия не ждёт: ордер сразу получает `Failed("lane full")`.
    pub fn submit(&self, order: CopyOrder, cancel: CancelToken) -> Result<PendingOutcome, LookupError> {
        let (reply, rx) = oneshot::channel();
        let job = Job { order, cancel, reply };
        match self.lane.try_send(job) {
            Ok(()) => Ok(PendingOutcome { rx }),
            Err(TrySendError::Full(job)) => {
                warn!(
                    subscriber = %self.subscriber_id,
                    correlation_id = %job.order.correlation_id,
                    "Connector lane full, order not queued."
                );
                let _ = job.reply.send(Outcome::Failed("lane full".to_string()));
                Ok(PendingOutcome { rx })
            }
            Err(TrySendError::Closed(_)) => Err(LookupError::LaneClosed(self.subscriber_id.clone())),
        }
    }

    /// Отправка с ожиданием результата
    pub async fn send(&self, order: CopyOrder, cancel: CancelToken) -> Outcome {
        match self.submit(order, cancel) {
            Ok(pending) => pending.wait().await,
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }

    /// Закрывает линию: новые ордера не принимаются, уже стоящие дорабатываются.
    pub async fn close(&self) {
        self.closing.trigger();
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(subscriber = %self.subscriber_id, "Connector lane task failed: {}", e);
            }
        }
    }
}

struct Lane {
    subscriber_id: String,
    account_id: String,
    session: Arc<dyn BrokerSession>,
    send_permits: Arc<Semaphore>,
    recent: RecentIds<Outcome>,
    retry: RetryPolicy,
}

impl Lane {
    async fn run(mut self, mut rx: mpsc::Receiver<Job>, closing: CancelToken) {
        debug!(subscriber = %self.subscriber_id, "Connector lane started.");
        let mut closed = false;
        loop {
            let job = if closed {
                rx.recv().await
            } else {
                tokio::select! {
                    biased;
                    job = rx.recv() => job,
                    _ = closing.cancelled() => {
                        rx.close();
                        closed = true;
                        continue;
                    }
                }
            };
            let Some(job) = job else { break };

            let outcome = self.process(&job.order, &job.cancel).await;
            // получатель мог уйти (отмена диспетчера), ордер всё равно обработан
            let _ = job.reply.send(outcome);
        }
        info!(subscriber = %self.subscriber_id, "Connector lane stopped.");
    }

    async fn process(&mut self, order: &CopyOrder, cancel: &CancelToken) -> Outcome {
        if let Some(cached) = self.recent.get(&order.correlation_id) {
            info!(
                subscriber = %self.subscriber_id,
                correlation_id = %order.correlation_id,
                outcome = %cached,
                cached = self.recent.len(),
                "Duplicate order, returning cached outcome."
            );
            return cached;
        }
        if cancel.is_cancelled() {
            return Outcome::Failed("cancelled before send".to_string());
        }

        let req = NewOrderRequest::from_order(&self.account_id, order);
        let outcome = self.send_with_retry(&req, cancel).await;

        match &outcome {
            Outcome::Filled | Outcome::Accepted => info!(
                subscriber = %self.subscriber_id,
                correlation_id = %req.client_order_id,
                symbol = %req.symbol,
                qty = %req.quantity,
                outcome = %outcome,
                "Order delivered."
            ),
            Outcome::Rejected(reason) => warn!(
                subscriber = %self.subscriber_id,
                correlation_id = %req.client_order_id,
                "Broker rejected order: {}", reason
            ),
            Outcome::Failed(reason) => error!(
                subscriber = %self.subscriber_id,
                correlation_id = %req.client_order_id,
                "Order failed: {}", reason
            ),
        }

        if outcome.is_terminal() {
            self.recent.insert(order.correlation_id.clone(), outcome.clone());
        }
        outcome
    }

    async fn send_with_retry(&self, req: &NewOrderRequest, cancel: &CancelToken) -> Outcome {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Outcome::Failed(format!("cancelled waiting for a send slot (attempt {})", attempt));
                }
                p = self.send_permits.acquire() => p,
            };
            let Ok(slot) = permit else {
                return Outcome::Failed("send slots closed".to_string());
            };

            let call = AssertUnwindSafe(self.session.send_new_order(req)).catch_unwind();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Outcome::Failed(format!("cancelled during attempt {}", attempt));
                }
                r = timeout(self.retry.attempt_timeout, call) => r,
            };
            drop(slot);

            let err = match result {
                Ok(Ok(Ok(resp))) => return Outcome::from_response(resp),
                Ok(Ok(Err(e))) => e,
                Ok(Err(panic)) => {
                    return Outcome::Failed(format!("broker session panicked: {}", panic_message(&*panic)));
                }
                Err(_) => SessionError::Transport(format!(
                    "attempt timed out after {:?}",
                    self.retry.attempt_timeout
                )),
            };

            if !err.is_retryable() {
                return Outcome::Failed(err.to_string());
            }
            if attempt >= self.retry.max_attempts {
                return Outcome::Failed(format!("retries exhausted after {} attempts: {}", attempt, err));
            }

            let delay = self.retry.backoff.delay(attempt);
            warn!(
                subscriber = %self.subscriber_id,
                correlation_id = %req.client_order_id,
                attempt,
                "Send failed: {}. Retrying in {:?}...", err, delay
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Outcome::Failed(format!("cancelled during backoff after {} attempts: {}", attempt, err));
                }
                _ = sleep(delay) => {}
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::retry::Backoff;
    use crate::models::TradeAction;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Сессия с заранее заданными ответами; пустой сценарий = Filled
    #[derive(Default)]
    struct Scripted {
        script: Mutex<VecDeque<Result<NewOrderResponse, SessionError>>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl Scripted {
        fn with(script: Vec<Result<NewOrderResponse, SessionError>>) -> Arc<Self> {
            Arc::new(Self { script: Mutex::new(script.into()), ..Default::default() })
        }
    }

    #[async_trait]
    impl BrokerSession for Scripted {
        async fn send_new_order(&self, req: &NewOrderRequest) -> Result<NewOrderResponse, SessionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(req.client_order_id.clone());
            if let Some(d) = self.delay {
                sleep(d).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(NewOrderResponse::filled()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl BrokerSession for Panicking {
        async fn send_new_order(&self, _req: &NewOrderRequest) -> Result<NewOrderResponse, SessionError> {
            panic!("session blew up");
        }
    }

    fn fast_settings(max_attempts: u32) -> ConnectorSettings {
        ConnectorSettings {
            retry: RetryPolicy {
                max_attempts,
                backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(4)),
                attempt_timeout: Duration::from_millis(200),
            },
            ..Default::default()
        }
    }

    fn order(id: &str) -> CopyOrder {
        CopyOrder {
            subscriber_id: "S1".into(),
            action: TradeAction::Open,
            symbol: "EURUSD".into(),
            volume: dec!(0.5),
            price: Some(dec!(1.08345)),
            correlation_id: id.into(),
        }
    }

    fn sub() -> SubscriberConfig {
        SubscriberConfig::new("S1", dec!(0.5))
    }

    #[tokio::test]
    async fn duplicate_is_served_from_cache() {
        let session = Scripted::with(vec![]);
        let conn = Connector::new(&sub(), session.clone(), fast_settings(3));

        let first = conn.send(order("c1"), CancelToken::never()).await;
        let second = conn.send(order("c1"), CancelToken::never()).await;
        assert_eq!(first, Outcome::Filled);
        assert_eq!(second, Outcome::Filled);
        assert_eq!(session.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejection_is_terminal_and_cached() {
        let session = Scripted::with(vec![Ok(NewOrderResponse::rejected("market closed"))]);
        let conn = Connector::new(&sub(), session.clone(), fast_settings(3));

        let out = conn.send(order("c1"), CancelToken::never()).await;
        assert_eq!(out, Outcome::Rejected("market closed".into()));
        assert_eq!(session.calls.load(Ordering::SeqCst), 1);

        let again = conn.send(order("c1"), CancelToken::never()).await;
        assert_eq!(again, out);
        assert_eq!(session.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_errors_are_retried() {
        let session = Scripted::with(vec![
            Err(SessionError::Transport("reset".into())),
            Err(SessionError::Transport("reset".into())),
            Ok(NewOrderResponse::filled()),
        ]);
        let conn = Connector::new(&sub(), session.clone(), fast_settings(3));
        assert_eq!(conn.send(order("c1"), CancelToken::never()).await, Outcome::Filled);
        assert_eq!(session.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_and_are_not_cached() {
        let session = Scripted::with(vec![
            Err(SessionError::Transport("down".into())),
            Err(SessionError::Transport("down".into())),
        ]);
        let conn = Connector::new(&sub(), session.clone(), fast_settings(2));
        let out = conn.send(order("c1"), CancelToken::never()).await;
        assert!(matches!(out, Outcome::Failed(ref r) if r.contains("retries exhausted")));
        assert_eq!(session.calls.load(Ordering::SeqCst), 2);

        // редоставка того же события пробует снова
        assert_eq!(conn.send(order("c1"), CancelToken::never()).await, Outcome::Filled);
        assert_eq!(session.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let session = Scripted::with(vec![Err(SessionError::Fatal("bad credentials".into()))]);
        let conn = Connector::new(&sub(), session.clone(), fast_settings(5));
        let out = conn.send(order("c1"), CancelToken::never()).await;
        assert!(matches!(out, Outcome::Failed(ref r) if r.contains("bad credentials")));
        assert_eq!(session.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sends_in_submission_order() {
        let session = Arc::new(Scripted { delay: Some(Duration::from_millis(2)), ..Default::default() });
        let conn = Connector::new(&sub(), session.clone(), fast_settings(1));

        let mut pending = Vec::new();
        for i in 0..20 {
            pending.push(conn.submit(order(&format!("c{}", i)), CancelToken::never()).unwrap());
        }
        for p in pending {
            assert_eq!(p.wait().await, Outcome::Filled);
        }
        let expected: Vec<String> = (0..20).map(|i| format!("c{}", i)).collect();
        assert_eq!(*session.seen.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn cancellation_mid_retry_frees_the_lane() {
        let session = Scripted::with(vec![Err(SessionError::Transport("down".into()))]);
        let mut settings = fast_settings(10);
        settings.retry.backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(30));
        let conn = Connector::new(&sub(), session.clone(), settings);

        let shutdown = Shutdown::new();
        let pending = conn.submit(order("c1"), shutdown.token()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();
        let out = tokio::time::timeout(Duration::from_secs(1), pending.wait()).await.unwrap();
        assert!(matches!(out, Outcome::Failed(ref r) if r.contains("cancelled")));

        // линия свободна для следующего ордера
        let next = tokio::time::timeout(
            Duration::from_secs(1),
            conn.send(order("c2"), CancelToken::never()),
        )
        .await
        .unwrap();
        assert_eq!(next, Outcome::Filled);
        assert_eq!(session.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panic_in_session_is_contained() {
        let conn = Connector::new(&sub(), Arc::new(Panicking), fast_settings(3));
        let out = conn.send(order("c1"), CancelToken::never()).await;
        assert!(matches!(out, Outcome::Failed(ref r) if r.contains("session blew up")));
        // линия жива
        let out = conn.send(order("c2"), CancelToken::never()).await;
        assert!(matches!(out, Outcome::Failed(_)));
    }

    #[tokio::test]
    async fn hung_session_times_out() {
        let session = Arc::new(Scripted { delay: Some(Duration::from_secs(5)), ..Default::default() });
        let mut settings = fast_settings(2);
        settings.retry.attempt_timeout = Duration::from_millis(20);
        let conn = Connector::new(&sub(), session.clone(), settings);
        let out = conn.send(order("c1"), CancelToken::never()).await;
        assert!(matches!(out, Outcome::Failed(ref r) if r.contains("timed out")));
        assert_eq!(session.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn closed_lane_refuses_new_orders() {
        let conn = Connector::new(&sub(), Scripted::with(vec![]), fast_settings(1));
        conn.close().await;
        let err = conn.submit(order("c1"), CancelToken::never()).unwrap_err();
        assert_eq!(err, LookupError::LaneClosed("S1".into()));
    }

    #[tokio::test]
    async fn full_lane_fails_fast() {
        let session = Arc::new(Scripted { delay: Some(Duration::from_millis(100)), ..Default::default() });
        let settings = ConnectorSettings { lane_capacity: 1, ..fast_settings(1) };
        let conn = Connector::new(&sub(), session.clone(), settings);

        let first = conn.submit(order("c1"), CancelToken::never()).unwrap();
        // c1 уже у брокера, c2 занимает единственное место в очереди
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = conn.submit(order("c2"), CancelToken::never()).unwrap();

        let started = std::time::Instant::now();
        let third = conn.submit(order("c3"), CancelToken::never()).unwrap();
        assert_eq!(third.wait().await, Outcome::Failed("lane full".into()));
        assert!(started.elapsed() < Duration::from_millis(50));

        assert_eq!(first.wait().await, Outcome::Filled);
        assert_eq!(second.wait().await, Outcome::Filled);
        assert_eq!(*session.seen.lock().unwrap(), vec!["c1", "c2"]);
    }

    #[derive(Default)]
    struct Gauge {
        now: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl BrokerSession for Gauge {
        async fn send_new_order(&self, _req: &NewOrderRequest) -> Result<NewOrderResponse, SessionError> {
            let current = self.now.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            sleep(Duration::from_millis(20)).await;
            self.now.fetch_sub(1, Ordering::SeqCst);
            Ok(NewOrderResponse::filled())
        }
    }

    #[tokio::test]
    async fn shared_send_slots_bound_concurrent_sends() {
        let gauge = Arc::new(Gauge::default());
        let slots = Arc::new(Semaphore::new(1));
        let a = Connector::with_send_permits(&SubscriberConfig::new("A", dec!(1)), gauge.clone(), fast_settings(1), slots.clone());
        let b = Connector::with_send_permits(&SubscriberConfig::new("B", dec!(1)), gauge.clone(), fast_settings(1), slots);

        let (ra, rb) = tokio::join!(
            a.send(order("a1"), CancelToken::never()),
            b.send(order("b1"), CancelToken::never())
        );
        assert_eq!(ra, Outcome::Filled);
        assert_eq!(rb, Outcome::Filled);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
    }
}
