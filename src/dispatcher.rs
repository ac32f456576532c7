// src/dispatcher.rs

use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::SubscriberConfig;
use crate::connector::{ConnectorPool, Outcome};
use crate::error::DispatchError;
use crate::models::{CopyOrder, TradeEvent};
use crate::shutdown::CancelToken;
use crate::translator::{translate, SkipReason, Translation};

/// Результат по одному подписчику для одного события
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Sent(Outcome),
    Skipped(SkipReason),
    /// Коннектор не найден или его линия закрыта
    Unroutable(String),
    /// Паника или потерянная задача
    Faulted(String),
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitOutcome::Sent(outcome) => write!(f, "{}", outcome),
            UnitOutcome::Skipped(reason) => write!(f, "Skipped({})", reason),
            UnitOutcome::Unroutable(reason) => write!(f, "Unroutable({})", reason),
            UnitOutcome::Faulted(reason) => write!(f, "Faulted({})", reason),
        }
    }
}

/// Сводка по событию: исходы всех подписчиков в порядке конфига
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub event_identity: String,
    pub units: Vec<(String, UnitOutcome)>,
}

impl DispatchReport {
    pub fn get(&self, subscriber_id: &str) -> Option<&UnitOutcome> {
        self.units.iter().find(|(id, _)| id == subscriber_id).map(|(_, o)| o)
    }

    pub fn delivered(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Sent(out) if out.is_success()))
    }

    pub fn rejected(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Sent(Outcome::Rejected(_))))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| {
            matches!(
                o,
                UnitOutcome::Sent(Outcome::Failed(_)) | UnitOutcome::Unroutable(_) | UnitOutcome::Faulted(_)
            )
        })
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Skipped(_)))
    }

    fn count(&self, pred: impl Fn(&UnitOutcome) -> bool) -> usize {
        self.units.iter().filter(|(_, o)| pred(o)).count()
    }

    pub fn log_summary(&self) {
        let (delivered, rejected, failed, skipped) =
            (self.delivered(), self.rejected(), self.failed(), self.skipped());
        if failed > 0 || rejected > 0 {
            warn!(
                event = %self.event_identity,
                delivered, rejected, failed, skipped,
                "Event dispatched with problems."
            );
            for (id, outcome) in &self.units {
                if !matches!(outcome, UnitOutcome::Skipped(_))
                    && !matches!(outcome, UnitOutcome::Sent(o) if o.is_success())
                {
                    warn!(subscriber = %id, outcome = %outcome, "Subscriber not delivered.");
                }
            }
        } else {
            info!(event = %self.event_identity, delivered, skipped, "Event dispatched.");
        }
    }
}

/// Событие уже разложено по линиям подписчиков; исходы можно дождаться позже
pub struct PendingDispatch {
    event_identity: String,
    orders: Vec<CopyOrder>,
    expected: Vec<String>,
    ready: Vec<(usize, UnitOutcome)>,
    running: JoinSet<(usize, UnitOutcome)>,
}

impl PendingDispatch {
    /// Ордера, созданные для этого события (для топика команд)
    pub fn orders(&self) -> &[CopyOrder] {
        &self.orders
    }

    pub async fn wait(mut self) -> DispatchReport {
        let mut done = std::mem::take(&mut self.ready);
        while let Some(joined) = self.running.join_next().await {
            match joined {
                Ok(unit) => done.push(unit),
                Err(e) => error!(event = %self.event_identity, "Dispatch unit task lost: {}", e),
            }
        }

        let mut slots: Vec<Option<UnitOutcome>> = vec![None; self.expected.len()];
        for (idx, outcome) in done {
            slots[idx] = Some(outcome);
        }
        let units = self
            .expected
            .into_iter()
            .zip(slots)
            .map(|(id, slot)| {
                (id, slot.unwrap_or_else(|| UnitOutcome::Faulted("dispatch unit lost".to_string())))
            })
            .collect();

        DispatchReport { event_identity: self.event_identity, units }
    }
}

/// Раскладывает событие по всем подписчикам.
/// Передача в линии идёт последовательно и никогда не ждёт чужую линию;
/// отправка у брокеров идёт параллельно, лимит одновременных отправок держит пул.
#[derive(Clone)]
pub struct Dispatcher {
    subscribers: Arc<Vec<SubscriberConfig>>,
    pool: ConnectorPool,
}

impl Dispatcher {
    pub fn new(subscribers: Vec<SubscriberConfig>, pool: ConnectorPool) -> Self {
        Self { subscribers: Arc::new(subscribers), pool }
    }

    /// Возвращается, когда ордера события стоят во всех линиях.
    /// Следующее событие можно отдавать сразу: порядок в линиях сохранится.
    pub async fn dispatch(&self, event: &TradeEvent, cancel: &CancelToken) -> Result<PendingDispatch, DispatchError> {
        let identity = event.identity();
        let mut pending = PendingDispatch {
            event_identity: identity.clone(),
            orders: Vec::new(),
            expected: Vec::with_capacity(self.subscribers.len()),
            ready: Vec::new(),
            running: JoinSet::new(),
        };

        for (idx, sub) in self.subscribers.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(event = %identity, handed_off = pending.orders.len(), "Dispatch cancelled during handoff.");
                return Err(DispatchError::Cancelled);
            }
            pending.expected.push(sub.id.clone());

            let order = match std::panic::catch_unwind(AssertUnwindSafe(|| translate(event, sub))) {
                Ok(Translation::Order(order)) => order,
                Ok(Translation::Skip(reason)) => {
                    if reason == SkipReason::VolumeOverflow {
                        warn!(subscriber = %sub.id, event = %identity, volume = %event.volume, "Skipping: {}", reason);
                    } else {
                        debug!(subscriber = %sub.id, event = %identity, "Skipping: {}", reason);
                    }
                    pending.ready.push((idx, UnitOutcome::Skipped(reason)));
                    continue;
                }
                Err(_) => {
                    error!(subscriber = %sub.id, event = %identity, "Translation panicked.");
                    pending.ready.push((idx, UnitOutcome::Faulted("translation panicked".to_string())));
                    continue;
                }
            };

            let conn = match self.pool.get(&sub.id) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(subscriber = %sub.id, event = %identity, "{}", e);
                    pending.ready.push((idx, UnitOutcome::Unroutable(e.to_string())));
                    continue;
                }
            };

            let pending_outcome = match conn.submit(order.clone(), cancel.clone()) {
                Ok(p) => p,
                Err(e) => {
                    warn!(subscriber = %sub.id, event = %identity, "{}", e);
                    pending.ready.push((idx, UnitOutcome::Unroutable(e.to_string())));
                    continue;
                }
            };
            pending.orders.push(order);

            pending.running.spawn(async move {
                match AssertUnwindSafe(pending_outcome.wait()).catch_unwind().await {
                    Ok(outcome) => (idx, UnitOutcome::Sent(outcome)),
                    Err(_) => (idx, UnitOutcome::Faulted("dispatch unit panicked".to_string())),
                }
            });
        }

        debug!(
            event = %identity,
            handed_off = pending.orders.len(),
            subscribers = self.subscribers.len(),
            "Event handed off to connector lanes."
        );
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerSession, NewOrderRequest, NewOrderResponse};
    use crate::connector::{ConnectorSettings, PaperSessionFactory, SessionFactory};
    use crate::error::SessionError;
    use crate::models::TradeAction;
    use crate::shutdown::Shutdown;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<HashMap<String, Vec<NewOrderRequest>>>,
        down: Vec<String>,
        slow: Vec<String>,
    }

    impl Recording {
        fn count(&self, id: &str) -> usize {
            self.sent.lock().unwrap().get(id).map_or(0, Vec::len)
        }
    }

    struct RecordingSession {
        shared: Arc<Recording>,
    }

    #[async_trait]
    impl BrokerSession for RecordingSession {
        async fn send_new_order(&self, req: &NewOrderRequest) -> Result<NewOrderResponse, SessionError> {
            if self.shared.down.contains(&req.account_id) {
                return Err(SessionError::Transport("connection refused".into()));
            }
            if self.shared.slow.contains(&req.account_id) {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            self.shared
                .sent
                .lock()
                .unwrap()
                .entry(req.account_id.clone())
                .or_default()
                .push(req.clone());
            Ok(NewOrderResponse::filled())
        }
    }

    #[async_trait]
    impl SessionFactory for Arc<Recording> {
        async fn connect(&self, _sub: &SubscriberConfig) -> Result<Arc<dyn BrokerSession>, SessionError> {
            Ok(Arc::new(RecordingSession { shared: self.clone() }))
        }
    }

    fn event(sent_at_ns: i64) -> TradeEvent {
        TradeEvent {
            action: TradeAction::Open,
            symbol: "EURUSD".into(),
            volume: dec!(1.0),
            price: Some(dec!(1.08345)),
            magic: 1,
            timestamp: 1,
            sent_at_ns,
            event_id: None,
        }
    }

    fn fast() -> ConnectorSettings {
        let mut s = ConnectorSettings::default();
        s.max_in_flight = 4;
        s.retry.max_attempts = 2;
        s.retry.backoff = crate::connector::Backoff::new(Duration::from_millis(1), Duration::from_millis(2));
        s
    }

    async fn dispatcher(subs: Vec<SubscriberConfig>, factory: &dyn SessionFactory) -> Dispatcher {
        let pool = ConnectorPool::build(&subs, factory, fast()).await.unwrap();
        Dispatcher::new(subs, pool)
    }

    #[tokio::test]
    async fn fans_out_with_scaling_and_skip() {
        let subs = vec![
            SubscriberConfig::new("S1", dec!(0.5)),
            SubscriberConfig::new("S2", dec!(0)),
            SubscriberConfig::new("S3", dec!(2)).with_symbol("EURUSD", "EURUSD.x"),
        ];
        let rec = Arc::new(Recording::default());
        let d = dispatcher(subs, &rec).await;

        let pending = d.dispatch(&event(7), &CancelToken::never()).await.unwrap();
        assert_eq!(pending.orders().len(), 2);
        let report = pending.wait().await;

        assert_eq!(report.get("S1"), Some(&UnitOutcome::Sent(Outcome::Filled)));
        assert_eq!(report.get("S2"), Some(&UnitOutcome::Skipped(SkipReason::Disabled)));
        assert_eq!(report.get("S3"), Some(&UnitOutcome::Sent(Outcome::Filled)));
        assert_eq!(report.delivered(), 2);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.units.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(), ["S1", "S2", "S3"]);

        let sent = rec.sent.lock().unwrap();
        assert_eq!(sent["S1"][0].quantity, dec!(0.5));
        assert_eq!(sent["S3"][0].quantity, dec!(2));
        assert_eq!(sent["S3"][0].symbol, "EURUSD.x");
        assert!(!sent.contains_key("S2"));
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_block_others() {
        let subs = vec![SubscriberConfig::new("A", dec!(1)), SubscriberConfig::new("B", dec!(1))];
        let rec = Arc::new(Recording { down: vec!["A".into()], ..Default::default() });
        let d = dispatcher(subs, &rec).await;

        let mut reports = Vec::new();
        for i in 0..5 {
            let pending = d.dispatch(&event(i), &CancelToken::never()).await.unwrap();
            reports.push(pending.wait().await);
        }
        for r in &reports {
            assert!(matches!(r.get("A"), Some(UnitOutcome::Sent(Outcome::Failed(_)))));
            assert_eq!(r.get("B"), Some(&UnitOutcome::Sent(Outcome::Filled)));
            assert_eq!(r.failed(), 1);
        }
        assert_eq!(rec.sent.lock().unwrap()["B"].len(), 5);
    }

    #[tokio::test]
    async fn unknown_subscriber_is_unroutable() {
        let pool = ConnectorPool::build(&[SubscriberConfig::new("S1", dec!(1))], &PaperSessionFactory, fast())
            .await
            .unwrap();
        let subs = vec![SubscriberConfig::new("S1", dec!(1)), SubscriberConfig::new("GHOST", dec!(1))];
        let d = Dispatcher::new(subs, pool);
        let report = d.dispatch(&event(1), &CancelToken::never()).await.unwrap().wait().await;
        assert_eq!(report.get("S1"), Some(&UnitOutcome::Sent(Outcome::Filled)));
        assert!(matches!(report.get("GHOST"), Some(UnitOutcome::Unroutable(_))));
    }

    #[tokio::test]
    async fn handoff_preserves_event_order_per_subscriber() {
        let subs: Vec<_> = (0..4).map(|i| SubscriberConfig::new(&format!("S{}", i), dec!(1))).collect();
        let rec = Arc::new(Recording::default());
        let d = dispatcher(subs, &rec).await;

        let mut pendings = Vec::new();
        for i in 0..10 {
            pendings.push(d.dispatch(&event(i), &CancelToken::never()).await.unwrap());
        }
        for p in pendings {
            assert_eq!(p.wait().await.delivered(), 4);
        }

        let sent = rec.sent.lock().unwrap();
        for i in 0..4 {
            let ids: Vec<String> = sent[&format!("S{}", i)].iter().map(|r| r.client_order_id.clone()).collect();
            let expected: Vec<String> = (0..10)
                .map(|n| crate::translator::correlation_id(&event(n).identity(), &format!("S{}", i)))
                .collect();
            assert_eq!(ids, expected);
        }
    }

    #[tokio::test]
    async fn cancelled_handoff_returns_error() {
        let subs = vec![SubscriberConfig::new("S1", dec!(1)), SubscriberConfig::new("S2", dec!(1))];
        let rec = Arc::new(Recording::default());
        let d = dispatcher(subs, &rec).await;

        let shutdown = Shutdown::new();
        shutdown.trigger();
        let err = d.dispatch(&event(2), &shutdown.token()).await;
        assert!(matches!(err, Err(DispatchError::Cancelled)));
        assert_eq!(rec.count("S1") + rec.count("S2"), 0);

        // тот же диспетчер продолжает работать с живым токеном
        let report = d.dispatch(&event(3), &CancelToken::never()).await.unwrap().wait().await;
        assert_eq!(report.delivered(), 2);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_delay_others() {
        let subs = vec![SubscriberConfig::new("A", dec!(1)), SubscriberConfig::new("B", dec!(1))];
        let rec = Arc::new(Recording { slow: vec!["A".into()], ..Default::default() });
        let d = dispatcher(subs, &rec).await;

        // очередь A (6 × 300ms) больше, чем max_in_flight = 4
        let started = std::time::Instant::now();
        let mut pendings = Vec::new();
        for i in 0..6 {
            pendings.push(d.dispatch(&event(i), &CancelToken::never()).await.unwrap());
        }
        tokio::time::timeout(Duration::from_millis(250), async {
            while rec.count("B") < 6 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("B waited on A's backlog");
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(rec.count("A") < 6);
    }
}
