//! Grid runner - main execution loop
//!
//! One task owns the [`Engine`] and serializes the check timer, the order
//! event queue and the polling timer. Nothing else mutates the ledger.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};

use super::engine::Engine;
use super::errors::{GridError, GridResult};
use super::executor::{MarketData, OrderGateway};
use super::types::{EngineEvent, OrderUpdate};

/// Handle used by the push transport to deliver order updates
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<EngineEvent>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// Queue an update, waiting for room if the queue is full
    pub async fn send(&self, update: OrderUpdate) -> GridResult<()> {
        self.tx
            .send(EngineEvent::OrderUpdate(update))
            .await
            .map_err(|e| GridError::ChannelSend(e.to_string()))
    }

    /// Queue an update without waiting; fails if the queue is full or closed
    pub fn try_send(&self, update: OrderUpdate) -> GridResult<()> {
        self.tx
            .try_send(EngineEvent::OrderUpdate(update))
            .map_err(|e| GridError::ChannelSend(e.to_string()))
    }
}

/// Requests a graceful stop of a running [`GridRunner`]
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    /// Trigger on SIGINT/Ctrl+C (and SIGTERM on unix)
    pub fn trigger_on_signal(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        tokio::select! {
                            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received (SIGINT/Ctrl+C)"),
                            _ = sigterm.recv() => info!("Shutdown signal received (SIGTERM)"),
                        }
                    }
                    Err(e) => {
                        warn!("Failed to register SIGTERM handler: {}", e);
                        let _ = tokio::signal::ctrl_c().await;
                        info!("Shutdown signal received (SIGINT/Ctrl+C)");
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutdown signal received (SIGINT/Ctrl+C)");
            }
            handle.trigger();
        });
    }
}

/// Single-writer loop around an [`Engine`]
pub struct GridRunner<M: ?Sized, G: ?Sized> {
    engine: Engine,
    market: Arc<M>,
    gateway: Arc<G>,
    events_tx: mpsc::Sender<EngineEvent>,
    events_rx: mpsc::Receiver<EngineEvent>,
    shutdown: ShutdownHandle,
    skipped_cycles: u32,
    runtime_view: Option<PathBuf>,
}

impl<M, G> GridRunner<M, G>
where
    M: MarketData + ?Sized + 'static,
    G: OrderGateway + ?Sized + 'static,
{
    pub fn new(engine: Engine, market: Arc<M>, gateway: Arc<G>) -> Self {
        let capacity = engine.config().event_queue_capacity.max(1);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        Self {
            engine,
            market,
            gateway,
            events_tx,
            events_rx,
            shutdown: ShutdownHandle::default(),
            skipped_cycles: 0,
            runtime_view: None,
        }
    }

    /// Rewrite a readable view of the ladder to `path` after every check
    pub fn with_runtime_view(mut self, path: impl Into<PathBuf>) -> Self {
        self.runtime_view = Some(path.into());
        self
    }

    pub fn event_sender(&self) -> EventSender {
        EventSender {
            tx: self.events_tx.clone(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Run until shutdown is requested, then persist and hand the engine back
    pub async fn run(mut self) -> GridResult<Engine> {
        let config = self.engine.config().clone();
        info!(
            "Starting grid runner for {}: check every {:?} (quick {:?}), sync every {:?}",
            self.engine.instrument(),
            config.check_interval(),
            config.quick_recheck_interval(),
            config.sync_interval()
        );

        let mut sync_timer = interval(config.sync_interval());
        sync_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick
        sync_timer.tick().await;

        let check_timer = sleep(config.check_interval());
        tokio::pin!(check_timer);

        loop {
            if let Err(e) = self.engine.persist() {
                warn!("Failed to save state: {}", e);
            }

            tokio::select! {
                _ = self.shutdown.notify.notified() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = &mut check_timer => {
                    let wait = self.on_check().await;
                    self.write_runtime_view();
                    check_timer.as_mut().reset(Instant::now() + wait);
                }
                Some(event) = self.events_rx.recv() => {
                    self.on_event(&event);
                }
                _ = sync_timer.tick() => {
                    self.on_sync().await;
                }
            }
        }

        // Fold whatever is already queued so rejections are not lost
        while let Ok(event) = self.events_rx.try_recv() {
            self.on_event(&event);
        }

        self.engine.persist()?;
        let summary = self.engine.summary();
        info!(
            "Grid runner stopped: {} open / {} close orders in flight, realized pnl {:.4}",
            summary.open_orders, summary.close_orders, summary.realized_pnl
        );
        Ok(self.engine)
    }

    /// One engine cycle; returns the wait before the next one
    async fn on_check(&mut self) -> Duration {
        let config = self.engine.config();
        let (quick, baseline) = (config.quick_recheck_interval(), config.check_interval());

        match self.engine.check(self.market.as_ref(), self.gateway.as_ref()).await {
            Ok(outcome) => {
                self.on_cycle_resumed();
                for rejection in outcome.rejections {
                    self.enqueue(rejection);
                }
                if outcome.triggered {
                    let summary = self.engine.summary();
                    info!(
                        "Cycle placed {} order(s); in flight {}/{}, chance {:.4}/{:.4}, pnl {:.4}",
                        outcome.placed,
                        summary.open_orders,
                        summary.close_orders,
                        summary.open_chance,
                        summary.close_chance,
                        summary.realized_pnl
                    );
                    quick
                } else {
                    baseline
                }
            }
            Err(e) if e.is_transient() => {
                warn!("Cycle skipped: {}", e);
                self.on_cycle_skipped(&e);
                baseline
            }
            Err(e) => {
                error!("Cycle failed: {}", e);
                baseline
            }
        }
    }

    fn write_runtime_view(&self) {
        if let Some(path) = &self.runtime_view {
            if let Err(e) = self.engine.runtime_view().save_to_file(path) {
                warn!("Failed to write runtime view {:?}: {}", path, e);
            }
        }
    }

    /// Alert once per streak of skipped cycles
    fn on_cycle_skipped(&mut self, error: &GridError) {
        self.skipped_cycles = self.skipped_cycles.saturating_add(1);
        if self.skipped_cycles == self.engine.config().skip_alert_after.max(1) {
            self.engine.alert(&format!(
                "{}: {} cycles skipped in a row, last error: {}",
                self.engine.instrument(),
                self.skipped_cycles,
                error
            ));
        }
    }

    fn on_cycle_resumed(&mut self) {
        if self.skipped_cycles >= self.engine.config().skip_alert_after.max(1) {
            self.engine.alert(&format!(
                "{}: cycles resumed after {} skipped",
                self.engine.instrument(),
                self.skipped_cycles
            ));
        }
        self.skipped_cycles = 0;
    }

    /// Feed a synthetic rejection back through the queue.
    ///
    /// Folded in place when the queue cannot take it.
    fn enqueue(&mut self, event: EngineEvent) {
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) | Err(TrySendError::Closed(event)) => {
                debug!("Event queue unavailable, folding rejection directly");
                self.on_event(&event);
            }
        }
    }

    fn on_event(&mut self, event: &EngineEvent) {
        if let Err(e) = self.engine.handle_event(event) {
            error!("Failed to apply {:?}: {}", event, e);
        }
    }

    async fn on_sync(&mut self) {
        match self.engine.reconcile(self.gateway.as_ref()).await {
            Ok(report) => {
                if report.not_found > 0 || report.failed > 0 {
                    info!("Reconciliation: {:?}", report);
                }
            }
            Err(e) => error!("Reconciliation failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::config::{EngineConfig, LadderConfig, LevelConfig};
    use crate::grid::executor::mock::MockExchange;
    use crate::grid::state::{load_or_create, MemoryStore, StateStore};
    use crate::grid::types::{OrderStatus, Side};

    fn runner(exchange: Arc<MockExchange>) -> (GridRunner<MockExchange, MockExchange>, MemoryStore) {
        let ladder = LadderConfig::new("BTC-PERP", vec![LevelConfig::new(90.0, 101.0, 10.0, 0.0)]);
        let store = MemoryStore::new();
        let restored = load_or_create(&store, &ladder).unwrap();
        let engine = Engine::new("BTC-PERP", restored, EngineConfig::default(), Box::new(store.clone()));
        (GridRunner::new(engine, exchange.clone(), exchange), store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_are_folded_through_the_queue() {
        let exchange = Arc::new(MockExchange::new(100.0, 100.5, 0.1));
        exchange.set_reject(Some("post only would cross")).await;
        let (runner, store) = runner(exchange.clone());
        let shutdown = runner.shutdown_handle();

        let task = tokio::spawn(runner.run());
        sleep(Duration::from_millis(1600)).await;
        shutdown.trigger();
        let engine = task.await.unwrap().unwrap();

        assert!(!exchange.placed().await.is_empty());
        assert_eq!(engine.ledger().grids()[0].open_chance, 10.0);
        assert!(engine.registry().is_empty());

        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.grids[0].open_chance, 10.0);
        assert!(saved.grids[0].open_orders.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pushed_updates_are_folded() {
        let exchange = Arc::new(MockExchange::new(100.0, 100.5, 0.1));
        let (runner, _store) = runner(exchange.clone());
        let shutdown = runner.shutdown_handle();
        let sender = runner.event_sender();

        let task = tokio::spawn(runner.run());
        sleep(Duration::from_millis(1600)).await;

        let placed = exchange.placed().await;
        assert_eq!(placed.len(), 1);
        let filled = OrderUpdate::new(placed[0].client_id.clone(), Side::Open, 10.0, 10.0, OrderStatus::Closed);
        sender.send(filled.clone()).await.unwrap();
        // Duplicate delivery is harmless
        sender.send(filled).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        shutdown.trigger();
        let engine = task.await.unwrap().unwrap();

        let grid = &engine.ledger().grids()[0];
        assert_eq!(grid.open_total, 10.0);
        assert_eq!(grid.open_chance, 0.0);
        assert!(grid.open_orders.is_empty());
        // The close side is either still available or already in flight
        assert_eq!(grid.close_chance + grid.committed(Side::Close), 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_market_does_not_stop_the_loop() {
        let exchange = Arc::new(MockExchange::new(100.0, 100.5, 0.1));
        exchange.set_fail_snapshot(true).await;
        let (runner, _store) = runner(exchange.clone());
        let shutdown = runner.shutdown_handle();

        let task = tokio::spawn(runner.run());
        sleep(Duration::from_millis(3100)).await;
        assert!(exchange.placed().await.is_empty());

        exchange.set_fail_snapshot(false).await;
        sleep(Duration::from_millis(1600)).await;
        shutdown.trigger();
        let engine = task.await.unwrap().unwrap();

        assert_eq!(exchange.placed().await.len(), 1);
        assert_eq!(engine.registry().len(), 1);
    }

    #[derive(Default)]
    struct Recorder {
        alerts: std::sync::Mutex<Vec<String>>,
    }

    impl crate::notify::Notifier for Recorder {
        fn notify(&self, text: &str) {
            self.alerts.lock().unwrap().push(text.to_string());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_cycles_alert_once_per_streak() {
        let exchange = Arc::new(MockExchange::new(100.0, 100.5, 0.1));
        exchange.set_fail_snapshot(true).await;
        let recorder = Arc::new(Recorder::default());

        let ladder = LadderConfig::new("BTC-PERP", vec![LevelConfig::new(90.0, 101.0, 10.0, 0.0)]);
        let store = MemoryStore::new();
        let restored = load_or_create(&store, &ladder).unwrap();
        let config = EngineConfig::default().with_skip_alert_after(2);
        let engine = Engine::new("BTC-PERP", restored, config, Box::new(store))
            .with_notifier(recorder.clone());
        let runner = GridRunner::new(engine, exchange.clone(), exchange.clone());
        let shutdown = runner.shutdown_handle();

        let task = tokio::spawn(runner.run());
        // Checks at 1.5s and 3s fail; the second one alerts
        sleep(Duration::from_millis(3100)).await;
        assert_eq!(recorder.alerts.lock().unwrap().len(), 1);

        // A third failure at 4.5s stays quiet
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(recorder.alerts.lock().unwrap().len(), 1);

        exchange.set_fail_snapshot(false).await;
        sleep(Duration::from_millis(1500)).await;
        shutdown.trigger();
        task.await.unwrap().unwrap();

        let alerts = recorder.alerts.lock().unwrap().clone();
        assert_eq!(alerts.len(), 2);
        assert!(alerts[0].contains("2 cycles skipped"));
        assert!(alerts[1].contains("resumed after 3 skipped"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_view_written_after_check() {
        let exchange = Arc::new(MockExchange::new(100.0, 100.5, 0.1));
        let (runner, _store) = runner(exchange.clone());
        let path = std::env::temp_dir().join(format!("grid_runtime_{}.json", uuid::Uuid::new_v4()));
        let runner = runner.with_runtime_view(&path);
        let shutdown = runner.shutdown_handle();

        let task = tokio::spawn(runner.run());
        sleep(Duration::from_millis(1600)).await;
        shutdown.trigger();
        task.await.unwrap().unwrap();

        let view: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(view["instrument"], "BTC-PERP");
        assert_eq!(view["levels"][0]["open_in_flight"], 1);
        std::fs::remove_file(&path).ok();
    }
}
