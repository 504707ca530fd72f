//! Reconciliation engine - the single writer of the ledger and the registry
//!
//! One call to [`Engine::check`] is one cycle: fetch a bounded-latency quote,
//! cancel orders that drifted away from the market, then place an order on
//! every eligible grid side. Order state coming back from the exchange (push
//! or poll) goes through [`Engine::on_order_change`]; failed submissions go
//! through [`Engine::on_reject_order`].

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::time::Instant;

use super::clock::{Clock, SystemClock};
use super::config::EngineConfig;
use super::errors::{GridError, GridResult};
use super::executor::{MarketData, OrderGateway};
use super::ledger::{GridOrder, Ledger, TradeGrid};
use super::registry::{OrderRegistry, OrderSlot};
use super::state::{GridState, Restored, StateStore};
use super::types::{EngineEvent, OrderUpdate, PlaceOutcome, PlaceRequest, Quote, Side};
use crate::notify::{LogNotifier, Notifier};

/// Relative tolerance applied to band and cancel-threshold edges
pub const EPSILON: f64 = 1e-9;

/// `a <= b`, treating values within [`EPSILON`] (relative) as equal.
fn approx_le(a: f64, b: f64) -> bool {
    a <= b + EPSILON * a.abs().max(b.abs())
}

/// Result of one placement cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleOutcome {
    /// At least one grid side was eligible; the caller should re-check soon
    pub triggered: bool,
    /// Orders submitted (accepted or with unknown outcome)
    pub placed: usize,
    /// Cancel requests sent for drifted orders
    pub cancels_sent: usize,
    /// Synthetic rejections to feed back through the event queue
    pub rejections: Vec<EngineEvent>,
}

/// Result of a polling pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Updates folded from the open-order list
    pub listed: usize,
    /// Orders queried individually
    pub queried: usize,
    /// Queried orders the exchange did not know; refunded
    pub not_found: usize,
    /// Queries that failed and will be retried
    pub failed: usize,
}

/// Aggregate view of the ladder
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LadderSummary {
    pub grids: usize,
    pub open_orders: usize,
    pub close_orders: usize,
    pub open_chance: f64,
    pub close_chance: f64,
    pub open_total: f64,
    pub close_total: f64,
    pub realized_pnl: f64,
}

/// Operator-facing snapshot of every level, rewritten after each cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeView {
    pub instrument: String,
    pub updated_at: DateTime<Utc>,
    pub last_quote: Option<Quote>,
    pub realized_pnl: f64,
    pub levels: Vec<RuntimeLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeLevel {
    pub open_price: f64,
    pub close_price: f64,
    pub open_chance: f64,
    pub close_chance: f64,
    pub open_in_flight: usize,
    pub close_in_flight: usize,
}

impl RuntimeView {
    /// Write to file atomically (temp file, then rename)
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> GridResult<()> {
        let path = path.as_ref();
        let temp_path = path.with_extension("tmp");

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

pub struct Engine {
    instrument: String,
    ledger: Ledger,
    registry: OrderRegistry,
    config: EngineConfig,
    store: Box<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    last_quote: Option<Quote>,
}

impl Engine {
    pub fn new(
        instrument: impl Into<String>,
        restored: Restored,
        config: EngineConfig,
        store: Box<dyn StateStore>,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            ledger: restored.ledger,
            registry: restored.registry,
            config,
            store,
            notifier: Arc::new(LogNotifier),
            clock: Arc::new(SystemClock),
            last_quote: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn registry(&self) -> &OrderRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn last_quote(&self) -> Option<Quote> {
        self.last_quote
    }

    /// Forward an operator alert to the configured notifier
    pub fn alert(&self, text: &str) {
        self.notifier.notify(text);
    }

    // ========================================================================
    // Cycle
    // ========================================================================

    /// Run one placement cycle.
    ///
    /// A failed or stale quote aborts the cycle before anything is mutated.
    pub async fn check<M, G>(&mut self, market: &M, gateway: &G) -> GridResult<CycleOutcome>
    where
        M: MarketData + ?Sized,
        G: OrderGateway + ?Sized,
    {
        let quote = self.fetch_quote(market).await?;
        self.last_quote = Some(quote);

        let mut outcome = CycleOutcome {
            cancels_sent: self.prune_stale_orders(&quote, gateway).await,
            ..Default::default()
        };

        for index in 0..self.ledger.len() {
            for side in [Side::Open, Side::Close] {
                if !self.is_eligible(self.ledger.grid(index)?, side, &quote) {
                    continue;
                }
                outcome.triggered = true;

                match self.place(index, side, gateway).await {
                    Ok(Some(rejection)) => outcome.rejections.push(rejection),
                    Ok(None) => outcome.placed += 1,
                    Err(e) => {
                        // Nothing else will deliver these once the cycle fails
                        for rejection in &outcome.rejections {
                            self.handle_event(rejection)?;
                        }
                        return Err(e);
                    }
                }
            }
        }

        Ok(outcome)
    }

    async fn fetch_quote<M>(&self, market: &M) -> GridResult<Quote>
    where
        M: MarketData + ?Sized,
    {
        let limit = self.config.max_quote_latency();
        let started = Instant::now();

        let quote = match tokio::time::timeout(limit, market.snapshot(&self.instrument)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(GridError::StaleMarketData {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    limit_ms: self.config.max_quote_latency_ms,
                })
            }
        };

        let sane = quote.bid.is_finite()
            && quote.ask.is_finite()
            && quote.bid > 0.0
            && quote.ask > 0.0
            && quote.min_size_increment.is_finite()
            && quote.min_size_increment > 0.0;
        if !sane {
            return Err(GridError::Exchange(format!("Unusable quote: {:?}", quote)));
        }

        debug!(
            "Quote {}: bid={} ask={} step={} ({:?})",
            self.instrument,
            quote.bid,
            quote.ask,
            quote.min_size_increment,
            started.elapsed()
        );
        Ok(quote)
    }

    /// Whether a grid side may receive a new order at this quote.
    ///
    /// Bands are inclusive at both ends. A side with an order in flight is
    /// never eligible.
    fn is_eligible(&self, grid: &TradeGrid, side: Side, quote: &Quote) -> bool {
        if grid.has_in_flight(side) || grid.chance(side) < quote.min_size_increment {
            return false;
        }

        let price = grid.price(side);
        match side {
            Side::Open => {
                approx_le(quote.bid * self.config.open_band_low, price)
                    && approx_le(price, quote.bid * self.config.open_band_high)
            }
            Side::Close => {
                approx_le(quote.ask * self.config.close_band_low, price)
                    && approx_le(price, quote.ask * self.config.close_band_high)
            }
        }
    }

    /// Reserve, track, persist, then submit. Returns a synthetic rejection
    /// if the exchange refused the order.
    async fn place<G>(&mut self, index: usize, side: Side, gateway: &G) -> GridResult<Option<EngineEvent>>
    where
        G: OrderGateway + ?Sized,
    {
        let now = self.clock.now();
        let price = self.ledger.grid(index)?.price(side);
        let qty = self.ledger.reserve_for_order(index, side)?;
        let client_id = uuid::Uuid::new_v4().simple().to_string();

        let order = GridOrder::new(client_id.clone(), index, side, qty, now);
        self.track(order)?;

        if let Err(e) = self.persist() {
            error!("Failed to persist before placing {}: {}", client_id, e);
            self.untrack(&client_id)?;
            self.ledger.refund(index, side, qty)?;
            self.notifier
                .notify(&format!("{} state save failed, placement aborted: {}", self.instrument, e));
            return Err(e);
        }

        let request = PlaceRequest {
            client_id: client_id.clone(),
            instrument: self.instrument.clone(),
            side,
            price,
            size: qty,
            post_only: match side {
                Side::Open => self.config.post_only_open,
                Side::Close => self.config.post_only_close,
            },
        };

        info!(
            "Placing {} {} {} @ {} (grid {}, key {})",
            side.as_direction(),
            qty,
            self.instrument,
            price,
            index,
            client_id
        );

        match gateway.place(&request).await {
            Ok(PlaceOutcome::Accepted) => Ok(None),
            Ok(PlaceOutcome::Rejected(reason)) => {
                warn!("Order {} rejected: {}", client_id, reason);
                self.notifier.notify(&format!(
                    "{} {} order @ {} rejected: {}",
                    self.instrument, side, price, reason
                ));
                Ok(Some(EngineEvent::Rejected { client_id, side }))
            }
            Err(e) => {
                // Outcome unknown; reconciliation resolves it by key
                warn!("Placing {} failed, leaving it to reconciliation: {}", client_id, e);
                self.notifier.notify(&format!(
                    "{} {} order @ {} submission failed: {}",
                    self.instrument, side, price, e
                ));
                Ok(None)
            }
        }
    }

    /// Cancel in-flight orders that drifted too far from the market.
    ///
    /// Open orders priced below `bid * open_cancel_ratio` and close orders
    /// priced above `ask * close_cancel_ratio` are cancelled, at most once per
    /// cooldown window. Returns the number of cancel requests sent.
    pub async fn prune_stale_orders<G>(&mut self, quote: &Quote, gateway: &G) -> usize
    where
        G: OrderGateway + ?Sized,
    {
        let now = self.clock.now();
        let cooldown = self.config.cancel_cooldown();
        let open_floor = quote.bid * self.config.open_cancel_ratio;
        let close_ceiling = quote.ask * self.config.close_cancel_ratio;

        let mut targets = Vec::new();
        for (index, grid) in self.ledger.grids().iter().enumerate() {
            for side in [Side::Open, Side::Close] {
                let drifted = match side {
                    Side::Open => !approx_le(open_floor, grid.open_price),
                    Side::Close => !approx_le(grid.close_price, close_ceiling),
                };
                if !drifted {
                    continue;
                }
                for order in grid.orders(side).values() {
                    if order.cancel_allowed(now, cooldown) {
                        targets.push((index, side, order.client_id.clone(), order.exchange_id));
                    }
                }
            }
        }

        let mut sent = 0;
        for (index, side, client_id, exchange_id) in targets {
            let Some(exchange_id) = exchange_id else {
                debug!("Order {} has no exchange id yet, cannot cancel", client_id);
                continue;
            };

            if let Ok(grid) = self.ledger.grid_mut(index) {
                if let Some(order) = grid.orders_mut(side).get_mut(&client_id) {
                    order.last_cancel_attempt_at = Some(now);
                }
            }

            info!("Cancelling drifted {} order {} (grid {})", side, client_id, index);
            match gateway.cancel(exchange_id).await {
                Ok(()) => sent += 1,
                Err(e) => warn!("Cancel of {} failed: {}", client_id, e),
            }
        }
        sent
    }

    // ========================================================================
    // Folds
    // ========================================================================

    /// Dispatch one queued event
    pub fn handle_event(&mut self, event: &EngineEvent) -> GridResult<()> {
        match event {
            EngineEvent::OrderUpdate(update) => self.on_order_change(update).map(|_| ()),
            EngineEvent::Rejected { client_id, side } => {
                self.on_reject_order(client_id, *side).map(|_| ())
            }
        }
    }

    /// Fold an order-state record into the ledger.
    ///
    /// Returns false when the key is unknown (already resolved or foreign).
    /// Replays are no-ops because only positive fill deltas are applied.
    pub fn on_order_change(&mut self, update: &OrderUpdate) -> GridResult<bool> {
        let Some(slot) = self.registry.get(&update.client_id) else {
            debug!("Ignoring update for unknown order {}", update.client_id);
            return Ok(false);
        };
        if slot.side != update.side {
            warn!(
                "Update for {} reports side {}, tracked as {}",
                update.client_id, update.side, slot.side
            );
        }

        let now = self.clock.now();
        let (delta, requested, executed) = {
            let order = self
                .ledger
                .grid_mut(slot.grid)?
                .orders_mut(slot.side)
                .get_mut(&update.client_id)
                .ok_or_else(|| GridError::OrderNotFound(update.client_id.clone()))?;

            if order.exchange_id.is_none() {
                order.exchange_id = update.exchange_id;
            }
            order.last_update_at = now;

            let delta = update.filled_size - order.executed_qty;
            let delta = if delta > 0.0 {
                order.executed_qty = update.filled_size;
                delta
            } else {
                0.0
            };
            (delta, order.requested_qty, order.executed_qty)
        };

        if delta > 0.0 {
            self.ledger.record_fill_delta(slot.grid, slot.side, delta)?;
            info!(
                "Fill on grid {} {}: +{} ({}/{})",
                slot.grid, slot.side, delta, executed, requested
            );
        }

        if update.status.is_terminal() {
            let remainder = (requested - executed).max(0.0);
            self.ledger.refund(slot.grid, slot.side, remainder)?;
            self.untrack(&update.client_id)?;
            info!(
                "Order {} finished ({:?}) on grid {} {}: filled {}, refunded {}",
                update.client_id, update.status, slot.grid, slot.side, executed, remainder
            );
        }

        Ok(true)
    }

    /// Refund and forget an order that never reached the book.
    ///
    /// Returns false when the key is unknown.
    pub fn on_reject_order(&mut self, client_id: &str, side: Side) -> GridResult<bool> {
        let Some(slot) = self.registry.get(client_id) else {
            debug!("Rejection for unknown order {} ignored", client_id);
            return Ok(false);
        };
        if slot.side != side {
            warn!("Rejection for {} reports side {}, tracked as {}", client_id, side, slot.side);
        }

        let order = self.untrack(client_id)?;
        let refund = order.outstanding();
        self.ledger.refund(slot.grid, slot.side, refund)?;
        info!(
            "Order {} rejected on grid {} {}: refunded {}",
            client_id, slot.grid, slot.side, refund
        );
        Ok(true)
    }

    fn track(&mut self, order: GridOrder) -> GridResult<()> {
        if !self.registry.add(&order) {
            return Err(GridError::CorruptState(format!(
                "duplicate idempotency key {}",
                order.client_id
            )));
        }
        self.ledger
            .grid_mut(order.grid)?
            .orders_mut(order.side)
            .insert(order.client_id.clone(), order);
        Ok(())
    }

    fn untrack(&mut self, client_id: &str) -> GridResult<GridOrder> {
        let OrderSlot { grid, side } = self
            .registry
            .remove(client_id)
            .ok_or_else(|| GridError::OrderNotFound(client_id.to_string()))?;
        self.ledger
            .grid_mut(grid)?
            .orders_mut(side)
            .remove(client_id)
            .ok_or_else(|| GridError::OrderNotFound(client_id.to_string()))
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Polling pass: fold the exchange's open-order list, then query by key
    /// every order that has not been updated for `order_stale_after`.
    pub async fn reconcile<G>(&mut self, gateway: &G) -> GridResult<ReconcileReport>
    where
        G: OrderGateway + ?Sized,
    {
        let mut report = ReconcileReport::default();

        match gateway.open_orders(&self.instrument).await {
            Ok(orders) => {
                for update in &orders {
                    if self.on_order_change(update)? {
                        report.listed += 1;
                    }
                }
            }
            Err(e) => warn!("Failed to list open orders: {}", e),
        }

        let now = self.clock.now();
        let stale_after = self.config.order_stale_after();
        let mut stale = Vec::new();
        for grid in self.ledger.grids() {
            for side in [Side::Open, Side::Close] {
                stale.extend(
                    grid.orders(side)
                        .values()
                        .filter(|o| now - o.last_update_at > stale_after)
                        .map(|o| o.client_id.clone()),
                );
            }
        }

        self.query_orders(gateway, stale, &mut report).await?;
        if report.queried > 0 {
            debug!("Reconciled: {:?}", report);
        }
        Ok(report)
    }

    /// Startup pass after loading a snapshot: query every in-flight order.
    ///
    /// Orders persisted right before a crash may never have been submitted;
    /// the exchange answers "not found" for those and they are refunded.
    pub async fn recover<G>(&mut self, gateway: &G) -> GridResult<ReconcileReport>
    where
        G: OrderGateway + ?Sized,
    {
        let keys = self.registry.keys();
        info!("Recovering {} in-flight order(s)", keys.len());

        let mut report = ReconcileReport::default();
        self.query_orders(gateway, keys, &mut report).await?;
        if report.failed > 0 {
            warn!("{} order(s) could not be queried during recovery", report.failed);
        }
        Ok(report)
    }

    async fn query_orders<G>(
        &mut self,
        gateway: &G,
        keys: Vec<String>,
        report: &mut ReconcileReport,
    ) -> GridResult<()>
    where
        G: OrderGateway + ?Sized,
    {
        for client_id in keys {
            let Some(slot) = self.registry.get(&client_id) else {
                continue;
            };
            report.queried += 1;

            match gateway.order_by_key(&client_id).await {
                Ok(Some(update)) => {
                    self.on_order_change(&update)?;
                }
                Ok(None) => {
                    warn!("Order {} not found on the exchange, treating as rejected", client_id);
                    self.on_reject_order(&client_id, slot.side)?;
                    self.notifier.notify(&format!(
                        "{} {} order {} not found on exchange, refunded",
                        self.instrument, slot.side, client_id
                    ));
                    report.not_found += 1;
                }
                Err(e) => {
                    warn!("Failed to query order {}: {}", client_id, e);
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Persistence and reporting
    // ========================================================================

    /// Write the current ledger to the store
    pub fn persist(&self) -> GridResult<()> {
        let state = GridState::capture(&self.instrument, &self.ledger, self.last_quote, self.clock.now());
        self.store.save(&state)
    }

    /// Log every level of the ladder
    pub fn log_ladder(&self) {
        info!("Ladder for {} ({} levels):", self.instrument, self.ledger.len());
        let mut cumulative = 0.0;
        for (index, grid) in self.ledger.grids().iter().enumerate() {
            cumulative += grid.open_chance + grid.close_chance;
            info!(
                "  [{:>3}] open {:>12} close {:>12} | chance {:>10.4}/{:<10.4} | total {:>10.4}/{:<10.4} | cum {:.4}",
                index,
                grid.open_price,
                grid.close_price,
                grid.open_chance,
                grid.close_chance,
                grid.open_total,
                grid.close_total,
                cumulative
            );
        }
    }

    pub fn summary(&self) -> LadderSummary {
        let mut summary = LadderSummary {
            grids: self.ledger.len(),
            realized_pnl: self.ledger.realized_pnl(),
            ..Default::default()
        };
        for grid in self.ledger.grids() {
            summary.open_orders += grid.open_orders.len();
            summary.close_orders += grid.close_orders.len();
            summary.open_chance += grid.open_chance;
            summary.close_chance += grid.close_chance;
            summary.open_total += grid.open_total;
            summary.close_total += grid.close_total;
        }
        summary
    }

    pub fn runtime_view(&self) -> RuntimeView {
        RuntimeView {
            instrument: self.instrument.clone(),
            updated_at: self.clock.now(),
            last_quote: self.last_quote,
            realized_pnl: self.ledger.realized_pnl(),
            levels: self
                .ledger
                .grids()
                .iter()
                .map(|grid| RuntimeLevel {
                    open_price: grid.open_price,
                    close_price: grid.close_price,
                    open_chance: grid.open_chance,
                    close_chance: grid.close_chance,
                    open_in_flight: grid.open_orders.len(),
                    close_in_flight: grid.close_orders.len(),
                })
                .collect(),
        }
    }
}
