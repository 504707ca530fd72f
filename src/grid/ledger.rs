//! Grid ledger: price levels and their committed-capital bookkeeping
//!
//! Every level carries a budget ("chance") per side. Capital only moves
//! between three places: available chance, in-flight orders, and realized
//! totals. The mutators here are the only code allowed to touch chance.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::LadderConfig;
use super::errors::{GridError, GridResult};
use super::types::Side;

/// In-flight order owned by one grid level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridOrder {
    /// Idempotency key, unique process-wide
    pub client_id: String,
    /// Exchange order id, learned from the first update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_id: Option<u64>,
    pub side: Side,
    pub requested_qty: f64,
    /// Last known filled quantity, never decreases
    pub executed_qty: f64,
    pub created_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cancel_attempt_at: Option<DateTime<Utc>>,
    /// Index of the owning grid; restored on load
    #[serde(skip)]
    pub grid: usize,
}

impl GridOrder {
    pub fn new(
        client_id: impl Into<String>,
        grid: usize,
        side: Side,
        requested_qty: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            exchange_id: None,
            side,
            requested_qty,
            executed_qty: 0.0,
            created_at: now,
            last_update_at: now,
            last_cancel_attempt_at: None,
            grid,
        }
    }

    /// Quantity still committed to the book
    pub fn outstanding(&self) -> f64 {
        (self.requested_qty - self.executed_qty).max(0.0)
    }

    /// Whether a cancel may be sent again at `now`
    pub fn cancel_allowed(&self, now: DateTime<Utc>, cooldown: chrono::Duration) -> bool {
        match self.last_cancel_attempt_at {
            Some(last) => now - last > cooldown,
            None => true,
        }
    }
}

/// One rung of the ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeGrid {
    /// Stable identifier used in logs and snapshots
    pub id: String,
    pub open_price: f64,
    pub close_price: f64,
    pub open_chance: f64,
    pub close_chance: f64,
    /// Cumulative filled quantity on the open side
    #[serde(default)]
    pub open_total: f64,
    /// Cumulative filled quantity on the close side
    #[serde(default)]
    pub close_total: f64,
    #[serde(default)]
    pub open_orders: BTreeMap<String, GridOrder>,
    #[serde(default)]
    pub close_orders: BTreeMap<String, GridOrder>,
}

impl TradeGrid {
    pub fn new(open_price: f64, close_price: f64, open_chance: f64, close_chance: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            open_price,
            close_price,
            open_chance,
            close_chance,
            open_total: 0.0,
            close_total: 0.0,
            open_orders: BTreeMap::new(),
            close_orders: BTreeMap::new(),
        }
    }

    /// Trigger price for a side
    pub fn price(&self, side: Side) -> f64 {
        match side {
            Side::Open => self.open_price,
            Side::Close => self.close_price,
        }
    }

    pub fn chance(&self, side: Side) -> f64 {
        match side {
            Side::Open => self.open_chance,
            Side::Close => self.close_chance,
        }
    }

    fn chance_mut(&mut self, side: Side) -> &mut f64 {
        match side {
            Side::Open => &mut self.open_chance,
            Side::Close => &mut self.close_chance,
        }
    }

    pub fn total(&self, side: Side) -> f64 {
        match side {
            Side::Open => self.open_total,
            Side::Close => self.close_total,
        }
    }

    fn total_mut(&mut self, side: Side) -> &mut f64 {
        match side {
            Side::Open => &mut self.open_total,
            Side::Close => &mut self.close_total,
        }
    }

    pub fn orders(&self, side: Side) -> &BTreeMap<String, GridOrder> {
        match side {
            Side::Open => &self.open_orders,
            Side::Close => &self.close_orders,
        }
    }

    pub fn orders_mut(&mut self, side: Side) -> &mut BTreeMap<String, GridOrder> {
        match side {
            Side::Open => &mut self.open_orders,
            Side::Close => &mut self.close_orders,
        }
    }

    /// Whether an order is currently resting (or about to) on this side
    pub fn has_in_flight(&self, side: Side) -> bool {
        !self.orders(side).is_empty()
    }

    /// Sum of unfilled quantity over this side's in-flight orders
    pub fn committed(&self, side: Side) -> f64 {
        self.orders(side).values().map(GridOrder::outstanding).sum()
    }

    /// Realized profit of this level so far
    pub fn realized_pnl(&self) -> f64 {
        self.close_total * (self.close_price - self.open_price)
    }
}

/// Ordered set of levels plus the realized P&L accumulator
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ledger {
    grids: Vec<TradeGrid>,
    realized_pnl: f64,
}

impl Ledger {
    pub fn new(grids: Vec<TradeGrid>, realized_pnl: f64) -> Self {
        Self {
            grids,
            realized_pnl,
        }
    }

    /// Build a fresh ledger from a validated ladder definition
    pub fn from_ladder(ladder: &LadderConfig) -> Self {
        let grids = ladder
            .levels
            .iter()
            .map(|level| {
                TradeGrid::new(
                    level.open_price,
                    level.close_price,
                    level.open_chance,
                    level.close_chance,
                )
            })
            .collect();
        Self::new(grids, 0.0)
    }

    pub fn grids(&self) -> &[TradeGrid] {
        &self.grids
    }

    pub fn len(&self) -> usize {
        self.grids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grids.is_empty()
    }

    pub fn grid(&self, index: usize) -> GridResult<&TradeGrid> {
        self.grids.get(index).ok_or(GridError::LevelNotFound(index))
    }

    pub fn grid_mut(&mut self, index: usize) -> GridResult<&mut TradeGrid> {
        self.grids.get_mut(index).ok_or(GridError::LevelNotFound(index))
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    /// Take the side's whole chance for a new order, leaving zero behind.
    ///
    /// Must run before the order is submitted.
    pub fn reserve_for_order(&mut self, grid: usize, side: Side) -> GridResult<f64> {
        let chance = self.grid_mut(grid)?.chance_mut(side);
        let qty = *chance;
        *chance = 0.0;
        Ok(qty)
    }

    /// Return quantity to a side's chance
    ///
    /// # Panics
    /// Panics if `qty` is negative or not finite
    pub fn refund(&mut self, grid: usize, side: Side, qty: f64) -> GridResult<()> {
        assert!(qty.is_finite() && qty >= 0.0, "refund qty must be non-negative, got {}", qty);
        *self.grid_mut(grid)?.chance_mut(side) += qty;
        Ok(())
    }

    /// Account for newly filled quantity on `side`.
    ///
    /// A fill on one side creates capacity on the other: open fills become
    /// closable, close fills become re-openable.
    ///
    /// # Panics
    /// Panics if `delta` is negative or not finite
    pub fn record_fill_delta(&mut self, grid: usize, side: Side, delta: f64) -> GridResult<()> {
        assert!(delta.is_finite() && delta >= 0.0, "fill delta must be non-negative, got {}", delta);
        let level = self.grid_mut(grid)?;
        *level.chance_mut(side.opposite()) += delta;
        *level.total_mut(side) += delta;

        if side == Side::Close {
            let profit = delta * (level.close_price - level.open_price);
            self.realized_pnl += profit;
        }
        Ok(())
    }

    /// Total capital tracked on one level: chances, in-flight remainder and totals
    pub fn level_capital(&self, grid: usize) -> GridResult<f64> {
        let level = self.grid(grid)?;
        Ok(level.open_chance
            + level.close_chance
            + level.committed(Side::Open)
            + level.committed(Side::Close)
            + level.open_total
            + level.close_total)
    }

    pub(crate) fn grids_mut(&mut self) -> &mut [TradeGrid] {
        &mut self.grids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::config::LevelConfig;

    fn ledger() -> Ledger {
        Ledger::from_ladder(&LadderConfig::new(
            "BTC-PERP",
            vec![
                LevelConfig::new(90.0, 95.0, 10.0, 0.0),
                LevelConfig::new(85.0, 90.0, 5.0, 2.0),
            ],
        ))
    }

    #[test]
    fn test_from_ladder() {
        let ledger = ledger();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.grids()[1].close_chance, 2.0);
        assert_ne!(ledger.grids()[0].id, ledger.grids()[1].id);
        assert_eq!(ledger.realized_pnl(), 0.0);
    }

    #[test]
    fn test_reserve_takes_whole_chance() {
        let mut ledger = ledger();
        let qty = ledger.reserve_for_order(0, Side::Open).unwrap();
        assert_eq!(qty, 10.0);
        assert_eq!(ledger.grids()[0].open_chance, 0.0);

        // Second reserve yields nothing
        assert_eq!(ledger.reserve_for_order(0, Side::Open).unwrap(), 0.0);
    }

    #[test]
    fn test_refund_restores_chance() {
        let mut ledger = ledger();
        let qty = ledger.reserve_for_order(1, Side::Close).unwrap();
        ledger.refund(1, Side::Close, qty).unwrap();
        assert_eq!(ledger.grids()[1].close_chance, 2.0);
    }

    #[test]
    fn test_open_fill_creates_close_capacity() {
        let mut ledger = ledger();
        ledger.record_fill_delta(0, Side::Open, 4.0).unwrap();

        let grid = &ledger.grids()[0];
        assert_eq!(grid.close_chance, 4.0);
        assert_eq!(grid.open_total, 4.0);
        assert_eq!(ledger.realized_pnl(), 0.0);
    }

    #[test]
    fn test_close_fill_books_profit() {
        let mut ledger = ledger();
        ledger.record_fill_delta(0, Side::Close, 2.0).unwrap();

        let grid = &ledger.grids()[0];
        assert_eq!(grid.open_chance, 12.0);
        assert_eq!(grid.close_total, 2.0);
        // 2 * (95 - 90)
        assert_eq!(ledger.realized_pnl(), 10.0);
        assert_eq!(grid.realized_pnl(), 10.0);
    }

    #[test]
    fn test_unknown_level() {
        let mut ledger = ledger();
        assert!(matches!(
            ledger.reserve_for_order(7, Side::Open),
            Err(GridError::LevelNotFound(7))
        ));
    }

    #[test]
    #[should_panic(expected = "fill delta must be non-negative")]
    fn test_negative_delta_panics() {
        let mut ledger = ledger();
        let _ = ledger.record_fill_delta(0, Side::Open, -1.0);
    }

    #[test]
    #[should_panic(expected = "refund qty must be non-negative")]
    fn test_negative_refund_panics() {
        let mut ledger = ledger();
        let _ = ledger.refund(0, Side::Open, -0.5);
    }

    #[test]
    fn test_cancel_cooldown_window() {
        let now = Utc::now();
        let mut order = GridOrder::new("k", 0, Side::Open, 1.0, now);
        let cooldown = chrono::Duration::seconds(20);
        assert!(order.cancel_allowed(now, cooldown));

        order.last_cancel_attempt_at = Some(now);
        assert!(!order.cancel_allowed(now + chrono::Duration::seconds(20), cooldown));
        assert!(order.cancel_allowed(now + chrono::Duration::seconds(21), cooldown));
    }
}
