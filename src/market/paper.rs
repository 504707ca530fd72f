//! Paper exchange
//!
//! Simulates order execution locally: resting orders fill at their limit
//! price once the simulated quote crosses them. Order state is pushed to the
//! engine's event queue like a real venue's private feed would.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::grid::errors::{GridError, GridResult};
use crate::grid::executor::{MarketData, OrderGateway};
use crate::grid::runner::EventSender;
use crate::grid::types::{OrderStatus, OrderUpdate, PlaceOutcome, PlaceRequest, Quote, Side};

fn default_mid() -> f64 {
    100.0
}

fn default_spread() -> f64 {
    0.1
}

fn default_min_size_increment() -> f64 {
    0.001
}

fn default_step() -> f64 {
    0.25
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_fee_rate() -> f64 {
    0.0002
}

/// Settings for the simulated venue and its price walk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperExchangeInput {
    /// Starting mid price
    #[serde(default = "default_mid")]
    pub mid: f64,

    /// Ask minus bid
    #[serde(default = "default_spread")]
    pub spread: f64,

    #[serde(default = "default_min_size_increment")]
    pub min_size_increment: f64,

    /// The walk turns around at these bounds; unset means mid -/+ 20%
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,

    /// Mid move per tick
    #[serde(default = "default_step")]
    pub step: f64,

    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Fee rate charged on fills (e.g., 0.0002 = 0.02%)
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
}

impl Default for PaperExchangeInput {
    fn default() -> Self {
        Self {
            mid: default_mid(),
            spread: default_spread(),
            min_size_increment: default_min_size_increment(),
            low: None,
            high: None,
            step: default_step(),
            tick_ms: default_tick_ms(),
            fee_rate: default_fee_rate(),
        }
    }
}

impl PaperExchangeInput {
    fn bounds(&self) -> (f64, f64) {
        (
            self.low.unwrap_or(self.mid * 0.8),
            self.high.unwrap_or(self.mid * 1.2),
        )
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    request: PlaceRequest,
    oid: u64,
    filled: f64,
    status: OrderStatus,
}

impl PaperOrder {
    fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Buy fills when the ask comes down to the limit, sell when the bid
    /// comes up to it
    fn should_fill(&self, quote: &Quote) -> bool {
        if !self.is_active() {
            return false;
        }
        match self.request.side {
            Side::Open => quote.ask <= self.request.price,
            Side::Close => quote.bid >= self.request.price,
        }
    }

    fn to_update(&self) -> OrderUpdate {
        OrderUpdate::new(
            self.request.client_id.clone(),
            self.request.side,
            self.request.size,
            self.filled,
            self.status,
        )
        .with_exchange_id(self.oid)
    }
}

/// Long-only position built from paper fills
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PaperPosition {
    pub size: f64,
    pub entry_price: f64,
    pub realized_pnl: f64,
    pub fees: f64,
}

impl PaperPosition {
    fn apply_fill(&mut self, side: Side, qty: f64, price: f64, fee: f64) {
        self.fees += fee;
        match side {
            Side::Open => {
                let cost = self.entry_price * self.size + price * qty;
                self.size += qty;
                self.entry_price = cost / self.size;
            }
            Side::Close => {
                let closed = qty.min(self.size);
                self.realized_pnl += (price - self.entry_price) * closed;
                self.size -= closed;
                if self.size <= 0.0 {
                    self.size = 0.0;
                    self.entry_price = 0.0;
                }
            }
        }
    }

    pub fn unrealized_pnl(&self, mid: f64) -> f64 {
        (mid - self.entry_price) * self.size
    }
}

#[derive(Debug)]
struct PaperBook {
    quote: Quote,
    orders: HashMap<String, PaperOrder>,
    keys_by_oid: HashMap<u64, String>,
    next_oid: u64,
    position: PaperPosition,
    events: Option<EventSender>,
}

impl PaperBook {
    /// Fill every crossed order at its limit price
    fn match_orders(&mut self, fee_rate: f64) -> Vec<OrderUpdate> {
        let quote = self.quote;
        let mut updates = Vec::new();

        for order in self.orders.values_mut().filter(|o| o.should_fill(&quote)) {
            let qty = order.request.size - order.filled;
            let price = order.request.price;
            let fee = qty * price * fee_rate;

            order.filled = order.request.size;
            order.status = OrderStatus::Closed;
            self.position.apply_fill(order.request.side, qty, price, fee);

            info!(
                "Paper fill: {} {} @ {} (oid {}, fee {:.4})",
                order.request.side.as_direction(),
                qty,
                price,
                order.oid,
                fee
            );
            updates.push(order.to_update());
        }
        updates
    }

    fn push(&self, updates: Vec<OrderUpdate>) {
        let Some(events) = &self.events else {
            return;
        };
        for update in updates {
            if let Err(e) = events.try_send(update) {
                // The engine's polling pass picks the state up later
                warn!("Paper exchange could not push update: {}", e);
            }
        }
    }
}

/// Local simulated venue implementing both exchange traits
pub struct PaperExchange {
    instrument: String,
    input: PaperExchangeInput,
    book: Mutex<PaperBook>,
}

impl PaperExchange {
    pub fn new(instrument: impl Into<String>, input: PaperExchangeInput) -> Self {
        let half = input.spread / 2.0;
        let quote = Quote::new(input.mid - half, input.mid + half, input.min_size_increment);
        Self {
            instrument: instrument.into(),
            input,
            book: Mutex::new(PaperBook {
                quote,
                orders: HashMap::new(),
                keys_by_oid: HashMap::new(),
                next_oid: 1,
                position: PaperPosition::default(),
                events: None,
            }),
        }
    }

    /// Route order updates to the engine's queue
    pub async fn attach(&self, events: EventSender) {
        self.book.lock().await.events = Some(events);
    }

    /// Move the quote and fill whatever it crosses. Returns the fill count.
    pub async fn set_quote(&self, bid: f64, ask: f64) -> usize {
        let mut book = self.book.lock().await;
        book.quote.bid = bid;
        book.quote.ask = ask;
        let updates = book.match_orders(self.input.fee_rate);
        let fills = updates.len();
        book.push(updates);
        fills
    }

    /// Move the mid, keeping the configured spread
    pub async fn set_mid(&self, mid: f64) -> usize {
        let half = self.input.spread / 2.0;
        self.set_quote(mid - half, mid + half).await
    }

    pub async fn quote(&self) -> Quote {
        self.book.lock().await.quote
    }

    pub async fn position(&self) -> PaperPosition {
        self.book.lock().await.position
    }

    pub async fn active_order_count(&self) -> usize {
        self.book.lock().await.orders.values().filter(|o| o.is_active()).count()
    }

    /// Bounce the mid between the configured bounds
    pub fn spawn_price_walk(self: &Arc<Self>) -> JoinHandle<()> {
        let exchange = Arc::clone(self);
        let (low, high) = self.input.bounds();
        let step = self.input.step.abs();
        let period = Duration::from_millis(self.input.tick_ms.max(1));
        info!(
            "Paper price walk for {}: {} .. {} step {} every {:?}",
            self.instrument, low, high, step, period
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut mid = exchange.input.mid;
            let mut direction = -1.0;
            loop {
                ticker.tick().await;
                mid += direction * step;
                if mid <= low {
                    mid = low;
                    direction = 1.0;
                } else if mid >= high {
                    mid = high;
                    direction = -1.0;
                }
                let fills = exchange.set_mid(mid).await;
                if fills > 0 {
                    debug!("Paper mid {} filled {} order(s)", mid, fills);
                }
            }
        })
    }
}

#[async_trait]
impl MarketData for PaperExchange {
    async fn snapshot(&self, instrument: &str) -> GridResult<Quote> {
        if instrument != self.instrument {
            return Err(GridError::Exchange(format!("Unknown instrument {}", instrument)));
        }
        Ok(self.book.lock().await.quote)
    }
}

#[async_trait]
impl OrderGateway for PaperExchange {
    async fn place(&self, request: &PlaceRequest) -> GridResult<PlaceOutcome> {
        let mut book = self.book.lock().await;

        // Same key twice is the same order
        if book.orders.contains_key(&request.client_id) {
            debug!("Paper order {} already known", request.client_id);
            return Ok(PlaceOutcome::Accepted);
        }
        if request.instrument != self.instrument {
            return Ok(PlaceOutcome::Rejected(format!(
                "unknown instrument {}",
                request.instrument
            )));
        }
        if !(request.size >= book.quote.min_size_increment) || !(request.price > 0.0) {
            return Ok(PlaceOutcome::Rejected(format!(
                "invalid size {} or price {}",
                request.size, request.price
            )));
        }

        let crosses = match request.side {
            Side::Open => request.price >= book.quote.ask,
            Side::Close => request.price <= book.quote.bid,
        };
        if request.post_only && crosses {
            return Ok(PlaceOutcome::Rejected("post only order would cross".into()));
        }

        let oid = book.next_oid;
        book.next_oid += 1;
        let order = PaperOrder {
            request: request.clone(),
            oid,
            filled: 0.0,
            status: OrderStatus::Open,
        };
        info!(
            "Paper order {}: {} {} {} @ {}",
            oid,
            request.side.as_direction(),
            request.size,
            request.instrument,
            request.price
        );

        let mut updates = vec![order.to_update()];
        book.keys_by_oid.insert(oid, request.client_id.clone());
        book.orders.insert(request.client_id.clone(), order);
        updates.extend(book.match_orders(self.input.fee_rate));
        book.push(updates);

        Ok(PlaceOutcome::Accepted)
    }

    async fn cancel(&self, exchange_id: u64) -> GridResult<()> {
        let mut book = self.book.lock().await;
        let key = book
            .keys_by_oid
            .get(&exchange_id)
            .cloned()
            .ok_or_else(|| GridError::Exchange(format!("Unknown order id {}", exchange_id)))?;

        let update = match book.orders.get_mut(&key) {
            Some(order) if order.is_active() => {
                order.status = OrderStatus::Cancelled;
                info!("Paper order {} cancelled", exchange_id);
                order.to_update()
            }
            _ => return Ok(()),
        };
        book.push(vec![update]);
        Ok(())
    }

    async fn open_orders(&self, instrument: &str) -> GridResult<Vec<OrderUpdate>> {
        let book = self.book.lock().await;
        Ok(book
            .orders
            .values()
            .filter(|o| o.is_active() && o.request.instrument == instrument)
            .map(PaperOrder::to_update)
            .collect())
    }

    async fn order_by_key(&self, client_id: &str) -> GridResult<Option<OrderUpdate>> {
        let book = self.book.lock().await;
        Ok(book.orders.get(client_id).map(PaperOrder::to_update))
    }
}
