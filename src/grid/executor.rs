//! Exchange abstraction for the grid engine - enables mocking for tests
//!
//! The wire client (signing, REST transport, push reconnects) lives outside
//! this crate; it only has to implement these two traits.

use async_trait::async_trait;

use super::errors::GridResult;
use super::types::{OrderUpdate, PlaceOutcome, PlaceRequest, Quote};

/// Market snapshot provider
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Best bid, best ask and minimum size increment for an instrument.
    ///
    /// The caller applies the latency bound.
    async fn snapshot(&self, instrument: &str) -> GridResult<Quote>;
}

/// Order gateway keyed by idempotency key
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Submit an order. `Err` means the outcome is unknown (transport
    /// failure); `Rejected` means the exchange refused it.
    async fn place(&self, request: &PlaceRequest) -> GridResult<PlaceOutcome>;

    /// Request cancellation; confirmation arrives later as an order update
    async fn cancel(&self, exchange_id: u64) -> GridResult<()>;

    /// Currently open orders for an instrument
    async fn open_orders(&self, instrument: &str) -> GridResult<Vec<OrderUpdate>>;

    /// Look up one order by idempotency key; `None` means the exchange has
    /// no such order
    async fn order_by_key(&self, client_id: &str) -> GridResult<Option<OrderUpdate>>;
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Mock exchange for testing the engine without a real exchange connection.
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Mutex;

    use crate::grid::errors::GridError;
    use crate::grid::types::OrderStatus;

    /// Mock exchange for testing
    ///
    /// Accepted orders are remembered with status `New` so that lookups by
    /// key find them, the way a real venue would.
    pub struct MockExchange {
        pub quote: Arc<Mutex<Quote>>,
        pub quote_delay: Arc<Mutex<Option<Duration>>>,
        pub fail_snapshot: Arc<Mutex<bool>>,
        pub placed: Arc<Mutex<Vec<PlaceRequest>>>,
        pub cancelled: Arc<Mutex<Vec<u64>>>,
        pub reject_reason: Arc<Mutex<Option<String>>>,
        pub fail_places: Arc<Mutex<bool>>,
        pub fail_queries: Arc<Mutex<bool>>,
        pub open: Arc<Mutex<Vec<OrderUpdate>>>,
        pub known: Arc<Mutex<HashMap<String, OrderUpdate>>>,
        next_oid: AtomicU64,
    }

    impl MockExchange {
        pub fn new(bid: f64, ask: f64, min_size_increment: f64) -> Self {
            Self {
                quote: Arc::new(Mutex::new(Quote::new(bid, ask, min_size_increment))),
                quote_delay: Arc::new(Mutex::new(None)),
                fail_snapshot: Arc::new(Mutex::new(false)),
                placed: Arc::new(Mutex::new(Vec::new())),
                cancelled: Arc::new(Mutex::new(Vec::new())),
                reject_reason: Arc::new(Mutex::new(None)),
                fail_places: Arc::new(Mutex::new(false)),
                fail_queries: Arc::new(Mutex::new(false)),
                open: Arc::new(Mutex::new(Vec::new())),
                known: Arc::new(Mutex::new(HashMap::new())),
                next_oid: AtomicU64::new(1),
            }
        }

        pub async fn set_quote(&self, bid: f64, ask: f64) {
            let mut quote = self.quote.lock().await;
            quote.bid = bid;
            quote.ask = ask;
        }

        pub async fn set_quote_delay(&self, delay: Option<Duration>) {
            *self.quote_delay.lock().await = delay;
        }

        pub async fn set_fail_snapshot(&self, fail: bool) {
            *self.fail_snapshot.lock().await = fail;
        }

        pub async fn set_reject(&self, reason: Option<&str>) {
            *self.reject_reason.lock().await = reason.map(str::to_string);
        }

        pub async fn set_fail_places(&self, fail: bool) {
            *self.fail_places.lock().await = fail;
        }

        pub async fn set_fail_queries(&self, fail: bool) {
            *self.fail_queries.lock().await = fail;
        }

        pub async fn placed(&self) -> Vec<PlaceRequest> {
            self.placed.lock().await.clone()
        }

        pub async fn cancelled(&self) -> Vec<u64> {
            self.cancelled.lock().await.clone()
        }

        /// Make `order_by_key` answer with this record
        pub async fn set_known(&self, update: OrderUpdate) {
            self.known.lock().await.insert(update.client_id.clone(), update);
        }

        /// Make `order_by_key` answer "not found"
        pub async fn forget(&self, client_id: &str) {
            self.known.lock().await.remove(client_id);
        }

        pub async fn set_open_orders(&self, orders: Vec<OrderUpdate>) {
            *self.open.lock().await = orders;
        }
    }

    #[async_trait]
    impl MarketData for MockExchange {
        async fn snapshot(&self, _instrument: &str) -> GridResult<Quote> {
            if let Some(delay) = *self.quote_delay.lock().await {
                tokio::time::sleep(delay).await;
            }
            if *self.fail_snapshot.lock().await {
                return Err(GridError::Exchange("Mock snapshot failure".into()));
            }
            Ok(*self.quote.lock().await)
        }
    }

    #[async_trait]
    impl OrderGateway for MockExchange {
        async fn place(&self, request: &PlaceRequest) -> GridResult<PlaceOutcome> {
            self.placed.lock().await.push(request.clone());

            if *self.fail_places.lock().await {
                return Err(GridError::Exchange("Mock transport failure".into()));
            }
            if let Some(reason) = self.reject_reason.lock().await.clone() {
                return Ok(PlaceOutcome::Rejected(reason));
            }

            let oid = self.next_oid.fetch_add(1, Ordering::SeqCst);
            let update = OrderUpdate::new(
                request.client_id.clone(),
                request.side,
                request.size,
                0.0,
                OrderStatus::New,
            )
            .with_exchange_id(oid);
            self.known.lock().await.insert(request.client_id.clone(), update);

            Ok(PlaceOutcome::Accepted)
        }

        async fn cancel(&self, exchange_id: u64) -> GridResult<()> {
            self.cancelled.lock().await.push(exchange_id);
            Ok(())
        }

        async fn open_orders(&self, _instrument: &str) -> GridResult<Vec<OrderUpdate>> {
            if *self.fail_queries.lock().await {
                return Err(GridError::Exchange("Mock query failure".into()));
            }
            Ok(self.open.lock().await.clone())
        }

        async fn order_by_key(&self, client_id: &str) -> GridResult<Option<OrderUpdate>> {
            if *self.fail_queries.lock().await {
                return Err(GridError::Exchange("Mock query failure".into()));
            }
            Ok(self.known.lock().await.get(client_id).cloned())
        }
    }
}
