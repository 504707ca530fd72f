//! Core data types shared by the ledger, the engine and the exchange boundary

use serde::{Deserialize, Serialize};

/// Side of a grid level.
///
/// The ladder is long-biased: the open side buys at `open_price`, the close
/// side sells at `close_price`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Open,
    Close,
}

impl Side {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            Side::Open => Side::Close,
            Side::Close => Side::Open,
        }
    }

    /// Exchange order direction for this side
    pub fn as_direction(&self) -> &'static str {
        match self {
            Side::Open => "buy",
            Side::Close => "sell",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Open => "open",
            Side::Close => "close",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order status as reported by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Accepted, not yet on the book
    New,
    /// Resting on the book (possibly partially filled)
    Open,
    /// Done: fully filled or cancelled with a remainder
    Closed,
    /// Cancelled, reported explicitly by venues that distinguish it
    Cancelled,
}

impl OrderStatus {
    /// Terminal statuses end the order's life in the ledger
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Closed | OrderStatus::Cancelled)
    }
}

/// Order state record, delivered by push or obtained by polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    /// Idempotency key the order was submitted with
    pub client_id: String,
    /// Exchange-assigned order id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_id: Option<u64>,
    pub side: Side,
    /// Requested size as known by the exchange
    pub size: f64,
    /// Cumulative filled size
    pub filled_size: f64,
    pub status: OrderStatus,
}

impl OrderUpdate {
    pub fn new(
        client_id: impl Into<String>,
        side: Side,
        size: f64,
        filled_size: f64,
        status: OrderStatus,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            exchange_id: None,
            side,
            size,
            filled_size,
            status,
        }
    }

    /// Builder: attach the exchange order id
    pub fn with_exchange_id(mut self, exchange_id: u64) -> Self {
        self.exchange_id = Some(exchange_id);
        self
    }
}

/// Top-of-book snapshot for one instrument
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    /// Smallest tradable size step
    pub min_size_increment: f64,
}

impl Quote {
    pub fn new(bid: f64, ask: f64, min_size_increment: f64) -> Self {
        Self {
            bid,
            ask,
            min_size_increment,
        }
    }

    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// Request to place a grid order
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceRequest {
    /// Idempotency key reserved for this order
    pub client_id: String,
    pub instrument: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub post_only: bool,
}

/// Synchronous outcome of an order submission
#[derive(Debug, Clone, PartialEq)]
pub enum PlaceOutcome {
    /// The exchange took the order; its lifecycle continues via updates
    Accepted,
    /// The exchange refused the order; nothing reached the book
    Rejected(String),
}

/// Events serialized through the engine's single writer
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Order state from the push transport or from polling
    OrderUpdate(OrderUpdate),
    /// Synthetic rejection raised by a failed submission
    Rejected { client_id: String, side: Side },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_opposite_and_direction() {
        assert_eq!(Side::Open.opposite(), Side::Close);
        assert_eq!(Side::Close.opposite(), Side::Open);
        assert_eq!(Side::Open.as_direction(), "buy");
        assert_eq!(Side::Close.as_direction(), "sell");
    }

    #[test]
    fn test_order_status_terminal() {
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::Open.is_terminal());
        assert!(OrderStatus::Closed.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_order_update_json_shape() {
        let update = OrderUpdate::new("abc", Side::Open, 10.0, 4.0, OrderStatus::Open)
            .with_exchange_id(42);
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"side\":\"open\""));
        assert!(json.contains("\"status\":\"open\""));
        assert!(json.contains("\"exchange_id\":42"));
    }
}
