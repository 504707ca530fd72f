//! Global index of in-flight orders, keyed by idempotency key

use std::collections::HashMap;
use std::ops::ControlFlow;

use super::ledger::GridOrder;
use super::types::Side;

/// Where an in-flight order lives in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderSlot {
    pub grid: usize,
    pub side: Side,
}

/// Maps client id to the owning grid and side.
///
/// An entry exists here iff the order sits in exactly one grid's per-side
/// order set. The engine is the only writer.
#[derive(Debug, Clone, Default)]
pub struct OrderRegistry {
    entries: HashMap<String, OrderSlot>,
}

impl OrderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an order. Returns false if the key was already present.
    pub fn add(&mut self, order: &GridOrder) -> bool {
        if self.entries.contains_key(&order.client_id) {
            return false;
        }
        self.entries.insert(
            order.client_id.clone(),
            OrderSlot {
                grid: order.grid,
                side: order.side,
            },
        );
        true
    }

    pub fn remove(&mut self, client_id: &str) -> Option<OrderSlot> {
        self.entries.remove(client_id)
    }

    pub fn get(&self, client_id: &str) -> Option<OrderSlot> {
        self.entries.get(client_id).copied()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.entries.contains_key(client_id)
    }

    /// Visit every entry in no particular order; `Break` stops early
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&str, OrderSlot) -> ControlFlow<()>,
    {
        for (client_id, slot) in &self.entries {
            if visitor(client_id, *slot).is_break() {
                break;
            }
        }
    }

    /// Snapshot of all keys, for loops that mutate the ledger while visiting
    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn order(key: &str, grid: usize, side: Side) -> GridOrder {
        GridOrder::new(key, grid, side, 1.0, Utc::now())
    }

    #[test]
    fn test_add_get_remove() {
        let mut registry = OrderRegistry::new();
        assert!(registry.add(&order("a", 3, Side::Close)));
        assert_eq!(
            registry.get("a"),
            Some(OrderSlot {
                grid: 3,
                side: Side::Close
            })
        );

        assert!(registry.remove("a").is_some());
        assert!(registry.get("a").is_none());
        assert!(registry.remove("a").is_none());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut registry = OrderRegistry::new();
        assert!(registry.add(&order("a", 0, Side::Open)));
        assert!(!registry.add(&order("a", 1, Side::Close)));
        assert_eq!(registry.get("a").map(|s| s.grid), Some(0));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_for_each_early_stop() {
        let mut registry = OrderRegistry::new();
        for i in 0..5 {
            registry.add(&order(&format!("k{}", i), i, Side::Open));
        }

        let mut visited = 0;
        registry.for_each(|_, _| {
            visited += 1;
            if visited == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(visited, 2);

        let mut all = 0;
        registry.for_each(|_, _| {
            all += 1;
            ControlFlow::Continue(())
        });
        assert_eq!(all, 5);
    }
}
