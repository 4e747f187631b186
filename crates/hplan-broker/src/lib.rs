//! Execution boundary (§4.9: `ExecuteTrade(request) -> result`).
//!
//! Grounded on `mqk-broker-paper/src/lib.rs`'s deterministic in-memory
//! paper-broker design: no randomness, no timestamps, `order_id` derived
//! purely from the request's own inputs so the same request always
//! produces the same id. Real broker transports are out of scope (§1
//! Non-goals) — this crate stands in for "the thing C9 calls", letting
//! the dispatcher and its tests be exercised end to end without a live
//! connection.

use std::collections::BTreeMap;
use std::sync::Mutex;

use hplan_schemas::{Side, TradeRequest, TradeResult};

/// Execution boundary trait C9 depends on. Implementors decide success,
/// order id assignment, and rejection reasons.
pub trait ExecutionBoundary: Send + Sync {
    fn execute_trade(&self, request: &TradeRequest) -> TradeResult;
}

fn derive_order_id(request: &TradeRequest) -> String {
    format!(
        "paper:{}:{}:{}:{}",
        request.isin.as_str(),
        request.side,
        request.quantity,
        request.symbol.as_str()
    )
}

/// Deterministic in-memory paper broker: accepts every well-formed
/// request, rejects non-positive quantities, and is idempotent for a
/// repeated identical request (the second call returns the same result
/// without mutating state further).
#[derive(Default)]
pub struct PaperBroker {
    filled: Mutex<BTreeMap<String, TradeResult>>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filled_order_ids(&self) -> Vec<String> {
        self.filled.lock().expect("paper broker mutex poisoned").keys().cloned().collect()
    }
}

impl ExecutionBoundary for PaperBroker {
    fn execute_trade(&self, request: &TradeRequest) -> TradeResult {
        if request.quantity <= 0 {
            return TradeResult {
                success: false,
                order_id: None,
                reason: Some("quantity must be positive".to_string()),
            };
        }

        let order_id = derive_order_id(request);
        let mut filled = self.filled.lock().expect("paper broker mutex poisoned");
        if let Some(existing) = filled.get(&order_id) {
            return existing.clone();
        }

        let result = TradeResult {
            success: true,
            order_id: Some(order_id.clone()),
            reason: None,
        };
        filled.insert(order_id, result.clone());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hplan_schemas::Isin;

    fn request(isin: &str, side: Side, qty: i64) -> TradeRequest {
        TradeRequest {
            symbol: hplan_schemas::Symbol::new(isin),
            isin: Isin::new(isin),
            side,
            quantity: qty,
            reason: "test".to_string(),
        }
    }

    #[test]
    fn accepts_well_formed_buy() {
        let broker = PaperBroker::new();
        let result = broker.execute_trade(&request("A", Side::Buy, 10));
        assert!(result.success);
        assert!(result.order_id.is_some());
    }

    #[test]
    fn rejects_non_positive_quantity() {
        let broker = PaperBroker::new();
        let result = broker.execute_trade(&request("A", Side::Buy, 0));
        assert!(!result.success);
        assert!(result.reason.is_some());
    }

    #[test]
    fn same_request_produces_same_order_id() {
        let broker = PaperBroker::new();
        let first = broker.execute_trade(&request("A", Side::Sell, 5));
        let second = broker.execute_trade(&request("A", Side::Sell, 5));
        assert_eq!(first.order_id, second.order_id);
    }

    #[test]
    fn distinct_requests_produce_distinct_order_ids() {
        let broker = PaperBroker::new();
        let a = broker.execute_trade(&request("A", Side::Buy, 5));
        let b = broker.execute_trade(&request("B", Side::Buy, 5));
        assert_ne!(a.order_id, b.order_id);
    }
}
