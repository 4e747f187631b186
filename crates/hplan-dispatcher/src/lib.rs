//! Event-based trade dispatcher (C9, §4.9).
//!
//! Grounded on `mqk-execution/src/reconcile_guard.rs`'s
//! `ReconcileFreshnessGuard<C: Fn() -> i64>` injectable-clock idiom, adapted
//! from "is the last reconcile still fresh" to "has an execution already
//! happened within the last 15 minutes". Single-threaded, one in-process
//! mutex guarding the throttle's own private state (§5: "its state — last
//! execution timestamp — is private").

use std::sync::Mutex;

use anyhow::{Context, Result};
use hplan_broker::ExecutionBoundary;
use hplan_schemas::{Recommendation, TradeRequest};
use sqlx::PgPool;

pub const DEFAULT_THROTTLE_WINDOW_MINUTES: i64 = 15;
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Outcome of a single dispatcher invocation, for logging/metrics at the
/// call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Throttled,
    NothingPending,
    MaxRetriesExceeded { uuid: uuid::Uuid },
    Executed { uuid: uuid::Uuid, order_id: Option<String> },
    Failed { uuid: uuid::Uuid, reason: String },
}

struct ThrottleState {
    last_execution_at_ms: Option<i64>,
}

/// Throttles execution attempts to at most one per window, using an
/// injectable clock (`Fn() -> i64`, epoch-milliseconds) so tests can drive
/// time deterministically without mocking `SystemTime`.
pub struct Dispatcher<C>
where
    C: Fn() -> i64,
{
    window_ms: i64,
    max_retries: i32,
    clock: C,
    state: Mutex<ThrottleState>,
}

impl<C: Fn() -> i64> Dispatcher<C> {
    pub fn new(window_minutes: i64, max_retries: i32, clock: C) -> Self {
        Self {
            window_ms: window_minutes * 60 * 1000,
            max_retries,
            clock,
            state: Mutex::new(ThrottleState {
                last_execution_at_ms: None,
            }),
        }
    }

    fn is_throttled(&self) -> bool {
        let state = self.state.lock().expect("dispatcher mutex poisoned");
        match state.last_execution_at_ms {
            None => false,
            Some(last) => (self.clock)() - last < self.window_ms,
        }
    }

    fn record_execution(&self) {
        let mut state = self.state.lock().expect("dispatcher mutex poisoned");
        state.last_execution_at_ms = Some((self.clock)());
    }

    /// Run one dispatcher invocation against the store and execution
    /// boundary (§4.9 per-invocation algorithm).
    pub async fn dispatch_once(
        &self,
        pool: &PgPool,
        broker: &dyn ExecutionBoundary,
    ) -> Result<DispatchOutcome> {
        if self.is_throttled() {
            return Ok(DispatchOutcome::Throttled);
        }

        let pending = hplan_store::get_pending_recommendations(pool)
            .await
            .context("dispatch_once: fetch pending recommendations")?;

        let Some(recommendation) = pending.into_iter().next() else {
            return Ok(DispatchOutcome::NothingPending);
        };

        if recommendation.retry_count >= self.max_retries {
            let combined_reason = format!(
                "max retries exceeded; last failure: {}",
                recommendation.failure_reason.as_deref().unwrap_or("none")
            );
            hplan_store::mark_failed(pool, recommendation.uuid, &combined_reason)
                .await
                .context("dispatch_once: mark_failed on max retries")?;
            return Ok(DispatchOutcome::MaxRetriesExceeded {
                uuid: recommendation.uuid,
            });
        }

        self.record_execution();

        let request = to_trade_request(&recommendation);
        let result = broker.execute_trade(&request);

        if result.success {
            hplan_store::mark_executed(pool, recommendation.uuid)
                .await
                .context("dispatch_once: mark_executed")?;
            Ok(DispatchOutcome::Executed {
                uuid: recommendation.uuid,
                order_id: result.order_id,
            })
        } else {
            let reason = result.reason.unwrap_or_else(|| "execution rejected".to_string());
            hplan_store::record_failed_attempt(pool, recommendation.uuid, &reason)
                .await
                .context("dispatch_once: record_failed_attempt")?;
            Ok(DispatchOutcome::Failed {
                uuid: recommendation.uuid,
                reason,
            })
        }
    }
}

fn to_trade_request(r: &Recommendation) -> TradeRequest {
    TradeRequest {
        symbol: r.symbol.clone(),
        isin: r.isin.clone(),
        side: r.side,
        quantity: r.quantity.round() as i64,
        reason: r.reason.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn throttle_blocks_second_call_within_window() {
        let clock_value = Cell::new(0i64);
        let clock = || clock_value.get();
        let dispatcher = Dispatcher::new(15, 3, clock);

        assert!(!dispatcher.is_throttled());
        dispatcher.record_execution();
        assert!(dispatcher.is_throttled());

        clock_value.set(10 * 60 * 1000);
        assert!(dispatcher.is_throttled());

        clock_value.set(16 * 60 * 1000);
        assert!(!dispatcher.is_throttled());
    }

    #[test]
    fn fresh_dispatcher_is_never_throttled_before_first_execution() {
        let clock = || 0i64;
        let dispatcher = Dispatcher::new(15, 3, clock);
        assert!(!dispatcher.is_throttled());
    }

    #[test]
    fn to_trade_request_rounds_fractional_quantity() {
        let recommendation = Recommendation {
            uuid: uuid::Uuid::new_v4(),
            symbol: hplan_schemas::Symbol::new("AAPL"),
            isin: hplan_schemas::Isin::new("US0378331005"),
            name: "Apple".to_string(),
            side: hplan_schemas::Side::Buy,
            quantity: 9.6,
            estimated_price_eur_micros: 0,
            estimated_value_eur_micros: 0,
            reason: "test".to_string(),
            currency: "EUR".to_string(),
            priority: 0.0,
            current_portfolio_score: 0.0,
            new_portfolio_score: 0.0,
            score_change: 0.0,
            status: hplan_schemas::RecommendationStatus::Pending,
            portfolio_hash: hplan_schemas::PortfolioFingerprint("abc".to_string()),
            retry_count: 0,
            failure_reason: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let request = to_trade_request(&recommendation);
        assert_eq!(request.quantity, 10);
    }
}
