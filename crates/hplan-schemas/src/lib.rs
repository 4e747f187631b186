//! Wire-stable data model shared by every planning-core crate.
//!
//! `Isin` is the only key that may cross a component boundary; `Symbol`
//! exists solely for external (price/broker) boundaries. See the
//! `Side`/`Recommendation` types for the persisted wire format consumed by
//! `hplan-store` and emitted by `hplan-dispatcher`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed-point scale for EUR amounts: 1 EUR == 1_000_000 micros.
pub const MICROS_SCALE: i64 = 1_000_000;

/// ISIN: the canonical 12-character security identifier, used as the
/// sole internal key for every map that crosses a component boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Isin(pub String);

impl Isin {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Isin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Venue-local ticker identifier. Only appears at external boundaries
/// (price providers, broker) — never inside an `OpportunityContext`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable per-cycle security metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Security {
    pub isin: Isin,
    pub symbol: Symbol,
    pub name: String,
    pub currency: String,
    pub country: String,
    /// Possibly multi-valued, comma-joined at source.
    pub industry: String,
    pub exchange: String,
    pub allow_buy: bool,
    pub allow_sell: bool,
    pub min_lot: u32,
    pub active: bool,
}

/// A held quantity of a security, as synced from the broker/portfolio store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub isin: Isin,
    pub symbol: Symbol,
    /// Real-valued: fractional share positions are representable.
    pub quantity: f64,
    pub native_currency: String,
    pub currency_rate_at_sync: f64,
    pub market_value_eur_micros: i64,
    pub cost_basis_eur_micros: i64,
    pub unrealized_pnl_eur_micros: i64,
    pub unrealized_pnl_pct: f64,
    pub first_bought_at: Option<DateTime<Utc>>,
    pub last_sold_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    /// Native-currency current price and average cost, when known upstream.
    pub current_price_native: Option<f64>,
    pub avg_price_native: Option<f64>,
}

/// The planning-time projection of a `Position`, fully EUR-normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedPosition {
    pub isin: Isin,
    pub symbol: Symbol,
    pub quantity: f64,
    pub eur_avg_cost_per_share_micros: i64,
    pub eur_current_price_micros: i64,
    pub value_eur_micros: i64,
    pub weight_in_portfolio: f64,
    pub days_held: Option<i64>,
    pub name: String,
    pub country: String,
    pub exchange: String,
    pub active: bool,
    pub allow_buy: bool,
    pub allow_sell: bool,
    pub min_lot: u32,
}

/// The immutable snapshot handed to the planner by the context builder (C3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpportunityContext {
    pub positions: Vec<EnrichedPosition>,
    pub securities: BTreeMap<Isin, Security>,
    pub available_cash_eur_micros: i64,
    pub total_portfolio_value_eur_micros: i64,
    pub current_prices: BTreeMap<Isin, i64>,
    pub target_weights: BTreeMap<Isin, f64>,
    pub country_allocations_micros: BTreeMap<String, i64>,
    pub country_weights: BTreeMap<String, f64>,
    pub industry_allocations_micros: BTreeMap<String, i64>,
    pub industry_weights: BTreeMap<String, f64>,
    pub country_to_group: BTreeMap<String, String>,
    pub industry_to_group: BTreeMap<String, String>,
    pub security_scores: BTreeMap<Isin, f64>,
    pub long_term_scores: BTreeMap<Isin, f64>,
    pub fundamentals_scores: BTreeMap<Isin, f64>,
    pub cagrs: BTreeMap<Isin, f64>,
    pub opportunity_scores: BTreeMap<Isin, f64>,
    pub momentum_scores: BTreeMap<Isin, f64>,
    pub volatility: BTreeMap<Isin, f64>,
    pub sharpe: BTreeMap<Isin, f64>,
    pub max_drawdown: BTreeMap<Isin, f64>,
    pub regime_score: f64,
    pub market_avg_pe: f64,
    pub target_return: f64,
    pub target_return_threshold_pct: f64,
}

/// `OTHER` is the catch-all group for country/industry values with no
/// mapping in the grouping repository.
pub const OTHER_GROUP: &str = "OTHER";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCandidate {
    pub symbol: Symbol,
    pub isin: Isin,
    pub side: Side,
    pub quantity: i64,
    pub value_eur_micros: i64,
    pub estimated_price_eur_micros: i64,
    pub currency: String,
    pub reason: String,
    pub priority: f64,
    pub category: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionSequence {
    pub actions: Vec<ActionCandidate>,
}

impl ActionSequence {
    pub fn new(actions: Vec<ActionCandidate>) -> Self {
        Self { actions }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub diversification: f64,
    pub risk: f64,
    pub cost: f64,
    pub extra: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceEvaluation {
    pub sequence: ActionSequence,
    pub feasible: bool,
    pub end_state_score: f64,
    pub breakdown: ScoreBreakdown,
    pub final_cash_eur_micros: i64,
    pub final_positions: BTreeMap<Isin, f64>,
    pub diversification_score: f64,
    pub infeasible_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolisticStep {
    pub symbol: Symbol,
    pub isin: Isin,
    pub name: String,
    pub side: Side,
    pub quantity: i64,
    pub estimated_price_eur_micros: i64,
    pub estimated_value_eur_micros: i64,
    pub currency: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolisticPlan {
    pub steps: Vec<HolisticStep>,
    pub current_score: f64,
    pub end_state_score: f64,
    pub feasible: bool,
}

impl HolisticPlan {
    pub fn improvement(&self) -> f64 {
        self.end_state_score - self.current_score
    }

    pub fn empty(current_score: f64) -> Self {
        Self {
            steps: Vec::new(),
            current_score,
            end_state_score: current_score,
            feasible: true,
        }
    }
}

/// Generic reason-code carrier used by every explainability trace below.
/// Mirrors the corpus's `ReasonCode` enum shape (a closed set of known
/// causes plus an escape hatch for calculator-specific detail).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonCode {
    Inactive,
    BuyDisallowed,
    SellDisallowedNoPosition,
    CooloffWindow,
    QualityGateFailed,
    NoResolvablePrice,
    NoConvertibleCostBasis,
    ConcentrationCapExceeded,
    GroupTargetOutOfTolerance,
    EligibilityFailed,
    CorrelationTooHigh,
    DiversityFailed,
    RecentlyTraded,
    CalculatorFailure,
    BelowPriorityThreshold,
    CashInsufficient,
    LotRoundingInfeasible,
    Other(String),
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReasonCode::Inactive => write!(f, "inactive"),
            ReasonCode::BuyDisallowed => write!(f, "buy_disallowed"),
            ReasonCode::SellDisallowedNoPosition => write!(f, "sell_disallowed_no_position"),
            ReasonCode::CooloffWindow => write!(f, "cooloff_window"),
            ReasonCode::QualityGateFailed => write!(f, "quality_gate_failed"),
            ReasonCode::NoResolvablePrice => write!(f, "no_resolvable_price"),
            ReasonCode::NoConvertibleCostBasis => write!(f, "no_convertible_cost_basis"),
            ReasonCode::ConcentrationCapExceeded => write!(f, "concentration_cap_exceeded"),
            ReasonCode::GroupTargetOutOfTolerance => write!(f, "group_target_out_of_tolerance"),
            ReasonCode::EligibilityFailed => write!(f, "eligibility_failed"),
            ReasonCode::CorrelationTooHigh => write!(f, "correlation_too_high"),
            ReasonCode::DiversityFailed => write!(f, "diversity_failed"),
            ReasonCode::RecentlyTraded => write!(f, "recently_traded"),
            ReasonCode::CalculatorFailure => write!(f, "calculator_failure"),
            ReasonCode::BelowPriorityThreshold => write!(f, "below_priority_threshold"),
            ReasonCode::CashInsufficient => write!(f, "cash_insufficient"),
            ReasonCode::LotRoundingInfeasible => write!(f, "lot_rounding_infeasible"),
            ReasonCode::Other(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedOpportunity {
    pub isin: Isin,
    pub symbol: Symbol,
    pub category: String,
    pub reason: ReasonCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreFilteredSecurity {
    pub isin: Isin,
    pub symbol: Symbol,
    pub reason: ReasonCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedSequence {
    pub sequence: ActionSequence,
    pub filter_name: String,
    pub reason: ReasonCode,
}

/// A stable hash of the portfolio state, used to detect "state changed
/// since last plan" and to correlate recommendations/traces. Never used to
/// skip work.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortfolioFingerprint(pub String);

impl fmt::Display for PortfolioFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationStatus {
    Pending,
    Executed,
    Failed,
    Dismissed,
}

impl RecommendationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationStatus::Pending => "pending",
            RecommendationStatus::Executed => "executed",
            RecommendationStatus::Failed => "failed",
            RecommendationStatus::Dismissed => "dismissed",
        }
    }
}

impl fmt::Display for RecommendationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Wire-stable persisted recommendation record (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub uuid: Uuid,
    pub symbol: Symbol,
    pub isin: Isin,
    pub name: String,
    pub side: Side,
    pub quantity: f64,
    pub estimated_price_eur_micros: i64,
    pub estimated_value_eur_micros: i64,
    pub reason: String,
    pub currency: String,
    pub priority: f64,
    pub current_portfolio_score: f64,
    pub new_portfolio_score: f64,
    pub score_change: f64,
    pub status: RecommendationStatus,
    pub portfolio_hash: PortfolioFingerprint,
    pub retry_count: i32,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanGeneratedEvent {
    pub portfolio_hash: PortfolioFingerprint,
    pub steps: usize,
    pub end_score: f64,
    pub improvement: f64,
    pub feasible: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationsReadyEvent {
    pub portfolio_hash: PortfolioFingerprint,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum PlannerEvent {
    PlanGenerated(PlanGeneratedEvent),
    RecommendationsReady(RecommendationsReadyEvent),
}

/// `TradeRequest` is the boundary payload C9 hands to the execution boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRequest {
    pub symbol: Symbol,
    pub isin: Isin,
    pub side: Side,
    pub quantity: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isin_display_roundtrip() {
        let isin = Isin::new("US0378331005");
        assert_eq!(isin.to_string(), "US0378331005");
        assert_eq!(isin.as_str(), "US0378331005");
    }

    #[test]
    fn side_display_matches_wire_format() {
        assert_eq!(Side::Buy.to_string(), "BUY");
        assert_eq!(Side::Sell.to_string(), "SELL");
    }

    #[test]
    fn holistic_plan_improvement_is_end_minus_current() {
        let plan = HolisticPlan {
            steps: vec![],
            current_score: 0.40,
            end_state_score: 0.55,
            feasible: true,
        };
        assert!((plan.improvement() - 0.15).abs() < 1e-12);
    }

    #[test]
    fn empty_plan_has_zero_improvement() {
        let plan = HolisticPlan::empty(0.5);
        assert_eq!(plan.steps.len(), 0);
        assert!((plan.improvement()).abs() < 1e-12);
    }

    #[test]
    fn reason_code_display_known_variant() {
        assert_eq!(ReasonCode::CashInsufficient.to_string(), "cash_insufficient");
    }

    #[test]
    fn reason_code_display_other_passthrough() {
        let rc = ReasonCode::Other("weird_edge_case".to_string());
        assert_eq!(rc.to_string(), "weird_edge_case");
    }

    #[test]
    fn action_sequence_len_and_empty() {
        let seq = ActionSequence::default();
        assert!(seq.is_empty());
        assert_eq!(seq.len(), 0);
    }
}
