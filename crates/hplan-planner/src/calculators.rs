//! Opportunity calculators (§4.5 step 2).
//!
//! Each calculator reads the `OpportunityContext` and returns zero or more
//! `ActionCandidate`s tagged with a category label. Calculators are
//! independent and pure with respect to their parameters and the context;
//! failure of one must not abort planning (§7) — its output becomes empty
//! and a `CalculatorFailure` trace is recorded by the caller.
//!
//! Grounded on the corpus's `mqk-strategy::plugin_registry::PluginRegistry`
//! shape (named, insertion-ordered catalogue of boxed factories) for the
//! calculator catalogue, adapted from strategy instantiation to pure
//! calculator functions.

use std::collections::BTreeSet;

use hplan_schemas::{ActionCandidate, Isin, OpportunityContext, Side};

/// Per-calculator parameter block (§4.5: "exposes default parameters").
#[derive(Debug, Clone, Copy)]
pub struct CalculatorParams {
    pub max_opportunities_per_category: usize,
    /// Minimum unrealized gain fraction that triggers profit-taking.
    pub profit_taking_threshold: f64,
    /// Minimum unrealized loss fraction that triggers averaging-down.
    pub averaging_down_threshold: f64,
    /// Minimum deviation from target weight that triggers a rebalance.
    pub rebalance_tolerance: f64,
    /// Minimum opportunity score that triggers an opportunity-buy.
    pub opportunity_score_threshold: f64,
    /// ISINs currently held as of this cycle, for held-based eligibility.
    pub held: BTreeSet<Isin>,
}

impl Default for CalculatorParams {
    fn default() -> Self {
        Self {
            max_opportunities_per_category: 20,
            profit_taking_threshold: 0.15,
            averaging_down_threshold: 0.10,
            rebalance_tolerance: 0.02,
            opportunity_score_threshold: 0.7,
            held: BTreeSet::new(),
        }
    }
}

/// A single opportunity calculator.
///
/// Implementations are expected to be pure with respect to `ctx`/`params`
/// and to self-enforce `params.max_opportunities_per_category`.
pub trait OpportunityCalculator: Send + Sync {
    fn category(&self) -> &'static str;
    fn calculate(
        &self,
        ctx: &OpportunityContext,
        params: &CalculatorParams,
    ) -> Result<Vec<ActionCandidate>, String>;
}

fn round_down_to_lot(quantity: f64, min_lot: u32) -> i64 {
    let lot = min_lot.max(1) as f64;
    ((quantity / lot).floor() * lot) as i64
}

/// "profit-taking": sell positions whose unrealized gain exceeds the
/// configured threshold.
pub struct ProfitTakingCalculator;
impl OpportunityCalculator for ProfitTakingCalculator {
    fn category(&self) -> &'static str {
        "profit_taking"
    }

    fn calculate(
        &self,
        ctx: &OpportunityContext,
        params: &CalculatorParams,
    ) -> Result<Vec<ActionCandidate>, String> {
        let mut out = Vec::new();
        for pos in &ctx.positions {
            if !pos.allow_sell || pos.eur_avg_cost_per_share_micros <= 0 {
                continue;
            }
            let gain = (pos.eur_current_price_micros - pos.eur_avg_cost_per_share_micros) as f64
                / pos.eur_avg_cost_per_share_micros as f64;
            if gain < params.profit_taking_threshold {
                continue;
            }
            let qty = round_down_to_lot(pos.quantity, pos.min_lot).min(pos.quantity as i64);
            if qty <= 0 {
                continue;
            }
            out.push(ActionCandidate {
                symbol: pos.symbol.clone(),
                isin: pos.isin.clone(),
                side: Side::Sell,
                quantity: qty,
                value_eur_micros: qty * pos.eur_current_price_micros,
                estimated_price_eur_micros: pos.eur_current_price_micros,
                currency: "EUR".to_string(),
                reason: format!("unrealized gain {:.1}% above threshold", gain * 100.0),
                priority: gain,
                category: self.category().to_string(),
            });
            if out.len() >= params.max_opportunities_per_category {
                break;
            }
        }
        Ok(out)
    }
}

/// "averaging-down": buy more of positions in an unrealized loss beyond the
/// configured threshold, when buying is still allowed.
pub struct AveragingDownCalculator;
impl OpportunityCalculator for AveragingDownCalculator {
    fn category(&self) -> &'static str {
        "averaging_down"
    }

    fn calculate(
        &self,
        ctx: &OpportunityContext,
        params: &CalculatorParams,
    ) -> Result<Vec<ActionCandidate>, String> {
        let mut out = Vec::new();
        for pos in &ctx.positions {
            if !pos.allow_buy || pos.eur_avg_cost_per_share_micros <= 0 {
                continue;
            }
            let loss = (pos.eur_avg_cost_per_share_micros - pos.eur_current_price_micros) as f64
                / pos.eur_avg_cost_per_share_micros as f64;
            if loss < params.averaging_down_threshold {
                continue;
            }
            let top_up_qty = round_down_to_lot(pos.quantity * 0.25, pos.min_lot);
            if top_up_qty <= 0 || pos.eur_current_price_micros <= 0 {
                continue;
            }
            out.push(ActionCandidate {
                symbol: pos.symbol.clone(),
                isin: pos.isin.clone(),
                side: Side::Buy,
                quantity: top_up_qty,
                value_eur_micros: top_up_qty * pos.eur_current_price_micros,
                estimated_price_eur_micros: pos.eur_current_price_micros,
                currency: "EUR".to_string(),
                reason: format!("unrealized loss {:.1}% triggers averaging down", loss * 100.0),
                priority: loss,
                category: self.category().to_string(),
            });
            if out.len() >= params.max_opportunities_per_category {
                break;
            }
        }
        Ok(out)
    }
}

/// "rebalance-sells": trim positions whose portfolio weight exceeds their
/// target weight by more than `rebalance_tolerance`.
pub struct RebalanceSellsCalculator;
impl OpportunityCalculator for RebalanceSellsCalculator {
    fn category(&self) -> &'static str {
        "rebalance_sells"
    }

    fn calculate(
        &self,
        ctx: &OpportunityContext,
        params: &CalculatorParams,
    ) -> Result<Vec<ActionCandidate>, String> {
        let mut out = Vec::new();
        for pos in &ctx.positions {
            if !pos.allow_sell {
                continue;
            }
            let target = ctx.target_weights.get(&pos.isin).copied().unwrap_or(0.0);
            let excess = pos.weight_in_portfolio - target;
            if excess <= params.rebalance_tolerance {
                continue;
            }
            let excess_value_eur =
                excess * ctx.total_portfolio_value_eur_micros as f64 / hplan_schemas::MICROS_SCALE as f64;
            if pos.eur_current_price_micros <= 0 {
                continue;
            }
            let excess_qty = excess_value_eur
                / (pos.eur_current_price_micros as f64 / hplan_schemas::MICROS_SCALE as f64);
            let qty = round_down_to_lot(excess_qty, pos.min_lot).min(pos.quantity as i64);
            if qty <= 0 {
                continue;
            }
            out.push(ActionCandidate {
                symbol: pos.symbol.clone(),
                isin: pos.isin.clone(),
                side: Side::Sell,
                quantity: qty,
                value_eur_micros: qty * pos.eur_current_price_micros,
                estimated_price_eur_micros: pos.eur_current_price_micros,
                currency: "EUR".to_string(),
                reason: format!("weight {:.2}% exceeds target {:.2}%", pos.weight_in_portfolio * 100.0, target * 100.0),
                priority: excess,
                category: self.category().to_string(),
            });
            if out.len() >= params.max_opportunities_per_category {
                break;
            }
        }
        Ok(out)
    }
}

/// "rebalance-buys": top up (or initiate) positions below their target
/// weight, when buying is allowed.
pub struct RebalanceBuysCalculator;
impl OpportunityCalculator for RebalanceBuysCalculator {
    fn category(&self) -> &'static str {
        "rebalance_buys"
    }

    fn calculate(
        &self,
        ctx: &OpportunityContext,
        params: &CalculatorParams,
    ) -> Result<Vec<ActionCandidate>, String> {
        let mut out = Vec::new();
        for (isin, &target) in &ctx.target_weights {
            let Some(security) = ctx.securities.get(isin) else {
                continue;
            };
            if !security.allow_buy || !security.active {
                continue;
            }
            let current_weight = ctx
                .positions
                .iter()
                .find(|p| &p.isin == isin)
                .map(|p| p.weight_in_portfolio)
                .unwrap_or(0.0);
            let gap = target - current_weight;
            if gap <= params.rebalance_tolerance {
                continue;
            }
            let Some(&price_micros) = ctx.current_prices.get(isin) else {
                continue;
            };
            if price_micros <= 0 {
                continue;
            }
            let gap_value_eur =
                gap * ctx.total_portfolio_value_eur_micros as f64 / hplan_schemas::MICROS_SCALE as f64;
            let qty = round_down_to_lot(
                gap_value_eur / (price_micros as f64 / hplan_schemas::MICROS_SCALE as f64),
                security.min_lot,
            );
            if qty <= 0 {
                continue;
            }
            out.push(ActionCandidate {
                symbol: security.symbol.clone(),
                isin: isin.clone(),
                side: Side::Buy,
                quantity: qty,
                value_eur_micros: qty * price_micros,
                estimated_price_eur_micros: price_micros,
                currency: security.currency.clone(),
                reason: format!("weight {:.2}% below target {:.2}%", current_weight * 100.0, target * 100.0),
                priority: gap,
                category: self.category().to_string(),
            });
            if out.len() >= params.max_opportunities_per_category {
                break;
            }
        }
        Ok(out)
    }
}

/// "opportunity-buys": initiate new positions in unheld securities with a
/// high composite opportunity score.
pub struct OpportunityBuysCalculator;
impl OpportunityCalculator for OpportunityBuysCalculator {
    fn category(&self) -> &'static str {
        "opportunity_buys"
    }

    fn calculate(
        &self,
        ctx: &OpportunityContext,
        params: &CalculatorParams,
    ) -> Result<Vec<ActionCandidate>, String> {
        let mut scored: Vec<(&Isin, f64)> = ctx
            .opportunity_scores
            .iter()
            .filter(|(isin, &score)| {
                score >= params.opportunity_score_threshold && !params.held.contains(*isin)
            })
            .map(|(isin, &score)| (isin, score))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut out = Vec::new();
        for (isin, score) in scored {
            let Some(security) = ctx.securities.get(isin) else {
                continue;
            };
            if !security.allow_buy || !security.active {
                continue;
            }
            let Some(&price_micros) = ctx.current_prices.get(isin) else {
                continue;
            };
            if price_micros <= 0 {
                continue;
            }
            let target_value_eur = 0.01 * ctx.total_portfolio_value_eur_micros as f64
                / hplan_schemas::MICROS_SCALE as f64;
            let qty = round_down_to_lot(
                target_value_eur / (price_micros as f64 / hplan_schemas::MICROS_SCALE as f64),
                security.min_lot,
            );
            if qty <= 0 {
                continue;
            }
            out.push(ActionCandidate {
                symbol: security.symbol.clone(),
                isin: (*isin).clone(),
                side: Side::Buy,
                quantity: qty,
                value_eur_micros: qty * price_micros,
                estimated_price_eur_micros: price_micros,
                currency: security.currency.clone(),
                reason: format!("opportunity score {:.2} above threshold", score),
                priority: score,
                category: self.category().to_string(),
            });
            if out.len() >= params.max_opportunities_per_category {
                break;
            }
        }
        Ok(out)
    }
}

/// "weight-based": fill any remaining gap between `TargetWeights` and zero
/// for securities with no declared rebalance gap calculator coverage (a
/// generic catch-all, lowest priority of the buy-side calculators).
pub struct WeightBasedCalculator;
impl OpportunityCalculator for WeightBasedCalculator {
    fn category(&self) -> &'static str {
        "weight_based"
    }

    fn calculate(
        &self,
        ctx: &OpportunityContext,
        params: &CalculatorParams,
    ) -> Result<Vec<ActionCandidate>, String> {
        let mut out = Vec::new();
        for (isin, &target) in &ctx.target_weights {
            if target <= 0.0 || params.held.contains(isin) {
                continue;
            }
            let Some(security) = ctx.securities.get(isin) else {
                continue;
            };
            if !security.allow_buy || !security.active {
                continue;
            }
            let Some(&price_micros) = ctx.current_prices.get(isin) else {
                continue;
            };
            if price_micros <= 0 {
                continue;
            }
            let target_value_eur =
                target * ctx.total_portfolio_value_eur_micros as f64 / hplan_schemas::MICROS_SCALE as f64;
            let qty = round_down_to_lot(
                target_value_eur / (price_micros as f64 / hplan_schemas::MICROS_SCALE as f64),
                security.min_lot,
            );
            if qty <= 0 {
                continue;
            }
            out.push(ActionCandidate {
                symbol: security.symbol.clone(),
                isin: isin.clone(),
                side: Side::Buy,
                quantity: qty,
                value_eur_micros: qty * price_micros,
                estimated_price_eur_micros: price_micros,
                currency: security.currency.clone(),
                reason: format!("initiating position toward target weight {:.2}%", target * 100.0),
                priority: target,
                category: self.category().to_string(),
            });
            if out.len() >= params.max_opportunities_per_category {
                break;
            }
        }
        Ok(out)
    }
}

/// Insertion-ordered catalogue of calculators run by the planner (§9:
/// "plug-in-shaped" open question — the core requires the contract, not
/// any specific calculator set).
pub fn default_calculators() -> Vec<Box<dyn OpportunityCalculator>> {
    vec![
        Box::new(ProfitTakingCalculator),
        Box::new(AveragingDownCalculator),
        Box::new(RebalanceSellsCalculator),
        Box::new(RebalanceBuysCalculator),
        Box::new(OpportunityBuysCalculator),
        Box::new(WeightBasedCalculator),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use hplan_schemas::{EnrichedPosition, Isin, Security, Symbol};

    fn security(isin: &str) -> Security {
        Security {
            isin: Isin::new(isin),
            symbol: Symbol::new(isin),
            name: isin.to_string(),
            currency: "EUR".to_string(),
            country: "US".to_string(),
            industry: "Tech".to_string(),
            exchange: "XXX".to_string(),
            allow_buy: true,
            allow_sell: true,
            min_lot: 1,
            active: true,
        }
    }

    fn position(isin: &str, qty: f64, avg_cost: i64, current: i64) -> EnrichedPosition {
        EnrichedPosition {
            isin: Isin::new(isin),
            symbol: Symbol::new(isin),
            quantity: qty,
            eur_avg_cost_per_share_micros: avg_cost,
            eur_current_price_micros: current,
            value_eur_micros: current * qty as i64,
            weight_in_portfolio: 0.1,
            days_held: Some(10),
            name: isin.to_string(),
            country: "US".to_string(),
            exchange: "XXX".to_string(),
            active: true,
            allow_buy: true,
            allow_sell: true,
            min_lot: 1,
        }
    }

    #[test]
    fn profit_taking_triggers_above_threshold() {
        let mut ctx = OpportunityContext::default();
        ctx.positions.push(position("A", 10.0, 100_000_000, 130_000_000));
        let candidates = ProfitTakingCalculator
            .calculate(&ctx, &CalculatorParams::default())
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].side, Side::Sell);
    }

    #[test]
    fn profit_taking_skips_below_threshold() {
        let mut ctx = OpportunityContext::default();
        ctx.positions.push(position("A", 10.0, 100_000_000, 105_000_000));
        let candidates = ProfitTakingCalculator
            .calculate(&ctx, &CalculatorParams::default())
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn rebalance_buys_respects_eligible_gap() {
        let mut ctx = OpportunityContext::default();
        ctx.securities.insert(Isin::new("A"), security("A"));
        ctx.current_prices.insert(Isin::new("A"), 100_000_000);
        ctx.target_weights.insert(Isin::new("A"), 0.1);
        ctx.total_portfolio_value_eur_micros = 100_000 * hplan_schemas::MICROS_SCALE;

        let candidates = RebalanceBuysCalculator
            .calculate(&ctx, &CalculatorParams::default())
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].side, Side::Buy);
    }

    #[test]
    fn calculator_output_bounded_by_max_per_category() {
        let mut ctx = OpportunityContext::default();
        for i in 0..50 {
            ctx.positions
                .push(position(&format!("A{i}"), 10.0, 100_000_000, 150_000_000));
        }
        let params = CalculatorParams {
            max_opportunities_per_category: 5,
            ..Default::default()
        };
        let candidates = ProfitTakingCalculator.calculate(&ctx, &params).unwrap();
        assert_eq!(candidates.len(), 5);
    }
}
