//! C4 — optimizer adapter.
//!
//! Transforms portfolio state + targets into security-level target weights
//! consumed by the planner (C5). Grounded directly on the corpus's
//! `mqk-portfolio::allocator::Allocator::allocate` algorithm shape
//! (sort -> cap -> normalize -> clip -> constrain -> prune), adapted from a
//! target-count allocator to the weight/constraint contract of §4.4.
//!
//! The optimizer is specified as a contract, not a production algorithm
//! (§4.4): a reimplementation must match the optimizer's own specification.
//! This crate implements *a* valid interpretation — blend is a linear
//! combination of a return-proxy objective and an inverse-volatility
//! stability objective (recorded in `DESIGN.md`).

use std::collections::BTreeMap;

use hplan_config::OptimizerSettings;
use hplan_schemas::{Isin, Security};

#[derive(Debug, Clone, PartialEq)]
pub enum OptimizerError {
    NoEligibleSecurities,
    InvalidScore { isin: Isin },
}

impl std::fmt::Display for OptimizerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoEligibleSecurities => write!(f, "no eligible securities to allocate across"),
            Self::InvalidScore { isin } => write!(f, "invalid (NaN/inf) score for isin '{isin}'"),
        }
    }
}

impl std::error::Error for OptimizerError {}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionInput {
    pub quantity: f64,
    pub value_eur: f64,
}

#[derive(Debug, Clone, Default)]
pub struct OptimizerInputs {
    pub positions: BTreeMap<Isin, PositionInput>,
    pub securities: BTreeMap<Isin, Security>,
    pub current_prices_eur: BTreeMap<Isin, f64>,
    pub cash_eur: f64,
    /// Expected-return proxy per ISIN (e.g. composite/opportunity score).
    pub expected_return: BTreeMap<Isin, f64>,
    /// Inverse-volatility / stability proxy per ISIN.
    pub stability: BTreeMap<Isin, f64>,
    /// Declared geography targets (group -> target fraction).
    pub geography_targets: BTreeMap<String, f64>,
    /// Declared industry targets (group -> target fraction).
    pub industry_targets: BTreeMap<String, f64>,
    /// ISIN -> geography group, for constraint enforcement.
    pub isin_geography: BTreeMap<Isin, String>,
    /// ISIN -> industry group, for constraint enforcement.
    pub isin_industry: BTreeMap<Isin, String>,
}

/// §4.4 group-target tolerance: a group's aggregate weight is accepted if
/// within this fraction of its declared target.
const GROUP_TOLERANCE: f64 = 0.05;

/// Produce `TargetWeights: ISIN -> [0,1]` (§4.4).
///
/// Securities with `AllowBuy = false` may still hold non-zero target if
/// already held (no forced sells) but cannot receive new weight beyond the
/// held weight. Concentration is capped at `settings.max_concentration` per
/// ISIN. The blend parameter linearly combines a return-seeking objective
/// with a stability objective.
pub fn optimize(
    inputs: &OptimizerInputs,
    settings: &OptimizerSettings,
) -> Result<BTreeMap<Isin, f64>, OptimizerError> {
    let total_value = inputs.cash_eur
        + inputs
            .positions
            .values()
            .map(|p| p.value_eur)
            .sum::<f64>();
    if total_value <= 0.0 {
        return Err(OptimizerError::NoEligibleSecurities);
    }

    let held_weight = |isin: &Isin| -> f64 {
        inputs
            .positions
            .get(isin)
            .map(|p| p.value_eur / total_value)
            .unwrap_or(0.0)
    };

    // --- candidate universe: active securities we have some signal for ----
    let mut candidates: Vec<Isin> = inputs
        .securities
        .iter()
        .filter(|(_, s)| s.active)
        .map(|(isin, _)| isin.clone())
        .filter(|isin| {
            let buyable = inputs
                .securities
                .get(isin)
                .map(|s| s.allow_buy)
                .unwrap_or(false);
            buyable || held_weight(isin) > 0.0
        })
        .collect();

    if candidates.is_empty() {
        return Err(OptimizerError::NoEligibleSecurities);
    }

    for isin in &candidates {
        let ret = inputs.expected_return.get(isin).copied().unwrap_or(0.0);
        let stab = inputs.stability.get(isin).copied().unwrap_or(0.0);
        if !ret.is_finite() || !stab.is_finite() {
            return Err(OptimizerError::InvalidScore { isin: isin.clone() });
        }
    }

    // --- blend objective, sort descending by combined score --------------
    let blend = settings.blend.clamp(0.0, 1.0);
    let mut scored: Vec<(Isin, f64)> = candidates
        .drain(..)
        .map(|isin| {
            let ret = inputs.expected_return.get(&isin).copied().unwrap_or(0.0);
            let stab = inputs.stability.get(&isin).copied().unwrap_or(0.0);
            let score = blend * ret + (1.0 - blend) * stab;
            (isin, score)
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    // --- raw weights proportional to (non-negative) score, or equal-weight
    //     when every score is non-positive ------------------------------
    let positive_sum: f64 = scored.iter().map(|(_, s)| s.max(0.0)).sum();
    let mut raw: BTreeMap<Isin, f64> = BTreeMap::new();
    if positive_sum > 0.0 {
        for (isin, score) in &scored {
            raw.insert(isin.clone(), score.max(0.0) / positive_sum);
        }
    } else {
        let n = scored.len() as f64;
        for (isin, _) in &scored {
            raw.insert(isin.clone(), 1.0 / n);
        }
    }

    // --- investable fraction after reserving min cash --------------------
    let investable_fraction = (1.0 - settings.min_cash_reserve_pct).clamp(0.0, 1.0);

    // --- cap per-ISIN concentration; buy-disallowed names capped at held
    //     weight (no forced sells, no new buys beyond current weight) ----
    let max_conc = settings.max_concentration.clamp(0.0, 1.0);
    let mut capped: BTreeMap<Isin, f64> = BTreeMap::new();
    for (isin, w) in &raw {
        let allow_buy = inputs
            .securities
            .get(isin)
            .map(|s| s.allow_buy)
            .unwrap_or(false);
        let scaled = w * investable_fraction;
        let cap = if allow_buy {
            max_conc
        } else {
            held_weight(isin).min(max_conc)
        };
        capped.insert(isin.clone(), scaled.min(cap));
    }

    // --- renormalize to the investable fraction --------------------------
    let capped_sum: f64 = capped.values().sum();
    let mut normalized: BTreeMap<Isin, f64> = if capped_sum > investable_fraction && capped_sum > 0.0
    {
        let scale = investable_fraction / capped_sum;
        capped.iter().map(|(k, v)| (k.clone(), v * scale)).collect()
    } else {
        capped
    };

    // --- group constraint pass: scale each group toward its declared
    //     target within tolerance, preserving relative weights inside the
    //     group ----------------------------------------------------------
    apply_group_constraint(&mut normalized, &inputs.isin_geography, &inputs.geography_targets);
    apply_group_constraint(&mut normalized, &inputs.isin_industry, &inputs.industry_targets);

    // --- prune dust weights ------------------------------------------------
    normalized.retain(|_, w| *w > 1e-9);

    Ok(normalized)
}

fn apply_group_constraint(
    weights: &mut BTreeMap<Isin, f64>,
    isin_group: &BTreeMap<Isin, String>,
    targets: &BTreeMap<String, f64>,
) {
    if targets.is_empty() {
        return;
    }
    let mut group_totals: BTreeMap<String, f64> = BTreeMap::new();
    for (isin, w) in weights.iter() {
        let group = isin_group
            .get(isin)
            .cloned()
            .unwrap_or_else(|| hplan_schemas::OTHER_GROUP.to_string());
        *group_totals.entry(group).or_insert(0.0) += w;
    }

    for (group, target) in targets {
        let actual = group_totals.get(group).copied().unwrap_or(0.0);
        if actual <= 0.0 {
            continue;
        }
        let deviation = (actual - target).abs() / target.max(1e-9);
        if deviation <= GROUP_TOLERANCE {
            continue;
        }
        let scale = target / actual;
        for (isin, w) in weights.iter_mut() {
            let isin_group_val = isin_group
                .get(isin)
                .cloned()
                .unwrap_or_else(|| hplan_schemas::OTHER_GROUP.to_string());
            if &isin_group_val == group {
                *w *= scale;
            }
        }
    }
}
