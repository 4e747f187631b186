//! C3 — opportunity context builder.
//!
//! Enriches raw positions into EUR-normalized [`EnrichedPosition`]s, computes
//! portfolio value and weights, aggregates group-level allocations, and
//! attaches score maps — producing the immutable `OpportunityContext` handed
//! to the planner (C5). Grounded on the corpus's `mqk-portfolio::ledger`/
//! `metrics` aggregation passes and `mqk-portfolio::allocator`'s
//! `BTreeMap`-keyed weight-normalization routines (§4.3 step 7).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use hplan_fx::{convert_single, RateProvider};
use hplan_marketdata::{fetch_current_prices, MarketClock, PriceCache, QuoteProvider};
use hplan_schemas::{
    EnrichedPosition, Isin, OpportunityContext, Position, Security, MICROS_SCALE, OTHER_GROUP,
};

/// Unrecoverable failures per §7: missing required repositories for
/// positions/securities/allocations fail the whole cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextBuildError {
    PositionsUnavailable(String),
    SecuritiesUnavailable(String),
    AllocationsUnavailable(String),
}

impl std::fmt::Display for ContextBuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PositionsUnavailable(e) => write!(f, "positions repository unavailable: {e}"),
            Self::SecuritiesUnavailable(e) => write!(f, "securities repository unavailable: {e}"),
            Self::AllocationsUnavailable(e) => {
                write!(f, "allocations repository unavailable: {e}")
            }
        }
    }
}

impl std::error::Error for ContextBuildError {}

pub trait PositionsRepository: Send + Sync {
    fn load_positions(&self) -> Result<Vec<Position>, String>;
}

pub trait SecuritiesRepository: Send + Sync {
    fn load_active_securities(&self) -> Result<Vec<Security>, String>;
}

/// Grouping repository: reverse maps from country/industry to a coarser
/// group label. Unmapped values fall into [`OTHER_GROUP`] (§4.3 step 7).
pub trait GroupingRepository: Send + Sync {
    fn country_to_group(&self) -> Result<BTreeMap<String, String>, String>;
    fn industry_to_group(&self) -> Result<BTreeMap<String, String>, String>;
}

/// Cash balances by currency, plus the EUR total used directly by the
/// planner. Research-mode virtual cash injection (§4.3 step 2) is applied by
/// the caller before this struct reaches `build_context`.
#[derive(Debug, Clone, Default)]
pub struct CashBalances {
    pub eur: f64,
    pub by_currency: BTreeMap<String, f64>,
}

/// Research-mode settings controlling the synthetic `TEST` cash injection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResearchMode {
    pub enabled: bool,
    pub virtual_cash_eur: f64,
}

/// Apply research-mode virtual cash (§4.3 step 2): add to a synthetic `TEST`
/// key and to the EUR balance, but only add to EUR when virtual > 0 so a
/// disabled/zero setting never corrupts the real balance.
pub fn apply_research_cash(mut cash: CashBalances, mode: ResearchMode) -> CashBalances {
    if mode.enabled && mode.virtual_cash_eur != 0.0 {
        *cash.by_currency.entry("TEST".to_string()).or_insert(0.0) += mode.virtual_cash_eur;
        if mode.virtual_cash_eur > 0.0 {
            cash.eur += mode.virtual_cash_eur;
        }
    }
    cash
}

/// Score maps attached verbatim to the context (§4.3 step 8). `cagrs` holds
/// the *raw* `cagr_score` values; the piecewise-linear inverse is applied by
/// `build_context`, not by the repository.
#[derive(Debug, Clone, Default)]
pub struct ScoreMaps {
    pub security_scores: BTreeMap<Isin, f64>,
    pub long_term_scores: BTreeMap<Isin, f64>,
    pub fundamentals_scores: BTreeMap<Isin, f64>,
    pub cagr_scores_raw: BTreeMap<Isin, f64>,
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

/// Piecewise-linear inverse of the stored `cagr_score` (§4.3 step 8):
/// `cagr_score >= 0.8` maps linearly to 11-20%;
/// `0.15 <= cagr_score < 0.8` maps linearly to 0-11%;
/// below 0.15 is 0%.
pub fn cagr_from_score(cagr_score: f64) -> f64 {
    if cagr_score >= 0.8 {
        let t = ((cagr_score - 0.8) / (1.0 - 0.8)).clamp(0.0, 1.0);
        0.11 + t * (0.20 - 0.11)
    } else if cagr_score >= 0.15 {
        let t = (cagr_score - 0.15) / (0.8 - 0.15);
        t * 0.11
    } else {
        0.0
    }
}

/// Everything `build_context` needs beyond the three mandatory repositories.
pub struct ContextInputs<'a> {
    pub positions_repo: &'a dyn PositionsRepository,
    pub securities_repo: &'a dyn SecuritiesRepository,
    pub grouping_repo: &'a dyn GroupingRepository,
    pub cash: CashBalances,
    pub scores: ScoreMaps,
    pub optimizer_target_weights: Option<BTreeMap<Isin, f64>>,
    pub price_cache: &'a mut dyn PriceCache,
    pub quote_provider: &'a dyn QuoteProvider,
    pub rate_provider: &'a dyn RateProvider,
    pub market_clock: &'a dyn MarketClock,
    pub now: DateTime<Utc>,
}

/// Build an immutable `OpportunityContext` from the portfolio snapshot
/// (§4.3). The only failures are unrecoverable: a missing positions,
/// securities, or allocations repository. Every other degradation (missing
/// price, unconvertible cost basis, unmapped group) is a per-item soft
/// failure that drops the item with a warning.
pub fn build_context(inputs: ContextInputs<'_>) -> Result<OpportunityContext, ContextBuildError> {
    let positions = inputs
        .positions_repo
        .load_positions()
        .map_err(ContextBuildError::PositionsUnavailable)?;
    let securities = inputs
        .securities_repo
        .load_active_securities()
        .map_err(ContextBuildError::SecuritiesUnavailable)?;
    let country_to_group = inputs
        .grouping_repo
        .country_to_group()
        .map_err(ContextBuildError::AllocationsUnavailable)?;
    let industry_to_group = inputs
        .grouping_repo
        .industry_to_group()
        .map_err(ContextBuildError::AllocationsUnavailable)?;

    let securities_by_isin: BTreeMap<Isin, Security> = securities
        .iter()
        .cloned()
        .map(|s| (s.isin.clone(), s))
        .collect();

    let current_prices = fetch_current_prices(
        &securities,
        inputs.price_cache,
        inputs.quote_provider,
        inputs.rate_provider,
        inputs.market_clock,
        inputs.now,
    );

    // --- Step 4: enrich positions -----------------------------------------
    let mut enriched: Vec<EnrichedPosition> = Vec::new();
    for pos in &positions {
        if pos.isin.as_str().is_empty() {
            continue;
        }
        let Some(security) = securities_by_isin.get(&pos.isin) else {
            continue;
        };

        let eur_price = resolve_eur_price(pos, &current_prices, inputs.rate_provider);
        let Some(eur_price) = eur_price else {
            warn!(isin = %pos.isin, "hplan_context: dropping position, no resolvable EUR price");
            continue;
        };

        let value_eur = resolve_value_eur(pos, eur_price, &current_prices);

        let Some(avg_cost_eur) = resolve_avg_cost_eur(pos, inputs.rate_provider) else {
            warn!(isin = %pos.isin, "hplan_context: dropping position, no convertible cost basis");
            continue;
        };

        let days_held = pos.first_bought_at.and_then(|t| {
            let days = inputs.now.signed_duration_since(t).num_days();
            if days < 0 {
                None
            } else {
                Some(days)
            }
        });

        enriched.push(EnrichedPosition {
            isin: pos.isin.clone(),
            symbol: pos.symbol.clone(),
            quantity: pos.quantity,
            eur_avg_cost_per_share_micros: to_micros(avg_cost_eur),
            eur_current_price_micros: to_micros(eur_price),
            value_eur_micros: to_micros(value_eur),
            weight_in_portfolio: 0.0, // filled in second pass below
            days_held,
            name: security.name.clone(),
            country: security.country.clone(),
            exchange: security.exchange.clone(),
            active: security.active,
            allow_buy: security.allow_buy,
            allow_sell: security.allow_sell,
            min_lot: security.min_lot,
        });
    }

    // --- Step 5: total portfolio value --------------------------------
    let total_positions_value_eur: f64 = enriched
        .iter()
        .map(|p| p.value_eur_micros as f64 / MICROS_SCALE as f64)
        .sum();
    let total_portfolio_value_eur = inputs.cash.eur + total_positions_value_eur;

    // --- Step 6: weight in portfolio, second pass ----------------------
    if total_portfolio_value_eur > 0.0 {
        for p in enriched.iter_mut() {
            let value = p.value_eur_micros as f64 / MICROS_SCALE as f64;
            p.weight_in_portfolio = value / total_portfolio_value_eur;
        }
    }

    // --- Step 7: group allocations --------------------------------------
    let mut country_allocations_eur: BTreeMap<String, f64> = BTreeMap::new();
    let mut industry_allocations_eur: BTreeMap<String, f64> = BTreeMap::new();

    for p in &enriched {
        let value = p.value_eur_micros as f64 / MICROS_SCALE as f64;
        *country_allocations_eur.entry(p.country.clone()).or_insert(0.0) += value;

        let security = securities_by_isin.get(&p.isin);
        let industries: Vec<&str> = security
            .map(|s| s.industry.split(',').map(|i| i.trim()).filter(|i| !i.is_empty()).collect())
            .unwrap_or_default();
        if industries.is_empty() {
            *industry_allocations_eur.entry(OTHER_GROUP.to_string()).or_insert(0.0) += value;
        } else {
            let split = value / industries.len() as f64;
            for industry in industries {
                *industry_allocations_eur.entry(industry.to_string()).or_insert(0.0) += split;
            }
        }
    }

    let country_allocations_micros: BTreeMap<String, i64> = country_allocations_eur
        .iter()
        .map(|(k, v)| (k.clone(), to_micros(*v)))
        .collect();
    let industry_allocations_micros: BTreeMap<String, i64> = industry_allocations_eur
        .iter()
        .map(|(k, v)| (k.clone(), to_micros(*v)))
        .collect();

    let country_weights = normalize_to_fractions(&country_allocations_eur, total_portfolio_value_eur);
    let industry_weights = normalize_to_fractions(&industry_allocations_eur, total_portfolio_value_eur);

    // --- Step 9: target weights ------------------------------------------
    let target_weights = match inputs.optimizer_target_weights {
        Some(w) => w,
        None => {
            warn!("hplan_context: no optimizer target weights supplied, leaving TargetWeights empty");
            BTreeMap::new()
        }
    };

    Ok(OpportunityContext {
        positions: enriched,
        securities: securities_by_isin,
        available_cash_eur_micros: to_micros(inputs.cash.eur),
        total_portfolio_value_eur_micros: to_micros(total_portfolio_value_eur),
        current_prices: current_prices
            .into_iter()
            .map(|(isin, p)| (isin, to_micros(p)))
            .collect(),
        target_weights,
        country_allocations_micros,
        country_weights,
        industry_allocations_micros,
        industry_weights,
        country_to_group,
        industry_to_group,
        security_scores: inputs.scores.security_scores,
        long_term_scores: inputs.scores.long_term_scores,
        fundamentals_scores: inputs.scores.fundamentals_scores,
        cagrs: inputs
            .scores
            .cagr_scores_raw
            .iter()
            .map(|(k, v)| (k.clone(), cagr_from_score(*v)))
            .collect(),
        opportunity_scores: inputs.scores.opportunity_scores,
        momentum_scores: inputs.scores.momentum_scores,
        volatility: inputs.scores.volatility,
        sharpe: inputs.scores.sharpe,
        max_drawdown: inputs.scores.max_drawdown,
        regime_score: inputs.scores.regime_score,
        market_avg_pe: inputs.scores.market_avg_pe,
        target_return: inputs.scores.target_return,
        target_return_threshold_pct: inputs.scores.target_return_threshold_pct,
    })
}

fn to_micros(eur: f64) -> i64 {
    (eur * MICROS_SCALE as f64).round() as i64
}

/// §4.3 step 4: prefer the fetched C2 price; else MarketValueEUR/Quantity;
/// else convert native CurrentPrice via the stored sync rate; else drop.
fn resolve_eur_price(
    pos: &Position,
    current_prices: &BTreeMap<Isin, f64>,
    rates: &dyn RateProvider,
) -> Option<f64> {
    if let Some(&p) = current_prices.get(&pos.isin) {
        if p.is_finite() && p > 0.0 {
            return Some(p);
        }
    }
    if pos.quantity > 0.0 && pos.market_value_eur_micros > 0 {
        let v = pos.market_value_eur_micros as f64 / MICROS_SCALE as f64 / pos.quantity;
        if v.is_finite() && v > 0.0 {
            return Some(v);
        }
    }
    if let Some(native) = pos.current_price_native {
        if native.is_finite() && native > 0.0 && pos.currency_rate_at_sync > 0.0 {
            let conv = convert_single(native, &pos.native_currency, rates);
            let eur = if conv.is_fallback {
                native / pos.currency_rate_at_sync
            } else {
                conv.eur_price
            };
            if eur.is_finite() && eur > 0.0 {
                return Some(eur);
            }
        }
    }
    None
}

/// §4.3 step 4: value prefers the stored `MarketValueEUR` when the price
/// fallback chain used it, avoiding double-conversion.
fn resolve_value_eur(pos: &Position, eur_price: f64, current_prices: &BTreeMap<Isin, f64>) -> f64 {
    let used_fetched_or_native = current_prices.contains_key(&pos.isin);
    if !used_fetched_or_native && pos.market_value_eur_micros > 0 {
        pos.market_value_eur_micros as f64 / MICROS_SCALE as f64
    } else {
        eur_price * pos.quantity
    }
}

/// §4.3 step 4: EUR average cost per share, preferring `CostBasisEUR`, else
/// converting native `AvgPrice`, else dropping rather than mixing currencies.
fn resolve_avg_cost_eur(pos: &Position, rates: &dyn RateProvider) -> Option<f64> {
    if pos.quantity > 0.0 && pos.cost_basis_eur_micros > 0 {
        let v = pos.cost_basis_eur_micros as f64 / MICROS_SCALE as f64 / pos.quantity;
        if v.is_finite() && v >= 0.0 {
            return Some(v);
        }
    }
    if let Some(native_avg) = pos.avg_price_native {
        if native_avg.is_finite() && native_avg >= 0.0 && pos.currency_rate_at_sync > 0.0 {
            let conv = convert_single(native_avg, &pos.native_currency, rates);
            let eur = if conv.is_fallback {
                native_avg / pos.currency_rate_at_sync
            } else {
                conv.eur_price
            };
            if eur.is_finite() && eur >= 0.0 {
                return Some(eur);
            }
        }
    }
    None
}

/// Normalize a raw allocation map to fractions of `total`, only when the raw
/// sum is positive (§4.3 step 7 / §8 invariant 3).
fn normalize_to_fractions(raw: &BTreeMap<String, f64>, total: f64) -> BTreeMap<String, f64> {
    if total <= 0.0 {
        return BTreeMap::new();
    }
    let sum: f64 = raw.values().sum();
    if sum <= 0.0 {
        return BTreeMap::new();
    }
    raw.iter().map(|(k, v)| (k.clone(), v / sum)).collect()
}
