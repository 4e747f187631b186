//! Fixture builders and in-memory repository stand-ins for end-to-end
//! scenario tests of the holistic planner pipeline (C1-C9).
//!
//! Grounded on the corpus's `mqk-testkit` role: a thin crate that assembles
//! fixtures and fakes so scenario tests under `tests/` can drive the whole
//! pipeline without a live broker or a real portfolio snapshot. Unlike the
//! corpus's testkit (which hosts a bar-driven backtest orchestrator),
//! everything this crate needs to assemble is already a typed contract on
//! the C3/C8 boundary, so there is no separate "mini runtime" to build here
//! — fixtures plug directly into `hplan_context`/`hplan_orchestrator`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use hplan_context::{GroupingRepository, PositionsRepository, SecuritiesRepository};
use hplan_fx::StaticRateProvider;
use hplan_marketdata::{BatchQuoteError, MarketClock, QuoteProvider};
use hplan_schemas::{Isin, Position, Security, Symbol};

/// A [`Security`] with sensible defaults; override fields on the returned
/// value for anything a specific test needs to vary.
pub fn security(isin: &str, symbol: &str, currency: &str) -> Security {
    Security {
        isin: Isin::new(isin),
        symbol: Symbol::new(symbol),
        name: symbol.to_string(),
        currency: currency.to_string(),
        country: "US".to_string(),
        industry: "Technology".to_string(),
        exchange: "XNAS".to_string(),
        allow_buy: true,
        allow_sell: true,
        min_lot: 1,
        active: true,
    }
}

/// A [`Position`] with no stored EUR valuation — exercises the fallback
/// chain in `hplan-context` (native price/cost converted via
/// `currency_rate_at_sync`).
pub fn position_native_only(
    isin: &str,
    symbol: &str,
    quantity: f64,
    native_currency: &str,
    currency_rate_at_sync: f64,
    current_price_native: f64,
    avg_price_native: f64,
) -> Position {
    Position {
        isin: Isin::new(isin),
        symbol: Symbol::new(symbol),
        quantity,
        native_currency: native_currency.to_string(),
        currency_rate_at_sync,
        market_value_eur_micros: 0,
        cost_basis_eur_micros: 0,
        unrealized_pnl_eur_micros: 0,
        unrealized_pnl_pct: 0.0,
        first_bought_at: None,
        last_sold_at: None,
        last_updated: Utc::now(),
        current_price_native: Some(current_price_native),
        avg_price_native: Some(avg_price_native),
    }
}

/// A [`Position`] with EUR valuations already stored, as a synced broker
/// position would carry (§3: "CostBasisEUR and MarketValueEUR are always
/// stored in the reporting currency").
pub fn position_eur_valued(
    isin: &str,
    symbol: &str,
    quantity: f64,
    native_currency: &str,
    market_value_eur: f64,
    cost_basis_eur: f64,
) -> Position {
    Position {
        isin: Isin::new(isin),
        symbol: Symbol::new(symbol),
        quantity,
        native_currency: native_currency.to_string(),
        currency_rate_at_sync: 1.0,
        market_value_eur_micros: to_micros(market_value_eur),
        cost_basis_eur_micros: to_micros(cost_basis_eur),
        unrealized_pnl_eur_micros: to_micros(market_value_eur - cost_basis_eur),
        unrealized_pnl_pct: if cost_basis_eur != 0.0 {
            (market_value_eur - cost_basis_eur) / cost_basis_eur
        } else {
            0.0
        },
        first_bought_at: None,
        last_sold_at: None,
        last_updated: Utc::now(),
        current_price_native: None,
        avg_price_native: None,
    }
}

fn to_micros(eur: f64) -> i64 {
    (eur * hplan_schemas::MICROS_SCALE as f64).round() as i64
}

/// Fixed-snapshot repositories: wrap `Vec`/`BTreeMap` values the scenario
/// test already built, so `hplan_context::build_context` can be driven
/// without any actual persistence layer.
pub struct FixedPositionsRepo(pub Vec<Position>);

impl PositionsRepository for FixedPositionsRepo {
    fn load_positions(&self) -> Result<Vec<Position>, String> {
        Ok(self.0.clone())
    }
}

pub struct FixedSecuritiesRepo(pub Vec<Security>);

impl SecuritiesRepository for FixedSecuritiesRepo {
    fn load_active_securities(&self) -> Result<Vec<Security>, String> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
pub struct FixedGroupingRepo {
    pub country_to_group: BTreeMap<String, String>,
    pub industry_to_group: BTreeMap<String, String>,
}

impl GroupingRepository for FixedGroupingRepo {
    fn country_to_group(&self) -> Result<BTreeMap<String, String>, String> {
        Ok(self.country_to_group.clone())
    }

    fn industry_to_group(&self) -> Result<BTreeMap<String, String>, String> {
        Ok(self.industry_to_group.clone())
    }
}

/// A repository that fails, for exercising C3's unrecoverable-failure path
/// (§4.3: missing positions/securities/allocations fails the whole cycle).
pub struct FailingPositionsRepo;

impl PositionsRepository for FailingPositionsRepo {
    fn load_positions(&self) -> Result<Vec<Position>, String> {
        Err("positions repository unreachable".to_string())
    }
}

/// A [`QuoteProvider`] backed by a fixed `Symbol -> native price` table.
pub struct FixedQuoteProvider(pub BTreeMap<Symbol, Option<f64>>);

impl FixedQuoteProvider {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with_quote(mut self, symbol: &str, price: f64) -> Self {
        self.0.insert(Symbol::new(symbol), Some(price));
        self
    }
}

impl Default for FixedQuoteProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl QuoteProvider for FixedQuoteProvider {
    fn get_batch_quotes(
        &self,
        symbols: &BTreeMap<Symbol, Option<String>>,
    ) -> Result<BTreeMap<Symbol, Option<f64>>, BatchQuoteError> {
        Ok(symbols
            .keys()
            .map(|s| (s.clone(), self.0.get(s).copied().flatten()))
            .collect())
    }
}

/// A [`QuoteProvider`] that always fails wholesale, exercising the
/// stale-cache-fallback branch of §4.2 step 3.
pub struct FailingQuoteProvider;

impl QuoteProvider for FailingQuoteProvider {
    fn get_batch_quotes(
        &self,
        _symbols: &BTreeMap<Symbol, Option<String>>,
    ) -> Result<BTreeMap<Symbol, Option<f64>>, BatchQuoteError> {
        Err(BatchQuoteError("transport down".to_string()))
    }
}

/// A [`MarketClock`] that always reports the given open/closed state,
/// letting tests pin the §4.2 TTL policy branch deterministically.
pub struct FixedMarketClock(pub bool);

impl MarketClock for FixedMarketClock {
    fn any_major_market_open(&self, _at: DateTime<Utc>) -> bool {
        self.0
    }
}

pub fn always_open_clock() -> FixedMarketClock {
    FixedMarketClock(true)
}

pub fn always_closed_clock() -> FixedMarketClock {
    FixedMarketClock(false)
}

/// Convenience re-export: a rate table pre-seeded with the HKD rate used by
/// the canonical conversion scenario (§8 Scenario 1).
pub fn hkd_rate_provider() -> StaticRateProvider {
    StaticRateProvider::new().with_rate("HKD", 0.11)
}
