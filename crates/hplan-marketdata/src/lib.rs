//! C2 — price fetcher with market-aware cache.
//!
//! Grounded on the corpus's `mqk-md::Provider` trait shape (object-safe
//! batch-quote boundary, small error enum) for the external boundary, and
//! `mqk-db` connection patterns for the cache table idiom. The cache itself
//! is modeled as a trait so `hplan-db` can back it with Postgres while tests
//! use an in-memory implementation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use hplan_fx::{convert_to_eur, RateProvider};
use hplan_schemas::{Isin, Security, Symbol};

/// TTL policy (§4.2 step 1): 30 minutes while any major market is open,
/// 24 hours otherwise.
pub const TTL_MINUTES_MARKET_OPEN: i64 = 30;
pub const TTL_MINUTES_MARKET_CLOSED: i64 = 24 * 60;

/// Decides whether any major market is open at a given wall-clock instant.
/// Injectable so tests can force either branch of the TTL policy.
pub trait MarketClock: Send + Sync {
    fn any_major_market_open(&self, at: DateTime<Utc>) -> bool;
}

/// A simple weekday/hour-window clock: treats any weekday between
/// `open_hour_utc` and `close_hour_utc` as "open". Sufficient as a default;
/// callers needing real exchange calendars supply their own `MarketClock`.
#[derive(Debug, Clone, Copy)]
pub struct WeekdayWindowClock {
    pub open_hour_utc: u32,
    pub close_hour_utc: u32,
}

impl Default for WeekdayWindowClock {
    fn default() -> Self {
        // Roughly covers the combined Europe + US equity session in UTC.
        Self {
            open_hour_utc: 7,
            close_hour_utc: 21,
        }
    }
}

impl MarketClock for WeekdayWindowClock {
    fn any_major_market_open(&self, at: DateTime<Utc>) -> bool {
        use chrono::{Datelike, Timelike, Weekday};
        let is_weekday = !matches!(at.weekday(), Weekday::Sat | Weekday::Sun);
        let hour = at.hour();
        is_weekday && hour >= self.open_hour_utc && hour < self.close_hour_utc
    }
}

pub fn ttl_minutes(clock: &dyn MarketClock, now: DateTime<Utc>) -> i64 {
    if clock.any_major_market_open(now) {
        TTL_MINUTES_MARKET_OPEN
    } else {
        TTL_MINUTES_MARKET_CLOSED
    }
}

/// A cached EUR price entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedPrice {
    pub eur_price: f64,
    pub stored_at: DateTime<Utc>,
    pub ttl_minutes: i64,
}

impl CachedPrice {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.stored_at).num_minutes() < self.ttl_minutes
    }
}

/// ISIN-keyed price cache. A stale read ignores freshness entirely (§4.2
/// step 3) and is only ever used as a last resort when the batch quote call
/// fails wholesale.
pub trait PriceCache: Send + Sync {
    fn get(&self, isin: &Isin) -> Option<CachedPrice>;
    fn put(&mut self, isin: &Isin, price: CachedPrice);
}

/// In-memory cache implementation, sufficient for tests and single-process
/// deployments; `hplan-db` provides a Postgres-backed implementation for the
/// daemon.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPriceCache {
    entries: BTreeMap<Isin, CachedPrice>,
}

impl InMemoryPriceCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PriceCache for InMemoryPriceCache {
    fn get(&self, isin: &Isin) -> Option<CachedPrice> {
        self.entries.get(isin).copied()
    }

    fn put(&mut self, isin: &Isin, price: CachedPrice) {
        self.entries.insert(isin.clone(), price);
    }
}

/// Error returned when the batch-quote call fails wholesale (§4.2 step 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchQuoteError(pub String);

impl std::fmt::Display for BatchQuoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "batch quote call failed: {}", self.0)
    }
}

impl std::error::Error for BatchQuoteError {}

/// External price provider boundary (§6): `Symbol -> optional venue override
/// -> optional native price`. A missing/absent value means "no quote
/// available"; a non-positive value must be treated by the caller as
/// missing (enforced in `fetch_current_prices`).
pub trait QuoteProvider: Send + Sync {
    fn get_batch_quotes(
        &self,
        symbols: &BTreeMap<Symbol, Option<String>>,
    ) -> Result<BTreeMap<Symbol, Option<f64>>, BatchQuoteError>;
}

/// Batch-quote securities, applying the market-aware cache (§4.2).
///
/// Deterministic given a fixed cache, a fixed clock, and a fixed batch
/// response. No negative or non-finite prices are ever propagated.
pub fn fetch_current_prices(
    securities: &[Security],
    cache: &mut dyn PriceCache,
    provider: &dyn QuoteProvider,
    rates: &dyn RateProvider,
    clock: &dyn MarketClock,
    now: DateTime<Utc>,
) -> BTreeMap<Isin, f64> {
    let mut result: BTreeMap<Isin, f64> = BTreeMap::new();
    let ttl = ttl_minutes(clock, now);

    let mut to_fetch: Vec<&Security> = Vec::new();
    for sec in securities {
        if sec.isin.as_str().is_empty() {
            continue;
        }
        match cache.get(&sec.isin) {
            Some(cached) if cached.is_fresh(now) => {
                result.insert(sec.isin.clone(), cached.eur_price);
            }
            _ => to_fetch.push(sec),
        }
    }

    if to_fetch.is_empty() {
        return result;
    }

    let symbol_map: BTreeMap<Symbol, Option<String>> = to_fetch
        .iter()
        .map(|s| (s.symbol.clone(), None))
        .collect();

    match provider.get_batch_quotes(&symbol_map) {
        Ok(quotes) => {
            let native_prices: BTreeMap<Symbol, f64> = quotes
                .into_iter()
                .filter_map(|(symbol, maybe_price)| match maybe_price {
                    Some(p) if p.is_finite() && p > 0.0 => Some((symbol, p)),
                    _ => None,
                })
                .collect();

            let converted = convert_to_eur(&native_prices, to_fetch_as_slice(&to_fetch), rates);

            let symbol_to_isin: BTreeMap<&Symbol, &Isin> =
                to_fetch.iter().map(|s| (&s.symbol, &s.isin)).collect();

            for (symbol, conv) in converted {
                if !conv.eur_price.is_finite() || conv.eur_price <= 0.0 {
                    continue;
                }
                match symbol_to_isin.get(&symbol) {
                    Some(isin) => {
                        result.insert((*isin).clone(), conv.eur_price);
                        cache.put(
                            isin,
                            CachedPrice {
                                eur_price: conv.eur_price,
                                stored_at: now,
                                ttl_minutes: ttl,
                            },
                        );
                    }
                    None => {
                        warn!(symbol = %symbol, "hplan_marketdata: unresolved symbol, dropping");
                    }
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "hplan_marketdata: batch quote call failed, falling back to stale cache reads");
            for sec in &to_fetch {
                if let Some(cached) = cache.get(&sec.isin) {
                    result.insert(sec.isin.clone(), cached.eur_price);
                }
            }
        }
    }

    result
}

fn to_fetch_as_slice(to_fetch: &[&Security]) -> Vec<Security> {
    to_fetch.iter().map(|s| (*s).clone()).collect()
}
