//! C1 — currency converter.
//!
//! Converts a `Symbol -> native price` map to `Symbol -> EUR price` using an
//! injected [`RateProvider`]. Securities already denominated in EUR pass
//! through untouched. For any other currency, the converter applies the
//! `X -> EUR` rate; if no rate is available the native price is passed
//! through **unmodified**, marked as a fallback, and logged — the converter
//! never invents a rate (§4.1).
//!
//! Grounded on the corpus's `mqk-execution::prices` fixed-point conversion
//! idiom (`PricingError`-style small error enum, no panics on bad input);
//! the passthrough-on-missing-rate contract itself is new logic specific to
//! this boundary.

use std::collections::BTreeMap;

use hplan_schemas::{Security, Symbol};

/// A provider of `currency -> EUR` exchange rates. Absence of a rate is not
/// an error for the provider — `hplan-fx` handles passthrough (§6).
pub trait RateProvider: Send + Sync {
    /// Returns the multiplicative rate to convert one unit of `currency`
    /// into EUR, or `None` if no rate is known.
    fn rate_to_eur(&self, currency: &str) -> Option<f64>;
}

/// Simple in-memory rate table, sufficient for tests and small deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticRateProvider {
    rates: BTreeMap<String, f64>,
}

impl StaticRateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, currency: impl Into<String>, rate: f64) -> Self {
        self.rates.insert(currency.into(), rate);
        self
    }
}

impl RateProvider for StaticRateProvider {
    fn rate_to_eur(&self, currency: &str) -> Option<f64> {
        self.rates.get(currency).copied()
    }
}

/// Per-symbol conversion outcome, including whether the converter had to
/// fall back to a native passthrough.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvertedPrice {
    pub eur_price: f64,
    pub is_fallback: bool,
}

/// Convert a `Symbol -> native price` map into EUR. Securities not present
/// in `securities` are skipped (no currency metadata to convert by) — the
/// converter never guesses a currency.
///
/// The converter itself never fails: every input symbol that has a matching
/// `Security` produces an output entry, either correctly converted or as a
/// logged-fallback passthrough.
pub fn convert_to_eur(
    native_prices: &BTreeMap<Symbol, f64>,
    securities: &[Security],
    rates: &dyn RateProvider,
) -> BTreeMap<Symbol, ConvertedPrice> {
    let currency_by_symbol: BTreeMap<&Symbol, &str> = securities
        .iter()
        .map(|s| (&s.symbol, s.currency.as_str()))
        .collect();

    let mut out = BTreeMap::new();
    for (symbol, native_price) in native_prices {
        let Some(&currency) = currency_by_symbol.get(symbol) else {
            continue;
        };

        if currency.eq_ignore_ascii_case("EUR") {
            out.insert(
                symbol.clone(),
                ConvertedPrice {
                    eur_price: *native_price,
                    is_fallback: false,
                },
            );
            continue;
        }

        match rates.rate_to_eur(currency) {
            Some(rate) => {
                out.insert(
                    symbol.clone(),
                    ConvertedPrice {
                        eur_price: native_price * rate,
                        is_fallback: false,
                    },
                );
            }
            None => {
                tracing::warn!(
                    symbol = %symbol,
                    currency = currency,
                    "hplan_fx: no rate available, passing native price through as fallback"
                );
                out.insert(
                    symbol.clone(),
                    ConvertedPrice {
                        eur_price: *native_price,
                        is_fallback: true,
                    },
                );
            }
        }
    }
    out
}

/// Convert a single native price for a known currency. Convenience used by
/// `hplan-context` when it must convert an individual `Position`'s stored
/// native average price rather than a whole batch.
pub fn convert_single(native_price: f64, currency: &str, rates: &dyn RateProvider) -> ConvertedPrice {
    if currency.eq_ignore_ascii_case("EUR") {
        return ConvertedPrice {
            eur_price: native_price,
            is_fallback: false,
        };
    }
    match rates.rate_to_eur(currency) {
        Some(rate) => ConvertedPrice {
            eur_price: native_price * rate,
            is_fallback: false,
        },
        None => {
            tracing::warn!(
                currency = currency,
                "hplan_fx: no rate available for single conversion, passing through"
            );
            ConvertedPrice {
                eur_price: native_price,
                is_fallback: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn security(symbol: &str, currency: &str) -> Security {
        Security {
            isin: hplan_schemas::Isin::new(format!("ISIN-{symbol}")),
            symbol: Symbol::new(symbol),
            name: symbol.to_string(),
            currency: currency.to_string(),
            country: "XX".to_string(),
            industry: "Other".to_string(),
            exchange: "XXX".to_string(),
            allow_buy: true,
            allow_sell: true,
            min_lot: 1,
            active: true,
        }
    }

    #[test]
    fn eur_security_passes_through_unmodified() {
        let securities = vec![security("ASML", "EUR")];
        let mut prices = BTreeMap::new();
        prices.insert(Symbol::new("ASML"), 650.0);
        let rates = StaticRateProvider::new();

        let out = convert_to_eur(&prices, &securities, &rates);
        let c = out.get(&Symbol::new("ASML")).unwrap();
        assert_eq!(c.eur_price, 650.0);
        assert!(!c.is_fallback);
    }

    /// Scenario 1 (spec §8) — the canonical HKD conversion bug fix.
    #[test]
    fn hkd_conversion_is_applied_not_treated_as_eur() {
        let securities = vec![security("CAT.3750.AS", "HKD")];
        let mut prices = BTreeMap::new();
        prices.insert(Symbol::new("CAT.3750.AS"), 497.4);
        let rates = StaticRateProvider::new().with_rate("HKD", 0.11);

        let out = convert_to_eur(&prices, &securities, &rates);
        let c = out.get(&Symbol::new("CAT.3750.AS")).unwrap();
        assert!((c.eur_price - 54.714).abs() < 1e-6);
        assert!(!c.is_fallback);
    }

    /// Scenario 2 (spec §8) — missing rate passes through, never invents a rate.
    #[test]
    fn missing_rate_passes_through_as_fallback() {
        let securities = vec![security("TSM", "TWD")];
        let mut prices = BTreeMap::new();
        prices.insert(Symbol::new("TSM"), 600.0);
        let rates = StaticRateProvider::new();

        let out = convert_to_eur(&prices, &securities, &rates);
        let c = out.get(&Symbol::new("TSM")).unwrap();
        assert_eq!(c.eur_price, 600.0);
        assert!(c.is_fallback);
    }

    #[test]
    fn symbol_without_matching_security_is_skipped() {
        let securities = vec![security("AAPL", "USD")];
        let mut prices = BTreeMap::new();
        prices.insert(Symbol::new("UNKNOWN"), 10.0);
        let rates = StaticRateProvider::new().with_rate("USD", 0.9);

        let out = convert_to_eur(&prices, &securities, &rates);
        assert!(out.is_empty());
    }

    #[test]
    fn converter_never_fails_on_empty_input() {
        let out = convert_to_eur(&BTreeMap::new(), &[], &StaticRateProvider::new());
        assert!(out.is_empty());
    }
}
