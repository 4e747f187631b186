//! Pre-filter stage (§4.5 step 1): drops securities that are structurally
//! ineligible for this cycle before any calculator sees them.

use std::collections::{BTreeMap, BTreeSet};

use hplan_schemas::{Isin, OpportunityContext, PreFilteredSecurity, ReasonCode, Security};

/// Cooloff windows (in days) applied per side, keyed by ISIN. An empty map
/// means no cooloff is in effect for any security.
#[derive(Debug, Clone, Default)]
pub struct CooloffWindows {
    pub buy_cooloff_isins: BTreeSet<Isin>,
    pub sell_cooloff_isins: BTreeSet<Isin>,
}

/// Quality gate: a simple pass/fail predicate over a security, independent
/// of cooloff/activity/permission checks. `None` means "no quality gate
/// configured" (everything passes).
pub type QualityGate<'a> = Option<&'a dyn Fn(&Security) -> bool>;

/// Run the pre-filter over every known security. Returns the set of ISINs
/// still eligible for calculators, plus a trace entry for every drop.
pub fn prefilter(
    ctx: &OpportunityContext,
    cooloff: &CooloffWindows,
    quality_gate: QualityGate<'_>,
) -> (BTreeSet<Isin>, Vec<PreFilteredSecurity>) {
    let held: BTreeMap<&Isin, f64> = ctx
        .positions
        .iter()
        .map(|p| (&p.isin, p.quantity))
        .collect();

    let mut eligible = BTreeSet::new();
    let mut dropped = Vec::new();

    for (isin, security) in &ctx.securities {
        let reason = eligibility_reason(security, isin, &held, cooloff, quality_gate);
        match reason {
            Some(reason) => dropped.push(PreFilteredSecurity {
                isin: isin.clone(),
                symbol: security.symbol.clone(),
                reason,
            }),
            None => {
                eligible.insert(isin.clone());
            }
        }
    }

    (eligible, dropped)
}

fn eligibility_reason(
    security: &Security,
    isin: &Isin,
    held: &BTreeMap<&Isin, f64>,
    cooloff: &CooloffWindows,
    quality_gate: QualityGate<'_>,
) -> Option<ReasonCode> {
    if !security.active {
        return Some(ReasonCode::Inactive);
    }

    let position_qty = held.get(isin).copied().unwrap_or(0.0);
    let has_position = position_qty > 0.0;

    if !security.allow_buy && !security.allow_sell && !has_position {
        return Some(ReasonCode::BuyDisallowed);
    }

    let buy_cooling = cooloff.buy_cooloff_isins.contains(isin);
    let sell_cooling = cooloff.sell_cooloff_isins.contains(isin);
    if buy_cooling && sell_cooling {
        return Some(ReasonCode::CooloffWindow);
    }

    if let Some(gate) = quality_gate {
        if !gate(security) {
            return Some(ReasonCode::QualityGateFailed);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use hplan_schemas::Symbol;

    fn security(isin: &str, active: bool, allow_buy: bool, allow_sell: bool) -> Security {
        Security {
            isin: Isin::new(isin),
            symbol: Symbol::new(isin),
            name: isin.to_string(),
            currency: "EUR".to_string(),
            country: "US".to_string(),
            industry: "Tech".to_string(),
            exchange: "XXX".to_string(),
            allow_buy,
            allow_sell,
            min_lot: 1,
            active,
        }
    }

    fn ctx_with(securities: Vec<Security>) -> OpportunityContext {
        let mut ctx = OpportunityContext::default();
        for s in securities {
            ctx.securities.insert(s.isin.clone(), s);
        }
        ctx
    }

    #[test]
    fn inactive_security_is_dropped() {
        let ctx = ctx_with(vec![security("A", false, true, true)]);
        let (eligible, dropped) = prefilter(&ctx, &CooloffWindows::default(), None);
        assert!(eligible.is_empty());
        assert_eq!(dropped[0].reason, ReasonCode::Inactive);
    }

    #[test]
    fn no_buy_no_sell_no_position_is_dropped() {
        let ctx = ctx_with(vec![security("A", true, false, false)]);
        let (eligible, _) = prefilter(&ctx, &CooloffWindows::default(), None);
        assert!(eligible.is_empty());
    }

    #[test]
    fn active_with_buy_allowed_is_eligible() {
        let ctx = ctx_with(vec![security("A", true, true, true)]);
        let (eligible, dropped) = prefilter(&ctx, &CooloffWindows::default(), None);
        assert_eq!(eligible.len(), 1);
        assert!(dropped.is_empty());
    }

    #[test]
    fn double_cooloff_blocks_security() {
        let ctx = ctx_with(vec![security("A", true, true, true)]);
        let mut cooloff = CooloffWindows::default();
        cooloff.buy_cooloff_isins.insert(Isin::new("A"));
        cooloff.sell_cooloff_isins.insert(Isin::new("A"));
        let (eligible, dropped) = prefilter(&ctx, &cooloff, None);
        assert!(eligible.is_empty());
        assert_eq!(dropped[0].reason, ReasonCode::CooloffWindow);
    }

    #[test]
    fn quality_gate_failure_is_recorded() {
        let ctx = ctx_with(vec![security("A", true, true, true)]);
        let gate: &dyn Fn(&Security) -> bool = &|_s| false;
        let (eligible, dropped) = prefilter(&ctx, &CooloffWindows::default(), Some(gate));
        assert!(eligible.is_empty());
        assert_eq!(dropped[0].reason, ReasonCode::QualityGateFailed);
    }
}
