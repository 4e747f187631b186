//! Post-hoc sequence filters (§4.5 step 5): eligibility, correlation
//! awareness, diversity, and recently-traded windows. Sequences eliminated
//! here become `RejectedSequence`s carrying a reason code.

use std::collections::{BTreeMap, BTreeSet};

use hplan_schemas::{ActionSequence, Isin, ReasonCode};

/// A post-hoc filter either accepts a sequence or rejects it with a reason.
pub trait SequenceFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, sequence: &ActionSequence) -> Result<(), ReasonCode>;
}

/// "eligibility": every leg must reference an ISIN the caller has marked
/// eligible (post pre-filter).
pub struct EligibilityFilter {
    pub eligible: BTreeSet<Isin>,
}

impl SequenceFilter for EligibilityFilter {
    fn name(&self) -> &'static str {
        "eligibility"
    }

    fn check(&self, sequence: &ActionSequence) -> Result<(), ReasonCode> {
        for action in &sequence.actions {
            if !self.eligible.contains(&action.isin) {
                return Err(ReasonCode::EligibilityFailed);
            }
        }
        Ok(())
    }
}

/// "correlation-awareness": rejects sequences whose simultaneous buy legs
/// are all drawn from a single configured correlation cluster beyond a
/// count threshold (a simple proxy; real correlation matrices are an
/// upstream research concern, not this core's).
pub struct CorrelationFilter {
    pub clusters: BTreeMap<Isin, String>,
    pub max_same_cluster_buys: usize,
}

impl SequenceFilter for CorrelationFilter {
    fn name(&self) -> &'static str {
        "correlation_awareness"
    }

    fn check(&self, sequence: &ActionSequence) -> Result<(), ReasonCode> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for action in &sequence.actions {
            if action.side != hplan_schemas::Side::Buy {
                continue;
            }
            if let Some(cluster) = self.clusters.get(&action.isin) {
                *counts.entry(cluster.as_str()).or_insert(0) += 1;
            }
        }
        if counts.values().any(|&n| n > self.max_same_cluster_buys) {
            return Err(ReasonCode::CorrelationTooHigh);
        }
        Ok(())
    }
}

/// "diversity": rejects sequences whose buy legs concentrate too heavily
/// into a single country or industry group.
pub struct DiversityFilter {
    pub isin_to_group: BTreeMap<Isin, String>,
    pub max_fraction_same_group: f64,
}

impl SequenceFilter for DiversityFilter {
    fn name(&self) -> &'static str {
        "diversity"
    }

    fn check(&self, sequence: &ActionSequence) -> Result<(), ReasonCode> {
        let buys: Vec<_> = sequence
            .actions
            .iter()
            .filter(|a| a.side == hplan_schemas::Side::Buy)
            .collect();
        if buys.is_empty() {
            return Ok(());
        }
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for action in &buys {
            let group = self
                .isin_to_group
                .get(&action.isin)
                .map(|s| s.as_str())
                .unwrap_or(hplan_schemas::OTHER_GROUP);
            *counts.entry(group).or_insert(0) += 1;
        }
        let max_count = counts.values().copied().max().unwrap_or(0);
        let fraction = max_count as f64 / buys.len() as f64;
        if fraction > self.max_fraction_same_group {
            return Err(ReasonCode::DiversityFailed);
        }
        Ok(())
    }
}

/// "recently-traded": rejects sequences touching any ISIN traded within
/// the configured lookback window.
pub struct RecentlyTradedFilter {
    pub recently_traded: BTreeSet<Isin>,
}

impl SequenceFilter for RecentlyTradedFilter {
    fn name(&self) -> &'static str {
        "recently_traded"
    }

    fn check(&self, sequence: &ActionSequence) -> Result<(), ReasonCode> {
        for action in &sequence.actions {
            if self.recently_traded.contains(&action.isin) {
                return Err(ReasonCode::RecentlyTraded);
            }
        }
        Ok(())
    }
}

/// Run every filter over every sequence in order; the first filter to
/// reject a sequence determines its reason. Surviving sequences preserve
/// their input order.
pub fn apply_filters(
    sequences: Vec<ActionSequence>,
    filters: &[Box<dyn SequenceFilter>],
) -> (Vec<ActionSequence>, Vec<(ActionSequence, String, ReasonCode)>) {
    let mut kept = Vec::new();
    let mut rejected = Vec::new();

    'seq: for sequence in sequences {
        for filter in filters {
            if let Err(reason) = filter.check(&sequence) {
                rejected.push((sequence, filter.name().to_string(), reason));
                continue 'seq;
            }
        }
        kept.push(sequence);
    }

    (kept, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hplan_schemas::{ActionCandidate, Side, Symbol};

    fn candidate(isin: &str, side: Side) -> ActionCandidate {
        ActionCandidate {
            symbol: Symbol::new(isin),
            isin: Isin::new(isin),
            side,
            quantity: 10,
            value_eur_micros: 1_000_000,
            estimated_price_eur_micros: 100_000,
            currency: "EUR".to_string(),
            reason: "test".to_string(),
            priority: 0.5,
            category: "test".to_string(),
        }
    }

    #[test]
    fn eligibility_filter_rejects_unknown_isin() {
        let filter = EligibilityFilter {
            eligible: BTreeSet::from([Isin::new("A")]),
        };
        let seq = ActionSequence::new(vec![candidate("B", Side::Buy)]);
        assert_eq!(filter.check(&seq), Err(ReasonCode::EligibilityFailed));
    }

    #[test]
    fn recently_traded_filter_blocks_touching_sequence() {
        let filter = RecentlyTradedFilter {
            recently_traded: BTreeSet::from([Isin::new("A")]),
        };
        let seq = ActionSequence::new(vec![candidate("A", Side::Sell)]);
        assert_eq!(filter.check(&seq), Err(ReasonCode::RecentlyTraded));
    }

    #[test]
    fn diversity_filter_allows_mixed_groups() {
        let mut isin_to_group = BTreeMap::new();
        isin_to_group.insert(Isin::new("A"), "Tech".to_string());
        isin_to_group.insert(Isin::new("B"), "Health".to_string());
        let filter = DiversityFilter {
            isin_to_group,
            max_fraction_same_group: 0.6,
        };
        let seq = ActionSequence::new(vec![candidate("A", Side::Buy), candidate("B", Side::Buy)]);
        assert!(filter.check(&seq).is_ok());
    }

    #[test]
    fn diversity_filter_rejects_concentrated_group() {
        let mut isin_to_group = BTreeMap::new();
        isin_to_group.insert(Isin::new("A"), "Tech".to_string());
        isin_to_group.insert(Isin::new("B"), "Tech".to_string());
        let filter = DiversityFilter {
            isin_to_group,
            max_fraction_same_group: 0.5,
        };
        let seq = ActionSequence::new(vec![candidate("A", Side::Buy), candidate("B", Side::Buy)]);
        assert_eq!(filter.check(&seq), Err(ReasonCode::DiversityFailed));
    }

    #[test]
    fn apply_filters_preserves_order_of_survivors() {
        let filters: Vec<Box<dyn SequenceFilter>> = vec![Box::new(EligibilityFilter {
            eligible: BTreeSet::from([Isin::new("A"), Isin::new("C")]),
        })];
        let sequences = vec![
            ActionSequence::new(vec![candidate("A", Side::Buy)]),
            ActionSequence::new(vec![candidate("B", Side::Buy)]),
            ActionSequence::new(vec![candidate("C", Side::Buy)]),
        ];
        let (kept, rejected) = apply_filters(sequences, &filters);
        assert_eq!(kept.len(), 2);
        assert_eq!(rejected.len(), 1);
        assert_eq!(kept[0].actions[0].isin, Isin::new("A"));
        assert_eq!(kept[1].actions[0].isin, Isin::new("C"));
    }
}
