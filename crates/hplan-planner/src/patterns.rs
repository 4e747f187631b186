//! Pattern generators (§4.5 step 3): each pattern consumes the categorized
//! candidate pool produced by the calculators and emits zero or more
//! candidate `ActionSequence`s representing one coherent way of acting on
//! that pool this cycle.
//!
//! Grounded on the corpus's `mqk-strategy::plugin_registry` shape for the
//! registry, and on `mqk-portfolio`'s sequencing helpers for the idea of a
//! pattern as "a specific combination strategy over a shared candidate set"
//! rather than a single-action rule.

use std::collections::BTreeMap;

use hplan_schemas::{ActionCandidate, ActionSequence, Side};

pub type CategorizedCandidates = BTreeMap<String, Vec<ActionCandidate>>;

/// A pattern generator turns the full categorized candidate pool into zero
/// or more sequences. Failure is non-fatal: an empty `Vec` means "this
/// pattern found nothing to propose this cycle", not an error.
pub trait PatternGenerator: Send + Sync {
    fn name(&self) -> &'static str;
    fn generate(&self, candidates: &CategorizedCandidates) -> Vec<ActionSequence>;
}

fn all_candidates(candidates: &CategorizedCandidates) -> Vec<&ActionCandidate> {
    candidates.values().flatten().collect()
}

fn by_category<'a>(candidates: &'a CategorizedCandidates, category: &str) -> Vec<&'a ActionCandidate> {
    candidates.get(category).map(|v| v.iter().collect()).unwrap_or_default()
}

/// "direct-buy": the single highest-priority buy candidate in isolation.
pub struct DirectBuyPattern;
impl PatternGenerator for DirectBuyPattern {
    fn name(&self) -> &'static str {
        "direct_buy"
    }

    fn generate(&self, candidates: &CategorizedCandidates) -> Vec<ActionSequence> {
        let mut buys: Vec<&ActionCandidate> = all_candidates(candidates)
            .into_iter()
            .filter(|c| c.side == Side::Buy)
            .collect();
        buys.sort_by(|a, b| b.priority.partial_cmp(&a.priority).unwrap_or(std::cmp::Ordering::Equal));
        buys.into_iter()
            .take(1)
            .map(|c| ActionSequence::new(vec![c.clone()]))
            .collect()
    }
}

/// "single-best": the single highest-priority candidate of either side.
pub struct SingleBestPattern;
impl PatternGenerator for SingleBestPattern {
    fn name(&self) -> &'static str {
        "single_best"
    }

    fn generate(&self, candidates: &CategorizedCandidates) -> Vec<ActionSequence> {
        let mut all = all_candidates(candidates);
        all.sort_by(|a, b| b.priority.partial_cmp(&a.priority).unwrap_or(std::cmp::Ordering::Equal));
        all.into_iter()
            .take(1)
            .map(|c| ActionSequence::new(vec![c.clone()]))
            .collect()
    }
}

/// "mixed": pairs the single best sell with the single best buy, funding
/// the buy from the sell's proceeds (the two legs are not cash-checked
/// here — that's the evaluator's job).
pub struct MixedPattern;
impl PatternGenerator for MixedPattern {
    fn name(&self) -> &'static str {
        "mixed"
    }

    fn generate(&self, candidates: &CategorizedCandidates) -> Vec<ActionSequence> {
        let mut sells: Vec<&ActionCandidate> = all_candidates(candidates)
            .into_iter()
            .filter(|c| c.side == Side::Sell)
            .collect();
        let mut buys: Vec<&ActionCandidate> = all_candidates(candidates)
            .into_iter()
            .filter(|c| c.side == Side::Buy)
            .collect();
        sells.sort_by(|a, b| b.priority.partial_cmp(&a.priority).unwrap_or(std::cmp::Ordering::Equal));
        buys.sort_by(|a, b| b.priority.partial_cmp(&a.priority).unwrap_or(std::cmp::Ordering::Equal));

        match (sells.first(), buys.first()) {
            (Some(sell), Some(buy)) => {
                vec![ActionSequence::new(vec![(*sell).clone(), (*buy).clone()])]
            }
            _ => Vec::new(),
        }
    }
}

/// "deep-rebalance": every rebalance-sell paired with every rebalance-buy,
/// largest gap first on each side — a broader sweep than `mixed`.
pub struct DeepRebalancePattern {
    pub max_legs_per_side: usize,
}

impl Default for DeepRebalancePattern {
    fn default() -> Self {
        Self { max_legs_per_side: 3 }
    }
}

impl PatternGenerator for DeepRebalancePattern {
    fn name(&self) -> &'static str {
        "deep_rebalance"
    }

    fn generate(&self, candidates: &CategorizedCandidates) -> Vec<ActionSequence> {
        let mut sells = by_category(candidates, "rebalance_sells");
        let mut buys = by_category(candidates, "rebalance_buys");
        sells.sort_by(|a, b| b.priority.partial_cmp(&a.priority).unwrap_or(std::cmp::Ordering::Equal));
        buys.sort_by(|a, b| b.priority.partial_cmp(&a.priority).unwrap_or(std::cmp::Ordering::Equal));
        sells.truncate(self.max_legs_per_side);
        buys.truncate(self.max_legs_per_side);

        if sells.is_empty() && buys.is_empty() {
            return Vec::new();
        }

        let mut actions: Vec<ActionCandidate> = Vec::new();
        actions.extend(sells.into_iter().cloned());
        actions.extend(buys.into_iter().cloned());
        vec![ActionSequence::new(actions)]
    }
}

/// "cost-optimized": averaging-down candidates only, cheapest-priority-gap
/// first, to limit the sequence to its lowest-risk top-up legs.
pub struct CostOptimizedPattern;
impl PatternGenerator for CostOptimizedPattern {
    fn name(&self) -> &'static str {
        "cost_optimized"
    }

    fn generate(&self, candidates: &CategorizedCandidates) -> Vec<ActionSequence> {
        let mut averaging = by_category(candidates, "averaging_down");
        averaging.sort_by(|a, b| a.priority.partial_cmp(&b.priority).unwrap_or(std::cmp::Ordering::Equal));
        if averaging.is_empty() {
            return Vec::new();
        }
        vec![ActionSequence::new(averaging.into_iter().take(2).cloned().collect())]
    }
}

/// "adaptive": profit-taking sells funding opportunity-buys, sized to the
/// smaller of the two candidate pools so that the sequence always uses
/// every sell it proposes.
pub struct AdaptivePattern;
impl PatternGenerator for AdaptivePattern {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn generate(&self, candidates: &CategorizedCandidates) -> Vec<ActionSequence> {
        let mut sells = by_category(candidates, "profit_taking");
        let mut buys = by_category(candidates, "opportunity_buys");
        sells.sort_by(|a, b| b.priority.partial_cmp(&a.priority).unwrap_or(std::cmp::Ordering::Equal));
        buys.sort_by(|a, b| b.priority.partial_cmp(&a.priority).unwrap_or(std::cmp::Ordering::Equal));

        if sells.is_empty() || buys.is_empty() {
            return Vec::new();
        }
        let n = sells.len().min(buys.len());
        let mut actions: Vec<ActionCandidate> = Vec::new();
        actions.extend(sells.into_iter().take(n).cloned());
        actions.extend(buys.into_iter().take(n).cloned());
        vec![ActionSequence::new(actions)]
    }
}

/// Insertion-ordered catalogue of patterns run over the categorized pool.
pub fn default_patterns() -> Vec<Box<dyn PatternGenerator>> {
    vec![
        Box::new(DirectBuyPattern),
        Box::new(SingleBestPattern),
        Box::new(MixedPattern),
        Box::new(DeepRebalancePattern::default()),
        Box::new(CostOptimizedPattern),
        Box::new(AdaptivePattern),
    ]
}
