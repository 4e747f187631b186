//! Planner core (C5): pre-filter, opportunity calculators, pattern
//! generators, advanced sequence generators, and post-hoc filters, wired
//! into a single [`plan`] entry point.
//!
//! Every sub-stage is pure with respect to its parameters and the
//! `OpportunityContext` (§4.5 contract); failures of individual
//! calculators/generators are recorded, never propagated as a hard error.

pub mod calculators;
pub mod filters;
pub mod generators;
pub mod patterns;
pub mod prefilter;

use std::collections::BTreeMap;

use hplan_config::PlannerSettings;
use hplan_schemas::{
    ActionSequence, Isin, OpportunityContext, PreFilteredSecurity, RejectedSequence,
};

use calculators::{CalculatorParams, OpportunityCalculator};
use filters::SequenceFilter;
use generators::GeneratorParams;
use patterns::{CategorizedCandidates, PatternGenerator};
use prefilter::CooloffWindows;

/// Everything a single planning cycle produced, for persistence and
/// explainability (§4.7 step 5).
#[derive(Debug, Clone, Default)]
pub struct PlanningOutput {
    pub sequences: Vec<ActionSequence>,
    pub prefiltered: Vec<PreFilteredSecurity>,
    pub calculator_failures: Vec<(String, String)>,
    pub rejected_sequences: Vec<RejectedSequence>,
}

pub struct PlanningInputs<'a> {
    pub ctx: &'a OpportunityContext,
    pub cooloff: &'a CooloffWindows,
    pub quality_gate: prefilter::QualityGate<'a>,
    pub calculators: &'a [Box<dyn OpportunityCalculator>],
    pub patterns: &'a [Box<dyn PatternGenerator>],
    pub filters: &'a [Box<dyn SequenceFilter>],
    pub settings: &'a PlannerSettings,
}

/// Run the full C5 pipeline: pre-filter, calculate, pattern-generate,
/// advanced-expand, filter. Returns every candidate sequence alongside the
/// explainability traces needed for §4.7 step 5 persistence.
pub fn plan(inputs: PlanningInputs<'_>) -> PlanningOutput {
    let (eligible, prefiltered) = prefilter::prefilter(inputs.ctx, inputs.cooloff, inputs.quality_gate);

    let calc_params = CalculatorParams {
        max_opportunities_per_category: inputs.settings.max_opportunities_per_category as usize,
        held: held_isins(inputs.ctx),
        ..Default::default()
    };

    let mut categorized: CategorizedCandidates = BTreeMap::new();
    let mut calculator_failures = Vec::new();

    for calculator in inputs.calculators {
        match calculator.calculate(inputs.ctx, &calc_params) {
            Ok(candidates) => {
                let eligible_only: Vec<_> = candidates
                    .into_iter()
                    .filter(|c| eligible.contains(&c.isin))
                    .collect();
                categorized
                    .entry(calculator.category().to_string())
                    .or_default()
                    .extend(eligible_only);
            }
            Err(err) => {
                tracing::warn!(category = calculator.category(), error = %err, "calculator failed");
                calculator_failures.push((calculator.category().to_string(), err));
            }
        }
    }

    let mut base_sequences = Vec::new();
    for pattern in inputs.patterns {
        base_sequences.extend(pattern.generate(&categorized));
    }

    let generator_params = GeneratorParams {
        max_plan_depth: inputs.settings.max_plan_depth as usize,
        max_combinatorial_sequences: 200,
        priority_threshold: inputs.settings.priority_threshold,
    };
    let expanded = generators::generate_advanced_sequences(base_sequences, &generator_params);

    let (kept, rejected) = filters::apply_filters(expanded, inputs.filters);
    let rejected_sequences = rejected
        .into_iter()
        .map(|(sequence, filter_name, reason)| RejectedSequence {
            sequence,
            filter_name,
            reason,
        })
        .collect();

    PlanningOutput {
        sequences: kept,
        prefiltered,
        calculator_failures,
        rejected_sequences,
    }
}

fn held_isins(ctx: &OpportunityContext) -> std::collections::BTreeSet<Isin> {
    ctx.positions
        .iter()
        .filter(|p| p.quantity > 0.0)
        .map(|p| p.isin.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use calculators::default_calculators;
    use filters::EligibilityFilter;
    use hplan_schemas::{EnrichedPosition, Security, Symbol};
    use patterns::default_patterns;
    use std::collections::BTreeSet;

    fn sample_ctx() -> OpportunityContext {
        let mut ctx = OpportunityContext::default();
        let security = Security {
            isin: Isin::new("A"),
            symbol: Symbol::new("A"),
            name: "A".to_string(),
            currency: "EUR".to_string(),
            country: "US".to_string(),
            industry: "Tech".to_string(),
            exchange: "XXX".to_string(),
            allow_buy: true,
            allow_sell: true,
            min_lot: 1,
            active: true,
        };
        ctx.securities.insert(Isin::new("A"), security);
        ctx.current_prices.insert(Isin::new("A"), 100_000_000);
        ctx.target_weights.insert(Isin::new("A"), 0.5);
        ctx.total_portfolio_value_eur_micros = 100_000 * hplan_schemas::MICROS_SCALE;
        ctx.positions.push(EnrichedPosition {
            isin: Isin::new("A"),
            symbol: Symbol::new("A"),
            quantity: 0.0,
            eur_avg_cost_per_share_micros: 0,
            eur_current_price_micros: 100_000_000,
            value_eur_micros: 0,
            weight_in_portfolio: 0.0,
            days_held: None,
            name: "A".to_string(),
            country: "US".to_string(),
            exchange: "XXX".to_string(),
            active: true,
            allow_buy: true,
            allow_sell: true,
            min_lot: 1,
        });
        ctx
    }

    #[test]
    fn full_pipeline_produces_at_least_one_sequence_for_a_clear_gap() {
        let ctx = sample_ctx();
        let calculators = default_calculators();
        let patterns = default_patterns();
        let filters: Vec<Box<dyn SequenceFilter>> = vec![Box::new(EligibilityFilter {
            eligible: BTreeSet::from([Isin::new("A")]),
        })];
        let settings = PlannerSettings::default();

        let output = plan(PlanningInputs {
            ctx: &ctx,
            cooloff: &CooloffWindows::default(),
            quality_gate: None,
            calculators: &calculators,
            patterns: &patterns,
            filters: &filters,
            settings: &settings,
        });

        assert!(!output.sequences.is_empty());
        assert!(output.prefiltered.is_empty());
    }

    #[test]
    fn eligibility_filter_rejects_sequences_outside_prefilter_set() {
        let ctx = sample_ctx();
        let calculators = default_calculators();
        let patterns = default_patterns();
        let filters: Vec<Box<dyn SequenceFilter>> = vec![Box::new(EligibilityFilter {
            eligible: BTreeSet::new(),
        })];
        let settings = PlannerSettings::default();

        let output = plan(PlanningInputs {
            ctx: &ctx,
            cooloff: &CooloffWindows::default(),
            quality_gate: None,
            calculators: &calculators,
            patterns: &patterns,
            filters: &filters,
            settings: &settings,
        });

        assert!(output.sequences.is_empty());
    }

    #[test]
    fn calculator_failure_is_recorded_not_propagated() {
        struct AlwaysFails;
        impl OpportunityCalculator for AlwaysFails {
            fn category(&self) -> &'static str {
                "always_fails"
            }
            fn calculate(
                &self,
                _ctx: &OpportunityContext,
                _params: &CalculatorParams,
            ) -> Result<Vec<hplan_schemas::ActionCandidate>, String> {
                Err("boom".to_string())
            }
        }

        let ctx = sample_ctx();
        let calculators: Vec<Box<dyn OpportunityCalculator>> = vec![Box::new(AlwaysFails)];
        let patterns = default_patterns();
        let filters: Vec<Box<dyn SequenceFilter>> = Vec::new();
        let settings = PlannerSettings::default();

        let output = plan(PlanningInputs {
            ctx: &ctx,
            cooloff: &CooloffWindows::default(),
            quality_gate: None,
            calculators: &calculators,
            patterns: &patterns,
            filters: &filters,
            settings: &settings,
        });

        assert_eq!(output.calculator_failures.len(), 1);
        assert_eq!(output.calculator_failures[0].0, "always_fails");
    }
}
