//! Planner batch orchestrator (C8, §4.8).
//!
//! Grounded on the corpus's `mqk-daemon` staged-operation shape (`AppState`
//! holding a status snapshot broadcast over `BusMsg`) for the
//! status/duration-tracked stage list, adapted from "one daemon-wide status
//! struct" to "five sequential stages, each independently timed and
//! fallible". The five repository-facing concerns (hash, optimizer inputs,
//! context inputs, recommendation persistence) are contracts the caller
//! supplies — this crate owns the sequencing and the C5/C6 wiring itself.

use std::collections::BTreeMap;
use std::time::Instant;

use hplan_config::PlannerConfig;
use hplan_evaluator::{EvaluatorSettings, ProgressCallback};
use hplan_planner::calculators::OpportunityCalculator;
use hplan_planner::filters::SequenceFilter;
use hplan_planner::patterns::PatternGenerator;
use hplan_planner::prefilter::CooloffWindows;
use hplan_planner::{PlanningInputs, PlanningOutput};
use hplan_schemas::{
    HolisticPlan, HolisticStep, Isin, OpportunityContext, PlanGeneratedEvent, PlannerEvent,
    PortfolioFingerprint, RecommendationsReadyEvent,
};

pub const STAGE_NAMES: [&str; 5] = [
    "Portfolio hash",
    "Optimizer weights",
    "Opportunity context",
    "Create trade plan",
    "Store recommendations",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct StageRecord {
    pub name: &'static str,
    pub status: StageStatus,
    pub duration_ms: u128,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub stages: Vec<StageRecord>,
    pub portfolio_hash: Option<PortfolioFingerprint>,
    pub plan: Option<HolisticPlan>,
    pub events: Vec<PlannerEvent>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorError {
    pub stage: &'static str,
    pub message: String,
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stage '{}' failed: {}", self.stage, self.message)
    }
}

impl std::error::Error for OrchestratorError {}

/// Stage 1: compute a stable fingerprint of current portfolio state.
/// Metadata only — never used to skip work (§4.8 step 3).
pub trait PortfolioHasher: Send + Sync {
    fn compute(&self) -> Result<PortfolioFingerprint, String>;
}

/// Stage 2: produce target weights. Failure here is non-fatal (§4.8 step 4).
pub trait OptimizerRunner: Send + Sync {
    fn run(&self) -> Result<BTreeMap<Isin, f64>, String>;
}

/// Stage 3: build the opportunity context with the resolved target weights.
/// Failure here is fatal (§4.8 step 5).
pub trait ContextBuilder: Send + Sync {
    fn build(&self, target_weights: Option<BTreeMap<Isin, f64>>) -> Result<OpportunityContext, String>;
}

/// Stage 5: persist the plan and its explainability traces (§4.7/§4.8 step 7).
pub trait RecommendationSink: Send + Sync {
    fn invalidate_prior_cycle(&self) -> Result<(), String>;
    fn store(
        &self,
        plan: &HolisticPlan,
        output: &PlanningOutput,
        portfolio_hash: &PortfolioFingerprint,
    ) -> Result<usize, String>;
}

pub struct Orchestrator<'a> {
    pub hasher: &'a dyn PortfolioHasher,
    pub optimizer: &'a dyn OptimizerRunner,
    pub context_builder: &'a dyn ContextBuilder,
    pub sink: &'a dyn RecommendationSink,
    pub calculators: &'a [Box<dyn OpportunityCalculator>],
    pub patterns: &'a [Box<dyn PatternGenerator>],
    pub filters: &'a [Box<dyn SequenceFilter>],
    pub cooloff: &'a CooloffWindows,
    pub config: &'a PlannerConfig,
}

impl<'a> Orchestrator<'a> {
    /// Run one full cycle (§4.8 algorithm). Stage 2 failures are logged and
    /// degrade to empty target weights rather than aborting; every other
    /// stage failure aborts the cycle and no later stage runs.
    pub fn run_cycle(&self) -> Result<CycleReport, OrchestratorError> {
        self.sink
            .invalidate_prior_cycle()
            .map_err(|e| OrchestratorError { stage: "invalidate", message: e })?;

        let mut stages = vec![
            StageRecord { name: STAGE_NAMES[0], status: StageStatus::Pending, duration_ms: 0 },
            StageRecord { name: STAGE_NAMES[1], status: StageStatus::Pending, duration_ms: 0 },
            StageRecord { name: STAGE_NAMES[2], status: StageStatus::Pending, duration_ms: 0 },
            StageRecord { name: STAGE_NAMES[3], status: StageStatus::Pending, duration_ms: 0 },
            StageRecord { name: STAGE_NAMES[4], status: StageStatus::Pending, duration_ms: 0 },
        ];

        // Stage 1: Portfolio hash.
        stages[0].status = StageStatus::Running;
        let started = Instant::now();
        let portfolio_hash = self.hasher.compute();
        stages[0].duration_ms = started.elapsed().as_millis();
        let portfolio_hash = match portfolio_hash {
            Ok(h) => {
                stages[0].status = StageStatus::Completed;
                h
            }
            Err(e) => {
                stages[0].status = StageStatus::Failed;
                return Err(OrchestratorError { stage: STAGE_NAMES[0], message: e });
            }
        };

        // Stage 2: Optimizer weights (non-fatal on failure, §4.8 step 4).
        stages[1].status = StageStatus::Running;
        let started = Instant::now();
        let target_weights = self.optimizer.run();
        stages[1].duration_ms = started.elapsed().as_millis();
        let target_weights = match target_weights {
            Ok(weights) => {
                stages[1].status = StageStatus::Completed;
                Some(weights)
            }
            Err(e) => {
                tracing::warn!(error = %e, "optimizer stage failed; proceeding with empty target weights");
                stages[1].status = StageStatus::Failed;
                None
            }
        };

        // Stage 3: Opportunity context (fatal on failure, §4.8 step 5).
        stages[2].status = StageStatus::Running;
        let started = Instant::now();
        let ctx = self.context_builder.build(target_weights);
        stages[2].duration_ms = started.elapsed().as_millis();
        let ctx = match ctx {
            Ok(ctx) => {
                stages[2].status = StageStatus::Completed;
                ctx
            }
            Err(e) => {
                stages[2].status = StageStatus::Failed;
                return Err(OrchestratorError { stage: STAGE_NAMES[2], message: e });
            }
        };

        // Stage 4: Create trade plan (C5 + C6 + best-plan selection).
        stages[3].status = StageStatus::Running;
        let started = Instant::now();
        let (plan, output) = self.create_trade_plan(&ctx);
        stages[3].duration_ms = started.elapsed().as_millis();
        stages[3].status = StageStatus::Completed;

        // Stage 5: Store recommendations.
        stages[4].status = StageStatus::Running;
        let started = Instant::now();
        let store_result = self.sink.store(&plan, &output, &portfolio_hash);
        stages[4].duration_ms = started.elapsed().as_millis();
        match store_result {
            Ok(_) => stages[4].status = StageStatus::Completed,
            Err(e) => {
                stages[4].status = StageStatus::Failed;
                return Err(OrchestratorError { stage: STAGE_NAMES[4], message: e });
            }
        }

        let mut events = vec![PlannerEvent::PlanGenerated(PlanGeneratedEvent {
            portfolio_hash: portfolio_hash.clone(),
            steps: plan.steps.len(),
            end_score: plan.end_state_score,
            improvement: plan.improvement(),
            feasible: plan.feasible,
        })];
        if !plan.steps.is_empty() {
            events.push(PlannerEvent::RecommendationsReady(RecommendationsReadyEvent {
                portfolio_hash: portfolio_hash.clone(),
                count: plan.steps.len(),
            }));
        }

        Ok(CycleReport {
            stages,
            portfolio_hash: Some(portfolio_hash),
            plan: Some(plan),
            events,
        })
    }

    fn create_trade_plan(&self, ctx: &OpportunityContext) -> (HolisticPlan, PlanningOutput) {
        let output = hplan_planner::plan(PlanningInputs {
            ctx,
            cooloff: self.cooloff,
            quality_gate: None,
            calculators: self.calculators,
            patterns: self.patterns,
            filters: self.filters,
            settings: &self.config.planner,
        });

        let evaluator_settings = EvaluatorSettings {
            worker_count: self.config.evaluator.worker_count,
            evaluation_mode: self.config.planner.evaluation_mode,
            cost_penalty_factor: self.config.planner.cost_penalty_factor,
            transaction_cost_fixed_eur: self.config.planner.transaction_cost_fixed_eur,
            transaction_cost_percent: self.config.planner.transaction_cost_percent,
            allow_negative_cash: false,
            stochastic_scenarios: self.config.planner.stochastic_scenarios,
            monte_carlo_paths: self.config.planner.monte_carlo_paths,
        };

        // The empty sequence's own evaluation is the current state's score:
        // zero actions applied, scored the same way any candidate would be.
        let baseline = hplan_evaluator::evaluate_batch(
            &[hplan_schemas::ActionSequence::default()],
            ctx,
            &evaluator_settings,
            None,
        );
        let current_score = baseline.first().map(|e| e.end_state_score).unwrap_or(0.0);

        if output.sequences.is_empty() {
            return (HolisticPlan::empty(current_score), output);
        }

        let progress: &ProgressCallback<'_> = &|current, total, message| {
            tracing::debug!(stage = "Create trade plan", current, total, message, "sequence evaluated");
        };

        let evaluations = hplan_evaluator::evaluate_batch(&output.sequences, ctx, &evaluator_settings, Some(progress));
        let best_idx = hplan_evaluator::select_best(&evaluations, self.config.planner.evaluation_mode);

        let plan = match best_idx {
            Some(idx) => {
                let best = &evaluations[idx];
                let steps = best
                    .sequence
                    .actions
                    .iter()
                    .map(|a| HolisticStep {
                        symbol: a.symbol.clone(),
                        isin: a.isin.clone(),
                        name: ctx
                            .securities
                            .get(&a.isin)
                            .map(|s| s.name.clone())
                            .unwrap_or_else(|| a.symbol.as_str().to_string()),
                        side: a.side,
                        quantity: a.quantity,
                        estimated_price_eur_micros: a.estimated_price_eur_micros,
                        estimated_value_eur_micros: a.value_eur_micros,
                        currency: a.currency.clone(),
                        reason: a.reason.clone(),
                    })
                    .collect();
                HolisticPlan {
                    steps,
                    current_score,
                    end_state_score: best.end_state_score,
                    feasible: best.feasible,
                }
            }
            None => HolisticPlan::empty(current_score),
        };

        (plan, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hplan_planner::calculators::default_calculators;
    use hplan_planner::patterns::default_patterns;

    struct FixedHasher;
    impl PortfolioHasher for FixedHasher {
        fn compute(&self) -> Result<PortfolioFingerprint, String> {
            Ok(PortfolioFingerprint("fixed-hash".to_string()))
        }
    }

    struct FailingHasher;
    impl PortfolioHasher for FailingHasher {
        fn compute(&self) -> Result<PortfolioFingerprint, String> {
            Err("db unreachable".to_string())
        }
    }

    struct FailingOptimizer;
    impl OptimizerRunner for FailingOptimizer {
        fn run(&self) -> Result<BTreeMap<Isin, f64>, String> {
            Err("no eligible securities".to_string())
        }
    }

    struct EmptyContextBuilder;
    impl ContextBuilder for EmptyContextBuilder {
        fn build(&self, _target_weights: Option<BTreeMap<Isin, f64>>) -> Result<OpportunityContext, String> {
            Ok(OpportunityContext::default())
        }
    }

    struct RecordingSink {
        invalidated: std::sync::atomic::AtomicBool,
    }
    impl RecommendationSink for RecordingSink {
        fn invalidate_prior_cycle(&self) -> Result<(), String> {
            self.invalidated.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        fn store(
            &self,
            plan: &HolisticPlan,
            _output: &PlanningOutput,
            _portfolio_hash: &PortfolioFingerprint,
        ) -> Result<usize, String> {
            Ok(plan.steps.len())
        }
    }

    #[test]
    fn empty_context_yields_empty_feasible_plan() {
        let hasher = FixedHasher;
        let optimizer = FailingOptimizer;
        let context_builder = EmptyContextBuilder;
        let sink = RecordingSink { invalidated: std::sync::atomic::AtomicBool::new(false) };
        let calculators = default_calculators();
        let patterns = default_patterns();
        let filters: Vec<Box<dyn SequenceFilter>> = Vec::new();
        let cooloff = CooloffWindows::default();
        let config = PlannerConfig::default();

        let orchestrator = Orchestrator {
            hasher: &hasher,
            optimizer: &optimizer,
            context_builder: &context_builder,
            sink: &sink,
            calculators: &calculators,
            patterns: &patterns,
            filters: &filters,
            cooloff: &cooloff,
            config: &config,
        };

        let report = orchestrator.run_cycle().unwrap();
        assert!(sink.invalidated.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(report.stages[1].status, StageStatus::Failed);
        assert_eq!(report.stages[2].status, StageStatus::Completed);
        assert_eq!(report.plan.unwrap().steps.len(), 0);
        assert_eq!(report.events.len(), 1);
    }

    #[test]
    fn portfolio_hash_failure_aborts_before_later_stages() {
        let hasher = FailingHasher;
        let optimizer = FailingOptimizer;
        let context_builder = EmptyContextBuilder;
        let sink = RecordingSink { invalidated: std::sync::atomic::AtomicBool::new(false) };
        let calculators = default_calculators();
        let patterns = default_patterns();
        let filters: Vec<Box<dyn SequenceFilter>> = Vec::new();
        let cooloff = CooloffWindows::default();
        let config = PlannerConfig::default();

        let orchestrator = Orchestrator {
            hasher: &hasher,
            optimizer: &optimizer,
            context_builder: &context_builder,
            sink: &sink,
            calculators: &calculators,
            patterns: &patterns,
            filters: &filters,
            cooloff: &cooloff,
            config: &config,
        };

        let result = orchestrator.run_cycle();
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().stage, STAGE_NAMES[0]);
    }
}
