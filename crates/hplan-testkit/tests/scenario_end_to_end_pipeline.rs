//! Drives the full C1-C8 pipeline through `hplan_orchestrator::Orchestrator`
//! with in-memory fakes for every seam trait — no database, no broker, no
//! network. Exercises cross-crate EUR purity end-to-end: a Hong Kong
//! dollar-denominated position must come out the other end valued in EUR
//! via the same conversion path covered in isolation by `hplan-fx`'s own
//! Scenario 1 test.

use std::collections::BTreeMap;
use std::sync::Mutex;

use hplan_config::PlannerConfig;
use hplan_context::{CashBalances, ContextInputs, ScoreMaps};
use hplan_marketdata::InMemoryPriceCache;
use hplan_orchestrator::{ContextBuilder, Orchestrator, OptimizerRunner, PortfolioHasher, RecommendationSink};
use hplan_planner::calculators::default_calculators;
use hplan_planner::patterns::default_patterns;
use hplan_planner::filters::SequenceFilter;
use hplan_planner::prefilter::CooloffWindows;
use hplan_planner::PlanningOutput;
use hplan_schemas::{HolisticPlan, Isin, OpportunityContext, PortfolioFingerprint};
use hplan_testkit::{always_open_clock, hkd_rate_provider, position_native_only, security, FixedGroupingRepo, FixedPositionsRepo, FixedQuoteProvider, FixedSecuritiesRepo};

struct FixedHasher;
impl PortfolioHasher for FixedHasher {
    fn compute(&self) -> Result<PortfolioFingerprint, String> {
        Ok(PortfolioFingerprint("end-to-end-fixture".to_string()))
    }
}

struct EmptyOptimizer;
impl OptimizerRunner for EmptyOptimizer {
    fn run(&self) -> Result<BTreeMap<Isin, f64>, String> {
        Ok(BTreeMap::new())
    }
}

struct FixtureContextBuilder {
    positions_repo: FixedPositionsRepo,
    securities_repo: FixedSecuritiesRepo,
    grouping_repo: FixedGroupingRepo,
    quote_provider: FixedQuoteProvider,
}

impl ContextBuilder for FixtureContextBuilder {
    fn build(&self, target_weights: Option<BTreeMap<Isin, f64>>) -> Result<OpportunityContext, String> {
        let mut cache = InMemoryPriceCache::new();
        let rates = hkd_rate_provider();
        let clock = always_open_clock();

        hplan_context::build_context(ContextInputs {
            positions_repo: &self.positions_repo,
            securities_repo: &self.securities_repo,
            grouping_repo: &self.grouping_repo,
            cash: CashBalances {
                eur: 5_000.0,
                by_currency: BTreeMap::new(),
            },
            scores: ScoreMaps::default(),
            optimizer_target_weights: target_weights,
            price_cache: &mut cache,
            quote_provider: &self.quote_provider,
            rate_provider: &rates,
            market_clock: &clock,
            now: chrono::Utc::now(),
        })
        .map_err(|e| e.to_string())
    }
}

#[derive(Default)]
struct RecordingSink {
    invalidated: Mutex<bool>,
    stored_steps: Mutex<Option<usize>>,
}

impl RecommendationSink for RecordingSink {
    fn invalidate_prior_cycle(&self) -> Result<(), String> {
        *self.invalidated.lock().unwrap() = true;
        Ok(())
    }

    fn store(
        &self,
        plan: &HolisticPlan,
        _output: &PlanningOutput,
        _portfolio_hash: &PortfolioFingerprint,
    ) -> Result<usize, String> {
        *self.stored_steps.lock().unwrap() = Some(plan.steps.len());
        Ok(plan.steps.len())
    }
}

#[test]
fn full_cycle_with_hkd_position_runs_end_to_end_in_eur() {
    let securities = FixedSecuritiesRepo(vec![
        security("HK0000069689", "0700", "HKD"),
        security("US0378331005", "AAPL", "USD"),
    ]);
    let positions = FixedPositionsRepo(vec![position_native_only(
        "HK0000069689",
        "0700",
        100.0,
        "HKD",
        0.115,
        320.0,
        280.0,
    )]);
    let grouping = FixedGroupingRepo::default();
    let quotes = FixedQuoteProvider::new();

    let context_builder = FixtureContextBuilder {
        positions_repo: positions,
        securities_repo: securities,
        grouping_repo: grouping,
        quote_provider: quotes,
    };

    let hasher = FixedHasher;
    let optimizer = EmptyOptimizer;
    let sink = RecordingSink::default();
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

    let report = orchestrator.run_cycle().expect("cycle should not abort");

    assert!(*sink.invalidated.lock().unwrap());
    assert!(sink.stored_steps.lock().unwrap().is_some());
    assert_eq!(report.portfolio_hash, Some(PortfolioFingerprint("end-to-end-fixture".to_string())));

    // HKD position converted at 0.115 EUR/HKD: 100 shares * 320 * 0.115.
    let expected_value_eur_micros = (100.0_f64 * 320.0 * 0.115 * hplan_schemas::MICROS_SCALE as f64).round() as i64;
    let ctx = context_builder.build(None).unwrap();
    let enriched = ctx
        .positions
        .iter()
        .find(|p| p.isin == Isin::new("HK0000069689"))
        .expect("HKD position survives context build");
    assert_eq!(enriched.value_eur_micros, expected_value_eur_micros);

    assert!(report.plan.is_some());
}
