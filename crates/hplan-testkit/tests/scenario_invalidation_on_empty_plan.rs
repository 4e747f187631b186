//! Scenario 5 (spec §8): a cycle that produces a zero-step plan must still
//! dismiss every previously pending recommendation and clear the planner
//! scratchpad — invalidation runs unconditionally, not only when new
//! recommendations are about to replace old ones. Requires
//! `HPLAN_DATABASE_URL`; skips with a diagnostic if absent.

use hplan_schemas::{HolisticPlan, PortfolioFingerprint, Recommendation, RecommendationStatus, Side};

fn sample_pending(n: usize) -> Vec<Recommendation> {
    (0..n)
        .map(|i| Recommendation {
            uuid: uuid::Uuid::new_v4(),
            symbol: hplan_schemas::Symbol::new(format!("SYM{i}")),
            isin: hplan_schemas::Isin::new(format!("ISIN{i}")),
            name: format!("Security {i}"),
            side: Side::Buy,
            quantity: 1.0,
            estimated_price_eur_micros: 1_000_000,
            estimated_value_eur_micros: 1_000_000,
            reason: "fixture".to_string(),
            currency: "EUR".to_string(),
            priority: i as f64,
            current_portfolio_score: 0.0,
            new_portfolio_score: 0.0,
            score_change: 0.0,
            status: RecommendationStatus::Pending,
            portfolio_hash: PortfolioFingerprint(format!("hash-{i}")),
            retry_count: 0,
            failure_reason: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        })
        .collect()
}

async fn insert_pending(pool: &sqlx::PgPool, recs: &[Recommendation]) -> anyhow::Result<()> {
    let plan = HolisticPlan {
        steps: recs
            .iter()
            .map(|r| hplan_schemas::HolisticStep {
                symbol: r.symbol.clone(),
                isin: r.isin.clone(),
                name: r.name.clone(),
                side: r.side,
                quantity: r.quantity as i64,
                estimated_price_eur_micros: r.estimated_price_eur_micros,
                estimated_value_eur_micros: r.estimated_value_eur_micros,
                currency: r.currency.clone(),
                reason: r.reason.clone(),
            })
            .collect(),
        current_score: 0.0,
        end_state_score: 0.0,
        feasible: true,
    };
    hplan_store::store_plan(pool, &plan, &PortfolioFingerprint("seed-cycle".to_string())).await?;
    Ok(())
}

#[tokio::test]
async fn zero_step_plan_still_dismisses_all_pending_recommendations() -> anyhow::Result<()> {
    let url = match std::env::var(hplan_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: HPLAN_DATABASE_URL not set");
            return Ok(());
        }
    };

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await?;
    hplan_db::migrate(&pool).await?;

    // Clean slate, then seed five pending recommendations from a prior cycle.
    hplan_store::invalidate_prior_cycle(&pool).await?;
    let seeded = sample_pending(5);
    insert_pending(&pool, &seeded).await?;

    let before = hplan_store::get_pending_recommendations(&pool).await?;
    assert_eq!(before.len(), 5);

    // A new cycle that finds nothing worth recommending (§4.8 empty plan path).
    let dismissed = hplan_store::invalidate_prior_cycle(&pool).await?;
    assert_eq!(dismissed, 5);

    let after = hplan_store::get_pending_recommendations(&pool).await?;
    assert!(after.is_empty());

    // Invalidation is idempotent: a second call against an already-empty
    // pending set dismisses nothing and does not error.
    let dismissed_again = hplan_store::invalidate_prior_cycle(&pool).await?;
    assert_eq!(dismissed_again, 0);

    Ok(())
}
