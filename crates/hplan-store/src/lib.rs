//! Recommendation store & invalidator (C7, §4.7).
//!
//! Grounded on `mqk-db`'s `sqlx::query`/`query_as` binding style and
//! transactional `insert_run`/`insert_audit_event` idiom, adapted from
//! run-lifecycle bookkeeping to the invalidate-then-insert cycle described
//! in §4.7: every cycle unconditionally dismisses prior pending
//! recommendations and clears the planner scratchpad before persisting the
//! new plan's recommendations and rejection traces.

use anyhow::{Context, Result};
use chrono::Utc;
use hplan_schemas::{
    HolisticPlan, PortfolioFingerprint, PreFilteredSecurity, Recommendation, RecommendationStatus,
    RejectedOpportunity, RejectedSequence, Side,
};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

/// §4.7 step 1: mark every non-terminal recommendation as dismissed.
/// Unconditional — the trigger for running a cycle already invalidates
/// whatever was pending.
pub async fn dismiss_all_pending(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        update recommendations
        set status = 'dismissed', updated_at = now()
        where status = 'pending'
        "#,
    )
    .execute(pool)
    .await
    .context("dismiss_all_pending failed")?;

    Ok(result.rows_affected())
}

/// §4.7 step 2: the planner store is a scratchpad for the current cycle;
/// historical sequences/evaluations/best-results are never consulted
/// across cycles.
pub async fn delete_all_sequences(pool: &PgPool) -> Result<()> {
    sqlx::query("delete from planner_sequences")
        .execute(pool)
        .await
        .context("delete_all_sequences failed")?;
    Ok(())
}

pub async fn delete_all_evaluations(pool: &PgPool) -> Result<()> {
    sqlx::query("delete from planner_evaluations")
        .execute(pool)
        .await
        .context("delete_all_evaluations failed")?;
    Ok(())
}

pub async fn delete_all_best_results(pool: &PgPool) -> Result<()> {
    sqlx::query("delete from planner_best_results")
        .execute(pool)
        .await
        .context("delete_all_best_results failed")?;
    Ok(())
}

/// Run all three scratchpad deletions plus the pending-dismissal in one
/// invalidation pass (§4.7 steps 1-2, run at the top of every cycle).
pub async fn invalidate_prior_cycle(pool: &PgPool) -> Result<u64> {
    let dismissed = dismiss_all_pending(pool).await?;
    delete_all_sequences(pool).await?;
    delete_all_evaluations(pool).await?;
    delete_all_best_results(pool).await?;
    Ok(dismissed)
}

/// §4.7 steps 3-4: if the plan has zero steps, nothing more to do (the
/// dismissal above already leaves an empty pending set). Otherwise insert
/// one Recommendation per step, transactionally, so that a failure partway
/// through never leaves some steps of the same plan recommended and others
/// silently dropped.
pub async fn store_plan(
    pool: &PgPool,
    plan: &HolisticPlan,
    portfolio_hash: &PortfolioFingerprint,
) -> Result<Vec<Recommendation>> {
    if plan.steps.is_empty() {
        return Ok(Vec::new());
    }

    let mut tx = pool.begin().await.context("store_plan: begin transaction")?;
    let mut inserted = Vec::with_capacity(plan.steps.len());

    for (priority, step) in plan.steps.iter().enumerate() {
        let now = Utc::now();
        let recommendation = Recommendation {
            uuid: Uuid::new_v4(),
            symbol: step.symbol.clone(),
            isin: step.isin.clone(),
            name: step.name.clone(),
            side: step.side,
            quantity: step.quantity as f64,
            estimated_price_eur_micros: step.estimated_price_eur_micros,
            estimated_value_eur_micros: step.estimated_value_eur_micros,
            reason: step.reason.clone(),
            currency: step.currency.clone(),
            priority: priority as f64,
            current_portfolio_score: plan.current_score,
            new_portfolio_score: plan.end_state_score,
            score_change: plan.improvement(),
            status: RecommendationStatus::Pending,
            portfolio_hash: portfolio_hash.clone(),
            retry_count: 0,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };

        insert_recommendation(&mut tx, &recommendation)
            .await
            .context("store_plan: insert recommendation")?;
        inserted.push(recommendation);
    }

    tx.commit().await.context("store_plan: commit")?;
    Ok(inserted)
}

async fn insert_recommendation(
    tx: &mut Transaction<'_, Postgres>,
    r: &Recommendation,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into recommendations (
            uuid, symbol, isin, name, side, quantity, estimated_price_eur_micros,
            estimated_value_eur_micros, reason, currency, priority,
            current_portfolio_score, new_portfolio_score, score_change,
            status, portfolio_hash, retry_count, failure_reason, created_at, updated_at
        ) values (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20
        )
        "#,
    )
    .bind(r.uuid)
    .bind(r.symbol.as_str())
    .bind(r.isin.as_str())
    .bind(&r.name)
    .bind(r.side.as_str())
    .bind(r.quantity)
    .bind(r.estimated_price_eur_micros)
    .bind(r.estimated_value_eur_micros)
    .bind(&r.reason)
    .bind(&r.currency)
    .bind(r.priority)
    .bind(r.current_portfolio_score)
    .bind(r.new_portfolio_score)
    .bind(r.score_change)
    .bind(r.status.as_str())
    .bind(r.portfolio_hash.0.clone())
    .bind(r.retry_count)
    .bind(&r.failure_reason)
    .bind(r.created_at)
    .bind(r.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// §4.7 step 5: persist explainability traces with the same PortfolioHash.
pub async fn store_rejected_opportunities(
    pool: &PgPool,
    items: &[RejectedOpportunity],
    portfolio_hash: &PortfolioFingerprint,
) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await.context("store_rejected_opportunities: begin")?;
    for item in items {
        sqlx::query(
            r#"
            insert into rejected_opportunities (isin, symbol, category, reason, portfolio_hash, created_at)
            values ($1, $2, $3, $4, $5, now())
            "#,
        )
        .bind(item.isin.as_str())
        .bind(item.symbol.as_str())
        .bind(&item.category)
        .bind(item.reason.to_string())
        .bind(portfolio_hash.0.clone())
        .execute(&mut *tx)
        .await
        .context("store_rejected_opportunities: insert")?;
    }
    tx.commit().await.context("store_rejected_opportunities: commit")?;
    Ok(())
}

pub async fn store_prefiltered_securities(
    pool: &PgPool,
    items: &[PreFilteredSecurity],
    portfolio_hash: &PortfolioFingerprint,
) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await.context("store_prefiltered_securities: begin")?;
    for item in items {
        sqlx::query(
            r#"
            insert into prefiltered_securities (isin, symbol, reason, portfolio_hash, created_at)
            values ($1, $2, $3, $4, now())
            "#,
        )
        .bind(item.isin.as_str())
        .bind(item.symbol.as_str())
        .bind(item.reason.to_string())
        .bind(portfolio_hash.0.clone())
        .execute(&mut *tx)
        .await
        .context("store_prefiltered_securities: insert")?;
    }
    tx.commit().await.context("store_prefiltered_securities: commit")?;
    Ok(())
}

pub async fn store_rejected_sequences(
    pool: &PgPool,
    items: &[RejectedSequence],
    portfolio_hash: &PortfolioFingerprint,
) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await.context("store_rejected_sequences: begin")?;
    for item in items {
        let sequence_json = serde_json::to_value(&item.sequence).context("serialize rejected sequence")?;
        sqlx::query(
            r#"
            insert into rejected_sequences (sequence_json, filter_name, reason, portfolio_hash, created_at)
            values ($1, $2, $3, $4, now())
            "#,
        )
        .bind(sequence_json)
        .bind(&item.filter_name)
        .bind(item.reason.to_string())
        .bind(portfolio_hash.0.clone())
        .execute(&mut *tx)
        .await
        .context("store_rejected_sequences: insert")?;
    }
    tx.commit().await.context("store_rejected_sequences: commit")?;
    Ok(())
}

/// Ordered by Priority asc then created_at asc, per §4.7/§6.
pub async fn get_pending_recommendations(pool: &PgPool) -> Result<Vec<Recommendation>> {
    let rows = sqlx::query_as::<_, RecommendationRow>(
        r#"
        select uuid, symbol, isin, name, side, quantity, estimated_price_eur_micros,
               estimated_value_eur_micros, reason, currency, priority,
               current_portfolio_score, new_portfolio_score, score_change,
               status, portfolio_hash, retry_count, failure_reason, created_at, updated_at
        from recommendations
        where status = 'pending'
        order by priority asc, created_at asc
        "#,
    )
    .fetch_all(pool)
    .await
    .context("get_pending_recommendations failed")?;

    rows.into_iter().map(TryInto::try_into).collect()
}

pub async fn record_failed_attempt(pool: &PgPool, uuid: Uuid, reason: &str) -> Result<()> {
    sqlx::query(
        r#"
        update recommendations
        set retry_count = retry_count + 1, failure_reason = $2, updated_at = now()
        where uuid = $1
        "#,
    )
    .bind(uuid)
    .bind(reason)
    .execute(pool)
    .await
    .context("record_failed_attempt failed")?;
    Ok(())
}

pub async fn mark_failed(pool: &PgPool, uuid: Uuid, reason: &str) -> Result<()> {
    sqlx::query(
        r#"
        update recommendations
        set status = 'failed', failure_reason = $2, updated_at = now()
        where uuid = $1
        "#,
    )
    .bind(uuid)
    .bind(reason)
    .execute(pool)
    .await
    .context("mark_failed failed")?;
    Ok(())
}

pub async fn mark_executed(pool: &PgPool, uuid: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        update recommendations
        set status = 'executed', updated_at = now()
        where uuid = $1
        "#,
    )
    .bind(uuid)
    .execute(pool)
    .await
    .context("mark_executed failed")?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct RecommendationRow {
    uuid: Uuid,
    symbol: String,
    isin: String,
    name: String,
    side: String,
    quantity: f64,
    estimated_price_eur_micros: i64,
    estimated_value_eur_micros: i64,
    reason: String,
    currency: String,
    priority: f64,
    current_portfolio_score: f64,
    new_portfolio_score: f64,
    score_change: f64,
    status: String,
    portfolio_hash: String,
    retry_count: i32,
    failure_reason: Option<String>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl TryFrom<RecommendationRow> for Recommendation {
    type Error = anyhow::Error;

    fn try_from(row: RecommendationRow) -> Result<Self> {
        let side = match row.side.as_str() {
            "BUY" => Side::Buy,
            "SELL" => Side::Sell,
            other => anyhow::bail!("unknown side in recommendations row: {other}"),
        };
        let status = match row.status.as_str() {
            "pending" => RecommendationStatus::Pending,
            "executed" => RecommendationStatus::Executed,
            "failed" => RecommendationStatus::Failed,
            "dismissed" => RecommendationStatus::Dismissed,
            other => anyhow::bail!("unknown status in recommendations row: {other}"),
        };

        Ok(Recommendation {
            uuid: row.uuid,
            symbol: hplan_schemas::Symbol::new(row.symbol),
            isin: hplan_schemas::Isin::new(row.isin),
            name: row.name,
            side,
            quantity: row.quantity,
            estimated_price_eur_micros: row.estimated_price_eur_micros,
            estimated_value_eur_micros: row.estimated_value_eur_micros,
            reason: row.reason,
            currency: row.currency,
            priority: row.priority,
            current_portfolio_score: row.current_portfolio_score,
            new_portfolio_score: row.new_portfolio_score,
            score_change: row.score_change,
            status,
            portfolio_hash: PortfolioFingerprint(row.portfolio_hash),
            retry_count: row.retry_count,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hplan_schemas::HolisticStep;

    fn sample_plan() -> HolisticPlan {
        HolisticPlan {
            steps: vec![HolisticStep {
                symbol: hplan_schemas::Symbol::new("AAPL"),
                isin: hplan_schemas::Isin::new("US0378331005"),
                name: "Apple".to_string(),
                side: Side::Buy,
                quantity: 10,
                estimated_price_eur_micros: 150_000_000,
                estimated_value_eur_micros: 1_500_000_000,
                currency: "USD".to_string(),
                reason: "opportunity".to_string(),
            }],
            current_score: 0.4,
            end_state_score: 0.55,
            feasible: true,
        }
    }

    #[test]
    fn empty_plan_has_no_steps_to_insert() {
        let plan = HolisticPlan::empty(0.4);
        assert!(plan.steps.is_empty());
    }

    #[test]
    fn recommendation_row_roundtrip_rejects_unknown_side() {
        let row = RecommendationRow {
            uuid: Uuid::new_v4(),
            symbol: "AAPL".to_string(),
            isin: "US0378331005".to_string(),
            name: "Apple".to_string(),
            side: "HOLD".to_string(),
            quantity: 1.0,
            estimated_price_eur_micros: 0,
            estimated_value_eur_micros: 0,
            reason: "x".to_string(),
            currency: "EUR".to_string(),
            priority: 0.0,
            current_portfolio_score: 0.0,
            new_portfolio_score: 0.0,
            score_change: 0.0,
            status: "pending".to_string(),
            portfolio_hash: "abc".to_string(),
            retry_count: 0,
            failure_reason: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let result: Result<Recommendation> = row.try_into();
        assert!(result.is_err());
    }

    #[test]
    fn sample_plan_has_one_step_for_priority_assignment() {
        let plan = sample_plan();
        assert_eq!(plan.steps.len(), 1);
        assert!((plan.improvement() - 0.15).abs() < 1e-12);
    }
}
