//! `hplan recommendations list` — inspect the pending recommendation queue
//! (Priority asc, then created_at asc, per §6).

use anyhow::Result;

pub async fn list() -> Result<()> {
    let pool = hplan_db::connect_from_env().await?;
    let pending = hplan_store::get_pending_recommendations(&pool).await?;

    if pending.is_empty() {
        println!("no pending recommendations");
        return Ok(());
    }

    for r in pending {
        println!(
            "priority={} symbol={} side={:?} quantity={} reason=\"{}\" uuid={}",
            r.priority, r.symbol, r.side, r.quantity, r.reason, r.uuid
        );
    }

    Ok(())
}
