//! `hplan db` command handlers.

use anyhow::Result;

pub async fn status() -> Result<()> {
    let pool = hplan_db::connect_from_env().await?;
    let s = hplan_db::status(&pool).await?;
    println!("db_ok={}", s.ok);
    println!("has_recommendations_table={}", s.has_recommendations_table);
    Ok(())
}

pub async fn migrate() -> Result<()> {
    let pool = hplan_db::connect_from_env().await?;
    hplan_db::migrate(&pool).await?;
    println!("migrations_applied=true");
    Ok(())
}
