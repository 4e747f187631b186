//! Postgres-backed implementation of `hplan_marketdata::PriceCache` (C2).
//!
//! The trait is synchronous so both production code and tests can share one
//! cache abstraction without threading `async` through the whole pricing
//! path; bridging to `sqlx`'s async pool uses `futures::executor::block_on`,
//! the same pattern the corpus uses to call an async repository from a
//! synchronous trait method.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;

use hplan_marketdata::{CachedPrice, PriceCache};
use hplan_schemas::Isin;

pub struct PostgresPriceCache {
    pool: PgPool,
}

impl PostgresPriceCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn get_async(&self, isin: &Isin) -> Option<CachedPrice> {
        let row: Option<(f64, DateTime<Utc>, i64)> = sqlx::query_as(
            "select eur_price, stored_at, ttl_minutes from price_cache where isin = $1",
        )
        .bind(isin.as_str())
        .fetch_optional(&self.pool)
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "price_cache read failed, treating as miss");
            None
        });

        row.map(|(eur_price, stored_at, ttl_minutes)| CachedPrice {
            eur_price,
            stored_at,
            ttl_minutes,
        })
    }

    async fn put_async(&self, isin: &Isin, price: CachedPrice) {
        let result = sqlx::query(
            r#"
            insert into price_cache (isin, eur_price, stored_at, ttl_minutes)
            values ($1, $2, $3, $4)
            on conflict (isin) do update
                set eur_price = excluded.eur_price,
                    stored_at = excluded.stored_at,
                    ttl_minutes = excluded.ttl_minutes
            "#,
        )
        .bind(isin.as_str())
        .bind(price.eur_price)
        .bind(price.stored_at)
        .bind(price.ttl_minutes)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(error = %e, isin = %isin.as_str(), "price_cache write failed");
        }
    }
}

impl PriceCache for PostgresPriceCache {
    fn get(&self, isin: &Isin) -> Option<CachedPrice> {
        futures::executor::block_on(self.get_async(isin))
    }

    fn put(&mut self, isin: &Isin, price: CachedPrice) {
        futures::executor::block_on(self.put_async(isin, price))
    }
}
