use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use tracing::info;

use shared::{CoreError, CoreResult};

use crate::models::{NewStockLevel, StockLevelRow};
use crate::schema::stock_levels;

pub type DbPool = Pool<AsyncPgConnection>;

/// Internal stock administration: seed and adjust on-hand quantities.
/// Reservation traffic goes through the Kafka-driven engine instead.
#[derive(Clone)]
pub struct StockService {
    pool: DbPool,
}

impl StockService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(
        &self,
    ) -> CoreResult<diesel_async::pooled_connection::bb8::PooledConnection<'_, AsyncPgConnection>>
    {
        self.pool
            .get()
            .await
            .map_err(|e| CoreError::Persistence(e.to_string()))
    }

    pub async fn get_stock(&self, sku: &str) -> CoreResult<StockLevelRow> {
        let mut conn = self.conn().await?;
        stock_levels::table
            .find(sku)
            .first(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| CoreError::not_found("stock level", sku))
    }

    /// Applies `delta` to the available quantity of `sku`, creating the row on
    /// first use. The update is version-checked, so two concurrent adjustments
    /// against the same row surface as a `Conflict` rather than a lost write.
    pub async fn adjust_stock(&self, sku: &str, delta: i32) -> CoreResult<StockLevelRow> {
        let mut conn = self.conn().await?;

        let existing: Option<StockLevelRow> = stock_levels::table
            .find(sku)
            .first(&mut conn)
            .await
            .optional()?;

        let row: StockLevelRow = match existing {
            None => {
                if delta < 0 {
                    return Err(CoreError::Validation(format!(
                        "cannot remove stock from unknown sku {sku}"
                    )));
                }
                diesel::insert_into(stock_levels::table)
                    .values(&NewStockLevel {
                        sku: sku.to_string(),
                        available: delta,
                        reserved: 0,
                        version: 0,
                    })
                    .execute(&mut conn)
                    .await?;
                stock_levels::table.find(sku).first(&mut conn).await?
            }
            Some(stock) => {
                let new_available = stock.available + delta;
                if new_available < 0 {
                    return Err(CoreError::Validation(format!(
                        "adjustment of {delta} would leave sku {sku} at {new_available} available"
                    )));
                }
                let updated = diesel::update(
                    stock_levels::table
                        .find(sku)
                        .filter(stock_levels::version.eq(stock.version)),
                )
                .set((
                    stock_levels::available.eq(new_available),
                    stock_levels::version.eq(stock.version + 1),
                    stock_levels::updated_at.eq(Utc::now()),
                ))
                .execute(&mut conn)
                .await?;
                if updated == 0 {
                    return Err(CoreError::conflict("stock level", sku));
                }
                stock_levels::table.find(sku).first(&mut conn).await?
            }
        };

        info!(
            sku = %row.sku,
            delta,
            available = row.available,
            reserved = row.reserved,
            "stock adjusted"
        );
        Ok(row)
    }
}
