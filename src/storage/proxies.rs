use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{Proxy, DEAD_PROXY};

impl Database {
    // ========================================================================
    // Proxy Pool Operations
    // ========================================================================

    /// Oldest pool entry, if any.
    pub async fn first_proxy(&self) -> Result<Option<Proxy>> {
        let proxy = sqlx::query_as::<_, Proxy>(
            "SELECT id, address FROM proxies ORDER BY id ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(proxy)
    }

    /// Append addresses to the pool. Duplicates are stored as given.
    pub async fn insert_proxies(&self, addresses: &[String]) -> Result<()> {
        if addresses.is_empty() {
            return Ok(());
        }

        // One bind per row keeps chunks far below SQLite's parameter limit
        const BATCH_SIZE: usize = 500;
        let mut tx = self.pool.begin().await?;

        for chunk in addresses.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("INSERT INTO proxies (address) ");
            builder.push_values(chunk, |mut b, address| {
                b.push_bind(address);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Remove one entry. Returns whether it was still present.
    pub async fn delete_proxy(&self, proxy_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM proxies WHERE id = ?")
            .bind(proxy_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop every sentinel entry. Returns how many were removed.
    pub async fn purge_dead_proxies(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM proxies WHERE address = ?")
            .bind(DEAD_PROXY)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_proxies(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM proxies")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}
