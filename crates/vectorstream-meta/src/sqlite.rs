//! SQLite-backed meta KV.
//!
//! Single-process deployments persist coordinator metadata in one SQLite
//! table; the atomic multi-save maps onto a transaction and
//! compare-and-swap onto a guarded `UPDATE`. WAL mode lets the read path
//! serve concurrently with flush-report writes.
//!
//! Queries use the runtime API (`sqlx::query` with binds) rather than the
//! compile-time checked macros so the crate builds without a prepared
//! database.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;

use crate::error::Result;
use crate::kv::MetaKv;

pub struct SqliteMetaKv {
    pool: SqlitePool,
}

impl SqliteMetaKv {
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))
                .map_err(sqlx::Error::from)?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. Pinned to a single connection:
    /// every `sqlite::memory:` connection is its own database.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn init_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS meta_kv (
                key   TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Smallest string strictly greater than every key with this prefix.
    fn prefix_upper_bound(prefix: &str) -> String {
        format!("{prefix}\u{10FFFF}")
    }
}

#[async_trait]
impl MetaKv for SqliteMetaKv {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM meta_kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>(0)))
    }

    async fn load_with_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        // Range scan instead of LIKE: channel names may contain
        // LIKE wildcards such as '_'.
        let rows = sqlx::query(
            "SELECT key, value FROM meta_kv WHERE key >= ? AND key < ? ORDER BY key",
        )
        .bind(prefix)
        .bind(Self::prefix_upper_bound(prefix))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>(0), r.get::<Vec<u8>, _>(1)))
            .collect())
    }

    async fn save(&self, key: &str, value: Vec<u8>) -> Result<()> {
        sqlx::query(
            "INSERT INTO meta_kv (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn multi_save(&self, kvs: Vec<(String, Vec<u8>)>) -> Result<()> {
        self.multi_save_and_remove(kvs, Vec::new()).await
    }

    async fn multi_save_and_remove(
        &self,
        saves: Vec<(String, Vec<u8>)>,
        removals: Vec<String>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (key, value) in saves {
            sqlx::query(
                "INSERT INTO meta_kv (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        for key in removals {
            sqlx::query("DELETE FROM meta_kv WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expect: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool> {
        let affected = match expect {
            None => {
                sqlx::query("INSERT OR IGNORE INTO meta_kv (key, value) VALUES (?, ?)")
                    .bind(key)
                    .bind(value)
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
            }
            Some(expected) => {
                sqlx::query("UPDATE meta_kv SET value = ? WHERE key = ? AND value = ?")
                    .bind(value)
                    .bind(key)
                    .bind(expected)
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
            }
        };
        Ok(affected == 1)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM meta_kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
