pub mod collection;

use anyhow::Result;
use chrono::Utc;
use sqlx::{migrate::MigrateDatabase, Pool, Sqlite, SqlitePool};
use std::path::Path;
use tracing::{info, warn};

use crate::models::{ArtCacheRow, CardIdentity, CollectionRecord, OcrCacheRow};
use crate::scanner::art_hash::ArtHash;

/// Handle to the identification caches and the collection table.
///
/// Opened once per run and shared by every component that reads or writes
/// the store.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        if !Sqlite::database_exists(database_url).await? {
            info!("Creating database: {}", database_url);
            Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePool::connect(database_url).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn cache_ocr_identity(&self, ocr_text: &str, identity: &CardIdentity) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO ocr_cache (ocr_text, name, external_id, uri, set_code, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(ocr_text)
        .bind(&identity.name)
        .bind(&identity.external_id)
        .bind(&identity.external_uri)
        .bind(&identity.set_code)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(())
    }

    pub async fn lookup_ocr_cache(&self, ocr_text: &str) -> Result<Option<CardIdentity>> {
        let row = sqlx::query_as::<_, OcrCacheRow>(
            r#"
            SELECT name, external_id, uri, set_code FROM ocr_cache WHERE ocr_text = ?1
            "#,
        )
        .bind(ocr_text)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CardIdentity::from))
    }

    pub async fn cache_art_identity(&self, hash: &ArtHash, identity: &CardIdentity) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO art_cache (hash, name, external_id, uri, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(hash.to_string())
        .bind(&identity.name)
        .bind(&identity.external_id)
        .bind(&identity.external_uri)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(())
    }

    /// Every art-cache entry with a parseable hash. Art entries carry no set code.
    pub async fn art_cache_entries(&self) -> Result<Vec<(ArtHash, CardIdentity)>> {
        let rows = sqlx::query_as::<_, ArtCacheRow>(
            r#"
            SELECT hash, name, external_id, uri FROM art_cache ORDER BY hash
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            match row.hash.parse::<ArtHash>() {
                Ok(hash) => entries.push((
                    hash,
                    CardIdentity {
                        name: row.name,
                        external_id: row.external_id,
                        external_uri: row.uri,
                        set_code: None,
                    },
                )),
                Err(e) => warn!("Skipping art cache entry with bad hash {:?}: {}", row.hash, e),
            }
        }
        Ok(entries)
    }

    pub async fn upsert_collection(
        &self,
        name: &str,
        owned_count: u32,
        identity: Option<&CardIdentity>,
    ) -> Result<()> {
        collection::upsert(&self.pool, name, owned_count, identity).await
    }

    pub async fn export_collection(&self) -> Result<Vec<CollectionRecord>> {
        collection::export(&self.pool).await
    }

    pub async fn write_collection_csv(&self, path: &Path) -> Result<usize> {
        let records = self.export_collection().await?;
        collection::write_csv(&records, path).await?;
        Ok(records.len())
    }
}
