//! Reference catalog stores
//!
//! Reference catalogs are ingested by an external loader and only read here.

use super::{dec_band, ReferenceCatalog};
use crate::geometry::{angular_separation, SkyPosition};
use crate::models::ReferenceSource;
use async_trait::async_trait;
use skycat_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Reference catalogs held in memory, keyed by catalog name
#[derive(Debug, Clone, Default)]
pub struct MemoryReferenceCatalog {
    catalogs: HashMap<String, Vec<ReferenceSource>>,
}

impl MemoryReferenceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source: ReferenceSource) {
        self.catalogs
            .entry(source.catalog.clone())
            .or_default()
            .push(source);
    }

    pub fn with_sources(sources: impl IntoIterator<Item = ReferenceSource>) -> Self {
        let mut catalog = Self::new();
        for source in sources {
            catalog.insert(source);
        }
        catalog
    }
}

#[async_trait]
impl ReferenceCatalog for MemoryReferenceCatalog {
    async fn search(
        &self,
        center: SkyPosition,
        radius_deg: f64,
        catalog: &str,
    ) -> Result<Vec<ReferenceSource>> {
        Ok(self
            .catalogs
            .get(catalog)
            .map(|sources| {
                sources
                    .iter()
                    .filter(|s| angular_separation(center, s.position()) <= radius_deg)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Reference catalogs read from the `reference_source` table
#[derive(Debug, Clone)]
pub struct SqliteReferenceCatalog {
    pool: SqlitePool,
}

impl SqliteReferenceCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self> {
        let pool = skycat_common::db::init_database(path).await?;
        Ok(Self::new(pool))
    }

    /// Bulk insert, replacing entries with the same (catalog, source_id)
    pub async fn insert_sources(&self, sources: &[ReferenceSource]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::from_store)?;
        for source in sources {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO reference_source (catalog, source_id, ra, e_ra, dec, e_dec)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&source.catalog)
            .bind(&source.source_id)
            .bind(source.ra_deg)
            .bind(source.ra_err_deg)
            .bind(source.dec_deg)
            .bind(source.dec_err_deg)
            .execute(&mut *tx)
            .await
            .map_err(Error::from_store)?;
        }
        tx.commit().await.map_err(Error::from_store)?;

        info!(count = sources.len(), "Loaded reference sources");
        Ok(())
    }
}

#[async_trait]
impl ReferenceCatalog for SqliteReferenceCatalog {
    async fn search(
        &self,
        center: SkyPosition,
        radius_deg: f64,
        catalog: &str,
    ) -> Result<Vec<ReferenceSource>> {
        let (lo, hi) = dec_band(center, radius_deg);
        let rows = sqlx::query(
            r#"
            SELECT catalog, source_id, ra, e_ra, dec, e_dec
            FROM reference_source
            WHERE catalog = ? AND dec BETWEEN ? AND ?
            "#,
        )
        .bind(catalog)
        .bind(lo)
        .bind(hi)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::from_store)?;

        let mut results = Vec::new();
        for row in rows {
            let source = ReferenceSource {
                catalog: row.try_get("catalog").map_err(Error::from_store)?,
                source_id: row.try_get("source_id").map_err(Error::from_store)?,
                ra_deg: row.try_get("ra").map_err(Error::from_store)?,
                dec_deg: row.try_get("dec").map_err(Error::from_store)?,
                ra_err_deg: row.try_get("e_ra").map_err(Error::from_store)?,
                dec_err_deg: row.try_get("e_dec").map_err(Error::from_store)?,
            };
            if angular_separation(center, source.position()) <= radius_deg {
                results.push(source);
            }
        }
        Ok(results)
    }
}
