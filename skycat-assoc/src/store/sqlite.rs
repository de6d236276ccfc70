//! SQLite catalog store
//!
//! Each association transaction is a deferred SQLite transaction: in WAL mode
//! its first read pins a snapshot. Writes are staged in memory and flushed at
//! commit with optimistic version checks, so the write lock is held only for
//! the flush. A lost race (changed version, duplicate detection, lock
//! contention or stale snapshot) surfaces as `WriteConflict`.

use super::{dec_band, CatalogStore, CatalogTransaction};
use crate::geometry::{angular_separation, SkyPosition};
use crate::models::{
    AssociatedSource, CatalogMatch, ConfigClass, FluxDensity, SourceId, SourceShape,
};
use crate::utils::SessionTransaction;
use async_trait::async_trait;
use skycat_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

const SOURCE_COLUMNS: &str = "id, ra, e_ra, dec, e_dec, maj, e_maj, min, e_min, pa, e_pa, \
     flux, e_flux, config_key, beam, num_detections, num_nulls, catalog_id, match_id, \
     min_deruiter, catalogs_checked, matched_catalogs, version";

/// Catalog store backed by the SQLite catalog database
#[derive(Debug, Clone)]
pub struct SqliteCatalogStore {
    pool: SqlitePool,
}

impl SqliteCatalogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating and migrating if needed) the database at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = skycat_common::db::init_database(path).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Number of committed records
    pub async fn count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM assoc_source")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::from_store)
    }
}

#[async_trait]
impl CatalogStore for SqliteCatalogStore {
    async fn begin(&self) -> Result<Box<dyn CatalogTransaction>> {
        let tx = SessionTransaction::open(&self.pool, "sqlite_store::session").await?;
        Ok(Box::new(SqliteTransaction {
            tx,
            staged: BTreeMap::new(),
            processed: None,
        }))
    }

    async fn get(&self, id: SourceId) -> Result<Option<AssociatedSource>> {
        let mut conn = self.pool.acquire().await.map_err(Error::from_store)?;
        let sql = format!("SELECT {} FROM assoc_source WHERE id = ?", SOURCE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await
            .map_err(Error::from_store)?;

        match row {
            Some(row) => Ok(Some(load_source(&mut *conn, &row).await?)),
            None => Ok(None),
        }
    }
}

struct SqliteTransaction {
    tx: SessionTransaction,
    staged: BTreeMap<SourceId, AssociatedSource>,
    processed: Option<(String, usize)>,
}

impl SqliteTransaction {
    async fn select_where(&mut self, sql: &str, param: Option<&str>) -> Result<Vec<AssociatedSource>> {
        let conn = self.tx.conn()?;
        let mut query = sqlx::query(sql);
        if let Some(param) = param {
            query = query.bind(param.to_string());
        }
        let rows = query
            .fetch_all(&mut *conn)
            .await
            .map_err(Error::from_store)?;

        let mut sources = Vec::with_capacity(rows.len());
        for row in &rows {
            sources.push(load_source(&mut *conn, row).await?);
        }
        Ok(sources)
    }

    /// Replace committed rows by their staged versions, add staged records
    /// that now satisfy `keep`, and drop those that no longer do
    fn overlay_staged(
        &self,
        committed: Vec<AssociatedSource>,
        keep: impl Fn(&AssociatedSource) -> bool,
    ) -> Vec<AssociatedSource> {
        let mut results: Vec<AssociatedSource> = committed
            .into_iter()
            .filter(|s| !self.staged.contains_key(&s.id))
            .collect();
        results.extend(self.staged.values().filter(|s| keep(s)).cloned());
        results.sort_by_key(|s| s.id);
        results
    }
}

#[async_trait]
impl CatalogTransaction for SqliteTransaction {
    async fn search(
        &mut self,
        center: SkyPosition,
        radius_deg: f64,
    ) -> Result<Vec<AssociatedSource>> {
        let (lo, hi) = dec_band(center, radius_deg);
        let sql = format!(
            "SELECT {} FROM assoc_source WHERE dec BETWEEN ? AND ?",
            SOURCE_COLUMNS
        );

        let conn = self.tx.conn()?;
        let rows = sqlx::query(&sql)
            .bind(lo)
            .bind(hi)
            .fetch_all(&mut *conn)
            .await
            .map_err(Error::from_store)?;

        let mut results = Vec::new();
        for row in &rows {
            let ra: f64 = row.try_get("ra").map_err(Error::from_store)?;
            let dec: f64 = row.try_get("dec").map_err(Error::from_store)?;
            if angular_separation(center, SkyPosition::new(ra, dec)) > radius_deg {
                continue;
            }
            let source = load_source(&mut *conn, row).await?;
            results.push(self.staged.get(&source.id).cloned().unwrap_or(source));
        }
        results.retain(|s| angular_separation(center, s.position()) <= radius_deg);

        results.extend(
            self.staged
                .values()
                .filter(|s| !s.is_committed())
                .filter(|s| angular_separation(center, s.position()) <= radius_deg)
                .cloned(),
        );
        Ok(results)
    }

    async fn checked_against(&mut self, catalog: &str) -> Result<Vec<AssociatedSource>> {
        let sql = format!(
            "SELECT {} FROM assoc_source \
             WHERE EXISTS (SELECT 1 FROM json_each(assoc_source.catalogs_checked) WHERE value = ?)",
            SOURCE_COLUMNS
        );
        let found = self.select_where(&sql, Some(catalog)).await?;
        Ok(self.overlay_staged(found, |s| s.catalogs_checked.contains(catalog)))
    }

    async fn unmatched(&mut self) -> Result<Vec<AssociatedSource>> {
        let sql = format!(
            "SELECT {} FROM assoc_source WHERE catalog_id IS NULL AND catalogs_checked <> '[]'",
            SOURCE_COLUMNS
        );
        let found = self.select_where(&sql, None).await?;
        Ok(self.overlay_staged(found, |s| s.is_unmatched()))
    }

    async fn contains_detection(&mut self, detection_id: &str) -> Result<bool> {
        if self
            .staged
            .values()
            .any(|s| s.detection_ids.iter().any(|d| d == detection_id))
        {
            return Ok(true);
        }

        let conn = self.tx.conn()?;
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM assoc_detection WHERE detection_id = ?)")
            .bind(detection_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(Error::from_store)
    }

    async fn is_image_processed(&mut self, image_id: &str) -> Result<bool> {
        let conn = self.tx.conn()?;
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM processed_image WHERE image_id = ?)")
            .bind(image_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(Error::from_store)
    }

    async fn upsert(&mut self, source: AssociatedSource) -> Result<()> {
        source.check_invariants()?;
        self.staged.insert(source.id, source);
        Ok(())
    }

    async fn mark_image_processed(&mut self, image_id: &str, num_detections: usize) -> Result<()> {
        self.processed = Some((image_id.to_string(), num_detections));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let SqliteTransaction {
            mut tx,
            staged,
            processed,
        } = *self;

        {
            let conn = tx.conn()?;
            for source in staged.values() {
                write_source(&mut *conn, source).await?;
            }

            if let Some((image_id, num_detections)) = &processed {
                sqlx::query("INSERT INTO processed_image (image_id, num_detections) VALUES (?, ?)")
                    .bind(image_id)
                    .bind(*num_detections as i64)
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| {
                        map_write_error(e, || Error::AlreadyProcessed(image_id.clone()))
                    })?;
            }
        }

        tx.commit().await?;

        debug!(records = staged.len(), "Committed SQLite catalog transaction");
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let SqliteTransaction { tx, staged, .. } = *self;
        tx.rollback().await?;
        debug!(staged = staged.len(), "Aborted SQLite catalog transaction");
        Ok(())
    }
}

/// Unique-constraint violations become `conflict()`; everything else is
/// classified by [`Error::from_store`]
fn map_write_error(err: sqlx::Error, conflict: impl FnOnce() -> Error) -> Error {
    let unique_violation =
        matches!(&err, sqlx::Error::Database(db_err) if db_err.is_unique_violation());
    if unique_violation {
        conflict()
    } else {
        Error::from_store(err)
    }
}

async fn write_source(conn: &mut SqliteConnection, source: &AssociatedSource) -> Result<()> {
    let id = source.id.to_string();
    let checked = serde_json::to_string(&source.catalogs_checked)?;
    let matched = serde_json::to_string(&source.matched_catalogs)?;
    let (catalog_id, match_id, min_deruiter) = match &source.catalog_match {
        Some(m) => (
            Some(m.catalog_id.clone()),
            Some(m.match_id.clone()),
            Some(m.min_separation_statistic),
        ),
        None => (None, None, None),
    };

    if source.version == 0 {
        sqlx::query(
            r#"
            INSERT INTO assoc_source (
                id, ra, e_ra, dec, e_dec, maj, e_maj, min, e_min, pa, e_pa,
                flux, e_flux, config_key, beam, num_detections, num_nulls,
                catalog_id, match_id, min_deruiter, catalogs_checked, matched_catalogs, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(&id)
        .bind(source.ra_deg)
        .bind(source.ra_err_deg)
        .bind(source.dec_deg)
        .bind(source.dec_err_deg)
        .bind(source.shape.maj_arcsec)
        .bind(source.shape.maj_err_arcsec)
        .bind(source.shape.min_arcsec)
        .bind(source.shape.min_err_arcsec)
        .bind(source.shape.pa_deg)
        .bind(source.shape.pa_err_deg)
        .bind(source.flux.value_mjy)
        .bind(source.flux.err_mjy)
        .bind(&source.config.key)
        .bind(source.config.beam_deg)
        .bind(source.num_detections as i64)
        .bind(source.num_nulls as i64)
        .bind(&catalog_id)
        .bind(&match_id)
        .bind(min_deruiter)
        .bind(&checked)
        .bind(&matched)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            map_write_error(e, || {
                Error::WriteConflict(format!("source {} already exists", source.id))
            })
        })?;
    } else {
        let result = sqlx::query(
            r#"
            UPDATE assoc_source SET
                ra = ?, e_ra = ?, dec = ?, e_dec = ?,
                maj = ?, e_maj = ?, min = ?, e_min = ?, pa = ?, e_pa = ?,
                flux = ?, e_flux = ?, num_detections = ?, num_nulls = ?,
                catalog_id = ?, match_id = ?, min_deruiter = ?, catalogs_checked = ?,
                matched_catalogs = ?, version = version + 1, updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(source.ra_deg)
        .bind(source.ra_err_deg)
        .bind(source.dec_deg)
        .bind(source.dec_err_deg)
        .bind(source.shape.maj_arcsec)
        .bind(source.shape.maj_err_arcsec)
        .bind(source.shape.min_arcsec)
        .bind(source.shape.min_err_arcsec)
        .bind(source.shape.pa_deg)
        .bind(source.shape.pa_err_deg)
        .bind(source.flux.value_mjy)
        .bind(source.flux.err_mjy)
        .bind(source.num_detections as i64)
        .bind(source.num_nulls as i64)
        .bind(&catalog_id)
        .bind(&match_id)
        .bind(min_deruiter)
        .bind(&checked)
        .bind(&matched)
        .bind(&id)
        .bind(source.version as i64)
        .execute(&mut *conn)
        .await
        .map_err(Error::from_store)?;

        if result.rows_affected() == 0 {
            return Err(Error::WriteConflict(format!(
                "source {} changed since read (read v{})",
                source.id, source.version
            )));
        }
    }

    // Detection lists only grow: append the ids beyond what is stored
    let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM assoc_detection WHERE assoc_id = ?")
        .bind(&id)
        .fetch_one(&mut *conn)
        .await
        .map_err(Error::from_store)?;

    for (seq, detection_id) in source
        .detection_ids
        .iter()
        .enumerate()
        .skip(stored.max(0) as usize)
    {
        sqlx::query("INSERT INTO assoc_detection (detection_id, assoc_id, seq) VALUES (?, ?, ?)")
            .bind(detection_id)
            .bind(&id)
            .bind(seq as i64)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                map_write_error(e, || {
                    Error::WriteConflict(format!(
                        "detection {} already belongs to another source",
                        detection_id
                    ))
                })
            })?;
    }

    Ok(())
}

async fn load_source(conn: &mut SqliteConnection, row: &SqliteRow) -> Result<AssociatedSource> {
    let id: String = row.try_get("id").map_err(Error::from_store)?;
    let detection_ids: Vec<String> =
        sqlx::query_scalar("SELECT detection_id FROM assoc_detection WHERE assoc_id = ? ORDER BY seq")
            .bind(&id)
            .fetch_all(&mut *conn)
            .await
            .map_err(Error::from_store)?;

    source_from_row(row, detection_ids)
}

fn source_from_row(row: &SqliteRow, detection_ids: Vec<String>) -> Result<AssociatedSource> {
    let get_f64 = |name: &str| -> Result<f64> { row.try_get(name).map_err(Error::from_store) };

    let id: String = row.try_get("id").map_err(Error::from_store)?;
    let id = Uuid::parse_str(&id)
        .map_err(|e| Error::Internal(format!("Invalid source id {}: {}", id, e)))?;

    let catalog_id: Option<String> = row.try_get("catalog_id").map_err(Error::from_store)?;
    let match_id: Option<String> = row.try_get("match_id").map_err(Error::from_store)?;
    let min_deruiter: Option<f64> = row.try_get("min_deruiter").map_err(Error::from_store)?;
    let catalog_match = match (catalog_id, match_id, min_deruiter) {
        (Some(catalog_id), Some(match_id), Some(stat)) => Some(CatalogMatch {
            catalog_id,
            match_id,
            min_separation_statistic: stat,
        }),
        _ => None,
    };

    let checked: String = row.try_get("catalogs_checked").map_err(Error::from_store)?;
    let catalogs_checked: BTreeSet<String> = serde_json::from_str(&checked)?;
    let matched: String = row.try_get("matched_catalogs").map_err(Error::from_store)?;
    let matched_catalogs: BTreeSet<String> = serde_json::from_str(&matched)?;

    let num_detections: i64 = row.try_get("num_detections").map_err(Error::from_store)?;
    let num_nulls: i64 = row.try_get("num_nulls").map_err(Error::from_store)?;
    let version: i64 = row.try_get("version").map_err(Error::from_store)?;
    let config_key: String = row.try_get("config_key").map_err(Error::from_store)?;

    Ok(AssociatedSource {
        id,
        ra_deg: get_f64("ra")?,
        dec_deg: get_f64("dec")?,
        ra_err_deg: get_f64("e_ra")?,
        dec_err_deg: get_f64("e_dec")?,
        shape: SourceShape {
            maj_arcsec: get_f64("maj")?,
            maj_err_arcsec: get_f64("e_maj")?,
            min_arcsec: get_f64("min")?,
            min_err_arcsec: get_f64("e_min")?,
            pa_deg: get_f64("pa")?,
            pa_err_deg: get_f64("e_pa")?,
        },
        flux: FluxDensity {
            value_mjy: get_f64("flux")?,
            err_mjy: get_f64("e_flux")?,
        },
        config: ConfigClass::new(config_key, get_f64("beam")?),
        num_detections: num_detections as u32,
        num_nulls: num_nulls as u32,
        detection_ids,
        catalog_match,
        catalogs_checked,
        matched_catalogs,
        version: version as u64,
    })
}
