//! Reference catalog bookkeeping outside association sessions
//!
//! Withdrawing a catalog removes its counterparts from every record and
//! forgets that it was checked, so the next `Update` cross-match queries it
//! again. A record that loses its best match also forgets the other catalogs
//! that held a counterpart, since the runner-up may sit in any of them.

use crate::models::AssociatedSource;
use crate::store::{CatalogStore, CatalogTransaction};
use crate::utils::retry_on_conflict;
use serde::Serialize;
use skycat_common::Result;
use tracing::{info, warn};

/// Summary of one catalog withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogWithdrawal {
    pub catalog: String,
    /// Records that had the catalog in their checked set
    pub records_updated: usize,
    /// Records whose best match came from the catalog
    pub matches_cleared: usize,
    pub attempts: u32,
}

/// Remove `catalog` from one record's cross-match state
///
/// Returns `None` when the record was never checked against the catalog.
pub fn withdraw_catalog_from(source: &AssociatedSource, catalog: &str) -> Option<AssociatedSource> {
    if !source.catalogs_checked.contains(catalog) {
        return None;
    }

    let mut updated = source.clone();
    updated.catalogs_checked.remove(catalog);
    updated.matched_catalogs.remove(catalog);

    let lost_best = updated
        .catalog_match
        .as_ref()
        .map_or(false, |m| m.catalog_id == catalog);
    if lost_best {
        updated.catalog_match = None;
        for other in std::mem::take(&mut updated.matched_catalogs) {
            updated.catalogs_checked.remove(&other);
        }
    }

    Some(updated)
}

/// Withdraw `catalog` from every record in one transaction
///
/// Retried on write conflict like an association session.
pub async fn withdraw_catalog(
    store: &dyn CatalogStore,
    catalog: &str,
    max_retries: u32,
) -> Result<CatalogWithdrawal> {
    let outcome = retry_on_conflict("withdraw_catalog", max_retries, |_attempt| {
        withdraw_once(store, catalog)
    })
    .await;

    let (records_updated, matches_cleared) = outcome.result?;
    info!(
        catalog,
        records_updated,
        matches_cleared,
        attempts = outcome.attempts,
        "Reference catalog withdrawn"
    );

    Ok(CatalogWithdrawal {
        catalog: catalog.to_string(),
        records_updated,
        matches_cleared,
        attempts: outcome.attempts,
    })
}

async fn withdraw_once(store: &dyn CatalogStore, catalog: &str) -> Result<(usize, usize)> {
    let mut tx = store.begin().await?;
    match stage_withdrawal(tx.as_mut(), catalog).await {
        Ok(counts) => {
            tx.commit().await?;
            Ok(counts)
        }
        Err(err) => {
            if let Err(e) = tx.abort().await {
                warn!(catalog, error = %e, "Rollback failed; transaction released on drop");
            }
            Err(err)
        }
    }
}

async fn stage_withdrawal(tx: &mut dyn CatalogTransaction, catalog: &str) -> Result<(usize, usize)> {
    let mut updated = 0;
    let mut cleared = 0;
    for source in tx.checked_against(catalog).await? {
        if let Some(next) = withdraw_catalog_from(&source, catalog) {
            if source.catalog_match.is_some() && next.catalog_match.is_none() {
                cleared += 1;
            }
            tx.upsert(next).await?;
            updated += 1;
        }
    }
    Ok((updated, cleared))
}

/// Committed records that were cross-matched without finding any counterpart
pub async fn unmatched_sources(store: &dyn CatalogStore) -> Result<Vec<AssociatedSource>> {
    let mut tx = store.begin().await?;
    let found = tx.unmatched().await;
    tx.abort().await?;
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CatalogMatch, ConfigClass, FluxDensity, SourceShape};
    use crate::store::MemoryCatalogStore;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn source(checked: &[&str], matched: &[&str], best: Option<&str>) -> AssociatedSource {
        AssociatedSource {
            id: Uuid::new_v4(),
            ra_deg: 200.0,
            dec_deg: -10.0,
            ra_err_deg: 1e-4,
            dec_err_deg: 1e-4,
            shape: SourceShape {
                maj_arcsec: 5.0,
                maj_err_arcsec: 0.5,
                min_arcsec: 5.0,
                min_err_arcsec: 0.5,
                pa_deg: 0.0,
                pa_err_deg: 10.0,
            },
            flux: FluxDensity {
                value_mjy: 1.0,
                err_mjy: 0.1,
            },
            config: ConfigClass::new("A", 0.01),
            num_detections: 1,
            num_nulls: 0,
            detection_ids: vec![format!("d-{}", Uuid::new_v4())],
            catalog_match: best.map(|catalog| CatalogMatch {
                catalog_id: catalog.to_string(),
                match_id: format!("{}-1", catalog),
                min_separation_statistic: 0.5,
            }),
            catalogs_checked: checked.iter().map(|c| c.to_string()).collect(),
            matched_catalogs: matched.iter().map(|c| c.to_string()).collect(),
            version: 0,
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_unchecked_record_untouched() {
        let record = source(&["FIRST"], &[], None);
        assert!(withdraw_catalog_from(&record, "NVSS").is_none());
    }

    #[test]
    fn test_withdraw_non_best_catalog_keeps_match() {
        let record = source(&["NVSS", "FIRST", "SUMSS"], &["NVSS", "FIRST"], Some("NVSS"));
        let next = withdraw_catalog_from(&record, "FIRST").unwrap();

        assert_eq!(next.catalog_match, record.catalog_match);
        assert_eq!(next.catalogs_checked, set(&["NVSS", "SUMSS"]));
        assert_eq!(next.matched_catalogs, set(&["NVSS"]));
        next.check_invariants().unwrap();
    }

    #[test]
    fn test_withdraw_best_catalog_reopens_other_matches() {
        let record = source(&["NVSS", "FIRST", "SUMSS"], &["NVSS", "FIRST"], Some("NVSS"));
        let next = withdraw_catalog_from(&record, "NVSS").unwrap();

        assert!(next.catalog_match.is_none());
        // FIRST held a counterpart and is queried again; SUMSS had none
        assert_eq!(next.catalogs_checked, set(&["SUMSS"]));
        assert!(next.matched_catalogs.is_empty());
        assert!(next.is_unmatched());
        next.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_withdraw_catalog_across_store() {
        let store = MemoryCatalogStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.upsert(source(&["NVSS"], &["NVSS"], Some("NVSS"))).await.unwrap();
        tx.upsert(source(&["NVSS", "FIRST"], &["FIRST"], Some("FIRST"))).await.unwrap();
        tx.upsert(source(&["FIRST"], &[], None)).await.unwrap();
        tx.commit().await.unwrap();

        let report = withdraw_catalog(&store, "NVSS", 3).await.unwrap();
        assert_eq!(report.records_updated, 2);
        assert_eq!(report.matches_cleared, 1);
        assert_eq!(report.attempts, 1);

        for record in store.all_sources().unwrap() {
            assert!(!record.catalogs_checked.contains("NVSS"));
            assert!(record.is_committed());
        }

        // Withdrawing again finds nothing to do
        let again = withdraw_catalog(&store, "NVSS", 3).await.unwrap();
        assert_eq!(again.records_updated, 0);
    }

    #[tokio::test]
    async fn test_unmatched_sources_lists_checked_records_without_match() {
        let store = MemoryCatalogStore::new();
        let lonely = source(&["NVSS", "FIRST"], &[], None);
        let mut tx = store.begin().await.unwrap();
        tx.upsert(lonely.clone()).await.unwrap();
        tx.upsert(source(&["NVSS"], &["NVSS"], Some("NVSS"))).await.unwrap();
        tx.upsert(source(&[], &[], None)).await.unwrap();
        tx.commit().await.unwrap();

        let unmatched = unmatched_sources(&store).await.unwrap();
        assert_eq!(unmatched.len(), 1);
        assert_eq!(unmatched[0].id, lonely.id);
    }

    #[tokio::test]
    async fn test_scan_conflicts_with_concurrent_commit() {
        let store = MemoryCatalogStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.upsert(source(&["NVSS"], &["NVSS"], Some("NVSS"))).await.unwrap();
        tx.commit().await.unwrap();

        let mut scan = store.begin().await.unwrap();
        let found = scan.checked_against("NVSS").await.unwrap();
        assert_eq!(found.len(), 1);
        let next = withdraw_catalog_from(&found[0], "NVSS").unwrap();
        scan.upsert(next).await.unwrap();

        // A session commits a newly checked record meanwhile
        let mut other = store.begin().await.unwrap();
        other.upsert(source(&["NVSS"], &[], None)).await.unwrap();
        other.commit().await.unwrap();

        let err = scan.commit().await.unwrap_err();
        assert_eq!(err.reason_code(), "WRITE_CONFLICT");
    }
}
