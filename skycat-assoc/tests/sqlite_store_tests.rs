//! SQLite catalog store integration tests
//!
//! Run against temporary database files so WAL snapshots and cross-connection
//! conflicts behave as in production.

mod helpers;

use helpers::{
    batch, create_test_store, detection, detection_at, image, image_at, reference, ARCSEC,
    FIELD_DEC, FIELD_RA,
};
use skycat_assoc::geometry::SkyPosition;
use skycat_assoc::models::CatalogMatch;
use skycat_assoc::services::{create, merge, unmatched_sources, withdraw_catalog};
use skycat_assoc::store::{CatalogStore, ReferenceCatalog};
use skycat_assoc::{SessionOrchestrator, SqliteCatalogStore, SqliteReferenceCatalog};
use skycat_common::config::AssociationConfig;
use skycat_common::Error;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn field_center() -> SkyPosition {
    SkyPosition::new(FIELD_RA, FIELD_DEC)
}

#[tokio::test]
async fn test_created_record_roundtrips() {
    let (_dir, store) = create_test_store().await.unwrap();

    let mut source = create(&detection("img1-d1", "img1", 0.0, 0.0));
    source.catalog_match = Some(CatalogMatch {
        catalog_id: "NVSS".to_string(),
        match_id: "J100000+300000".to_string(),
        min_separation_statistic: 0.42,
    });
    source.catalogs_checked.insert("NVSS".to_string());
    source.catalogs_checked.insert("FIRST".to_string());
    source.matched_catalogs.insert("NVSS".to_string());

    let mut tx = store.begin().await.unwrap();
    tx.upsert(source.clone()).await.unwrap();
    tx.commit().await.unwrap();

    let stored = store.get(source.id).await.unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.detection_ids, vec!["img1-d1".to_string()]);
    assert_eq!(stored.catalog_match, source.catalog_match);
    assert_eq!(stored.catalogs_checked, source.catalogs_checked);
    assert_eq!(stored.matched_catalogs, source.matched_catalogs);
    assert_eq!(stored.config, source.config);
    assert_eq!(stored.shape, source.shape);
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_search_respects_radius_and_own_writes() {
    let (_dir, store) = create_test_store().await.unwrap();

    let near = create(&detection("d-near", "img1", 10.0, 0.0));
    let far = create(&detection("d-far", "img1", 0.0, 7200.0));
    let mut tx = store.begin().await.unwrap();
    tx.upsert(near.clone()).await.unwrap();
    tx.upsert(far.clone()).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let found = tx.search(field_center(), 60.0 * ARCSEC).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, near.id);

    // Staged writes are visible to the same transaction only
    let staged = create(&detection("d-new", "img2", -5.0, 0.0));
    tx.upsert(staged.clone()).await.unwrap();
    assert_eq!(tx.search(field_center(), 60.0 * ARCSEC).await.unwrap().len(), 2);
    assert!(tx.contains_detection("d-new").await.unwrap());
    tx.abort().await.unwrap();

    assert!(store.get(staged.id).await.unwrap().is_none());
    assert_eq!(store.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_stale_update_is_write_conflict() {
    let (_dir, store) = create_test_store().await.unwrap();

    let source = create(&detection("img1-d1", "img1", 0.0, 0.0));
    let mut tx = store.begin().await.unwrap();
    tx.upsert(source.clone()).await.unwrap();
    tx.commit().await.unwrap();

    let committed = store.get(source.id).await.unwrap().unwrap();

    // Two sessions read version 1 and both try to merge a detection
    let mut first = store.begin().await.unwrap();
    let mut second = store.begin().await.unwrap();
    assert_eq!(first.search(field_center(), 0.01).await.unwrap().len(), 1);
    assert_eq!(second.search(field_center(), 0.01).await.unwrap().len(), 1);

    first
        .upsert(merge(&committed, &detection("img2-d1", "img2", 0.0, 0.3)))
        .await
        .unwrap();
    second
        .upsert(merge(&committed, &detection("img3-d1", "img3", 0.0, -0.3)))
        .await
        .unwrap();

    first.commit().await.unwrap();
    let err = second.commit().await.unwrap_err();
    assert!(matches!(err, Error::WriteConflict(_)), "got {:?}", err);

    let stored = store.get(source.id).await.unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.num_detections, 2);
    assert_eq!(
        stored.detection_ids,
        vec!["img1-d1".to_string(), "img2-d1".to_string()]
    );
}

#[tokio::test]
async fn test_detection_claimed_twice_is_write_conflict() {
    let (_dir, store) = create_test_store().await.unwrap();

    let a = create(&detection("shared", "img1", 0.0, 0.0));
    let b = create(&detection("shared", "img1", 0.0, 0.0));

    let mut first = store.begin().await.unwrap();
    let mut second = store.begin().await.unwrap();
    first.upsert(a).await.unwrap();
    second.upsert(b.clone()).await.unwrap();

    first.commit().await.unwrap();
    let err = second.commit().await.unwrap_err();
    assert_eq!(err.reason_code(), "WRITE_CONFLICT");

    // The losing transaction rolled back entirely
    assert!(store.get(b.id).await.unwrap().is_none());
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_processed_image_marker() {
    let (_dir, store) = create_test_store().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    assert!(!tx.is_image_processed("img1").await.unwrap());
    tx.mark_image_processed("img1", 3).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    assert!(tx.is_image_processed("img1").await.unwrap());
    tx.mark_image_processed("img1", 3).await.unwrap();
    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, Error::AlreadyProcessed(ref id) if id == "img1"));
}

#[tokio::test]
async fn test_association_persists_across_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("catalog.db");
    let cancel = CancellationToken::new();

    let record_id = {
        let store = SqliteCatalogStore::open(&db_path).await.unwrap();
        let orch =
            SessionOrchestrator::new(Arc::new(store), None, AssociationConfig::default()).unwrap();
        let outcome = orch
            .associate(&batch(image("img1"), vec![detection("img1-d1", "img1", 0.0, 0.0)]), 1, &cancel)
            .await
            .unwrap();
        outcome.created[0]
    };

    let store = SqliteCatalogStore::open(&db_path).await.unwrap();
    let orch = SessionOrchestrator::new(
        Arc::new(store.clone()),
        None,
        AssociationConfig::default(),
    )
    .unwrap();

    let outcome = orch
        .associate(&batch(image("img2"), vec![detection("img2-d1", "img2", 0.5, 0.0)]), 1, &cancel)
        .await
        .unwrap();
    assert_eq!(outcome.merged, vec![("img2-d1".to_string(), record_id)]);

    let outcome = orch
        .associate(&batch(image("img3"), vec![]), 1, &cancel)
        .await
        .unwrap();
    assert_eq!(outcome.null_incremented, vec![record_id]);

    let stored = store.get(record_id).await.unwrap().unwrap();
    assert_eq!(stored.num_detections, 2);
    assert_eq!(stored.num_nulls, 1);
    assert_eq!(stored.version, 3);
    stored.check_invariants().unwrap();
}

#[tokio::test]
async fn test_edge_candidate_cone_reads_beyond_region() {
    let (_dir, store) = create_test_store().await.unwrap();
    let orch =
        SessionOrchestrator::new(Arc::new(store.clone()), None, AssociationConfig::default())
            .unwrap();
    let cancel = CancellationToken::new();
    let edge_dec = FIELD_DEC + 0.5;

    let first = orch
        .associate(
            &batch(
                image_at("img1", FIELD_RA, edge_dec),
                vec![detection_at("img1-d1", "img1", FIELD_RA, edge_dec + ARCSEC)],
            ),
            1,
            &cancel,
        )
        .await
        .unwrap();

    let second = orch
        .associate(
            &batch(
                image("img2"),
                vec![detection_at("img2-d1", "img2", FIELD_RA, edge_dec - 0.5 * ARCSEC)],
            ),
            1,
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(second.merged, vec![("img2-d1".to_string(), first.created[0])]);
    assert_eq!(store.count().await.unwrap(), 1);
    let stored = store.get(first.created[0]).await.unwrap().unwrap();
    assert_eq!(stored.num_detections, 2);
    assert_eq!(stored.num_nulls, 0);
}

#[tokio::test]
async fn test_catalog_withdrawal_and_unmatched_query() {
    let (_dir, store) = create_test_store().await.unwrap();

    let mut matched = create(&detection("d-matched", "img1", 0.0, 0.0));
    matched.catalog_match = Some(CatalogMatch {
        catalog_id: "NVSS".to_string(),
        match_id: "n1".to_string(),
        min_separation_statistic: 0.7,
    });
    matched.catalogs_checked.insert("NVSS".to_string());
    matched.catalogs_checked.insert("FIRST".to_string());
    matched.matched_catalogs.insert("NVSS".to_string());

    let mut lonely = create(&detection("d-lonely", "img1", 0.0, 600.0));
    lonely.catalogs_checked.insert("FIRST".to_string());

    let unchecked = create(&detection("d-unchecked", "img1", 0.0, -600.0));

    let mut tx = store.begin().await.unwrap();
    tx.upsert(matched.clone()).await.unwrap();
    tx.upsert(lonely.clone()).await.unwrap();
    tx.upsert(unchecked).await.unwrap();
    tx.commit().await.unwrap();

    let unmatched = unmatched_sources(&store).await.unwrap();
    assert_eq!(unmatched.len(), 1);
    assert_eq!(unmatched[0].id, lonely.id);

    let report = withdraw_catalog(&store, "NVSS", 3).await.unwrap();
    assert_eq!(report.records_updated, 1);
    assert_eq!(report.matches_cleared, 1);

    let stored = store.get(matched.id).await.unwrap().unwrap();
    assert!(stored.catalog_match.is_none());
    assert_eq!(stored.version, 2);
    assert!(!stored.catalogs_checked.contains("NVSS"));
    assert!(stored.catalogs_checked.contains("FIRST"));

    // Without its only counterpart the record joins the unmatched set
    let unmatched = unmatched_sources(&store).await.unwrap();
    assert_eq!(unmatched.len(), 2);
}

#[tokio::test]
async fn test_reference_catalog_shares_database() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("catalog.db");

    let refs = SqliteReferenceCatalog::open(&db_path).await.unwrap();
    refs.insert_sources(&[
        reference("NVSS", "n1", 1.0, 0.0),
        reference("NVSS", "n2", 0.0, 3600.0),
        reference("FIRST", "f1", 0.0, 1.0),
    ])
    .await
    .unwrap();

    let found = refs.search(field_center(), 0.01, "NVSS").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].source_id, "n1");

    // Catalog store on the same file sees an empty catalog
    let store = SqliteCatalogStore::open(&db_path).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 0);
}
