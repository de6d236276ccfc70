//! Catalog and reference stores
//!
//! The association core never touches global state: every read and write of
//! one image goes through a [`CatalogTransaction`] obtained from a
//! [`CatalogStore`]. A transaction reads a consistent snapshot and commits
//! all staged changes atomically, or fails with `WriteConflict` when another
//! session committed an overlapping change first.

use crate::geometry::SkyPosition;
use crate::models::{AssociatedSource, ReferenceSource, SourceId};
use async_trait::async_trait;
use skycat_common::Result;

pub mod memory;
pub mod reference;
pub mod sqlite;

pub use memory::MemoryCatalogStore;
pub use reference::{MemoryReferenceCatalog, SqliteReferenceCatalog};
pub use sqlite::SqliteCatalogStore;

/// Persistent catalog of associated sources
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Open a transaction reading a consistent snapshot
    async fn begin(&self) -> Result<Box<dyn CatalogTransaction>>;

    /// Read one committed record
    async fn get(&self, id: SourceId) -> Result<Option<AssociatedSource>>;
}

/// Unit of work for one image batch
///
/// Reads see the snapshot plus this transaction's own staged writes.
/// Dropping a transaction without committing discards everything staged.
#[async_trait]
pub trait CatalogTransaction: Send {
    /// All records within `radius_deg` of `center`, any configuration class
    async fn search(&mut self, center: SkyPosition, radius_deg: f64)
        -> Result<Vec<AssociatedSource>>;

    /// Records already cross-matched against `catalog`
    async fn checked_against(&mut self, catalog: &str) -> Result<Vec<AssociatedSource>>;

    /// Records checked against at least one reference catalog that hold no
    /// counterpart in any of them
    async fn unmatched(&mut self) -> Result<Vec<AssociatedSource>>;

    /// True if the detection is already part of some record
    async fn contains_detection(&mut self, detection_id: &str) -> Result<bool>;

    /// True if the image was committed by an earlier session
    async fn is_image_processed(&mut self, image_id: &str) -> Result<bool>;

    /// Stage a created (`version == 0`) or updated record
    async fn upsert(&mut self, source: AssociatedSource) -> Result<()>;

    /// Stage the processed-image marker committed with this transaction
    async fn mark_image_processed(&mut self, image_id: &str, num_detections: usize)
        -> Result<()>;

    /// Apply all staged changes atomically
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard all staged changes
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// Read-only external reference catalogs
#[async_trait]
pub trait ReferenceCatalog: Send + Sync {
    /// Sources of `catalog` within `radius_deg` of `center`
    async fn search(
        &self,
        center: SkyPosition,
        radius_deg: f64,
        catalog: &str,
    ) -> Result<Vec<ReferenceSource>>;
}

/// Declination band `[lo, hi]` covering a cone, clamped to the sphere
pub(crate) fn dec_band(center: SkyPosition, radius_deg: f64) -> (f64, f64) {
    (
        (center.dec_deg - radius_deg).max(-90.0),
        (center.dec_deg + radius_deg).min(90.0),
    )
}
