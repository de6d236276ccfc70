//! In-memory catalog store with snapshot isolation
//!
//! Committed state is an immutable `Arc<CatalogState>`; a transaction keeps
//! the `Arc` it started from and stages its writes privately. Commit takes
//! the store mutex only long enough to validate versions against the latest
//! state and swap in a new copy.
//!
//! Every cone a transaction searched is re-checked at commit: if another
//! session committed a record into it since the snapshot, the commit fails.
//! A whole-catalog scan conflicts with any record committed since the snapshot.

use super::{dec_band, CatalogStore, CatalogTransaction};
use crate::geometry::{angular_separation, SkyPosition};
use crate::models::{AssociatedSource, DetectionId, SourceId};
use async_trait::async_trait;
use skycat_common::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Height of one declination zone of the spatial index (degrees)
const ZONE_HEIGHT_DEG: f64 = 0.5;

fn zone_of(dec_deg: f64) -> i64 {
    (dec_deg / ZONE_HEIGHT_DEG).floor() as i64
}

#[derive(Debug, Clone, Default)]
struct CatalogState {
    sources: HashMap<SourceId, Arc<AssociatedSource>>,
    /// Declination zone -> records in that zone
    zones: BTreeMap<i64, BTreeSet<SourceId>>,
    /// Detection -> owning record
    detections: HashMap<DetectionId, SourceId>,
    /// Image -> number of detections committed with it
    processed_images: HashMap<String, usize>,
}

impl CatalogState {
    fn search(&self, center: SkyPosition, radius_deg: f64) -> Vec<Arc<AssociatedSource>> {
        let (lo, hi) = dec_band(center, radius_deg);
        self.zones
            .range(zone_of(lo)..=zone_of(hi))
            .flat_map(|(_, ids)| ids.iter())
            .filter_map(|id| self.sources.get(id))
            .filter(|s| angular_separation(center, s.position()) <= radius_deg)
            .cloned()
            .collect()
    }

    fn put(&mut self, source: AssociatedSource) {
        if let Some(old) = self.sources.get(&source.id) {
            let old_zone = zone_of(old.dec_deg);
            if let Some(ids) = self.zones.get_mut(&old_zone) {
                ids.remove(&source.id);
                if ids.is_empty() {
                    self.zones.remove(&old_zone);
                }
            }
        }
        for detection_id in &source.detection_ids {
            self.detections.insert(detection_id.clone(), source.id);
        }
        self.zones
            .entry(zone_of(source.dec_deg))
            .or_default()
            .insert(source.id);
        self.sources.insert(source.id, Arc::new(source));
    }
}

/// Catalog store held entirely in memory
///
/// Cloning yields another handle to the same catalog.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalogStore {
    committed: Arc<Mutex<Arc<CatalogState>>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Result<Arc<CatalogState>> {
        let guard = self
            .committed
            .lock()
            .map_err(|_| Error::Internal("catalog state lock poisoned".to_string()))?;
        Ok(Arc::clone(&guard))
    }

    /// Number of committed records
    pub fn len(&self) -> Result<usize> {
        Ok(self.snapshot()?.sources.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// All committed records, ordered by id
    pub fn all_sources(&self) -> Result<Vec<AssociatedSource>> {
        let snapshot = self.snapshot()?;
        let mut sources: Vec<AssociatedSource> =
            snapshot.sources.values().map(|s| (**s).clone()).collect();
        sources.sort_by_key(|s| s.id);
        Ok(sources)
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn begin(&self) -> Result<Box<dyn CatalogTransaction>> {
        Ok(Box::new(MemoryTransaction {
            snapshot: self.snapshot()?,
            committed: Arc::clone(&self.committed),
            staged: BTreeMap::new(),
            processed: None,
            read_cones: Vec::new(),
            scanned_all: false,
        }))
    }

    async fn get(&self, id: SourceId) -> Result<Option<AssociatedSource>> {
        Ok(self.snapshot()?.sources.get(&id).map(|s| (**s).clone()))
    }
}

struct MemoryTransaction {
    snapshot: Arc<CatalogState>,
    committed: Arc<Mutex<Arc<CatalogState>>>,
    staged: BTreeMap<SourceId, AssociatedSource>,
    processed: Option<(String, usize)>,
    read_cones: Vec<(SkyPosition, f64)>,
    scanned_all: bool,
}

/// (id, version) pairs of the records in a cone
fn cone_versions(
    state: &CatalogState,
    center: SkyPosition,
    radius_deg: f64,
) -> BTreeSet<(SourceId, u64)> {
    state
        .search(center, radius_deg)
        .iter()
        .map(|s| (s.id, s.version))
        .collect()
}

impl MemoryTransaction {
    /// Every visible record satisfying `keep`, ordered by id
    fn scan(&mut self, keep: impl Fn(&AssociatedSource) -> bool) -> Vec<AssociatedSource> {
        self.scanned_all = true;
        let mut results: Vec<AssociatedSource> = self
            .snapshot
            .sources
            .values()
            .filter(|s| !self.staged.contains_key(&s.id))
            .map(|s| (**s).clone())
            .chain(self.staged.values().cloned())
            .filter(|s| keep(s))
            .collect();
        results.sort_by_key(|s| s.id);
        results
    }
}

fn all_versions(state: &CatalogState) -> BTreeSet<(SourceId, u64)> {
    state.sources.values().map(|s| (s.id, s.version)).collect()
}

#[async_trait]
impl CatalogTransaction for MemoryTransaction {
    async fn search(
        &mut self,
        center: SkyPosition,
        radius_deg: f64,
    ) -> Result<Vec<AssociatedSource>> {
        self.read_cones.push((center, radius_deg));
        let mut results: Vec<AssociatedSource> = self
            .snapshot
            .search(center, radius_deg)
            .into_iter()
            .map(|s| {
                self.staged
                    .get(&s.id)
                    .cloned()
                    .unwrap_or_else(|| (*s).clone())
            })
            .filter(|s| angular_separation(center, s.position()) <= radius_deg)
            .collect();

        // Staged records created by this transaction
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
        Ok(self.scan(|s| s.catalogs_checked.contains(catalog)))
    }

    async fn unmatched(&mut self) -> Result<Vec<AssociatedSource>> {
        Ok(self.scan(|s| s.is_unmatched()))
    }

    async fn contains_detection(&mut self, detection_id: &str) -> Result<bool> {
        if self.snapshot.detections.contains_key(detection_id) {
            return Ok(true);
        }
        Ok(self
            .staged
            .values()
            .any(|s| s.detection_ids.iter().any(|d| d == detection_id)))
    }

    async fn is_image_processed(&mut self, image_id: &str) -> Result<bool> {
        Ok(self.snapshot.processed_images.contains_key(image_id))
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
        let MemoryTransaction {
            snapshot,
            committed,
            staged,
            processed,
            read_cones,
            scanned_all,
        } = *self;

        let mut guard = committed
            .lock()
            .map_err(|_| Error::Internal("catalog state lock poisoned".to_string()))?;
        let latest = Arc::clone(&guard);

        if let Some((image_id, _)) = &processed {
            if latest.processed_images.contains_key(image_id) {
                return Err(Error::AlreadyProcessed(image_id.clone()));
            }
        }

        if !Arc::ptr_eq(&snapshot, &latest) {
            if scanned_all && all_versions(&snapshot) != all_versions(&latest) {
                return Err(Error::WriteConflict(
                    "catalog changed since full scan".to_string(),
                ));
            }
            for &(center, radius_deg) in &read_cones {
                if cone_versions(&snapshot, center, radius_deg)
                    != cone_versions(&latest, center, radius_deg)
                {
                    return Err(Error::WriteConflict(format!(
                        "records within {:.4} deg of ({:.5}, {:.5}) changed since read",
                        radius_deg, center.ra_deg, center.dec_deg
                    )));
                }
            }
        }

        // Validate every staged write against the latest committed state
        for source in staged.values() {
            let current_version = latest.sources.get(&source.id).map(|s| s.version);
            match (source.version, current_version) {
                (0, None) => {}
                (0, Some(_)) => {
                    return Err(Error::WriteConflict(format!(
                        "source {} already exists",
                        source.id
                    )));
                }
                (read, Some(current)) if read == current => {}
                (read, current) => {
                    return Err(Error::WriteConflict(format!(
                        "source {} changed since read (read v{}, now {:?})",
                        source.id, read, current
                    )));
                }
            }
            for detection_id in &source.detection_ids {
                if let Some(owner) = latest.detections.get(detection_id) {
                    if *owner != source.id {
                        return Err(Error::WriteConflict(format!(
                            "detection {} already belongs to source {}",
                            detection_id, owner
                        )));
                    }
                }
            }
        }

        let mut next = (*latest).clone();
        let count = staged.len();
        for (_, mut source) in staged {
            source.version += 1;
            next.put(source);
        }
        if let Some((image_id, num_detections)) = processed {
            next.processed_images.insert(image_id, num_detections);
        }
        *guard = Arc::new(next);

        debug!(records = count, "Committed in-memory catalog transaction");
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        debug!(
            staged = self.staged.len(),
            "Aborted in-memory catalog transaction"
        );
        Ok(())
    }
}
