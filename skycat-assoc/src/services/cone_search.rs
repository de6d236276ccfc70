//! Cone search over the catalog and reference stores
//!
//! Results are ordered by (separation, id) so downstream matching sees the
//! same input regardless of store iteration order.

use crate::geometry::{angular_separation, SkyPosition};
use crate::models::{AssociatedSource, ConfigClass, ReferenceSource};
use crate::store::{CatalogTransaction, ReferenceCatalog};
use skycat_common::config::CompatibilityRule;
use skycat_common::{Error, Result};
use tracing::debug;

/// Circular search region, optionally restricted to compatible classes
#[derive(Debug, Clone)]
pub struct ConeQuery {
    pub center: SkyPosition,
    pub radius_deg: f64,
    pub class: Option<(ConfigClass, CompatibilityRule)>,
}

impl ConeQuery {
    pub fn new(center: SkyPosition, radius_deg: f64) -> Self {
        Self {
            center,
            radius_deg,
            class: None,
        }
    }

    pub fn with_class(mut self, class: ConfigClass, rule: CompatibilityRule) -> Self {
        self.class = Some((class, rule));
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.radius_deg.is_finite() || self.radius_deg < 0.0 {
            return Err(Error::Config(format!(
                "cone radius must be a non-negative number, got {}",
                self.radius_deg
            )));
        }
        if !self.center.is_valid() {
            return Err(Error::InvalidInput(format!(
                "invalid cone center ({}, {})",
                self.center.ra_deg, self.center.dec_deg
            )));
        }
        Ok(())
    }

    fn accepts_class(&self, other: &ConfigClass) -> bool {
        match &self.class {
            Some((class, rule)) => rule.accepts(&class.key, class.beam_deg, &other.key, other.beam_deg),
            None => true,
        }
    }
}

/// Catalog records of compatible class within the cone, read through `tx`
pub async fn search_catalog(
    tx: &mut dyn CatalogTransaction,
    query: &ConeQuery,
) -> Result<Vec<AssociatedSource>> {
    query.validate()?;

    let mut records: Vec<AssociatedSource> = tx
        .search(query.center, query.radius_deg)
        .await?
        .into_iter()
        .filter(|r| query.accepts_class(&r.config))
        .collect();

    sort_by_separation(&mut records, query.center, |r| r.position(), |r| r.id.to_string());

    debug!(
        ra = query.center.ra_deg,
        dec = query.center.dec_deg,
        radius_deg = query.radius_deg,
        found = records.len(),
        "Catalog cone search"
    );
    Ok(records)
}

/// Sources of one reference catalog within the cone
pub async fn search_reference(
    reference: &dyn ReferenceCatalog,
    query: &ConeQuery,
    catalog: &str,
) -> Result<Vec<ReferenceSource>> {
    query.validate()?;

    let mut sources = reference
        .search(query.center, query.radius_deg, catalog)
        .await?;
    sort_by_separation(&mut sources, query.center, |s| s.position(), |s| s.source_id.clone());
    Ok(sources)
}

/// In-memory cone filter over an already retrieved snapshot
///
/// Input order is preserved.
pub fn within_cone<'a>(
    records: &'a [AssociatedSource],
    center: SkyPosition,
    radius_deg: f64,
) -> Vec<&'a AssociatedSource> {
    records
        .iter()
        .filter(|r| angular_separation(center, r.position()) <= radius_deg)
        .collect()
}

fn sort_by_separation<T>(
    items: &mut [T],
    center: SkyPosition,
    position: impl Fn(&T) -> SkyPosition,
    key: impl Fn(&T) -> String,
) {
    items.sort_by(|a, b| {
        angular_separation(center, position(a))
            .total_cmp(&angular_separation(center, position(b)))
            .then_with(|| key(a).cmp(&key(b)))
    });
}
