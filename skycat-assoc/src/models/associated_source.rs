//! Persistent catalog record

use crate::geometry::SkyPosition;
use crate::models::{ConfigClass, DetectionId, FluxDensity, SourceShape};
use serde::{Deserialize, Serialize};
use skycat_common::{Error, Result};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Catalog record identifier
pub type SourceId = Uuid;

/// Best reference catalog counterpart of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogMatch {
    pub catalog_id: String,
    pub match_id: String,
    /// de Ruiter radius of the match
    pub min_separation_statistic: f64,
}

/// One unique source within one configuration class
///
/// Merged values change only through the merge policy; `config` never
/// changes after creation. `version` is owned by the store: 0 means the
/// record has never been committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociatedSource {
    pub id: SourceId,
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub ra_err_deg: f64,
    pub dec_err_deg: f64,
    pub shape: SourceShape,
    pub flux: FluxDensity,
    pub config: ConfigClass,
    pub num_detections: u32,
    pub num_nulls: u32,
    /// Contributing detections, in merge order
    pub detection_ids: Vec<DetectionId>,
    pub catalog_match: Option<CatalogMatch>,
    /// Reference catalogs already queried for this record
    pub catalogs_checked: BTreeSet<String>,
    /// Checked catalogs that held a counterpart below the threshold
    #[serde(default)]
    pub matched_catalogs: BTreeSet<String>,
    pub version: u64,
}

impl AssociatedSource {
    pub fn position(&self) -> SkyPosition {
        SkyPosition::new(self.ra_deg, self.dec_deg)
    }

    /// True once the record exists in the store
    pub fn is_committed(&self) -> bool {
        self.version > 0
    }

    /// Number of reference catalogs holding a counterpart
    pub fn num_matches(&self) -> usize {
        self.matched_catalogs.len()
    }

    /// Checked against at least one catalog without any counterpart
    pub fn is_unmatched(&self) -> bool {
        self.catalog_match.is_none() && !self.catalogs_checked.is_empty()
    }

    /// Check the record-level invariants before it is written
    pub fn check_invariants(&self) -> Result<()> {
        if self.num_detections == 0 {
            return Err(Error::Internal(format!(
                "source {} has no detections",
                self.id
            )));
        }
        if self.num_detections as usize != self.detection_ids.len() {
            return Err(Error::Internal(format!(
                "source {} counts {} detections but lists {}",
                self.id,
                self.num_detections,
                self.detection_ids.len()
            )));
        }
        if let Some(extra) = self
            .matched_catalogs
            .iter()
            .find(|c| !self.catalogs_checked.contains(*c))
        {
            return Err(Error::Internal(format!(
                "source {} matched in unchecked catalog {}",
                self.id, extra
            )));
        }
        if let Some(m) = &self.catalog_match {
            if !self.matched_catalogs.contains(&m.catalog_id) {
                return Err(Error::Internal(format!(
                    "source {} best match from {} not counted as matched",
                    self.id, m.catalog_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AssociatedSource {
        AssociatedSource {
            id: Uuid::new_v4(),
            ra_deg: 10.0,
            dec_deg: -5.0,
            ra_err_deg: 1e-4,
            dec_err_deg: 1e-4,
            shape: SourceShape {
                maj_arcsec: 6.0,
                maj_err_arcsec: 0.5,
                min_arcsec: 4.0,
                min_err_arcsec: 0.5,
                pa_deg: 30.0,
                pa_err_deg: 5.0,
            },
            flux: FluxDensity {
                value_mjy: 12.0,
                err_mjy: 0.3,
            },
            config: ConfigClass::new("A-L", 0.0015),
            num_detections: 1,
            num_nulls: 0,
            detection_ids: vec!["img1-0".to_string()],
            catalog_match: None,
            catalogs_checked: BTreeSet::new(),
            matched_catalogs: BTreeSet::new(),
            version: 0,
        }
    }

    #[test]
    fn test_invariants_hold_for_fresh_record() {
        let source = sample();
        assert!(source.check_invariants().is_ok());
        assert!(!source.is_committed());
    }

    #[test]
    fn test_invariants_reject_count_mismatch() {
        let mut source = sample();
        source.num_detections = 2;
        let err = source.check_invariants().unwrap_err();
        assert_eq!(err.reason_code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_invariants_reject_match_outside_checked_catalogs() {
        let mut source = sample();
        source.catalog_match = Some(CatalogMatch {
            catalog_id: "NVSS".to_string(),
            match_id: "n1".to_string(),
            min_separation_statistic: 0.5,
        });
        assert!(source.check_invariants().is_err());

        source.matched_catalogs.insert("NVSS".to_string());
        assert!(source.check_invariants().is_err());

        source.catalogs_checked.insert("NVSS".to_string());
        assert!(source.check_invariants().is_ok());
        assert_eq!(source.num_matches(), 1);
        assert!(!source.is_unmatched());
    }

    #[test]
    fn test_unmatched_requires_a_checked_catalog() {
        let mut source = sample();
        assert!(!source.is_unmatched());
        source.catalogs_checked.insert("FIRST".to_string());
        assert!(source.is_unmatched());
        assert_eq!(source.num_matches(), 0);
    }

    #[test]
    fn test_serde_roundtrip_keeps_checked_catalogs() {
        let mut source = sample();
        source.catalogs_checked.insert("NVSS".to_string());
        let json = serde_json::to_string(&source).unwrap();
        let back: AssociatedSource = serde_json::from_str(&json).unwrap();
        assert_eq!(back, source);
    }
}
