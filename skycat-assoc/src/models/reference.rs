//! Reference catalog entries

use crate::geometry::SkyPosition;
use serde::{Deserialize, Serialize};

/// A source from an external reference catalog (read-only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSource {
    pub catalog: String,
    pub source_id: String,
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub ra_err_deg: f64,
    pub dec_err_deg: f64,
}

impl ReferenceSource {
    pub fn position(&self) -> SkyPosition {
        SkyPosition::new(self.ra_deg, self.dec_deg)
    }
}
