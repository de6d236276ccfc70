//! Detection batch input types
//!
//! Produced by the upstream source extractor, one [`ImageBatch`] per image.

use crate::geometry::SkyPosition;
use serde::{Deserialize, Serialize};

/// Detection identifier, unique across all images
pub type DetectionId = String;

/// Instrument configuration / beam class
///
/// Only records of compatible classes are ever associated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigClass {
    /// Configuration key (e.g. array configuration + band)
    pub key: String,
    /// Restoring beam major axis (degrees)
    pub beam_deg: f64,
}

impl ConfigClass {
    pub fn new(key: impl Into<String>, beam_deg: f64) -> Self {
        Self {
            key: key.into(),
            beam_deg,
        }
    }
}

/// Fitted source shape (arcsec, position angle in degrees east of north)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceShape {
    pub maj_arcsec: f64,
    pub maj_err_arcsec: f64,
    pub min_arcsec: f64,
    pub min_err_arcsec: f64,
    pub pa_deg: f64,
    pub pa_err_deg: f64,
}

/// Flux density (mJy)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FluxDensity {
    pub value_mjy: f64,
    pub err_mjy: f64,
}

/// One measured source in one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: DetectionId,
    pub image_id: String,
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub ra_err_deg: f64,
    pub dec_err_deg: f64,
    pub shape: SourceShape,
    pub flux: FluxDensity,
    pub config: ConfigClass,
}

impl Detection {
    pub fn position(&self) -> SkyPosition {
        SkyPosition::new(self.ra_deg, self.dec_deg)
    }
}

/// Per-image pointing and configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub image_id: String,
    /// Pointing center
    pub center: SkyPosition,
    /// Radius of the imaged field (degrees)
    pub fov_radius_deg: f64,
    pub config: ConfigClass,
}

/// All detections extracted from one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBatch {
    pub image: ImageInfo,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl ImageBatch {
    pub fn image_id(&self) -> &str {
        &self.image.image_id
    }
}
