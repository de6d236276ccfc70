//! Test Helper Utilities
//!
//! Shared builders and store setup for skycat-assoc integration tests

#![allow(dead_code)]

pub mod db_utils;

pub use db_utils::{create_test_db, create_test_store};

use skycat_assoc::geometry::SkyPosition;
use skycat_assoc::models::{
    ConfigClass, Detection, FluxDensity, ImageBatch, ImageInfo, ReferenceSource, SourceShape,
};

/// One arcsecond in degrees
pub const ARCSEC: f64 = 1.0 / 3600.0;

/// Beam of the default test configuration class (36 arcsec)
pub const BEAM_DEG: f64 = 0.01;

pub const FIELD_RA: f64 = 150.0;
pub const FIELD_DEC: f64 = 30.0;

pub fn config_class(key: &str) -> ConfigClass {
    ConfigClass::new(key, BEAM_DEG)
}

/// Detection with 1 arcsec positional errors at the given offset from the
/// field center (arcsec, on-sky east and north)
pub fn detection(id: &str, image_id: &str, east_arcsec: f64, north_arcsec: f64) -> Detection {
    let dec_deg = FIELD_DEC + north_arcsec * ARCSEC;
    let ra_deg = FIELD_RA + east_arcsec * ARCSEC / dec_deg.to_radians().cos();
    detection_at(id, image_id, ra_deg, dec_deg)
}

pub fn detection_at(id: &str, image_id: &str, ra_deg: f64, dec_deg: f64) -> Detection {
    Detection {
        id: id.to_string(),
        image_id: image_id.to_string(),
        ra_deg,
        dec_deg,
        ra_err_deg: ARCSEC,
        dec_err_deg: ARCSEC,
        shape: SourceShape {
            maj_arcsec: 40.0,
            maj_err_arcsec: 2.0,
            min_arcsec: 36.0,
            min_err_arcsec: 2.0,
            pa_deg: 45.0,
            pa_err_deg: 5.0,
        },
        flux: FluxDensity {
            value_mjy: 12.0,
            err_mjy: 0.5,
        },
        config: config_class("L-band"),
    }
}

/// Image pointing at the shared field center, 1 degree field radius
pub fn image(image_id: &str) -> ImageInfo {
    image_at(image_id, FIELD_RA, FIELD_DEC)
}

pub fn image_at(image_id: &str, ra_deg: f64, dec_deg: f64) -> ImageInfo {
    ImageInfo {
        image_id: image_id.to_string(),
        center: SkyPosition::new(ra_deg, dec_deg),
        fov_radius_deg: 1.0,
        config: config_class("L-band"),
    }
}

pub fn batch(image: ImageInfo, detections: Vec<Detection>) -> ImageBatch {
    ImageBatch { image, detections }
}

/// Reference source offset from the field center (arcsec)
pub fn reference(catalog: &str, id: &str, east_arcsec: f64, north_arcsec: f64) -> ReferenceSource {
    let dec_deg = FIELD_DEC + north_arcsec * ARCSEC;
    ReferenceSource {
        catalog: catalog.to_string(),
        source_id: id.to_string(),
        ra_deg: FIELD_RA + east_arcsec * ARCSEC / dec_deg.to_radians().cos(),
        dec_deg,
        ra_err_deg: ARCSEC,
        dec_err_deg: ARCSEC,
    }
}
