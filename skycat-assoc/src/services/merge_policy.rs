//! Inverse-variance merge of detections into catalog records
//!
//! Every merged quantity is a running weighted mean: for aggregate `m ± S`
//! and new value `x ± s`,
//!
//! ```text
//! m' = (m/S² + x/s²) / (1/S² + 1/s²)
//! S' = sqrt(1 / (1/S² + 1/s²))
//! ```
//!
//! Folding order matters only at floating-point precision. Detections are
//! folded in commit order across images and, within one image, in
//! assignment order (ascending statistic, then detection id).

use crate::geometry::{normalize_pa, normalize_ra, unwrap_pa_near, unwrap_ra_near};
use crate::models::{AssociatedSource, Detection, FluxDensity, SourceShape};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Weighted mean of `(m, S)` and `(x, s)`; returns `(m', S')`
pub fn weighted_merge(m: f64, big_s: f64, x: f64, s: f64) -> (f64, f64) {
    let w_m = 1.0 / (big_s * big_s);
    let w_x = 1.0 / (s * s);
    let w = w_m + w_x;
    ((m * w_m + x * w_x) / w, (1.0 / w).sqrt())
}

/// Fold one detection into an existing record
///
/// The record keeps its id, class, version, null count and cross-match
/// annotation; only merged values and the detection list change.
pub fn merge(source: &AssociatedSource, det: &Detection) -> AssociatedSource {
    let mut merged = source.clone();

    let det_ra = unwrap_ra_near(det.ra_deg, source.ra_deg);
    let (ra, ra_err) = weighted_merge(source.ra_deg, source.ra_err_deg, det_ra, det.ra_err_deg);
    merged.ra_deg = normalize_ra(ra);
    merged.ra_err_deg = ra_err;

    let (dec, dec_err) =
        weighted_merge(source.dec_deg, source.dec_err_deg, det.dec_deg, det.dec_err_deg);
    merged.dec_deg = dec.clamp(-90.0, 90.0);
    merged.dec_err_deg = dec_err;

    let (maj, maj_err) = weighted_merge(
        source.shape.maj_arcsec,
        source.shape.maj_err_arcsec,
        det.shape.maj_arcsec,
        det.shape.maj_err_arcsec,
    );
    let (min, min_err) = weighted_merge(
        source.shape.min_arcsec,
        source.shape.min_err_arcsec,
        det.shape.min_arcsec,
        det.shape.min_err_arcsec,
    );
    let det_pa = unwrap_pa_near(det.shape.pa_deg, source.shape.pa_deg);
    let (pa, pa_err) = weighted_merge(
        source.shape.pa_deg,
        source.shape.pa_err_deg,
        det_pa,
        det.shape.pa_err_deg,
    );
    merged.shape = SourceShape {
        maj_arcsec: maj,
        maj_err_arcsec: maj_err,
        min_arcsec: min,
        min_err_arcsec: min_err,
        pa_deg: normalize_pa(pa),
        pa_err_deg: pa_err,
    };

    let (flux, flux_err) = weighted_merge(
        source.flux.value_mjy,
        source.flux.err_mjy,
        det.flux.value_mjy,
        det.flux.err_mjy,
    );
    merged.flux = FluxDensity {
        value_mjy: flux,
        err_mjy: flux_err,
    };

    merged.detection_ids.push(det.id.clone());
    merged.num_detections += 1;
    merged
}

/// New record seeded from a single detection
pub fn create(det: &Detection) -> AssociatedSource {
    AssociatedSource {
        id: Uuid::new_v4(),
        ra_deg: normalize_ra(det.ra_deg),
        dec_deg: det.dec_deg,
        ra_err_deg: det.ra_err_deg,
        dec_err_deg: det.dec_err_deg,
        shape: SourceShape {
            pa_deg: normalize_pa(det.shape.pa_deg),
            ..det.shape
        },
        flux: det.flux,
        config: det.config.clone(),
        num_detections: 1,
        num_nulls: 0,
        detection_ids: vec![det.id.clone()],
        catalog_match: None,
        catalogs_checked: BTreeSet::new(),
        matched_catalogs: BTreeSet::new(),
        version: 0,
    }
}
