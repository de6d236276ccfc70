//! Positional matching of detections to catalog records
//!
//! Candidate pairs are scored with the de Ruiter radius, a dimensionless
//! positional separation normalized by the combined uncertainties. A pair is
//! admissible when its radius is strictly below the configured threshold.
//! Assignment is greedy on ascending radius, which yields a one-to-one
//! matching between detections and records.

use crate::geometry::{midpoint_xyz, tangent_offsets, SkyPosition};
use crate::models::{AssociatedSource, Detection, ReferenceSource, SourceId};
use skycat_common::{Error, Result};
use std::collections::HashSet;

/// A position with its 1-sigma uncertainties (degrees on the sky)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasuredPosition {
    pub position: SkyPosition,
    pub ra_err_deg: f64,
    pub dec_err_deg: f64,
}

impl From<&Detection> for MeasuredPosition {
    fn from(d: &Detection) -> Self {
        Self {
            position: d.position(),
            ra_err_deg: d.ra_err_deg,
            dec_err_deg: d.dec_err_deg,
        }
    }
}

impl From<&AssociatedSource> for MeasuredPosition {
    fn from(s: &AssociatedSource) -> Self {
        Self {
            position: s.position(),
            ra_err_deg: s.ra_err_deg,
            dec_err_deg: s.dec_err_deg,
        }
    }
}

impl From<&ReferenceSource> for MeasuredPosition {
    fn from(s: &ReferenceSource) -> Self {
        Self {
            position: s.position(),
            ra_err_deg: s.ra_err_deg,
            dec_err_deg: s.dec_err_deg,
        }
    }
}

/// de Ruiter radius between two measured positions
///
/// Both points are projected onto the tangent plane at their spherical
/// midpoint, so the result is exactly symmetric in its arguments.
/// Points 90° or more apart are never comparable and yield infinity.
pub fn de_ruiter_radius(a: &MeasuredPosition, b: &MeasuredPosition) -> f64 {
    let pa = a.position.to_xyz();
    let pb = b.position.to_xyz();
    let Some(mid) = midpoint_xyz(pa, pb) else {
        return f64::INFINITY;
    };
    let (Some((xa, ya)), Some((xb, yb))) = (tangent_offsets(pa, mid), tangent_offsets(pb, mid))
    else {
        return f64::INFINITY;
    };

    let dx = xa - xb;
    let dy = ya - yb;
    let var_ra = a.ra_err_deg.to_radians().powi(2) + b.ra_err_deg.to_radians().powi(2);
    let var_dec = a.dec_err_deg.to_radians().powi(2) + b.dec_err_deg.to_radians().powi(2);

    (dx * dx / var_ra + dy * dy / var_dec).sqrt()
}

/// Reject detections with degenerate or nonsensical measurements
pub fn validate_detection(det: &Detection) -> Result<()> {
    let invalid = |reason: String| Error::InvalidMeasurement {
        detection_id: det.id.clone(),
        reason,
    };

    if !det.position().is_valid() {
        return Err(invalid(format!(
            "position ({}, {}) is not on the sphere",
            det.ra_deg, det.dec_deg
        )));
    }

    for (name, value) in [
        ("shape.maj_arcsec", det.shape.maj_arcsec),
        ("shape.min_arcsec", det.shape.min_arcsec),
        ("shape.pa_deg", det.shape.pa_deg),
        ("flux.value_mjy", det.flux.value_mjy),
    ] {
        if !value.is_finite() {
            return Err(invalid(format!("{} is not finite", name)));
        }
    }

    for (name, value) in [
        ("ra_err_deg", det.ra_err_deg),
        ("dec_err_deg", det.dec_err_deg),
        ("shape.maj_err_arcsec", det.shape.maj_err_arcsec),
        ("shape.min_err_arcsec", det.shape.min_err_arcsec),
        ("shape.pa_err_deg", det.shape.pa_err_deg),
        ("flux.err_mjy", det.flux.err_mjy),
        ("config.beam_deg", det.config.beam_deg),
    ] {
        if !value.is_finite() || value <= 0.0 {
            return Err(invalid(format!("{} must be positive, got {}", name, value)));
        }
    }

    Ok(())
}

/// Scored (detection, record) pair
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    /// Index into the detection slice passed to [`assign`]
    pub detection_index: usize,
    pub record_id: SourceId,
    pub statistic: f64,
}

/// One-to-one assignment of detections to records
#[derive(Debug, Clone, Default)]
pub struct Assignment {
    /// Committed pairs in assignment order (ascending statistic)
    pub pairs: Vec<MatchCandidate>,
    /// Detections without an admissible free record, ascending index
    pub unmatched_detections: Vec<usize>,
}

impl Assignment {
    /// Region records that received no detection
    pub fn unassigned_records<'a>(&self, region: &'a [AssociatedSource]) -> Vec<&'a AssociatedSource> {
        let assigned: HashSet<SourceId> = self.pairs.iter().map(|p| p.record_id).collect();
        region.iter().filter(|r| !assigned.contains(&r.id)).collect()
    }
}

/// Greedy minimum-statistic assignment
///
/// `candidates[i]` holds the records considered for `detections[i]`.
/// Admissible pairs are ordered by (statistic, detection id, record id) and
/// taken while both sides are still free.
pub fn assign(
    detections: &[Detection],
    candidates: &[Vec<&AssociatedSource>],
    threshold: f64,
) -> Assignment {
    let mut admissible: Vec<MatchCandidate> = Vec::new();
    for (i, (det, records)) in detections.iter().zip(candidates).enumerate() {
        let det_pos = MeasuredPosition::from(det);
        for record in records {
            let statistic = de_ruiter_radius(&det_pos, &MeasuredPosition::from(*record));
            if statistic < threshold {
                admissible.push(MatchCandidate {
                    detection_index: i,
                    record_id: record.id,
                    statistic,
                });
            }
        }
    }

    admissible.sort_by(|a, b| {
        a.statistic
            .total_cmp(&b.statistic)
            .then_with(|| detections[a.detection_index].id.cmp(&detections[b.detection_index].id))
            .then_with(|| a.record_id.cmp(&b.record_id))
    });

    let mut used_detections = vec![false; detections.len()];
    let mut used_records: HashSet<SourceId> = HashSet::new();
    let mut pairs = Vec::new();
    for candidate in admissible {
        if used_detections[candidate.detection_index] || used_records.contains(&candidate.record_id)
        {
            continue;
        }
        used_detections[candidate.detection_index] = true;
        used_records.insert(candidate.record_id);
        pairs.push(candidate);
    }

    let unmatched_detections = used_detections
        .iter()
        .enumerate()
        .filter(|(_, used)| !**used)
        .map(|(i, _)| i)
        .collect();

    Assignment {
        pairs,
        unmatched_detections,
    }
}
