//! Spherical geometry on the celestial sphere
//!
//! Angles at the public boundary are in degrees; unit-vector and tangent-plane
//! helpers work in radians. Every function is pure and deterministic so
//! matching decisions are reproducible bit-for-bit.

use serde::{Deserialize, Serialize};
use skycat_common::config::AssociationConfig;
use skycat_common::{Error, Result};

/// A position on the sky (ICRS degrees)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyPosition {
    pub ra_deg: f64,
    pub dec_deg: f64,
}

impl SkyPosition {
    pub fn new(ra_deg: f64, dec_deg: f64) -> Self {
        Self { ra_deg, dec_deg }
    }

    /// Unit vector `[x, y, z]`
    pub fn to_xyz(&self) -> [f64; 3] {
        radec_to_xyz(self.ra_deg.to_radians(), self.dec_deg.to_radians())
    }

    pub fn is_valid(&self) -> bool {
        self.ra_deg.is_finite()
            && self.dec_deg.is_finite()
            && (-90.0..=90.0).contains(&self.dec_deg)
    }
}

/// Convert (RA, Dec) in radians to a unit vector `[x, y, z]`.
pub fn radec_to_xyz(ra: f64, dec: f64) -> [f64; 3] {
    let cos_dec = dec.cos();
    [cos_dec * ra.cos(), cos_dec * ra.sin(), dec.sin()]
}

/// Great-circle separation in degrees.
///
/// Haversine in its atan2 form: well conditioned for tiny separations, at the
/// poles and across the RA 0/360 seam, and symmetric in its arguments.
pub fn angular_separation(a: SkyPosition, b: SkyPosition) -> f64 {
    let dec1 = a.dec_deg.to_radians();
    let dec2 = b.dec_deg.to_radians();
    let half_ddec = ((b.dec_deg - a.dec_deg).to_radians() * 0.5).sin();
    let half_dra = ((b.ra_deg - a.ra_deg).to_radians() * 0.5).sin();

    let h = (half_ddec * half_ddec + dec1.cos() * dec2.cos() * half_dra * half_dra)
        .clamp(0.0, 1.0);
    (2.0 * h.sqrt().atan2((1.0 - h).sqrt())).to_degrees()
}

/// Normalized midpoint of two unit vectors; `None` for antipodal points.
pub fn midpoint_xyz(a: [f64; 3], b: [f64; 3]) -> Option<[f64; 3]> {
    let mx = a[0] + b[0];
    let my = a[1] + b[1];
    let mz = a[2] + b[2];
    let norm = (mx * mx + my * my + mz * mz).sqrt();
    if norm < 1e-15 {
        return None;
    }
    let inv = 1.0 / norm;
    Some([mx * inv, my * inv, mz * inv])
}

/// Gnomonic (TAN) projection of `point` onto the tangent plane at `reference`.
///
/// Returns `(x, y)` in radians: x increases with RA, y toward the north pole.
/// `None` if the point lies in the opposite hemisphere.
pub fn tangent_offsets(point: [f64; 3], reference: [f64; 3]) -> Option<(f64, f64)> {
    let s = point;
    let r = reference;

    let sdotr = s[0] * r[0] + s[1] * r[1] + s[2] * r[2];
    if sdotr <= 0.0 {
        return None;
    }
    let inv_sdotr = 1.0 / sdotr;

    // At a pole the RA direction is undefined; fall back to the x/y axes
    if r[0] == 0.0 && r[1] == 0.0 {
        let sign = if r[2] > 0.0 { 1.0 } else { -1.0 };
        return Some((sign * s[1] * inv_sdotr, -sign * s[0] * inv_sdotr));
    }

    // eta: perpendicular to r, in direction of increasing RA (eta_z = 0)
    let mut etax = -r[1];
    let mut etay = r[0];
    let inv_en = 1.0 / etax.hypot(etay);
    etax *= inv_en;
    etay *= inv_en;

    // xi = r cross eta: northward
    let xix = -r[2] * etay;
    let xiy = r[2] * etax;
    let xiz = r[0] * etay - r[1] * etax;

    let x = (s[0] * etax + s[1] * etay) * inv_sdotr;
    let y = (s[0] * xix + s[1] * xiy + s[2] * xiz) * inv_sdotr;

    Some((x, y))
}

/// Radius of the region searched for known sources around an image center.
///
/// `max(fov_radius * search_radius_scale, beam)`, capped by
/// `max_search_radius_deg`.
pub fn search_radius(fov_radius_deg: f64, beam_deg: f64, config: &AssociationConfig) -> Result<f64> {
    check_non_negative("fov_radius_deg", fov_radius_deg)?;
    check_non_negative("beam_deg", beam_deg)?;
    let radius = (fov_radius_deg * config.search_radius_scale).max(beam_deg);
    Ok(radius.min(config.max_search_radius_deg))
}

/// Per-source candidate cone: `beam * candidate_radius_beams`, capped.
pub fn candidate_radius(beam_deg: f64, config: &AssociationConfig) -> Result<f64> {
    check_non_negative("beam_deg", beam_deg)?;
    Ok((beam_deg * config.candidate_radius_beams).min(config.max_search_radius_deg))
}

fn check_non_negative(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(Error::Config(format!(
            "{} must be a non-negative number, got {}",
            name, value
        )));
    }
    Ok(())
}

/// Normalize RA into `[0, 360)`.
pub fn normalize_ra(ra_deg: f64) -> f64 {
    let ra = ra_deg.rem_euclid(360.0);
    if ra >= 360.0 {
        0.0
    } else {
        ra
    }
}

/// Shift `ra_deg` by whole turns so it lies within ±180° of `reference_deg`.
pub fn unwrap_ra_near(ra_deg: f64, reference_deg: f64) -> f64 {
    reference_deg + (ra_deg - reference_deg + 180.0).rem_euclid(360.0) - 180.0
}

/// Normalize a position angle (180° periodic) into `[0, 180)`.
pub fn normalize_pa(pa_deg: f64) -> f64 {
    let pa = pa_deg.rem_euclid(180.0);
    if pa >= 180.0 {
        0.0
    } else {
        pa
    }
}

/// Shift `pa_deg` by half turns so it lies within ±90° of `reference_deg`.
pub fn unwrap_pa_near(pa_deg: f64, reference_deg: f64) -> f64 {
    reference_deg + (pa_deg - reference_deg + 90.0).rem_euclid(180.0) - 90.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    fn assert_close(a: f64, b: f64, tol: f64) {
        assert!(
            (a - b).abs() < tol,
            "expected {a} ~= {b} (diff = {})",
            (a - b).abs()
        );
    }

    #[test]
    fn angular_separation_known() {
        let origin = SkyPosition::new(0.0, 0.0);
        assert_close(angular_separation(origin, SkyPosition::new(90.0, 0.0)), 90.0, EPS);
        assert_close(angular_separation(origin, SkyPosition::new(180.0, 0.0)), 180.0, 1e-9);
        assert_close(angular_separation(origin, origin), 0.0, EPS);
        assert_close(
            angular_separation(SkyPosition::new(0.0, 90.0), SkyPosition::new(0.0, -90.0)),
            180.0,
            1e-9,
        );
    }

    #[test]
    fn angular_separation_across_ra_seam() {
        let a = SkyPosition::new(359.9995, 10.0);
        let b = SkyPosition::new(0.0005, 10.0);
        let expected = 0.001 * 10.0_f64.to_radians().cos();
        assert_close(angular_separation(a, b), expected, 1e-9);
    }

    #[test]
    fn angular_separation_near_pole() {
        // Two points 1 arcsec apart across the pole
        let a = SkyPosition::new(0.0, 90.0 - 0.5 / 3600.0);
        let b = SkyPosition::new(180.0, 90.0 - 0.5 / 3600.0);
        assert_close(angular_separation(a, b), 1.0 / 3600.0, 1e-10);
    }

    #[test]
    fn angular_separation_symmetric() {
        let a = SkyPosition::new(123.456, -45.678);
        let b = SkyPosition::new(123.457, -45.6775);
        assert_eq!(angular_separation(a, b), angular_separation(b, a));
    }

    #[test]
    fn small_separation_resolution() {
        let a = SkyPosition::new(10.0, 20.0);
        let b = SkyPosition::new(10.0, 20.0 + 1e-6);
        assert_close(angular_separation(a, b), 1e-6, 1e-13);
    }

    #[test]
    fn tangent_offsets_axes() {
        let r = SkyPosition::new(0.0, 0.0).to_xyz();
        let delta = 1e-4_f64;
        let east = radec_to_xyz(delta, 0.0);
        let (x, y) = tangent_offsets(east, r).unwrap();
        assert_close(x, delta, 1e-8);
        assert_close(y, 0.0, 1e-8);

        let north = radec_to_xyz(0.0, delta);
        let (x, y) = tangent_offsets(north, r).unwrap();
        assert_close(x, 0.0, 1e-8);
        assert_close(y, delta, 1e-8);
    }

    #[test]
    fn tangent_offsets_opposite_hemisphere() {
        let r = SkyPosition::new(0.0, 0.0).to_xyz();
        let s = SkyPosition::new(180.0, 0.0).to_xyz();
        assert!(tangent_offsets(s, r).is_none());
    }

    #[test]
    fn tangent_offsets_at_pole_preserve_distance() {
        let pole = [0.0, 0.0, 1.0];
        let s = SkyPosition::new(45.0, 89.999).to_xyz();
        let (x, y) = tangent_offsets(s, pole).unwrap();
        assert_close(x.hypot(y), 0.001_f64.to_radians(), 1e-10);
    }

    #[test]
    fn search_radius_scales_and_caps() {
        let config = AssociationConfig::default();
        // 1.0 deg field * 0.5 scale
        assert_close(search_radius(1.0, 0.001, &config).unwrap(), 0.5, EPS);
        // Never smaller than the beam
        assert_close(search_radius(0.001, 0.01, &config).unwrap(), 0.01, EPS);
        // Capped by max_search_radius_deg
        assert_close(search_radius(20.0, 0.01, &config).unwrap(), 3.0, EPS);
    }

    #[test]
    fn search_radius_rejects_negative() {
        let config = AssociationConfig::default();
        let err = search_radius(-1.0, 0.01, &config).unwrap_err();
        assert_eq!(err.reason_code(), "CONFIGURATION_ERROR");
        assert!(candidate_radius(f64::NAN, &config).is_err());
    }

    #[test]
    fn ra_and_pa_wrapping() {
        assert_close(normalize_ra(-0.5), 359.5, EPS);
        assert_close(normalize_ra(360.0), 0.0, EPS);
        assert_close(unwrap_ra_near(359.9, 0.1), -0.1, 1e-9);
        assert_close(unwrap_ra_near(0.1, 359.9), 360.1, 1e-9);
        assert_close(normalize_pa(-10.0), 170.0, EPS);
        assert_close(unwrap_pa_near(175.0, 5.0), -5.0, 1e-9);
    }
}
