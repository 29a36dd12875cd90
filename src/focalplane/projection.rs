//! Sky ↔ focal-plane projection.
//!
//! A target direction is mapped to millimeters on the focal plane in three
//! steps: rotate the celestial frame so the tile center lands on +x, measure
//! the angular radius and position angle of the target relative to that axis,
//! then convert the angle to a radial distance through the telescope's
//! radial distortion fit and apply the per-tile field rotation.
//!
//! The `*_multi` forms are data-parallel over independent points; the only
//! shared state is the immutable [`Hardware`].

use rayon::prelude::*;

use super::Hardware;
use crate::Vec2;

// Radial distortion fit, highest power first. The constant term is zero:
// the center of the tile maps to the center of the focal plane.
const RADIAL_FIT: [f64; 4] = [8.297e5, -1750.0, 1.394e4, 0.0];

// Newton inversion of the radial fit.
const NEWTON_GUESS_RAD: f64 = 0.01;
const NEWTON_STEP_RAD: f64 = 1e-4;
const NEWTON_TOL_MM: f64 = 1e-7;

impl Hardware {
    /// Radial distance (mm) from the tile center for a field angle (radians).
    pub fn radial_ang2dist(&self, theta_rad: f64) -> f64 {
        let mut dist_mm = 0.0;
        for p in RADIAL_FIT {
            dist_mm = theta_rad * dist_mm + p;
        }
        dist_mm
    }

    /// Field angle (radians) for a radial distance (mm) from the tile center.
    ///
    /// Inverts [`Hardware::radial_ang2dist`] with Newton iteration using a
    /// finite-difference slope.
    pub fn radial_dist2ang(&self, dist_mm: f64) -> f64 {
        let inv_step = 1.0 / NEWTON_STEP_RAD;
        let mut theta_rad = NEWTON_GUESS_RAD;
        loop {
            let cur = self.radial_ang2dist(theta_rad);
            let error = cur - dist_mm;
            if error.abs() <= NEWTON_TOL_MM {
                return theta_rad;
            }
            let ahead = self.radial_ang2dist(theta_rad + NEWTON_STEP_RAD);
            theta_rad -= error / (inv_step * (ahead - cur));
        }
    }

    /// Project a target (ra, dec) onto the focal plane of a tile.
    ///
    /// All inputs in degrees; `tile_theta` is the field rotation. Returns
    /// millimeters.
    pub fn radec2xy(
        &self,
        tile_ra: f64,
        tile_dec: f64,
        tile_theta: f64,
        ra: f64,
        dec: f64,
    ) -> Vec2 {
        let deg = std::f64::consts::PI / 180.0;

        // Inclination is 90 degrees minus the declination.
        let inc_rad = (90.0 - dec) * deg;
        let ra_rad = ra * deg;
        let tile_ra_rad = tile_ra * deg;
        let tile_dec_rad = tile_dec * deg;
        let tile_theta_rad = tile_theta * deg;

        let (sin_inc, cos_inc) = inc_rad.sin_cos();
        let (sin_ra, cos_ra) = ra_rad.sin_cos();
        let x0 = sin_inc * cos_ra;
        let y0 = sin_inc * sin_ra;
        let z0 = cos_inc;

        // Rotate about z by -tile_ra, then about y by -tile_dec, bringing the
        // tile center onto +x.
        let (sin_tra, cos_tra) = tile_ra_rad.sin_cos();
        let x1 = cos_tra * x0 + sin_tra * y0;
        let y1 = -sin_tra * x0 + cos_tra * y0;
        let z1 = z0;

        let (sin_tdec, cos_tdec) = tile_dec_rad.sin_cos();
        let x = cos_tdec * x1 + sin_tdec * z1;
        let y = y1;
        let z = -sin_tdec * x1 + cos_tdec * z1;

        let mut ra_ang = y.atan2(x);
        if ra_ang < 0.0 {
            ra_ang += 2.0 * std::f64::consts::PI;
        }
        let dec_ang = std::f64::consts::FRAC_PI_2
            - (z / (x * x + y * y + z * z).sqrt()).acos();

        let radius_rad = 2.0
            * ((dec_ang / 2.0).sin().powi(2)
                + dec_ang.cos() * (ra_ang / 2.0).sin().powi(2))
            .sqrt()
            .asin();

        let q_rad = z.atan2(-y);

        let radius_mm = self.radial_ang2dist(radius_rad);

        // Apply field rotation
        let rotated = q_rad + tile_theta_rad;

        Vec2::new(radius_mm * rotated.cos(), radius_mm * rotated.sin())
    }

    /// Parallel [`Hardware::radec2xy`] over many targets of one tile.
    pub fn radec2xy_multi(
        &self,
        tile_ra: f64,
        tile_dec: f64,
        tile_theta: f64,
        radec: &[(f64, f64)],
    ) -> Vec<Vec2> {
        radec
            .par_iter()
            .map(|&(ra, dec)| self.radec2xy(tile_ra, tile_dec, tile_theta, ra, dec))
            .collect()
    }

    /// Invert [`Hardware::radec2xy`]: focal-plane mm back to (ra, dec) degrees.
    pub fn xy2radec(
        &self,
        tile_ra: f64,
        tile_dec: f64,
        tile_theta: f64,
        x_mm: f64,
        y_mm: f64,
    ) -> (f64, f64) {
        let deg = std::f64::consts::PI / 180.0;
        let rad_to_deg = 180.0 / std::f64::consts::PI;

        let tile_ra_rad = tile_ra * deg;
        let tile_dec_rad = tile_dec * deg;
        let tile_theta_rad = tile_theta * deg;

        let radius_mm = (x_mm * x_mm + y_mm * y_mm).sqrt();
        let radius_rad = self.radial_dist2ang(radius_mm);

        // Remove field rotation from the focal-plane position angle.
        let rotated = y_mm.atan2(x_mm);
        let q_rad = rotated - tile_theta_rad;

        // Walk the unit vector back through the tile rotations: clockwise
        // about z by the radius, clockwise about x by q, then undo the tile
        // declination and right ascension rotations.
        let (sin_r, cos_r) = radius_rad.sin_cos();
        let x1 = cos_r;
        let y1 = -sin_r;

        let (sin_q, cos_q) = q_rad.sin_cos();
        let x2 = x1;
        let y2 = y1 * cos_q;
        let z2 = -y1 * sin_q;

        let (sin_tdec, cos_tdec) = tile_dec_rad.sin_cos();
        let x3 = cos_tdec * x2 - sin_tdec * z2;
        let y3 = y2;
        let z3 = sin_tdec * x2 + cos_tdec * z2;

        let (sin_tra, cos_tra) = tile_ra_rad.sin_cos();
        let x4 = cos_tra * x3 - sin_tra * y3;
        let y4 = sin_tra * x3 + cos_tra * y3;
        let z4 = z3;

        let mut ra_rad = y4.atan2(x4);
        if ra_rad < 0.0 {
            ra_rad += 2.0 * std::f64::consts::PI;
        }
        let dec_rad = std::f64::consts::FRAC_PI_2 - z4.acos();

        ((ra_rad * rad_to_deg).rem_euclid(360.0), dec_rad * rad_to_deg)
    }

    /// Parallel [`Hardware::xy2radec`] over many focal-plane positions.
    pub fn xy2radec_multi(
        &self,
        tile_ra: f64,
        tile_dec: f64,
        tile_theta: f64,
        xy: &[Vec2],
    ) -> Vec<(f64, f64)> {
        xy.par_iter()
            .map(|p| self.xy2radec(tile_ra, tile_dec, tile_theta, p.x, p.y))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::focalplane::test_support::*;

    #[test]
    fn radial_fit_zero_at_center() {
        let hw = hardware(vec![pos_record(100, 0, 0.0, 0.0, (3.0, 3.0))]);
        assert_eq!(hw.radial_ang2dist(0.0), 0.0);
    }

    #[test]
    fn radial_fit_inverts() {
        let hw = hardware(vec![pos_record(100, 0, 0.0, 0.0, (3.0, 3.0))]);
        // Field angles out to 2 degrees
        for i in 1..=40 {
            let theta = (i as f64) * 0.05_f64.to_radians();
            let dist = hw.radial_ang2dist(theta);
            let back = hw.radial_dist2ang(dist);
            assert!(
                (back - theta).abs() < 1e-7,
                "theta {theta} -> {dist} mm -> {back}"
            );
        }
    }

    #[test]
    fn sky_roundtrip() {
        let hw = hardware(vec![pos_record(100, 0, 0.0, 0.0, (3.0, 3.0))]);
        let (tile_ra, tile_dec, tile_theta) = (150.0, 20.0, 5.0);

        for &(dra, ddec) in &[
            (0.3, 0.0),
            (-0.5, 0.4),
            (0.0, -0.9),
            (1.0, 1.0),
            (-1.1, -0.2),
        ] {
            let ra = tile_ra + dra;
            let dec = tile_dec + ddec;
            let xy = hw.radec2xy(tile_ra, tile_dec, tile_theta, ra, dec);
            let (ra2, dec2) = hw.xy2radec(tile_ra, tile_dec, tile_theta, xy.x, xy.y);
            let tol = 1e-9_f64.to_degrees();
            assert!(
                (ra2 - ra).abs() < tol && (dec2 - dec).abs() < tol,
                "({ra}, {dec}) -> ({ra2}, {dec2})"
            );
        }
    }

    #[test]
    fn tile_center_maps_to_origin() {
        let hw = hardware(vec![pos_record(100, 0, 0.0, 0.0, (3.0, 3.0))]);
        let xy = hw.radec2xy(42.0, -15.0, 0.0, 42.0, -15.0);
        assert!(xy.norm() < 1e-9, "center at {xy:?}");
    }

    #[test]
    fn field_rotation_spins_the_plane() {
        let hw = hardware(vec![pos_record(100, 0, 0.0, 0.0, (3.0, 3.0))]);
        let a = hw.radec2xy(10.0, 0.0, 0.0, 10.5, 0.0);
        let b = hw.radec2xy(10.0, 0.0, 90.0, 10.5, 0.0);
        // Same radius, rotated by 90 degrees
        assert!((a.norm() - b.norm()).abs() < 1e-9);
        let dot = a.x * b.x + a.y * b.y;
        assert!(dot.abs() < 1e-6 * a.norm() * b.norm(), "not orthogonal");
    }

    #[test]
    fn multi_matches_scalar() {
        let hw = hardware(vec![pos_record(100, 0, 0.0, 0.0, (3.0, 3.0))]);
        let radec: Vec<(f64, f64)> = (0..64)
            .map(|i| (120.0 + (i as f64) * 0.01, -5.0 + (i as f64) * 0.007))
            .collect();
        let multi = hw.radec2xy_multi(120.5, -5.2, 12.0, &radec);
        for (i, &(ra, dec)) in radec.iter().enumerate() {
            let single = hw.radec2xy(120.5, -5.2, 12.0, ra, dec);
            assert_eq!(multi[i], single);
        }
        let back = hw.xy2radec_multi(120.5, -5.2, 12.0, &multi);
        for (i, &(ra, dec)) in radec.iter().enumerate() {
            assert!((back[i].0 - ra).abs() < 1e-7 && (back[i].1 - dec).abs() < 1e-7);
        }
    }
}
