//! Positioner kinematics: inverse (x, y) → (θ, φ) and forward placement of
//! the arm exclusion polygons.
//!
//! Every primitive reports reachability instead of erroring: `None` (or a
//! `true` "bad" flag) means the requested pose is outside the positioner's
//! patrol area or angle limits, and the caller simply rejects the candidate.

use rayon::prelude::*;

use super::{Hardware, LocId, Positioner};
use crate::geom::Shape;
use crate::Vec2;

/// Equality tolerance for the fully-extended / fully-folded arm branches.
/// Single-precision epsilon on squared millimeter comparisons.
const ARM_EPS: f64 = f32::EPSILON as f64;

/// Wrap `ang` by ±2π into `[zero + min, zero + max]`.
///
/// Returns the wrapped angle, or `None` when no wrap lands inside the range.
fn check_angle_range(ang: f64, zero: f64, min: f64, max: f64) -> Option<f64> {
    let two_pi = 2.0 * std::f64::consts::PI;
    let abs_min = zero + min;
    let abs_max = zero + max;
    let mut a = ang;
    if a < abs_min {
        a += two_pi;
    }
    if a > abs_max {
        a -= two_pi;
    }
    if a < abs_min || a > abs_max {
        None
    } else {
        Some(a)
    }
}

impl Positioner {
    /// Inverse kinematics: the (θ, φ) pose reaching a focal-plane position.
    ///
    /// Returns `None` when the position is outside the annulus the two arms
    /// can cover, or when the required angles fall outside the limits.
    pub fn xy_to_thetaphi(&self, position: Vec2) -> Option<(f64, f64)> {
        let offset = position - self.center;

        let sq_theta_arm = self.theta_arm * self.theta_arm;
        let sq_phi_arm = self.phi_arm * self.phi_arm;
        let sq_offset = offset.norm_squared();
        let sq_total_arm = (self.theta_arm + self.phi_arm).powi(2);
        let sq_diff_arm = (self.theta_arm - self.phi_arm).powi(2);

        let theta;
        let phi;
        if (sq_offset - sq_total_arm).abs() <= ARM_EPS {
            // Maximum extension: force phi to zero.
            phi = 0.0;
            theta = offset.y.atan2(offset.x);
        } else if (sq_diff_arm - sq_offset).abs() <= ARM_EPS {
            // Arm folded fully inwards: force phi to PI.
            phi = std::f64::consts::PI;
            theta = offset.y.atan2(offset.x);
        } else {
            if sq_total_arm < sq_offset || sq_offset < sq_diff_arm {
                return None;
            }

            // Opening angle at the elbow, law of cosines; phi is its
            // supplement.
            let opening = ((sq_theta_arm + sq_phi_arm - sq_offset)
                / (2.0 * self.theta_arm * self.phi_arm))
                .acos();
            phi = std::f64::consts::PI - opening;

            // Angle from the theta arm to the line from the center to the
            // target.
            let nrm_offset = sq_offset.sqrt();
            let txy = ((sq_theta_arm + sq_offset - sq_phi_arm)
                / (2.0 * self.theta_arm * nrm_offset))
                .acos();
            theta = offset.y.atan2(offset.x) - txy;
        }

        let theta = check_angle_range(theta, self.theta_offset, self.theta_min, self.theta_max)?;
        let phi = check_angle_range(phi, self.phi_offset, self.phi_min, self.phi_max)?;
        Some((theta, phi))
    }

    /// Forward kinematics: place copies of the arm templates at (θ, φ).
    ///
    /// Returns the positioned (theta shape, phi shape), or `None` when the
    /// angles are outside the limits.
    pub fn place_thetaphi(&self, theta: f64, phi: f64) -> Option<(Shape, Shape)> {
        let theta = check_angle_range(theta, self.theta_offset, self.theta_min, self.theta_max)?;
        let phi = check_angle_range(phi, self.phi_offset, self.phi_min, self.phi_max)?;

        let cs_theta = (theta.cos(), theta.sin());
        let cs_phi = (phi.cos(), phi.sin());

        let mut shp_theta = self.theta_excl.clone();
        let mut shp_phi = self.phi_excl.clone();

        // Move the phi polygon to the fully extended position along +x.
        shp_phi.translate(Vec2::new(self.theta_arm, 0.0));

        // Rotate the fully extended positioner by theta about its center.
        shp_theta.rotate_origin(cs_theta);
        shp_phi.rotate_origin(cs_theta);

        // Rotate just the phi arm by phi about the elbow.
        shp_phi.rotate(cs_phi);

        // Translate the whole positioner to its hole.
        shp_theta.translate(self.center);
        shp_phi.translate(self.center);

        Some((shp_theta, shp_phi))
    }

    /// Place the arm polygons so the fiber reaches a focal-plane position.
    pub fn place_xy(&self, position: Vec2) -> Option<(Shape, Shape)> {
        let (theta, phi) = self.xy_to_thetaphi(position)?;
        self.place_thetaphi(theta, phi)
    }
}

impl Hardware {
    /// Quick reachability probe: `true` when the location cannot reach `xy`.
    ///
    /// Inverse kinematics only; no polygons are placed.
    pub fn position_xy_bad(&self, loc: LocId, xy: Vec2) -> bool {
        self.positioner(loc).xy_to_thetaphi(xy).is_none()
    }

    /// Place the arm polygons of a location at a focal-plane position.
    pub fn loc_position_xy(&self, loc: LocId, xy: Vec2) -> Option<(Shape, Shape)> {
        self.positioner(loc).place_xy(xy)
    }

    /// Place the arm polygons of a location at a (θ, φ) pose.
    pub fn loc_position_thetaphi(&self, loc: LocId, theta: f64, phi: f64) -> Option<(Shape, Shape)> {
        self.positioner(loc).place_thetaphi(theta, phi)
    }

    /// Parallel [`Hardware::loc_position_xy`] over many locations.
    pub fn loc_position_xy_multi(
        &self,
        locs: &[LocId],
        xys: &[Vec2],
    ) -> Vec<Option<(Shape, Shape)>> {
        locs.par_iter()
            .zip(xys.par_iter())
            .map(|(&loc, &xy)| self.loc_position_xy(loc, xy))
            .collect()
    }

    /// Parallel [`Hardware::loc_position_thetaphi`] over many locations.
    pub fn loc_position_thetaphi_multi(
        &self,
        locs: &[LocId],
        theta: &[f64],
        phi: &[f64],
    ) -> Vec<Option<(Shape, Shape)>> {
        locs.par_iter()
            .zip(theta.par_iter().zip(phi.par_iter()))
            .map(|(&loc, (&th, &ph))| self.loc_position_thetaphi(loc, th, ph))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::focalplane::test_support::*;

    #[test]
    fn elbow_angles_for_partial_extension() {
        // Arms (3, 3), target at (4, 0): opening = acos(2/18), phi is the
        // supplement, theta swings below the x axis.
        let hw = hardware(vec![pos_record(100, 0, 0.0, 0.0, (3.0, 3.0))]);
        let (theta, phi) = hw
            .positioner(100)
            .xy_to_thetaphi(Vec2::new(4.0, 0.0))
            .expect("reachable");

        let opening = (2.0_f64 / 18.0).acos();
        let txy = (16.0_f64 / 24.0).acos();
        assert!((phi - (std::f64::consts::PI - opening)).abs() < 1e-12);
        assert!((theta + txy).abs() < 1e-12);
    }

    #[test]
    fn full_extension_and_fold() {
        let hw = hardware(vec![pos_record(100, 0, 0.0, 0.0, (3.0, 3.0))]);
        let p = hw.positioner(100);

        let (theta, phi) = p.xy_to_thetaphi(Vec2::new(6.0, 0.0)).expect("extended");
        assert_eq!(phi, 0.0);
        assert_eq!(theta, 0.0);

        // Equal arms fold back onto the center.
        let (_, phi) = p.xy_to_thetaphi(Vec2::new(0.0, 0.0)).expect("folded");
        assert_eq!(phi, std::f64::consts::PI);
    }

    #[test]
    fn out_of_annulus_unreachable() {
        let hw = hardware(vec![
            pos_record(100, 0, 0.0, 0.0, (3.0, 3.0)),
            pos_record(101, 0, 100.0, 0.0, (4.0, 2.0)),
        ]);
        assert!(hw.positioner(100).xy_to_thetaphi(Vec2::new(10.0, 0.0)).is_none());
        assert!(hw.position_xy_bad(100, Vec2::new(10.0, 0.0)));
        // Inside the inner annulus bound of unequal arms
        assert!(hw
            .positioner(101)
            .xy_to_thetaphi(Vec2::new(100.5, 0.0))
            .is_none());
    }

    #[test]
    fn angle_limits_make_pose_unreachable() {
        let mut r = pos_record(100, 0, 0.0, 0.0, (3.0, 3.0));
        // Tight phi range around fully-extended only
        r.phi_min_deg = -5.0;
        r.phi_max_deg = 5.0;
        let hw = hardware(vec![r]);
        let p = hw.positioner(100);
        assert!(p.xy_to_thetaphi(Vec2::new(6.0, 0.0)).is_some());
        assert!(p.xy_to_thetaphi(Vec2::new(3.0, 0.0)).is_none());
    }

    #[test]
    fn angle_range_wraps_by_two_pi() {
        // theta allowed in [-190°, -170°]; atan2 returns +π for (-r, 0) which
        // must wrap down by 2π into range.
        let mut r = pos_record(100, 0, 0.0, 0.0, (3.0, 3.0));
        r.theta_min_deg = -190.0;
        r.theta_max_deg = -170.0;
        let hw = hardware(vec![r]);
        let got = hw.positioner(100).xy_to_thetaphi(Vec2::new(-6.0, 0.0));
        let (theta, phi) = got.expect("wrapped into range");
        assert!((theta + std::f64::consts::PI).abs() < 1e-12);
        assert_eq!(phi, 0.0);
    }

    #[test]
    fn forward_places_fiber_tip_on_target() {
        let hw = hardware(vec![pos_record(100, 0, 5.0, -2.0, (3.0, 3.0))]);
        let p = hw.positioner(100);

        for &(dx, dy) in &[(4.0, 0.0), (1.5, 2.5), (-3.0, 1.0), (0.5, -4.0)] {
            let target = p.center + Vec2::new(dx, dy);
            let (_, shp_phi) = p.place_xy(target).expect("reachable");
            // The phi template carries the fiber tip at points[2].
            let tip = shp_phi.points[2];
            assert!(
                (tip - target).norm() < 1e-3,
                "tip {tip:?} vs target {target:?}"
            );
        }
    }

    #[test]
    fn multi_matches_scalar_placement() {
        let hw = hardware(vec![
            pos_record(100, 0, 0.0, 0.0, (3.0, 3.0)),
            pos_record(101, 0, 10.0, 0.0, (3.0, 3.0)),
        ]);
        let locs = vec![100, 101, 100];
        let xys = vec![Vec2::new(4.0, 0.0), Vec2::new(12.0, 1.0), Vec2::new(99.0, 0.0)];
        let multi = hw.loc_position_xy_multi(&locs, &xys);
        assert_eq!(multi.len(), 3);
        assert!(multi[0].is_some());
        assert!(multi[1].is_some());
        assert!(multi[2].is_none());
        let single = hw.loc_position_xy(100, Vec2::new(4.0, 0.0)).unwrap();
        let m = multi[0].as_ref().unwrap();
        assert_eq!(m.1.points, single.1.points);
    }
}
