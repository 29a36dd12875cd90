//! Collision checks between positioners and against static boundaries.
//!
//! A pose that cannot be reached counts as a collision: the caller is asking
//! "may both positioners hold these positions", and an out-of-range pose is
//! just as unacceptable as an overlap. Only three polygon pairs are tested
//! per positioner pair; the central theta bodies of two neighbors cannot
//! touch each other.
//!
//! The batch checks place every supplied positioner in parallel, test the
//! deduplicated neighbor pairs in parallel, and fold the per-pair hits into
//! the output marks serially, so the result is identical for any thread
//! count.

use std::collections::{BTreeSet, HashMap};

use rayon::prelude::*;

use super::{Hardware, LocId};
use crate::geom::{intersects, Shape};
use crate::Vec2;

impl Hardware {
    /// True when two positioners reaching for the given positions interfere,
    /// or when either position is unreachable.
    pub fn collide_xy(&self, loc1: LocId, xy1: Vec2, loc2: LocId, xy2: Vec2) -> bool {
        let Some((theta1, phi1)) = self.loc_position_xy(loc1, xy1) else {
            return true;
        };
        let Some((theta2, phi2)) = self.loc_position_xy(loc2, xy2) else {
            return true;
        };
        arms_collide(&theta1, &phi1, &theta2, &phi2)
    }

    /// [`Hardware::collide_xy`] starting from (θ, φ) poses.
    pub fn collide_thetaphi(
        &self,
        loc1: LocId,
        theta1: f64,
        phi1: f64,
        loc2: LocId,
        theta2: f64,
        phi2: f64,
    ) -> bool {
        let Some((t1, p1)) = self.loc_position_thetaphi(loc1, theta1, phi1) else {
            return true;
        };
        let Some((t2, p2)) = self.loc_position_thetaphi(loc2, theta2, phi2) else {
            return true;
        };
        arms_collide(&t1, &p1, &t2, &p2)
    }

    /// True when a positioner reaching for `xy` hits its petal's static
    /// boundaries (GFA or petal edge), or when `xy` is unreachable.
    ///
    /// The theta body stays near the hole and clears the boundaries by
    /// construction; only the phi arm is tested.
    pub fn collide_xy_edges(&self, loc: LocId, xy: Vec2) -> bool {
        let Some((_, phi)) = self.loc_position_xy(loc, xy) else {
            return true;
        };
        let p = self.positioner(loc);
        intersects(&phi, &p.gfa_excl) || intersects(&phi, &p.petal_excl)
    }

    /// Batch collision check from focal-plane positions.
    ///
    /// Returns one flag per supplied location, `true` when that location
    /// participates in at least one collision (including an unreachable
    /// pose paired with a neighbor). Neighbor pairs are restricted to the
    /// supplied set.
    pub fn check_collisions_xy(&self, locs: &[LocId], xys: &[Vec2]) -> Vec<bool> {
        let placed = self.loc_position_xy_multi(locs, xys);
        self.mark_colliding_pairs(locs, &placed)
    }

    /// Batch collision check from (θ, φ) poses.
    pub fn check_collisions_thetaphi(
        &self,
        locs: &[LocId],
        theta: &[f64],
        phi: &[f64],
    ) -> Vec<bool> {
        let placed = self.loc_position_thetaphi_multi(locs, theta, phi);
        self.mark_colliding_pairs(locs, &placed)
    }

    fn mark_colliding_pairs(
        &self,
        locs: &[LocId],
        placed: &[Option<(Shape, Shape)>],
    ) -> Vec<bool> {
        let loc_index: HashMap<LocId, usize> =
            locs.iter().enumerate().map(|(i, &l)| (l, i)).collect();

        // Deduplicated unordered neighbor pairs with both ends in the batch.
        let mut pairs: BTreeSet<(LocId, LocId)> = BTreeSet::new();
        for &lid in locs {
            for &nb in self.neighbors(lid) {
                if loc_index.contains_key(&nb) {
                    pairs.insert((lid.min(nb), lid.max(nb)));
                }
            }
        }
        let pairs: Vec<(LocId, LocId)> = pairs.into_iter().collect();

        let hits: Vec<(usize, usize)> = pairs
            .par_iter()
            .filter_map(|&(low, high)| {
                let i = loc_index[&low];
                let j = loc_index[&high];
                let hit = match (&placed[i], &placed[j]) {
                    (Some((t1, p1)), Some((t2, p2))) => arms_collide(t1, p1, t2, p2),
                    // An unplaceable pose invalidates the whole pair.
                    _ => true,
                };
                hit.then_some((i, j))
            })
            .collect();

        let mut result = vec![false; locs.len()];
        for (i, j) in hits {
            result[i] = true;
            result[j] = true;
        }
        result
    }
}

/// The three polygon pairs that can interfere between two neighbors.
fn arms_collide(theta1: &Shape, phi1: &Shape, theta2: &Shape, phi2: &Shape) -> bool {
    intersects(phi1, phi2) || intersects(theta1, phi2) || intersects(theta2, phi1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::focalplane::test_support::*;

    #[test]
    fn reaching_for_the_same_point_collides() {
        // Two positioners 6 mm apart, both reaching the midpoint: the phi
        // arms land on top of each other.
        let hw = hardware(vec![
            pos_record(100, 0, 0.0, 0.0, (3.0, 3.0)),
            pos_record(101, 0, 6.0, 0.0, (3.0, 3.0)),
        ]);
        let p = Vec2::new(3.0, 0.0);
        assert!(hw.collide_xy(100, p, 101, p));
    }

    #[test]
    fn separated_reaches_do_not_collide() {
        let hw = hardware(vec![
            pos_record(100, 0, 0.0, 0.0, (3.0, 3.0)),
            pos_record(101, 0, 12.0, 0.0, (3.0, 3.0)),
        ]);
        assert!(!hw.collide_xy(
            100,
            Vec2::new(-3.0, 0.0),
            101,
            Vec2::new(15.0, 0.0)
        ));
    }

    #[test]
    fn collision_is_symmetric() {
        let hw = hardware(vec![
            pos_record(100, 0, 0.0, 0.0, (3.0, 3.0)),
            pos_record(101, 0, 6.0, 0.0, (3.0, 3.0)),
        ]);
        let cases = [
            (Vec2::new(3.0, 0.0), Vec2::new(3.0, 0.0)),
            (Vec2::new(4.0, 1.0), Vec2::new(2.5, -1.0)),
            (Vec2::new(-3.0, 0.0), Vec2::new(9.0, 0.0)),
        ];
        for &(a, b) in &cases {
            assert_eq!(
                hw.collide_xy(100, a, 101, b),
                hw.collide_xy(101, b, 100, a)
            );
        }
    }

    #[test]
    fn unreachable_pose_counts_as_collision() {
        let hw = hardware(vec![
            pos_record(100, 0, 0.0, 0.0, (3.0, 3.0)),
            pos_record(101, 0, 6.0, 0.0, (3.0, 3.0)),
        ]);
        // 100 cannot reach (20, 0) at all
        assert!(hw.collide_xy(100, Vec2::new(20.0, 0.0), 101, Vec2::new(9.0, 0.0)));
    }

    #[test]
    fn thetaphi_matches_xy_for_same_pose() {
        let hw = hardware(vec![
            pos_record(100, 0, 0.0, 0.0, (3.0, 3.0)),
            pos_record(101, 0, 6.0, 0.0, (3.0, 3.0)),
        ]);
        let a = Vec2::new(3.0, 0.5);
        let b = Vec2::new(3.5, -0.5);
        let (t1, p1) = hw.positioner(100).xy_to_thetaphi(a).unwrap();
        let (t2, p2) = hw.positioner(101).xy_to_thetaphi(b).unwrap();
        assert_eq!(
            hw.collide_xy(100, a, 101, b),
            hw.collide_thetaphi(100, t1, p1, 101, t2, p2)
        );
    }

    #[test]
    fn edge_collision_against_gfa() {
        let mut r = pos_record(100, 3, 0.0, 0.0, (3.0, 3.0));
        // Petal 3 rotation is (7 + 3) * 36 = 360 ≡ 0 degrees, so the
        // boundary polygon stays where we put it: a wall crossing (4, 0).
        r.gfa_excl = Shape::new(
            Vec2::new(4.5, 0.0),
            vec![
                Vec2::new(4.0, -5.0),
                Vec2::new(5.0, -5.0),
                Vec2::new(5.0, 5.0),
                Vec2::new(4.0, 5.0),
            ],
        );
        let hw = hardware(vec![r]);
        // Reaching toward the wall sweeps the phi arm into it
        assert!(hw.collide_xy_edges(100, Vec2::new(4.5, 0.0)));
        // Reaching the other way stays clear
        assert!(!hw.collide_xy_edges(100, Vec2::new(-4.0, 0.0)));
    }

    #[test]
    fn batch_marks_both_members_of_a_colliding_pair() {
        let hw = hardware(vec![
            pos_record(100, 0, 0.0, 0.0, (3.0, 3.0)),
            pos_record(101, 0, 6.0, 0.0, (3.0, 3.0)),
            pos_record(102, 0, 40.0, 0.0, (3.0, 3.0)),
        ]);
        let locs = vec![100, 101, 102];
        let xys = vec![Vec2::new(3.0, 0.0), Vec2::new(3.0, 0.0), Vec2::new(43.0, 0.0)];
        let marks = hw.check_collisions_xy(&locs, &xys);
        assert_eq!(marks, vec![true, true, false]);
    }

    #[test]
    fn batch_ignores_neighbors_outside_the_batch() {
        let hw = hardware(vec![
            pos_record(100, 0, 0.0, 0.0, (3.0, 3.0)),
            pos_record(101, 0, 6.0, 0.0, (3.0, 3.0)),
        ]);
        // Only loc 100 supplied; its neighbor 101 is not in the batch and
        // must not be probed.
        let marks = hw.check_collisions_xy(&[100], &[Vec2::new(3.0, 0.0)]);
        assert_eq!(marks, vec![false]);
    }

    #[test]
    fn batch_thetaphi_agrees_with_batch_xy() {
        let hw = hardware(vec![
            pos_record(100, 0, 0.0, 0.0, (3.0, 3.0)),
            pos_record(101, 0, 6.0, 0.0, (3.0, 3.0)),
        ]);
        let locs = vec![100, 101];
        let xys = vec![Vec2::new(3.0, 0.2), Vec2::new(3.2, -0.2)];
        let mut theta = Vec::new();
        let mut phi = Vec::new();
        for (&l, &xy) in locs.iter().zip(xys.iter()) {
            let (t, p) = hw.positioner(l).xy_to_thetaphi(xy).unwrap();
            theta.push(t);
            phi.push(p);
        }
        assert_eq!(
            hw.check_collisions_xy(&locs, &xys),
            hw.check_collisions_thetaphi(&locs, &theta, &phi)
        );
    }
}
