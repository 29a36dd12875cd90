//! The merged target list (MTL) and the spatial index used to find targets
//! near a tile center.
//!
//! The catalog itself is immutable; the per-target observation budget is
//! owned and decremented by the assignment engine, not here.
//!
//! [`SkyIndex`] is the boundary to the external spatial tree: one cone query,
//! over-approximate supersets allowed. [`GridIndex`] is the provided
//! implementation — a spherical grid binned in `z = sin(dec)` and right
//! ascension, with an exact dot-product post-filter.

use std::collections::HashMap;
use std::f64::consts::{PI, TAU};

use serde::{Deserialize, Serialize};

use crate::Vec3;

/// Stable catalog identifier of one target.
pub type TargetId = i64;

// ── Observing conditions ────────────────────────────────────────────────────

pub const OBS_DARK: u32 = 1;
pub const OBS_GRAY: u32 = 2;
pub const OBS_BRIGHT: u32 = 4;

// ── Targets ─────────────────────────────────────────────────────────────────

/// Science role of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetKind {
    Science,
    StandardStar,
    SkyFiber,
    SafeLocation,
    Supplementary,
}

/// One row of the merged target list. Coordinates in degrees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub ra: f64,
    pub dec: f64,
    /// Observing-condition bitmask; the target is eligible on a tile when the
    /// masks intersect.
    pub obscond: u32,
    pub priority: i32,
    /// Tie-breaker within a priority class.
    pub subpriority: f64,
    /// Requested number of observations.
    pub nobs: i32,
    pub kind: TargetKind,
}

impl Target {
    /// Unit vector of the target direction on the celestial sphere.
    pub fn uvec(&self) -> Vec3 {
        radec_to_uvec(self.ra.to_radians(), self.dec.to_radians())
    }
}

/// The merged target list: id → target, with deterministic iteration order.
#[derive(Debug, Clone, Default)]
pub struct Mtl {
    targets: HashMap<TargetId, Target>,
    /// All ids, ascending.
    ids: Vec<TargetId>,
}

impl Mtl {
    pub fn new(targets: Vec<Target>) -> Self {
        let mut map = HashMap::with_capacity(targets.len());
        for t in targets {
            map.insert(t.id, t);
        }
        let mut ids: Vec<TargetId> = map.keys().copied().collect();
        ids.sort_unstable();
        Self { targets: map, ids }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, id: TargetId) -> Option<&Target> {
        self.targets.get(&id)
    }

    /// All target ids, ascending.
    pub fn ids(&self) -> &[TargetId] {
        &self.ids
    }

    /// Iterate targets in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.ids.iter().map(move |id| &self.targets[id])
    }
}

// ── Spatial index ───────────────────────────────────────────────────────────

/// Cone query over the target catalog.
///
/// `near` returns the ids of targets within `radius_deg` of the pointing;
/// returning a superset is acceptable, the caller re-filters by geometry.
pub trait SkyIndex {
    fn near(&self, ra_deg: f64, dec_deg: f64, radius_deg: f64) -> Vec<TargetId>;
}

/// Spherical grid index over target directions.
///
/// Latitude is partitioned into `3 * nside` bins in `z = sin(dec)` and
/// longitude into `4 * nside` bins in right ascension. A query scans the
/// bins intersecting the cone and applies an exact angular filter.
#[derive(Debug, Clone)]
pub struct GridIndex {
    n_lat: u32,
    n_lon: u32,
    entries: Vec<(TargetId, Vec3)>,
    cell_offsets: Vec<u32>,
    entry_indices: Vec<u32>,
}

impl GridIndex {
    /// Build the index over a catalog. `nside` controls resolution; the
    /// number of sky cells is `12 * nside^2`.
    pub fn new(nside: u32, mtl: &Mtl) -> Self {
        assert!(nside > 0, "nside must be > 0");
        let n_lat = 3 * nside;
        let n_lon = 4 * nside;
        let n_cells = (n_lat * n_lon) as usize;

        let entries: Vec<(TargetId, Vec3)> = mtl.iter().map(|t| (t.id, t.uvec())).collect();

        let mut bins: Vec<Vec<u32>> = vec![Vec::new(); n_cells];
        for (i, t) in mtl.iter().enumerate() {
            let cell = cell_for_radec(n_lat, n_lon, t.ra.to_radians(), t.dec.to_radians());
            bins[cell as usize].push(i as u32);
        }

        let mut cell_offsets = Vec::with_capacity(n_cells + 1);
        let mut entry_indices = Vec::with_capacity(entries.len());
        cell_offsets.push(0);
        for bin in bins {
            entry_indices.extend(bin);
            cell_offsets.push(entry_indices.len() as u32);
        }

        Self {
            n_lat,
            n_lon,
            entries,
            cell_offsets,
            entry_indices,
        }
    }

    fn collect_cell_matches(
        &self,
        lat_bin: u32,
        lon_bin: u32,
        dir: Vec3,
        cos_radius: f64,
        out: &mut Vec<TargetId>,
    ) {
        let cell = (lat_bin * self.n_lon + lon_bin) as usize;
        let start = self.cell_offsets[cell] as usize;
        let end = self.cell_offsets[cell + 1] as usize;
        for &idx in &self.entry_indices[start..end] {
            let (id, uvec) = self.entries[idx as usize];
            if dir.dot(&uvec) >= cos_radius {
                out.push(id);
            }
        }
    }

    fn for_each_wrapped_lon_bin<F: FnMut(u32)>(&self, lon_min: f64, lon_max: f64, mut f: F) {
        let start_bin = phi_to_lon_bin(self.n_lon, lon_min.rem_euclid(TAU));
        let end_bin = phi_to_lon_bin(self.n_lon, lon_max.rem_euclid(TAU));
        if start_bin <= end_bin {
            for b in start_bin..=end_bin {
                f(b);
            }
        } else {
            for b in start_bin..self.n_lon {
                f(b);
            }
            for b in 0..=end_bin {
                f(b);
            }
        }
    }
}

impl SkyIndex for GridIndex {
    fn near(&self, ra_deg: f64, dec_deg: f64, radius_deg: f64) -> Vec<TargetId> {
        if self.entries.is_empty() {
            return Vec::new();
        }
        let radius = radius_deg.to_radians().clamp(0.0, PI);
        let dir = radec_to_uvec(ra_deg.to_radians(), dec_deg.to_radians());
        let cos_radius = radius.cos();

        let z_step = 2.0 / self.n_lat as f64;
        let lon_step = TAU / self.n_lon as f64;

        let z_center = dir.z.clamp(-1.0, 1.0);
        let z_min = (z_center - radius.sin()).max(-1.0);
        let z_max = (z_center + radius.sin()).min(1.0);

        let mut out = Vec::new();
        for lat_bin in z_to_lat_bin(self.n_lat, z_min)..=z_to_lat_bin(self.n_lat, z_max) {
            // Widest parallel the bin touches; polar bins degenerate to a
            // full ring walk.
            let z_lo = -1.0 + lat_bin as f64 * z_step;
            let z_hi = (z_lo + z_step).min(1.0);
            let max_abs_z = z_lo.abs().max(z_hi.abs()).min(1.0);
            let cos_dec = (1.0 - max_abs_z * max_abs_z).sqrt().max(1e-9);

            let lon_half_span = (radius / cos_dec).min(PI) + lon_step;

            let mut phi = dir.y.atan2(dir.x);
            if phi < 0.0 {
                phi += TAU;
            }

            if 2.0 * lon_half_span >= TAU {
                for lon_bin in 0..self.n_lon {
                    self.collect_cell_matches(lat_bin, lon_bin, dir, cos_radius, &mut out);
                }
                continue;
            }

            self.for_each_wrapped_lon_bin(phi - lon_half_span, phi + lon_half_span, |lon_bin| {
                self.collect_cell_matches(lat_bin, lon_bin, dir, cos_radius, &mut out);
            });
        }

        out.sort_unstable();
        out.dedup();
        out
    }
}

fn radec_to_uvec(ra_rad: f64, dec_rad: f64) -> Vec3 {
    let (sin_ra, cos_ra) = ra_rad.sin_cos();
    let (sin_dec, cos_dec) = dec_rad.sin_cos();
    Vec3::new(cos_dec * cos_ra, cos_dec * sin_ra, sin_dec)
}

fn cell_for_radec(n_lat: u32, n_lon: u32, ra_rad: f64, dec_rad: f64) -> u32 {
    let phi = ra_rad.rem_euclid(TAU);
    let z = dec_rad.sin().clamp(-1.0, 1.0);
    z_to_lat_bin(n_lat, z) * n_lon + phi_to_lon_bin(n_lon, phi)
}

fn z_to_lat_bin(n_lat: u32, z: f64) -> u32 {
    let u = ((z.clamp(-1.0, 1.0) + 1.0) * 0.5).clamp(0.0, 1.0);
    ((u * n_lat as f64).floor() as u32).min(n_lat - 1)
}

fn phi_to_lon_bin(n_lon: u32, phi: f64) -> u32 {
    let u = (phi / TAU).clamp(0.0, 1.0 - f64::EPSILON);
    ((u * n_lon as f64).floor() as u32).min(n_lon - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn science(id: TargetId, ra: f64, dec: f64) -> Target {
        Target {
            id,
            ra,
            dec,
            obscond: OBS_DARK,
            priority: 100,
            subpriority: 0.5,
            nobs: 1,
            kind: TargetKind::Science,
        }
    }

    #[test]
    fn cone_query_finds_nearby_targets() {
        let mtl = Mtl::new(vec![
            science(1, 0.0, 0.0),
            science(2, 2.0, 1.0),
            science(3, 40.0, -10.0),
        ]);
        let index = GridIndex::new(8, &mtl);
        let hits = index.near(0.5, 0.25, 3.0);
        assert_eq!(hits, vec![1, 2]);
    }

    #[test]
    fn cone_query_handles_ra_wraparound() {
        let mtl = Mtl::new(vec![
            science(10, 359.0, 0.0),
            science(11, 1.0, 0.0),
            science(12, 180.0, 0.0),
        ]);
        let index = GridIndex::new(8, &mtl);
        let hits = index.near(0.0, 0.0, 3.0);
        assert_eq!(hits, vec![10, 11]);
    }

    #[test]
    fn cone_query_matches_brute_force() {
        // A band of targets around one declination; compare against a direct
        // angular scan.
        let targets: Vec<Target> = (0..200)
            .map(|i| science(i, (i as f64) * 1.8, -30.0 + ((i % 7) as f64) * 9.5))
            .collect();
        let mtl = Mtl::new(targets);
        let index = GridIndex::new(16, &mtl);

        let (ra, dec, radius) = (123.0, 10.0, 8.0);
        let hits = index.near(ra, dec, radius);

        let dir = radec_to_uvec(ra.to_radians(), dec.to_radians());
        let expected: Vec<TargetId> = mtl
            .iter()
            .filter(|t| dir.dot(&t.uvec()).acos() <= radius.to_radians())
            .map(|t| t.id)
            .collect();
        assert_eq!(hits, expected);
    }

    #[test]
    fn polar_cap_query() {
        let mtl = Mtl::new(vec![science(1, 10.0, 89.5), science(2, 200.0, 89.0)]);
        let index = GridIndex::new(8, &mtl);
        let hits = index.near(0.0, 90.0, 1.5);
        assert_eq!(hits, vec![1, 2]);
    }

    #[test]
    fn mtl_iterates_in_id_order() {
        let mtl = Mtl::new(vec![science(5, 0.0, 0.0), science(1, 1.0, 0.0), science(3, 2.0, 0.0)]);
        let ids: Vec<TargetId> = mtl.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
        assert_eq!(mtl.get(3).map(|t| t.ra), Some(2.0));
        assert!(mtl.get(99).is_none());
    }
}
