//! The availability map: which targets each (tile, positioner) pair can
//! physically reach, and its inverse.
//!
//! Built once before assignment. For every tile, the spatial index supplies
//! the targets within the focal-plane radius; each is projected to (x, y)
//! and tested against the patrol annulus, the angle limits, and the static
//! boundaries of every nearby science positioner. Candidates are ranked by
//! (priority desc, subpriority desc, id asc) so all downstream tie-breaking
//! is deterministic.
//!
//! The assignment engine prunes entries as targets complete; nothing else
//! mutates the map.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::focalplane::{
    DeviceType, Hardware, LocId, FIBER_STATE_OK, FOCALPLANE_RADIUS_DEG, PATROL_BUFFER_MM,
};
use crate::targets::{Mtl, SkyIndex, TargetId};
use crate::tiles::Tiles;
use crate::Vec2;

/// Reachability of targets per (tile, positioner), with projected positions
/// and the inverse target → slots map.
#[derive(Debug, Clone)]
pub struct Availability {
    /// tile index → loc → ranked candidate target ids.
    avail: Vec<HashMap<LocId, Vec<TargetId>>>,
    /// tile index → target id → projected focal-plane position, mm.
    xy: Vec<HashMap<TargetId, Vec2>>,
    /// target id → (tile index, loc) slots that can reach it, ascending.
    reachable: HashMap<TargetId, Vec<(usize, LocId)>>,
}

impl Availability {
    /// Build the map for a tile sequence over a catalog.
    pub fn build(hw: &Hardware, tiles: &Tiles, mtl: &Mtl, index: &dyn SkyIndex) -> Self {
        let science_locs = hw.device_locations(DeviceType::Pos);
        let buckets = LocBuckets::new(hw, &science_locs);

        let mut avail: Vec<HashMap<LocId, Vec<TargetId>>> = vec![HashMap::new(); tiles.len()];
        let mut xy: Vec<HashMap<TargetId, Vec2>> = vec![HashMap::new(); tiles.len()];

        for tile in 0..tiles.len() {
            let (tile_ra, tile_dec, tile_theta) = (tiles.ra[tile], tiles.dec[tile], tiles.theta[tile]);

            // Candidates near the tile center, filtered by observing
            // conditions and remaining budget before any geometry runs.
            let ids = index.near(tile_ra, tile_dec, FOCALPLANE_RADIUS_DEG);
            let mut cand: Vec<TargetId> = Vec::with_capacity(ids.len());
            let mut radec: Vec<(f64, f64)> = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(t) = mtl.get(id) else { continue };
                if t.obscond & tiles.obscond[tile] == 0 || t.nobs <= 0 {
                    continue;
                }
                cand.push(id);
                radec.push((t.ra, t.dec));
            }

            let projected = hw.radec2xy_multi(tile_ra, tile_dec, tile_theta, &radec);

            let mut nreach = 0usize;
            for (&id, &pos) in cand.iter().zip(projected.iter()) {
                for loc in buckets.nearby(pos) {
                    let p = hw.positioner(loc);
                    if p.state != FIBER_STATE_OK {
                        continue;
                    }
                    if (pos - p.center).norm() > p.patrol_radius() - PATROL_BUFFER_MM {
                        continue;
                    }
                    if p.xy_to_thetaphi(pos).is_none() {
                        continue;
                    }
                    // A reach that sweeps into the GFA or petal edge is
                    // unusable from this hole.
                    if hw.collide_xy_edges(loc, pos) {
                        continue;
                    }
                    avail[tile].entry(loc).or_default().push(id);
                    xy[tile].insert(id, pos);
                    nreach += 1;
                }
            }
            debug!(
                "tile {}: {} candidates, {} reachable (tile, loc) pairs",
                tiles.id[tile],
                cand.len(),
                nreach
            );
        }

        // Rank candidates within each slot.
        let rank: HashMap<TargetId, (i32, f64)> = mtl
            .iter()
            .map(|t| (t.id, (t.priority, t.subpriority)))
            .collect();
        for tile_map in avail.iter_mut() {
            for list in tile_map.values_mut() {
                list.sort_by(|&a, &b| {
                    let (pa, sa) = rank.get(&a).copied().unwrap_or((i32::MIN, 0.0));
                    let (pb, sb) = rank.get(&b).copied().unwrap_or((i32::MIN, 0.0));
                    pb.cmp(&pa)
                        .then(sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal))
                        .then(a.cmp(&b))
                });
            }
        }

        // Inverse map, ascending in (tile, loc) by construction.
        let mut reachable: HashMap<TargetId, Vec<(usize, LocId)>> = HashMap::new();
        for (tile, tile_map) in avail.iter().enumerate() {
            for &loc in hw.locations() {
                if let Some(list) = tile_map.get(&loc) {
                    for &id in list {
                        reachable.entry(id).or_default().push((tile, loc));
                    }
                }
            }
        }

        info!(
            "availability: {} targets reachable from {} tiles",
            reachable.len(),
            tiles.len()
        );

        Self {
            avail,
            xy,
            reachable,
        }
    }

    /// Ranked candidates for one (tile, loc) slot.
    pub fn candidates(&self, tile: usize, loc: LocId) -> &[TargetId] {
        self.avail[tile].get(&loc).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Projected focal-plane position of a target on a tile.
    pub fn target_xy(&self, tile: usize, target: TargetId) -> Option<Vec2> {
        self.xy[tile].get(&target).copied()
    }

    /// Slots that can reach a target, ascending in (tile, loc).
    pub fn reachable(&self, target: TargetId) -> &[(usize, LocId)] {
        self.reachable
            .get(&target)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Remove a completed target from every slot after `tile`.
    pub(crate) fn drop_target_after(&mut self, tile: usize, target: TargetId) {
        let Some(slots) = self.reachable.get_mut(&target) else {
            return;
        };
        for &(ti, loc) in slots.iter() {
            if ti > tile {
                if let Some(list) = self.avail[ti].get_mut(&loc) {
                    list.retain(|&id| id != target);
                }
                self.xy[ti].remove(&target);
            }
        }
        slots.retain(|&(ti, _)| ti <= tile);
    }
}

/// Uniform bucket grid over science-positioner centers, cell size the
/// largest patrol radius, so a 3×3 neighborhood covers every positioner
/// that could reach a point.
struct LocBuckets {
    cell_mm: f64,
    cells: HashMap<(i64, i64), Vec<LocId>>,
}

impl LocBuckets {
    fn new(hw: &Hardware, locs: &[LocId]) -> Self {
        let cell_mm = locs
            .iter()
            .map(|&l| hw.positioner(l).patrol_radius())
            .fold(1.0, f64::max);
        let mut cells: HashMap<(i64, i64), Vec<LocId>> = HashMap::new();
        for &loc in locs {
            let c = hw.positioner(loc).center;
            cells
                .entry(Self::key(cell_mm, c))
                .or_default()
                .push(loc);
        }
        Self { cell_mm, cells }
    }

    fn key(cell_mm: f64, p: Vec2) -> (i64, i64) {
        ((p.x / cell_mm).floor() as i64, (p.y / cell_mm).floor() as i64)
    }

    /// Locations whose patrol area could contain `p`, ascending.
    fn nearby(&self, p: Vec2) -> Vec<LocId> {
        let (cx, cy) = Self::key(self.cell_mm, p);
        let mut out = Vec::new();
        for dx in -1..=1 {
            for dy in -1..=1 {
                if let Some(bucket) = self.cells.get(&(cx + dx, cy + dy)) {
                    out.extend_from_slice(bucket);
                }
            }
        }
        out.sort_unstable();
        out
    }
}
