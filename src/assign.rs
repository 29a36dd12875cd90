//! The assignment engine: per-tile positioner → target decisions.
//!
//! The engine sweeps tiles in observation order and positioners in ascending
//! location order, always consuming the ranked candidate lists of the
//! [`Availability`] map, so the result is fully deterministic. Passes:
//!
//! 1. An entry plan fills every slot greedily ([`Assignment::simple_assign`]
//!    or the fewest-options-first [`Assignment::new_assign_fibers`]).
//! 2. [`Assignment::redistribute_tf`] moves assignments sideways when that
//!    frees a slot for an otherwise unserved target.
//! 3. [`Assignment::improve`] rescues unassigned slots by stealing a target
//!    whose current holder has a fallback.
//! 4. Per tile: calibration quotas ([`Assignment::assign_sf_ss`]), filler
//!    targets ([`Assignment::assign_unused`]), then the tile is committed by
//!    [`Assignment::update_plan_from_one_obs`], which burns observation
//!    budget and prunes completed targets from the remaining tiles.
//!
//! Collisions are checked incrementally: a candidate is rejected when its
//! pose interferes with any already-assigned neighbor on the same tile.
//! Committed tiles are frozen; no later pass touches them.
//!
//! This engine is strictly single-threaded: every decision reads the table
//! written by the previous one.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::availability::Availability;
use crate::focalplane::{DeviceType, Hardware, LocId};
use crate::targets::{Mtl, TargetId, TargetKind};
use crate::tiles::Tiles;
use crate::Vec2;

// ── Configuration ───────────────────────────────────────────────────────────

/// Knobs for the assignment passes.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Standard stars required on each petal of each tile.
    pub standards_per_petal: usize,
    /// Sky fibers required on each petal of each tile.
    pub skies_per_petal: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            standards_per_petal: 10,
            skies_per_petal: 40,
        }
    }
}

// ── Output rows ─────────────────────────────────────────────────────────────

/// One output row: the decision for one positioner on one tile.
///
/// `target` is `-1` for an unassigned positioner, and the pose fields are
/// zero in that case. Angles are radians, positions are mm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignRow {
    pub tile_id: i32,
    pub location: LocId,
    pub fiber: i32,
    pub petal: i32,
    pub target: TargetId,
    pub theta: f64,
    pub phi: f64,
    pub x_mm: f64,
    pub y_mm: f64,
}

/// Sentinel target id of an unassigned positioner.
pub const UNASSIGNED: TargetId = -1;

// ── The engine ──────────────────────────────────────────────────────────────

/// Mutable assignment state over a fixed hardware model, tile sequence, and
/// catalog.
///
/// Owns the availability map (pruned as targets complete) and the per-target
/// observation budget; the catalog itself is never mutated.
pub struct Assignment<'a> {
    hw: &'a Hardware,
    tiles: &'a Tiles,
    mtl: &'a Mtl,
    avail: Availability,
    config: EngineConfig,
    /// Science positioners, ascending.
    science_locs: Vec<LocId>,
    /// tile index → loc → target.
    tile_loc: Vec<BTreeMap<LocId, TargetId>>,
    /// target → slots currently holding it, in assignment order.
    target_slots: HashMap<TargetId, Vec<(usize, LocId)>>,
    /// Remaining observation budget; decremented when a tile commits.
    nobs_remaining: HashMap<TargetId, i32>,
    /// Assignments on not-yet-committed tiles, per target.
    pending: HashMap<TargetId, i32>,
    /// Tiles `[0, committed)` are frozen.
    committed: usize,
}

impl<'a> Assignment<'a> {
    pub fn new(
        hw: &'a Hardware,
        tiles: &'a Tiles,
        mtl: &'a Mtl,
        avail: Availability,
        config: EngineConfig,
    ) -> Self {
        let science_locs = hw.device_locations(DeviceType::Pos);
        let nobs_remaining = mtl.iter().map(|t| (t.id, t.nobs)).collect();
        Self {
            hw,
            tiles,
            mtl,
            avail,
            config,
            science_locs,
            tile_loc: vec![BTreeMap::new(); tiles.len()],
            target_slots: HashMap::new(),
            nobs_remaining,
            pending: HashMap::new(),
            committed: 0,
        }
    }

    /// Run the standard pass sequence over the whole tile list.
    pub fn run(&mut self) {
        info!(
            "assigning {} tiles over {} science positioners",
            self.tiles.len(),
            self.science_locs.len()
        );
        self.new_assign_fibers(0);
        self.redistribute_tf(0);
        self.improve(0);
        self.improve_from_kind(TargetKind::StandardStar, 0);
        for tile in 0..self.tiles.len() {
            self.assign_sf_ss(tile);
            self.assign_unused(tile);
            self.update_plan_from_one_obs(tile);
        }
        info!(
            "assignment complete: {} slots filled, {} targets observed",
            self.num_assigned(),
            self.num_satisfied()
        );
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Target assigned to a (tile, loc) slot, if any.
    pub fn assigned_target(&self, tile: usize, loc: LocId) -> Option<TargetId> {
        self.tile_loc[tile].get(&loc).copied()
    }

    /// Total filled slots across all tiles.
    pub fn num_assigned(&self) -> usize {
        self.tile_loc.iter().map(BTreeMap::len).sum()
    }

    /// Targets holding at least one slot.
    pub fn num_satisfied(&self) -> usize {
        self.target_slots.values().filter(|v| !v.is_empty()).count()
    }

    /// Remaining observation budget of a target.
    pub fn remaining_obs(&self, target: TargetId) -> i32 {
        self.nobs_remaining.get(&target).copied().unwrap_or(0)
    }

    /// The availability map in its current (pruned) state.
    pub fn availability(&self) -> &Availability {
        &self.avail
    }

    /// Output table for one tile, one row per science positioner in
    /// ascending location order.
    pub fn tile_table(&self, tile: usize) -> Vec<AssignRow> {
        let mut rows = Vec::with_capacity(self.science_locs.len());
        for &loc in &self.science_locs {
            let p = self.hw.positioner(loc);
            let mut row = AssignRow {
                tile_id: self.tiles.id[tile],
                location: loc,
                fiber: p.fiber,
                petal: p.petal,
                target: UNASSIGNED,
                theta: 0.0,
                phi: 0.0,
                x_mm: 0.0,
                y_mm: 0.0,
            };
            if let Some(t) = self.assigned_target(tile, loc) {
                if let Some(xy) = self.avail.target_xy(tile, t) {
                    if let Some((theta, phi)) = p.xy_to_thetaphi(xy) {
                        row.target = t;
                        row.theta = theta;
                        row.phi = phi;
                        row.x_mm = xy.x;
                        row.y_mm = xy.y;
                    }
                }
            }
            rows.push(row);
        }
        rows
    }

    // ── Entry plans ─────────────────────────────────────────────────────

    /// Greedy first fill: tiles in order, locations ascending, best ranked
    /// candidate that fits.
    pub fn simple_assign(&mut self, from_tile: usize) {
        let locs = self.science_locs.clone();
        let mut filled = 0usize;
        for tile in from_tile.max(self.committed)..self.tiles.len() {
            for &loc in &locs {
                if self.assigned_target(tile, loc).is_some() {
                    continue;
                }
                if let Some(t) = self.find_best(tile, loc, None, None) {
                    self.assign(tile, loc, t);
                    filled += 1;
                }
            }
        }
        info!("simple_assign: filled {} slots", filled);
    }

    /// Greedy first fill resolving starved positioners first: within each
    /// tile, locations with fewer candidates pick before richer ones.
    pub fn new_assign_fibers(&mut self, from_tile: usize) {
        let locs = self.science_locs.clone();
        let mut filled = 0usize;
        for tile in from_tile.max(self.committed)..self.tiles.len() {
            let mut order: Vec<(usize, LocId)> = locs
                .iter()
                .map(|&l| (self.avail.candidates(tile, l).len(), l))
                .collect();
            order.sort_unstable();
            for (_, loc) in order {
                if self.assigned_target(tile, loc).is_some() {
                    continue;
                }
                if let Some(t) = self.find_best(tile, loc, None, None) {
                    self.assign(tile, loc, t);
                    filled += 1;
                }
            }
        }
        info!("new_assign_fibers: filled {} slots", filled);
    }

    // ── Improvement passes ──────────────────────────────────────────────

    /// Rescue unassigned slots, stealing from holders that have a fallback.
    ///
    /// Never decreases the number of filled slots or satisfied targets.
    pub fn improve(&mut self, from_tile: usize) {
        self.improve_pass(from_tile, None);
    }

    /// [`Assignment::improve`] restricted to candidates of one kind.
    pub fn improve_from_kind(&mut self, kind: TargetKind, from_tile: usize) {
        self.improve_pass(from_tile, Some(kind));
    }

    fn improve_pass(&mut self, from_tile: usize, kind: Option<TargetKind>) {
        let locs = self.science_locs.clone();
        let mut gained = 0usize;
        for tile in from_tile.max(self.committed)..self.tiles.len() {
            'slots: for &loc in &locs {
                if self.assigned_target(tile, loc).is_some() {
                    continue;
                }
                // A candidate with budget left just needs a collision-free
                // pose here.
                if let Some(t) = self.find_best(tile, loc, kind, None) {
                    self.assign(tile, loc, t);
                    gained += 1;
                    continue;
                }
                // Otherwise try to steal an exhausted candidate from a slot
                // that has a fallback of its own.
                let cands = self.avail.candidates(tile, loc).to_vec();
                for t in cands {
                    if !self.kind_matches(t, kind) {
                        continue;
                    }
                    let Some(xy) = self.avail.target_xy(tile, t) else {
                        continue;
                    };
                    if self.has_capacity(t) || self.on_tile(tile, t) {
                        continue;
                    }
                    if self.collides(tile, loc, xy) {
                        continue;
                    }
                    let donors = self.target_slots.get(&t).cloned().unwrap_or_default();
                    for (dtile, dloc) in donors {
                        if dtile < self.committed {
                            continue;
                        }
                        self.unassign(dtile, dloc);
                        let fallback = self.find_best(dtile, dloc, None, Some(t));
                        if let Some(u) = fallback {
                            self.assign(dtile, dloc, u);
                            if self.has_capacity(t)
                                && !self.on_tile(tile, t)
                                && !self.collides(tile, loc, xy)
                            {
                                self.assign(tile, loc, t);
                                gained += 1;
                                continue 'slots;
                            }
                            self.unassign(dtile, dloc);
                        }
                        self.assign(dtile, dloc, t);
                    }
                }
            }
        }
        match kind {
            Some(k) => info!("improve ({k:?}): rescued {} slots", gained),
            None => info!("improve: rescued {} slots", gained),
        }
    }

    /// Move assignments sideways when the vacated slot can serve another
    /// target.
    pub fn redistribute_tf(&mut self, from_tile: usize) {
        let locs = self.science_locs.clone();
        let mut moved = 0usize;
        for tile in from_tile.max(self.committed)..self.tiles.len() {
            'slots: for &loc in &locs {
                let Some(g) = self.assigned_target(tile, loc) else {
                    continue;
                };
                let homes = self.avail.reachable(g).to_vec();
                for (t2, l2) in homes {
                    if t2 < self.committed || (t2, l2) == (tile, loc) {
                        continue;
                    }
                    if self.assigned_target(t2, l2).is_some() {
                        continue;
                    }
                    let Some(gxy) = self.avail.target_xy(t2, g) else {
                        continue;
                    };
                    self.unassign(tile, loc);
                    if self.on_tile(t2, g) || self.collides(t2, l2, gxy) {
                        self.assign(tile, loc, g);
                        continue;
                    }
                    self.assign(t2, l2, g);
                    // Only worthwhile when the freed slot serves someone new.
                    if let Some(u) = self.find_best(tile, loc, None, Some(g)) {
                        self.assign(tile, loc, u);
                        moved += 1;
                        continue 'slots;
                    }
                    self.unassign(t2, l2);
                    self.assign(tile, loc, g);
                }
            }
        }
        info!("redistribute_tf: moved {} assignments", moved);
    }

    // ── Calibration and filler passes ───────────────────────────────────

    /// Ensure each petal of a tile carries its standard-star and sky-fiber
    /// quotas, filling from still-unassigned positioners.
    pub fn assign_sf_ss(&mut self, tile: usize) {
        if tile < self.committed {
            return;
        }
        for petal in 0..self.hw.npetal() {
            let plocs: Vec<LocId> = self
                .hw
                .petal_locations(petal)
                .iter()
                .copied()
                .filter(|&l| self.hw.positioner(l).device_type == DeviceType::Pos)
                .collect();

            let mut n_ss = 0usize;
            let mut n_sf = 0usize;
            for &loc in &plocs {
                if let Some(t) = self.assigned_target(tile, loc) {
                    match self.kind_of(t) {
                        Some(TargetKind::StandardStar) => n_ss += 1,
                        Some(TargetKind::SkyFiber) => n_sf += 1,
                        _ => {}
                    }
                }
            }

            for &loc in &plocs {
                if n_ss >= self.config.standards_per_petal
                    && n_sf >= self.config.skies_per_petal
                {
                    break;
                }
                if self.assigned_target(tile, loc).is_some() {
                    continue;
                }
                if n_ss < self.config.standards_per_petal {
                    if let Some(t) =
                        self.find_best(tile, loc, Some(TargetKind::StandardStar), None)
                    {
                        self.assign(tile, loc, t);
                        n_ss += 1;
                        continue;
                    }
                }
                if n_sf < self.config.skies_per_petal {
                    if let Some(t) = self.find_best(tile, loc, Some(TargetKind::SkyFiber), None)
                    {
                        self.assign(tile, loc, t);
                        n_sf += 1;
                    }
                }
            }

            if n_ss < self.config.standards_per_petal {
                warn!(
                    "tile {} petal {}: only {} of {} standard stars",
                    self.tiles.id[tile], petal, n_ss, self.config.standards_per_petal
                );
            }
            if n_sf < self.config.skies_per_petal {
                warn!(
                    "tile {} petal {}: only {} of {} sky fibers",
                    self.tiles.id[tile], petal, n_sf, self.config.skies_per_petal
                );
            }
        }
    }

    /// Park remaining unassigned positioners on safe-location or
    /// supplementary targets.
    pub fn assign_unused(&mut self, tile: usize) {
        if tile < self.committed {
            return;
        }
        let locs = self.science_locs.clone();
        let mut empty = 0usize;
        for &loc in &locs {
            if self.assigned_target(tile, loc).is_some() {
                continue;
            }
            if let Some(t) = self.find_best(tile, loc, Some(TargetKind::SafeLocation), None) {
                self.assign(tile, loc, t);
                continue;
            }
            if let Some(t) = self.find_best(tile, loc, Some(TargetKind::Supplementary), None) {
                self.assign(tile, loc, t);
                continue;
            }
            empty += 1;
        }
        if empty > 0 {
            debug!(
                "tile {}: {} positioners left unassigned",
                self.tiles.id[tile], empty
            );
        }
    }

    // ── Committing observations ─────────────────────────────────────────

    /// Commit a tile as observed: burn one observation per assigned target
    /// and prune completed targets from the remaining tiles.
    ///
    /// Tiles must be committed in sequence order. Budget underflow means the
    /// engine accounting is broken and aborts.
    pub fn update_plan_from_one_obs(&mut self, tile: usize) {
        assert_eq!(tile, self.committed, "tiles must be committed in order");
        let entries: Vec<(LocId, TargetId)> = self.tile_loc[tile]
            .iter()
            .map(|(&l, &t)| (l, t))
            .collect();
        let mut done = 0usize;
        for (_, t) in entries {
            let n = self.nobs_remaining.entry(t).or_insert(0);
            *n -= 1;
            assert!(*n >= 0, "observation budget underflow for target {t}");
            let finished = *n == 0;
            let p = self.pending.entry(t).or_insert(0);
            *p -= 1;
            debug_assert!(*p >= 0, "pending underflow for target {t}");
            if finished {
                self.avail.drop_target_after(tile, t);
                done += 1;
            }
        }
        self.committed = tile + 1;
        debug!(
            "tile {} committed: {} assignments, {} targets completed",
            self.tiles.id[tile],
            self.tile_loc[tile].len(),
            done
        );
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn kind_of(&self, t: TargetId) -> Option<TargetKind> {
        self.mtl.get(t).map(|x| x.kind)
    }

    fn kind_matches(&self, t: TargetId, kind: Option<TargetKind>) -> bool {
        match kind {
            None => true,
            Some(k) => self.kind_of(t) == Some(k),
        }
    }

    /// Can this target take one more (uncommitted) assignment?
    fn has_capacity(&self, t: TargetId) -> bool {
        let pending = self.pending.get(&t).copied().unwrap_or(0);
        pending < self.nobs_remaining.get(&t).copied().unwrap_or(0)
    }

    /// Is the target already assigned somewhere on this tile?
    fn on_tile(&self, tile: usize, t: TargetId) -> bool {
        self.target_slots
            .get(&t)
            .is_some_and(|v| v.iter().any(|&(ti, _)| ti == tile))
    }

    /// Would a positioner reaching `xy` interfere with an already-assigned
    /// neighbor on the same tile?
    fn collides(&self, tile: usize, loc: LocId, xy: Vec2) -> bool {
        for &nb in self.hw.neighbors(loc) {
            let Some(nt) = self.assigned_target(tile, nb) else {
                continue;
            };
            let Some(nxy) = self.avail.target_xy(tile, nt) else {
                continue;
            };
            if self.hw.collide_xy(loc, xy, nb, nxy) {
                return true;
            }
        }
        false
    }

    /// Best-ranked assignable candidate for a slot: capacity left, not on
    /// this tile yet, collision-free, optional kind filter, optional
    /// exclusion.
    fn find_best(
        &self,
        tile: usize,
        loc: LocId,
        kind: Option<TargetKind>,
        exclude: Option<TargetId>,
    ) -> Option<TargetId> {
        for &t in self.avail.candidates(tile, loc) {
            if exclude == Some(t) {
                continue;
            }
            if !self.kind_matches(t, kind) {
                continue;
            }
            if !self.has_capacity(t) || self.on_tile(tile, t) {
                continue;
            }
            let Some(xy) = self.avail.target_xy(tile, t) else {
                continue;
            };
            if self.collides(tile, loc, xy) {
                continue;
            }
            return Some(t);
        }
        None
    }

    fn assign(&mut self, tile: usize, loc: LocId, t: TargetId) {
        let prev = self.tile_loc[tile].insert(loc, t);
        debug_assert!(prev.is_none(), "slot ({tile}, {loc}) already assigned");
        self.target_slots.entry(t).or_default().push((tile, loc));
        *self.pending.entry(t).or_insert(0) += 1;
    }

    fn unassign(&mut self, tile: usize, loc: LocId) -> Option<TargetId> {
        let t = self.tile_loc[tile].remove(&loc)?;
        if let Some(slots) = self.target_slots.get_mut(&t) {
            slots.retain(|&s| s != (tile, loc));
        }
        *self.pending.entry(t).or_insert(0) -= 1;
        Some(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::focalplane::test_support::*;
    use crate::targets::{Target, OBS_DARK};
    use crate::GridIndex;

    fn science(id: TargetId, ra: f64, dec: f64, nobs: i32) -> Target {
        Target {
            id,
            ra,
            dec,
            obscond: OBS_DARK,
            priority: 100,
            subpriority: 0.5,
            nobs,
            kind: TargetKind::Science,
        }
    }

    fn tiles_at(n: usize) -> Tiles {
        Tiles::new(
            (0..n as i32).map(|i| 1000 + i).collect(),
            vec![150.0; n],
            vec![20.0; n],
            vec![OBS_DARK; n],
            vec![0.0; n],
        )
    }

    #[test]
    fn single_target_is_assigned() {
        let hw = hardware(vec![pos_record(100, 0, 0.0, 0.0, (3.0, 3.0))]);
        let (ra, dec) = hw.xy2radec(150.0, 20.0, 0.0, 4.0, 0.0);
        let mtl = Mtl::new(vec![science(7, ra, dec, 1)]);
        let tiles = tiles_at(1);
        let index = GridIndex::new(16, &mtl);
        let avail = Availability::build(&hw, &tiles, &mtl, &index);

        let mut asgn = Assignment::new(&hw, &tiles, &mtl, avail, EngineConfig::default());
        asgn.run();

        assert_eq!(asgn.assigned_target(0, 100), Some(7));
        assert_eq!(asgn.remaining_obs(7), 0);
    }

    #[test]
    fn unreachable_target_leaves_slot_empty() {
        let hw = hardware(vec![pos_record(100, 0, 0.0, 0.0, (3.0, 3.0))]);
        let (ra, dec) = hw.xy2radec(150.0, 20.0, 0.0, 10.0, 0.0);
        let mtl = Mtl::new(vec![science(7, ra, dec, 1)]);
        let tiles = tiles_at(1);
        let index = GridIndex::new(16, &mtl);
        let avail = Availability::build(&hw, &tiles, &mtl, &index);

        let mut asgn = Assignment::new(&hw, &tiles, &mtl, avail, EngineConfig::default());
        asgn.run();

        assert_eq!(asgn.assigned_target(0, 100), None);
        let rows = asgn.tile_table(0);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].target, UNASSIGNED);
    }

    #[test]
    fn budget_limits_assignment_to_first_tiles() {
        // One target wanting two observations, three tiles that all reach it.
        let hw = hardware(vec![pos_record(100, 0, 0.0, 0.0, (3.0, 3.0))]);
        let (ra, dec) = hw.xy2radec(150.0, 20.0, 0.0, 4.0, 0.0);
        let mtl = Mtl::new(vec![science(7, ra, dec, 2)]);
        let tiles = tiles_at(3);
        let index = GridIndex::new(16, &mtl);
        let avail = Availability::build(&hw, &tiles, &mtl, &index);

        let mut asgn = Assignment::new(&hw, &tiles, &mtl, avail, EngineConfig::default());
        asgn.run();

        assert_eq!(asgn.assigned_target(0, 100), Some(7));
        assert_eq!(asgn.assigned_target(1, 100), Some(7));
        assert_eq!(asgn.assigned_target(2, 100), None);
        assert_eq!(asgn.remaining_obs(7), 0);
    }

    #[test]
    fn output_row_carries_pose_and_position() {
        let hw = hardware(vec![pos_record(100, 0, 0.0, 0.0, (3.0, 3.0))]);
        let (ra, dec) = hw.xy2radec(150.0, 20.0, 0.0, 4.0, 0.0);
        let mtl = Mtl::new(vec![science(7, ra, dec, 1)]);
        let tiles = tiles_at(1);
        let index = GridIndex::new(16, &mtl);
        let avail = Availability::build(&hw, &tiles, &mtl, &index);

        let mut asgn = Assignment::new(&hw, &tiles, &mtl, avail, EngineConfig::default());
        asgn.run();

        let rows = asgn.tile_table(0);
        assert_eq!(rows[0].target, 7);
        assert!((rows[0].x_mm - 4.0).abs() < 1e-6);
        assert!(rows[0].y_mm.abs() < 1e-6);
        let expect_phi = std::f64::consts::PI - (2.0_f64 / 18.0).acos();
        assert!((rows[0].phi - expect_phi).abs() < 1e-6);
    }
}
