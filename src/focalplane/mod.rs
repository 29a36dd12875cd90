//! Focal-plane hardware model.
//!
//! [`Hardware`] is the immutable description of every fiber positioner on the
//! focal plane: petal membership, arm lengths and angle ranges, exclusion
//! polygons, and the neighbor graph used by the collision engine. It is built
//! once from per-location records and then shared by reference with the
//! geometry kernels and the assignment engine; nothing mutates it afterwards.
//!
//! The `impl Hardware` blocks are split across this directory:
//! - [`projection`] — radial distortion fits and sky ↔ focal-plane transforms
//! - [`kinematics`] — inverse/forward kinematics and positioner placement
//! - [`collision`] — pairwise, boundary, and batch collision checks

pub mod collision;
pub mod kinematics;
pub mod projection;

use std::collections::HashMap;

use thiserror::Error;
use tracing::info;

use crate::geom::Shape;
use crate::Vec2;

/// Stable integer identifying one positioner hole on the focal plane.
pub type LocId = i32;

// ── Instrument constants ────────────────────────────────────────────────────

/// Angular radius of the focal plane, for selecting targets near a tile.
pub const FOCALPLANE_RADIUS_DEG: f64 = 1.65;

/// Center distance below which two positioners are considered neighbors.
pub const NEIGHBOR_RADIUS_MM: f64 = 14.05;

/// Reduction of the total arm length when testing target reachability.
pub const PATROL_BUFFER_MM: f64 = 0.2;

/// Science positioners per petal.
pub const NFIBER_PETAL: usize = 500;

/// Petal 0 sits at `PETAL_ROTATION_OFFSET * 36°`; an instrument constant.
pub const PETAL_ROTATION_OFFSET: i32 = 7;

/// State bitmask value of a fully functional positioner.
pub const FIBER_STATE_OK: u32 = 0;

/// Sanity bound on petal indices accepted at construction.
const MAX_PETALS: i32 = 32;

// ── Device types ────────────────────────────────────────────────────────────

/// Kind of device occupying a focal-plane hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// Science fiber positioner; the only kind the engine assigns.
    Pos,
    /// Exposure-time-calorimeter fiber.
    Etc,
    /// Guide/focus/alignment sensor.
    Gfa,
    /// Anything else present in the hardware table.
    Other,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceType::Pos => "POS",
            DeviceType::Etc => "ETC",
            DeviceType::Gfa => "GFA",
            DeviceType::Other => "OTHER",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for DeviceType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "POS" => DeviceType::Pos,
            "ETC" => DeviceType::Etc,
            "GFA" => DeviceType::Gfa,
            _ => DeviceType::Other,
        })
    }
}

// ── Input records ───────────────────────────────────────────────────────────

/// One row of the hardware table. Angles are in degrees on this boundary and
/// are converted to radians on ingest; arm lengths and positions are in mm.
#[derive(Debug, Clone)]
pub struct PositionerRecord {
    pub location: LocId,
    pub petal: i32,
    pub device: i32,
    pub slitblock: i32,
    pub blockfiber: i32,
    pub fiber: i32,
    pub device_type: DeviceType,
    pub x_mm: f64,
    pub y_mm: f64,
    /// Bitmask; [`FIBER_STATE_OK`] means healthy.
    pub state: u32,
    pub theta_offset_deg: f64,
    pub theta_min_deg: f64,
    pub theta_max_deg: f64,
    pub theta_arm_mm: f64,
    pub phi_offset_deg: f64,
    pub phi_min_deg: f64,
    pub phi_max_deg: f64,
    pub phi_arm_mm: f64,
    /// Theta-arm footprint in the positioner's local frame.
    pub theta_excl: Shape,
    /// Phi-arm footprint in the local frame, elbow at the origin.
    pub phi_excl: Shape,
    /// GFA boundary in the petal-0 frame; rotated into place on construction.
    pub gfa_excl: Shape,
    /// Petal boundary in the petal-0 frame; rotated into place on construction.
    pub petal_excl: Shape,
}

// ── Errors ──────────────────────────────────────────────────────────────────

/// Fatal problems in the hardware table, detected at construction.
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("duplicate location id {0}")]
    DuplicateLocation(LocId),

    #[error("location {0}: petal index {1} out of range")]
    PetalOutOfRange(LocId, i32),

    #[error("location {0}: non-positive arm length")]
    BadArmLength(LocId),

    #[error("location {0}: empty theta or phi angle range")]
    BadAngleRange(LocId),

    #[error("radial calibration tables differ in length ({radius} vs {theta})")]
    CalibrationMismatch { radius: usize, theta: usize },
}

// ── The hardware model ──────────────────────────────────────────────────────

/// Everything known about one positioner, angles in radians.
///
/// `theta_min`/`theta_max` and `phi_min`/`phi_max` are relative to the
/// respective offsets. `gfa_excl` and `petal_excl` are in the absolute focal
/// plane frame; `theta_excl` and `phi_excl` stay in the local frame and are
/// copied for each placement.
#[derive(Debug, Clone)]
pub struct Positioner {
    pub location: LocId,
    pub petal: i32,
    pub device: i32,
    pub device_type: DeviceType,
    pub fiber: i32,
    pub slitblock: i32,
    pub blockfiber: i32,
    pub center: Vec2,
    pub state: u32,
    pub theta_arm: f64,
    pub phi_arm: f64,
    pub theta_offset: f64,
    pub theta_min: f64,
    pub theta_max: f64,
    pub phi_offset: f64,
    pub phi_min: f64,
    pub phi_max: f64,
    pub theta_excl: Shape,
    pub phi_excl: Shape,
    pub gfa_excl: Shape,
    pub petal_excl: Shape,
}

impl Positioner {
    /// Full patrol radius, before the reachability buffer is applied.
    pub fn patrol_radius(&self) -> f64 {
        self.theta_arm + self.phi_arm
    }
}

/// Immutable focal-plane model shared by the geometry kernels and the engine.
#[derive(Debug, Clone)]
pub struct Hardware {
    npetal: usize,
    /// All location ids, ascending.
    locations: Vec<LocId>,
    /// Location ids per petal, each ascending.
    petal_locations: Vec<Vec<LocId>>,
    positioners: HashMap<LocId, Positioner>,
    /// Symmetric adjacency: centers within [`NEIGHBOR_RADIUS_MM`].
    neighbors: HashMap<LocId, Vec<LocId>>,
    ps_radius: Vec<f64>,
    ps_theta: Vec<f64>,
}

impl Hardware {
    /// Build the hardware model from per-location records and the radial
    /// calibration samples.
    ///
    /// Validates the table, converts boundary angles to radians, builds the
    /// neighbor graph, and rotates the static exclusion polygons into their
    /// petal orientation.
    pub fn new(
        records: Vec<PositionerRecord>,
        ps_radius: Vec<f64>,
        ps_theta: Vec<f64>,
    ) -> Result<Self, HardwareError> {
        if ps_radius.len() != ps_theta.len() {
            return Err(HardwareError::CalibrationMismatch {
                radius: ps_radius.len(),
                theta: ps_theta.len(),
            });
        }

        let deg = std::f64::consts::PI / 180.0;

        let mut max_petal = 0;
        let mut positioners: HashMap<LocId, Positioner> = HashMap::with_capacity(records.len());
        let mut locations: Vec<LocId> = Vec::with_capacity(records.len());
        let mut unhealthy = 0usize;

        for r in records {
            if positioners.contains_key(&r.location) {
                return Err(HardwareError::DuplicateLocation(r.location));
            }
            if r.petal < 0 || r.petal >= MAX_PETALS {
                return Err(HardwareError::PetalOutOfRange(r.location, r.petal));
            }
            if r.theta_arm_mm <= 0.0 || r.phi_arm_mm <= 0.0 {
                return Err(HardwareError::BadArmLength(r.location));
            }
            if r.theta_min_deg >= r.theta_max_deg || r.phi_min_deg >= r.phi_max_deg {
                return Err(HardwareError::BadAngleRange(r.location));
            }

            if r.petal > max_petal {
                max_petal = r.petal;
            }
            if r.state != FIBER_STATE_OK {
                unhealthy += 1;
            }

            locations.push(r.location);
            positioners.insert(
                r.location,
                Positioner {
                    location: r.location,
                    petal: r.petal,
                    device: r.device,
                    device_type: r.device_type,
                    fiber: r.fiber,
                    slitblock: r.slitblock,
                    blockfiber: r.blockfiber,
                    center: Vec2::new(r.x_mm, r.y_mm),
                    state: r.state,
                    theta_arm: r.theta_arm_mm,
                    phi_arm: r.phi_arm_mm,
                    theta_offset: r.theta_offset_deg * deg,
                    theta_min: r.theta_min_deg * deg,
                    theta_max: r.theta_max_deg * deg,
                    phi_offset: r.phi_offset_deg * deg,
                    phi_min: r.phi_min_deg * deg,
                    phi_max: r.phi_max_deg * deg,
                    theta_excl: r.theta_excl,
                    phi_excl: r.phi_excl,
                    gfa_excl: r.gfa_excl,
                    petal_excl: r.petal_excl,
                },
            );
        }

        info!(
            "Focalplane has {} fibers that are stuck / broken",
            unhealthy
        );

        let npetal = (max_petal + 1) as usize;

        locations.sort_unstable();
        let mut petal_locations = vec![Vec::new(); npetal];
        for &loc in &locations {
            let p = positioners[&loc].petal as usize;
            petal_locations[p].push(loc);
        }

        // Neighbor graph: pairwise scan over the sorted ids.
        let mut neighbors: HashMap<LocId, Vec<LocId>> =
            locations.iter().map(|&l| (l, Vec::new())).collect();
        for i in 0..locations.len() {
            let a = locations[i];
            for &b in locations.iter().skip(i + 1) {
                let d = (positioners[&a].center - positioners[&b].center).norm();
                if d <= NEIGHBOR_RADIUS_MM {
                    neighbors.entry(a).or_default().push(b);
                    neighbors.entry(b).or_default().push(a);
                }
            }
        }

        // Rotate the static GFA and petal polygons to their petal orientation.
        for pos in positioners.values_mut() {
            let rot_deg = (((PETAL_ROTATION_OFFSET + pos.petal) * 36) % 360) as f64;
            let rot = rot_deg * deg;
            let cs = (rot.cos(), rot.sin());
            pos.gfa_excl.rotate_origin(cs);
            pos.petal_excl.rotate_origin(cs);
        }

        Ok(Self {
            npetal,
            locations,
            petal_locations,
            positioners,
            neighbors,
            ps_radius,
            ps_theta,
        })
    }

    /// Number of petals present in the hardware table.
    pub fn npetal(&self) -> usize {
        self.npetal
    }

    /// All location ids, ascending.
    pub fn locations(&self) -> &[LocId] {
        &self.locations
    }

    /// Location ids on one petal, ascending.
    pub fn petal_locations(&self, petal: usize) -> &[LocId] {
        &self.petal_locations[petal]
    }

    /// Full record for one location.
    pub fn positioner(&self, loc: LocId) -> &Positioner {
        &self.positioners[&loc]
    }

    /// Neighbors of one location (centers within [`NEIGHBOR_RADIUS_MM`]).
    pub fn neighbors(&self, loc: LocId) -> &[LocId] {
        &self.neighbors[&loc]
    }

    /// Location ids with the given device type, ascending.
    pub fn device_locations(&self, kind: DeviceType) -> Vec<LocId> {
        self.locations
            .iter()
            .copied()
            .filter(|&l| self.positioners[&l].device_type == kind)
            .collect()
    }

    /// Radial calibration samples: distances from the tile center, mm.
    pub fn ps_radius(&self) -> &[f64] {
        &self.ps_radius
    }

    /// Radial calibration samples: field angles, radians.
    pub fn ps_theta(&self) -> &[f64] {
        &self.ps_theta
    }
}
