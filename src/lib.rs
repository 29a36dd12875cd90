//! Fiberplan: fiber assignment for a multi-object spectrograph focal plane.
//!
//! Given a sequence of observation tiles and a target catalog, decide which
//! robotic fiber positioner on each tile observes which target, respecting
//! arm reach, mechanical collision constraints, and science priority.
//!
//! The crate is organized bottom-up:
//!
//! 1. [`geom`] — 2D polygon shapes and the boolean intersection test.
//! 2. [`focalplane`] — the hardware model: per-positioner kinematics,
//!    sky ↔ focal-plane projection, and the collision engine.
//! 3. [`tiles`] / [`targets`] — the tile sequence and the merged target list,
//!    plus the spatial index used for cone searches.
//! 4. [`availability`] — which targets each (tile, positioner) pair can reach.
//! 5. [`assign`] — the assignment engine and its improvement passes.

pub mod assign;
pub mod availability;
pub mod focalplane;
pub mod geom;
pub mod targets;
pub mod tiles;

pub use assign::{AssignRow, Assignment, EngineConfig, UNASSIGNED};
pub use availability::Availability;
pub use focalplane::{
    DeviceType, Hardware, HardwareError, LocId, PositionerRecord, FIBER_STATE_OK,
    FOCALPLANE_RADIUS_DEG, NEIGHBOR_RADIUS_MM, NFIBER_PETAL, PATROL_BUFFER_MM,
    PETAL_ROTATION_OFFSET,
};
pub use geom::Shape;
pub use targets::{
    GridIndex, Mtl, SkyIndex, Target, TargetId, TargetKind, OBS_BRIGHT, OBS_DARK, OBS_GRAY,
};
pub use tiles::Tiles;

// Commonly used types.
// All focal-plane and celestial math is double precision; the output tables
// are doubles and the collision tolerances are load-bearing.
pub type Vec2 = nalgebra::Vector2<f64>;
pub type Vec3 = nalgebra::Vector3<f64>;
