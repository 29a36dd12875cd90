//! The ordered sequence of observation tiles.
//!
//! Tiles are observed in the order given; the engine never reorders them.
//! `order` maps a tile id back to its position in the sequence.

use std::collections::HashMap;

use tracing::warn;

/// Ordered tile pointings with a reverse index. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Tiles {
    /// Tile ids, in observation order.
    pub id: Vec<i32>,
    /// Tile center right ascension, degrees.
    pub ra: Vec<f64>,
    /// Tile center declination, degrees.
    pub dec: Vec<f64>,
    /// Observing-condition bitmask (dark / gray / bright).
    pub obscond: Vec<u32>,
    /// Field rotation, degrees.
    pub theta: Vec<f64>,
    order: HashMap<i32, usize>,
}

impl Tiles {
    pub fn new(
        id: Vec<i32>,
        ra: Vec<f64>,
        dec: Vec<f64>,
        obscond: Vec<u32>,
        theta: Vec<f64>,
    ) -> Self {
        let mut order = HashMap::with_capacity(id.len());
        for (i, &tid) in id.iter().enumerate() {
            if order.insert(tid, i).is_some() {
                warn!("tile id {} appears more than once in the sequence", tid);
            }
        }
        Self {
            id,
            ra,
            dec,
            obscond,
            theta,
            order,
        }
    }

    /// Number of tiles in the sequence.
    pub fn len(&self) -> usize {
        self.id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }

    /// Position of a tile id in the observation sequence.
    pub fn order(&self, tile_id: i32) -> Option<usize> {
        self.order.get(&tile_id).copied()
    }
}
