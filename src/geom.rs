//! 2D geometry for the focal plane: polygon shapes, rigid transforms, and a
//! boolean intersection test.
//!
//! A [`Shape`] is a closed polygon together with a reference point (`axis`)
//! and a bounding-circle radius about that point. The axis doubles as the
//! rotation pivot for [`Shape::rotate`], which is how a phi arm swings about
//! its elbow, and the bounding circle gives an O(1) rejection test before the
//! exact edge-crossing scan.
//!
//! Rotations are passed as `(cos θ, sin θ)` pairs so callers can compute the
//! trig once and place many shapes.

use crate::Vec2;

/// A closed polygon with a reference point and bounding circle.
#[derive(Debug, Clone, PartialEq)]
pub struct Shape {
    /// Reference point; pivot for [`Shape::rotate`]. Moves with the shape.
    pub axis: Vec2,
    /// Bounding-circle radius about `axis`. Invariant under all transforms.
    pub radius: f64,
    /// Polygon vertices, interpreted as a closed loop.
    pub points: Vec<Vec2>,
}

impl Shape {
    /// Build a shape from its axis and vertices, computing the bounding radius.
    pub fn new(axis: Vec2, points: Vec<Vec2>) -> Self {
        let radius = points
            .iter()
            .map(|p| (p - axis).norm())
            .fold(0.0, f64::max);
        Self {
            axis,
            radius,
            points,
        }
    }

    /// Translate axis and vertices by `v`.
    pub fn translate(&mut self, v: Vec2) {
        self.axis += v;
        for p in self.points.iter_mut() {
            *p += v;
        }
    }

    /// Rotate the vertices about the current axis by `cs = (cos θ, sin θ)`.
    pub fn rotate(&mut self, cs: (f64, f64)) {
        let axis = self.axis;
        for p in self.points.iter_mut() {
            *p = axis + rotate_vec(*p - axis, cs);
        }
    }

    /// Rotate axis and vertices about the origin by `cs = (cos θ, sin θ)`.
    pub fn rotate_origin(&mut self, cs: (f64, f64)) {
        self.axis = rotate_vec(self.axis, cs);
        for p in self.points.iter_mut() {
            *p = rotate_vec(*p, cs);
        }
    }
}

fn rotate_vec(v: Vec2, cs: (f64, f64)) -> Vec2 {
    Vec2::new(cs.0 * v.x - cs.1 * v.y, cs.1 * v.x + cs.0 * v.y)
}

/// Signed area of the triangle (a, b, c); positive when counter-clockwise.
fn cross(a: Vec2, b: Vec2, c: Vec2) -> f64 {
    (b - a).perp(&(c - a))
}

/// True when collinear point `p` lies within the bounding box of (a, b).
fn on_segment(a: Vec2, b: Vec2, p: Vec2) -> bool {
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

/// True iff segment (p1, p2) intersects segment (q1, q2), endpoints included.
fn segments_cross(p1: Vec2, p2: Vec2, q1: Vec2, q2: Vec2) -> bool {
    let d1 = cross(q1, q2, p1);
    let d2 = cross(q1, q2, p2);
    let d3 = cross(p1, p2, q1);
    let d4 = cross(p1, p2, q2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    // Collinear endpoint touches
    (d1 == 0.0 && on_segment(q1, q2, p1))
        || (d2 == 0.0 && on_segment(q1, q2, p2))
        || (d3 == 0.0 && on_segment(p1, p2, q1))
        || (d4 == 0.0 && on_segment(p1, p2, q2))
}

/// Ray-cast point-in-polygon test.
fn contains(poly: &[Vec2], pt: Vec2) -> bool {
    let n = poly.len();
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let pi = poly[i];
        let pj = poly[j];
        if (pi.y > pt.y) != (pj.y > pt.y)
            && pt.x < (pj.x - pi.x) * (pt.y - pi.y) / (pj.y - pi.y) + pi.x
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// True iff the two polygons overlap: an edge of one crosses an edge of the
/// other, or one polygon contains a vertex of the other.
///
/// The bounding circles are compared first so distant shapes are rejected
/// without touching the vertex lists.
pub fn intersects(a: &Shape, b: &Shape) -> bool {
    if a.points.is_empty() || b.points.is_empty() {
        return false;
    }

    let sep = a.radius + b.radius;
    if (a.axis - b.axis).norm_squared() > sep * sep {
        return false;
    }

    let na = a.points.len();
    let nb = b.points.len();
    for i in 0..na {
        let p1 = a.points[i];
        let p2 = a.points[(i + 1) % na];
        for j in 0..nb {
            let q1 = b.points[j];
            let q2 = b.points[(j + 1) % nb];
            if segments_cross(p1, p2, q1, q2) {
                return true;
            }
        }
    }

    contains(&b.points, a.points[0]) || contains(&a.points, b.points[0])
}
