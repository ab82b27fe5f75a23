//! Geometry primitives used by the behavior rules.
//!
//! Coordinates are image pixels with the Y axis pointing down.

use serde::{Deserialize, Serialize};

/// Values closer to zero than this are treated as "on the line".
const SIDE_TOLERANCE: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Which side of a directed segment a point lies on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
    On,
}

/// Side of `p` relative to the directed line `a -> b`.
///
/// Uses the sign of the cross product of `(b - a)` and `(p - a)`. With Y pointing
/// down, a positive value means the point is to the right of the direction of travel.
pub fn side_of_line(p: Point, a: Point, b: Point) -> Side {
    let val = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    if val > SIDE_TOLERANCE {
        Side::Right
    } else if val < -SIDE_TOLERANCE {
        Side::Left
    } else {
        Side::On
    }
}

/// True when segment `p1-p2` and segment `q1-q2` share at least one point.
pub fn segments_intersect(p1: Point, p2: Point, q1: Point, q2: Point) -> bool {
    let d1 = side_of_line(p1, q1, q2);
    let d2 = side_of_line(p2, q1, q2);
    let d3 = side_of_line(q1, p1, p2);
    let d4 = side_of_line(q2, p1, p2);

    let straddles = |a: Side, b: Side| matches!((a, b), (Side::Left, Side::Right) | (Side::Right, Side::Left));
    if straddles(d1, d2) && straddles(d3, d4) {
        return true;
    }

    (d1 == Side::On && on_segment(p1, q1, q2))
        || (d2 == Side::On && on_segment(p2, q1, q2))
        || (d3 == Side::On && on_segment(q1, p1, p2))
        || (d4 == Side::On && on_segment(q2, p1, p2))
}

// Assumes `p` is collinear with `a-b`.
fn on_segment(p: Point, a: Point, b: Point) -> bool {
    p.x >= a.x.min(b.x) - SIDE_TOLERANCE
        && p.x <= a.x.max(b.x) + SIDE_TOLERANCE
        && p.y >= a.y.min(b.y) - SIDE_TOLERANCE
        && p.y <= a.y.max(b.y) + SIDE_TOLERANCE
}

/// Simple polygon given by its ordered vertices (implicitly closed).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Polygon {
    vertices: Vec<Point>,
}

impl Polygon {
    pub fn new(vertices: Vec<Point>) -> Self {
        Self { vertices }
    }

    pub fn vertices(&self) -> &[Point] {
        &self.vertices
    }

    /// Absolute area (shoelace formula).
    pub fn area(&self) -> f64 {
        let n = self.vertices.len();
        if n < 3 {
            return 0.0;
        }
        let mut twice = 0.0;
        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[(i + 1) % n];
            twice += a.x * b.y - b.x * a.y;
        }
        (twice / 2.0).abs()
    }

    /// Even-odd ray casting test. Points exactly on an edge count as outside.
    pub fn contains(&self, p: Point) -> bool {
        let n = self.vertices.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let vi = self.vertices[i];
            let vj = self.vertices[j];
            if (vi.y > p.y) != (vj.y > p.y) {
                let x_cross = (vj.x - vi.x) * (p.y - vi.y) / (vj.y - vi.y) + vi.x;
                if p.x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Polygon {
        Polygon::new(vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(0.0, 10.0),
        ])
    }

    #[test]
    fn polygon_contains_interior_points_only() {
        let poly = square();
        assert!(poly.contains(Point::new(5.0, 5.0)));
        assert!(!poly.contains(Point::new(15.0, 5.0)));
        assert!(!poly.contains(Point::new(-0.1, 5.0)));
        assert_eq!(poly.area(), 100.0);
    }

    #[test]
    fn side_of_line_uses_screen_coordinates() {
        // Line pointing along +x; +y is "down" on screen, which is to the right.
        let a = Point::new(0.0, 0.0);
        let b = Point::new(10.0, 0.0);
        assert_eq!(side_of_line(Point::new(5.0, 3.0), a, b), Side::Right);
        assert_eq!(side_of_line(Point::new(5.0, -3.0), a, b), Side::Left);
        assert_eq!(side_of_line(Point::new(20.0, 0.0), a, b), Side::On);
    }

    #[test]
    fn segment_intersection_respects_extent() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(10.0, 0.0);
        assert!(segments_intersect(Point::new(5.0, -1.0), Point::new(5.0, 1.0), a, b));
        // Crosses the infinite line but not the segment.
        assert!(!segments_intersect(Point::new(15.0, -1.0), Point::new(15.0, 1.0), a, b));
        // Touching an endpoint counts.
        assert!(segments_intersect(Point::new(10.0, 0.0), Point::new(10.0, 4.0), a, b));
    }
}
