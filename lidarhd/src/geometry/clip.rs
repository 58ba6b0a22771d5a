//! Sutherland–Hodgman polygon clipping.
//!
//! Clips an arbitrary simple polygon against a convex clip polygon and
//! reports the area of the result. Tile footprints are axis-aligned squares,
//! which keeps the convexity requirement trivially satisfied.

use super::{shoelace, Point, Polygon};

/// Area of `subject ∩ clip`, where `clip` must be convex.
///
/// Returns 0.0 when the polygons do not overlap. The subject may be concave.
pub fn clip_area(subject: &Polygon, clip: &Polygon) -> f64 {
    let clipped = clip_ring(subject.exterior(), clip.exterior());
    shoelace(&clipped).abs()
}

/// Clips `subject` against each edge of the convex ring `clip`.
///
/// The clip ring is normalized to counter-clockwise winding so the
/// inside test is consistent regardless of input orientation.
fn clip_ring(subject: &[Point], clip: &[Point]) -> Vec<Point> {
    let mut clip_ccw: Vec<Point> = clip.to_vec();
    if shoelace(&clip_ccw) < 0.0 {
        clip_ccw.reverse();
    }

    let mut output: Vec<Point> = subject.to_vec();
    let n = clip_ccw.len();
    for i in 0..n {
        if output.is_empty() {
            break;
        }
        let edge_start = clip_ccw[i];
        let edge_end = clip_ccw[(i + 1) % n];
        output = clip_against_edge(&output, edge_start, edge_end);
    }
    output
}

/// Keeps the part of `ring` on the left of the directed edge `a -> b`.
fn clip_against_edge(ring: &[Point], a: Point, b: Point) -> Vec<Point> {
    let mut result = Vec::with_capacity(ring.len() + 1);
    let n = ring.len();
    for i in 0..n {
        let current = ring[i];
        let previous = ring[(i + n - 1) % n];
        let current_inside = is_left(a, b, current);
        let previous_inside = is_left(a, b, previous);

        if current_inside {
            if !previous_inside {
                if let Some(p) = intersect(previous, current, a, b) {
                    result.push(p);
                }
            }
            result.push(current);
        } else if previous_inside {
            if let Some(p) = intersect(previous, current, a, b) {
                result.push(p);
            }
        }
    }
    result
}

/// True when `p` lies on or to the left of the directed edge `a -> b`.
fn is_left(a: Point, b: Point, p: Point) -> bool {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x) >= 0.0
}

/// Intersection of segment `p1 -> p2` with the infinite line through `a -> b`.
fn intersect(p1: Point, p2: Point, a: Point, b: Point) -> Option<Point> {
    let dx = p2.x - p1.x;
    let dy = p2.y - p1.y;
    let ex = b.x - a.x;
    let ey = b.y - a.y;
    let denom = dx * ey - dy * ex;
    if denom.abs() < f64::EPSILON {
        // Segment parallel to the clip edge; endpoints handle this case.
        return None;
    }
    let t = ((a.x - p1.x) * ey - (a.y - p1.y) * ex) / denom;
    Some(Point::new(p1.x + t * dx, p1.y + t * dy))
}
