//! Barycentric coordinates of a located point
//!
//! Degenerate simplices are reduced one vertex at a time
//! (triangle → edge → vertex), so evaluation always terminates.

use crate::control_point::BaryCoord;
use crate::geometry::{Point, EPS};
use crate::triangulation::{Location, VertexRef};

#[derive(Debug, Clone, Copy)]
enum Simplex {
    Vertex(VertexRef),
    Edge([VertexRef; 2]),
    Triangle([VertexRef; 3]),
}

/// Weights expressing `p` over the simplex `location` found. `None` when the
/// location is outside the frame or the hull.
pub fn barycentric(location: &Location, p: Point) -> Option<Vec<BaryCoord>> {
    let mut state = match *location {
        Location::Vertex(v) => Simplex::Vertex(v),
        Location::Edge(e) => Simplex::Edge(e),
        Location::Triangle(t) => Simplex::Triangle(t),
        Location::OutsideHull | Location::OutsideFrame => return None,
    };

    loop {
        state = match state {
            Simplex::Triangle([v0, v1, v2]) => {
                let (a, b, c) = (v0.pos, v1.pos, v2.pos);
                let det = (b.y - c.y) * (a.x - c.x) + (c.x - b.x) * (a.y - c.y);
                if det.abs() <= EPS {
                    Simplex::Edge([v1, v2])
                } else {
                    let l0 = ((b.y - c.y) * (p.x - c.x) + (c.x - b.x) * (p.y - c.y)) / det;
                    let l1 = ((c.y - a.y) * (p.x - c.x) + (a.x - c.x) * (p.y - c.y)) / det;
                    return Some(vec![
                        BaryCoord::new(l0, v0.id),
                        BaryCoord::new(l1, v1.id),
                        BaryCoord::new(1.0 - l0 - l1, v2.id),
                    ]);
                }
            }
            Simplex::Edge([v0, v1]) => {
                let d = v1.pos - v0.pos;
                let len_sqr = d.norm_sqr();
                if len_sqr <= EPS {
                    Simplex::Vertex(v1)
                } else {
                    let t = (p - v0.pos).dot(d) / len_sqr;
                    return Some(vec![
                        BaryCoord::new(1.0 - t, v0.id),
                        BaryCoord::new(t, v1.id),
                    ]);
                }
            }
            Simplex::Vertex(v) => return Some(vec![BaryCoord::new(1.0, v.id)]),
        };
    }
}
