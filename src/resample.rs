//! Dense deformation maps
//!
//! For every pixel of the deformed raster, find where it came from in the
//! source frame by locating it in the deformed mesh and replaying the same
//! barycentric weights over the original mesh.

use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::barycentric::barycentric;
use crate::diagnostics::Diagnostics;
use crate::geometry::Point;
use crate::mesh::Mesh;
use crate::triangulation::Triangulation;

/// Output pixel → source coordinate, row-major
#[derive(Debug, Clone, Serialize)]
pub struct DeformationMap {
    pub frame_index: usize,
    pub width: u32,
    pub height: u32,
    pub coords: Vec<Point>,
}

impl DeformationMap {
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> Point {
        self.coords[y as usize * self.width as usize + x as usize]
    }
}

/// Build the map of one frame from the committed mesh positions
pub fn build_map(
    mesh: &Mesh,
    frame_index: usize,
    out_width: u32,
    out_height: u32,
    scale_x: f64,
    scale_y: f64,
) -> (DeformationMap, Diagnostics) {
    let mut diagnostics = Diagnostics::default();
    let (src_w, src_h) = (mesh.width(), mesh.height());

    let (subdiv, duplicates) = Triangulation::from_points(
        out_width,
        out_height,
        mesh.frame_range(frame_index).map(|i| (mesh.points[i].pos, i)),
    );
    diagnostics.duplicate_vertices += duplicates;

    let row_len = out_width.max(1) as usize;
    let mut coords = vec![Point::default(); out_width as usize * out_height as usize];
    let unresolved: usize = coords
        .par_chunks_mut(row_len)
        .enumerate()
        .map(|(y, row)| {
            let mut misses = 0;
            for (x, out) in row.iter_mut().enumerate() {
                let p = Point::new(x as f64, y as f64);
                let source = match barycentric(&subdiv.locate(p), p) {
                    Some(weights) => weights.iter().fold(Point::default(), |acc, c| {
                        acc + c.weight * mesh.points[c.index].origin_pos
                    }),
                    None => {
                        misses += 1;
                        Point::new(p.x / scale_x, p.y / scale_y)
                    }
                };
                *out = source.clamp_inside(src_w, src_h);
            }
            misses
        })
        .sum();
    diagnostics.unresolved_pixels += unresolved;

    debug!(
        "Frame {}: deformation map {}x{} ({} unresolved pixels)",
        frame_index, out_width, out_height, unresolved
    );

    let map = DeformationMap {
        frame_index,
        width: out_width,
        height: out_height,
        coords,
    };
    (map, diagnostics)
}
