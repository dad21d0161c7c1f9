//! Control points: the vertices of the per-frame deformation mesh

use serde::{Deserialize, Serialize};

use crate::geometry::Point;

/// Role of a control point in the mesh
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnchorKind {
    /// Superpixel centroid, free
    Center,
    /// Crossing between two neighbouring superpixels, free but kept collinear
    Bound,
    /// Frame corner, never moves after rescale
    Static,
    StaticLeft,
    StaticTop,
    StaticRight,
    StaticBottom,
}

impl AnchorKind {
    /// Center and Bound points are the unknowns of the solver
    pub fn is_free(self) -> bool {
        matches!(self, AnchorKind::Center | AnchorKind::Bound)
    }

    pub fn is_static(self) -> bool {
        !self.is_free()
    }
}

/// One barycentric weight on a control point
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BaryCoord {
    pub weight: f64,
    pub index: usize,
}

impl BaryCoord {
    pub fn new(weight: f64, index: usize) -> Self {
        Self { weight, index }
    }
}

/// A mesh vertex tied to exactly one frame.
///
/// `origin_pos` lives in source-frame pixel space and is fixed once the mesh
/// is built. `pos` is the current position in the deformed output space and
/// is the only field the solver writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPoint {
    pub frame_index: usize,
    pub origin_pos: Point,
    pub pos: Point,
    pub anchor: AnchorKind,
    /// Superpixel this point represents or belongs to
    pub superpixel: Option<usize>,
    pub saliency: f64,
    /// Scaled forward flow to the next frame
    pub flow_displacement: Point,
    /// Points sharing a mesh edge with this one. Bound points have exactly
    /// two entries (their two centers), static anchors exactly one (their host).
    pub boundary_neighbors: Vec<usize>,
    /// Centers of neighbouring superpixels (Center points only)
    pub superpixel_neighbors: Vec<usize>,
    /// Flow-displaced position expressed in the next frame's mesh
    pub temporal_target: Vec<BaryCoord>,
}

impl ControlPoint {
    pub fn new(
        frame_index: usize,
        origin_pos: Point,
        anchor: AnchorKind,
        superpixel: Option<usize>,
        saliency: f64,
    ) -> Self {
        Self {
            frame_index,
            origin_pos,
            pos: origin_pos,
            anchor,
            superpixel,
            saliency,
            flow_displacement: Point::default(),
            boundary_neighbors: Vec::new(),
            superpixel_neighbors: Vec::new(),
            temporal_target: Vec::new(),
        }
    }

    pub fn add_boundary_neighbor(&mut self, index: usize) {
        self.boundary_neighbors.push(index);
    }

    pub fn add_superpixel_neighbor(&mut self, index: usize) {
        if !self.superpixel_neighbors.contains(&index) {
            self.superpixel_neighbors.push(index);
        }
    }

    pub fn set_temporal_target(&mut self, target: Vec<BaryCoord>) {
        self.temporal_target = target;
    }

    /// The host point a static anchor follows
    pub fn host(&self) -> Option<usize> {
        self.boundary_neighbors.first().copied()
    }
}

/// Reconstruct a position from barycentric weights over `points`
pub fn weighted_position<F>(points: &[ControlPoint], coords: &[BaryCoord], pick: F) -> Point
where
    F: Fn(&ControlPoint) -> Point,
{
    coords.iter().fold(Point::default(), |acc, c| {
        acc + c.weight * pick(&points[c.index])
    })
}
