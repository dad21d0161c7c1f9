//! Control-point mesh construction
//!
//! Per frame: one Center point per superpixel, one Bound point per
//! triangulation edge where the two superpixels meet, then frozen anchors on
//! the frame corners and on the borders touched by border superpixels.
//! All points of all frames live in one append-only arena.

use std::ops::Range;

use tracing::{debug, info};

use crate::config::MeshConfig;
use crate::control_point::{AnchorKind, ControlPoint};
use crate::diagnostics::Diagnostics;
use crate::geometry::{Point, PointIndexGrid, EPS};
use crate::keyframe::{BorderClass, KeyFrame, LabelMap};
use crate::triangulation::{Insertion, Triangulation};

/// Result of walking from one superpixel center toward another
#[derive(Debug, Clone, Copy, PartialEq)]
enum Walk {
    Crossing(Point),
    NoCrossing,
    LabelMiss,
}

/// All control points of a deformation run
#[derive(Debug, Clone)]
pub struct Mesh {
    pub points: Vec<ControlPoint>,
    width: u32,
    height: u32,
    frame_ranges: Vec<Range<usize>>,
    /// Center/Bound points of each frame; a prefix of the frame range
    free_ranges: Vec<Range<usize>>,
    grids: Vec<PointIndexGrid>,
}

impl Mesh {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn frame_count(&self) -> usize {
        self.frame_ranges.len()
    }

    pub fn frame_range(&self, frame: usize) -> Range<usize> {
        self.frame_ranges[frame].clone()
    }

    pub fn free_range(&self, frame: usize) -> Range<usize> {
        self.free_ranges[frame].clone()
    }

    /// Original-coordinate → index grid of a frame
    pub fn grid(&self, frame: usize) -> &PointIndexGrid {
        &self.grids[frame]
    }

    /// Total number of Center/Bound points over all frames
    pub fn free_count(&self) -> usize {
        self.free_ranges.iter().map(|r| r.len()).sum()
    }

    pub fn center_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.points
            .iter()
            .enumerate()
            .filter(|(_, p)| p.anchor == AnchorKind::Center)
            .map(|(i, _)| i)
    }

    /// Initial positions in the output space: every point scaled, border
    /// anchors pinned onto the output border. Corners keep their scaled
    /// position, so for `scale * (size - 1) < out_size - 1` the last output
    /// column or row lies outside the hull.
    pub fn rescale(&mut self, scale_x: f64, scale_y: f64, out_width: u32, out_height: u32) {
        let right = (out_width.max(1) - 1) as f64;
        let bottom = (out_height.max(1) - 1) as f64;

        for p in &mut self.points {
            let mut pos = p.origin_pos.scale(scale_x, scale_y);
            match p.anchor {
                AnchorKind::Static => pos = pos.clamp_inside(out_width, out_height),
                AnchorKind::StaticLeft => pos.x = 0.0,
                AnchorKind::StaticTop => pos.y = 0.0,
                AnchorKind::StaticRight => pos.x = right,
                AnchorKind::StaticBottom => pos.y = bottom,
                AnchorKind::Center | AnchorKind::Bound => {
                    pos = pos.clamp_inside(out_width, out_height);
                }
            }
            p.pos = pos;
        }
    }
}

/// Builds the control-point arena from key frames
pub struct MeshBuilder<'a> {
    config: &'a MeshConfig,
}

impl<'a> MeshBuilder<'a> {
    pub fn new(config: &'a MeshConfig) -> Self {
        Self { config }
    }

    pub fn build(&self, frames: &[KeyFrame], diagnostics: &mut Diagnostics) -> Mesh {
        let (width, height) = frames
            .first()
            .map(|f| (f.width(), f.height()))
            .unwrap_or((0, 0));

        let mut mesh = Mesh {
            points: Vec::new(),
            width,
            height,
            frame_ranges: Vec::with_capacity(frames.len()),
            free_ranges: Vec::with_capacity(frames.len()),
            grids: Vec::with_capacity(frames.len()),
        };

        for (frame_index, frame) in frames.iter().enumerate() {
            self.build_frame(&mut mesh, frame_index, frame, diagnostics);
            debug!(
                "Frame {}: {} control points ({} free)",
                frame_index,
                mesh.frame_ranges[frame_index].len(),
                mesh.free_ranges[frame_index].len()
            );
        }

        info!(
            "Built {} control points over {} frames ({} free)",
            mesh.points.len(),
            frames.len(),
            mesh.free_count()
        );
        mesh
    }

    fn build_frame(
        &self,
        mesh: &mut Mesh,
        frame_index: usize,
        frame: &KeyFrame,
        diagnostics: &mut Diagnostics,
    ) {
        let (w, h) = (frame.width(), frame.height());
        let start = mesh.points.len();
        let mut grid = PointIndexGrid::new(w, h);
        let mut subdiv = Triangulation::new(w, h);

        let push = |points: &mut Vec<ControlPoint>,
                    grid: &mut PointIndexGrid,
                    diagnostics: &mut Diagnostics,
                    cp: ControlPoint| {
            let index = points.len();
            if !grid.insert(cp.origin_pos, index) {
                diagnostics.grid_collisions += 1;
            }
            points.push(cp);
            index
        };

        // Superpixel centers
        let mut center_of = Vec::with_capacity(frame.superpixels.len());
        for (j, sp) in frame.superpixels.iter().enumerate() {
            let cp = ControlPoint::new(frame_index, sp.center, AnchorKind::Center, Some(j), sp.saliency);
            let index = push(&mut mesh.points, &mut grid, diagnostics, cp);
            center_of.push(index);
            if let Insertion::Duplicate(_) = subdiv.insert(sp.center, index) {
                diagnostics.duplicate_vertices += 1;
            }
        }

        // Bound points between neighbouring superpixels
        let area = w as f64 * h as f64;
        let max_dist =
            self.config.bound_density_factor * (area / frame.superpixels.len().max(1) as f64).sqrt();

        for (i0, i1) in subdiv.edges() {
            let (p0, p1) = (&mesh.points[i0], &mesh.points[i1]);
            if p0.origin_pos.is_outside(w, h) || p1.origin_pos.is_outside(w, h) {
                continue;
            }
            let (Some(s0), Some(s1)) = (p0.superpixel, p1.superpixel) else {
                diagnostics.skipped_edges += 1;
                continue;
            };

            let interior = frame.superpixels[s0].border.is_interior()
                && frame.superpixels[s1].border.is_interior();
            if interior && (p0.origin_pos - p1.origin_pos).norm() > max_dist {
                continue;
            }

            let Some(bound) = bound_point(&frame.labels, p0, p1) else {
                diagnostics.skipped_edges += 1;
                continue;
            };

            let cp = ControlPoint::new(frame_index, bound, AnchorKind::Bound, None, 0.0);
            let b = push(&mut mesh.points, &mut grid, diagnostics, cp);
            mesh.points[i0].add_boundary_neighbor(b);
            mesh.points[i1].add_boundary_neighbor(b);
            mesh.points[b].add_boundary_neighbor(i0);
            mesh.points[b].add_boundary_neighbor(i1);
            mesh.points[i0].add_superpixel_neighbor(i1);
            mesh.points[i1].add_superpixel_neighbor(i0);
        }

        let free_end = mesh.points.len();

        // Corner anchors, each hosted by the center of the superpixel under it
        let (right, bottom) = ((w - 1) as f64, (h - 1) as f64);
        let corners = [
            Point::new(0.0, 0.0),
            Point::new(right, 0.0),
            Point::new(0.0, bottom),
            Point::new(right, bottom),
        ];
        for corner in corners {
            let Some(label) = frame.labels.get(corner.x as i64, corner.y as i64) else {
                diagnostics.lookup_misses += 1;
                continue;
            };
            let host = center_of[label];
            let cp = ControlPoint::new(frame_index, corner, AnchorKind::Static, Some(label), 0.0);
            let index = push(&mut mesh.points, &mut grid, diagnostics, cp);
            link(&mut mesh.points, host, index);
        }

        // Border anchors for superpixels touching a frame border
        for (j, sp) in frame.superpixels.iter().enumerate() {
            let (anchor, pos) = match sp.border {
                BorderClass::None => continue,
                BorderClass::Left => (AnchorKind::StaticLeft, Point::new(0.0, sp.center.y)),
                BorderClass::Top => (AnchorKind::StaticTop, Point::new(sp.center.x, 0.0)),
                BorderClass::Right => (AnchorKind::StaticRight, Point::new(right, sp.center.y)),
                BorderClass::Bottom => (AnchorKind::StaticBottom, Point::new(sp.center.x, bottom)),
            };
            let host = center_of[j];
            let cp = ControlPoint::new(frame_index, pos, anchor, Some(j), 0.0);
            let index = push(&mut mesh.points, &mut grid, diagnostics, cp);
            link(&mut mesh.points, host, index);
        }

        mesh.frame_ranges.push(start..mesh.points.len());
        mesh.free_ranges.push(start..free_end);
        mesh.grids.push(grid);
    }
}

fn link(points: &mut [ControlPoint], host: usize, anchor: usize) {
    points[host].add_boundary_neighbor(anchor);
    points[anchor].add_boundary_neighbor(host);
}

/// Where the segment between two centers leaves the more salient one's
/// superpixel. Falls back to the midpoint when no crossing is found and
/// gives up when the walk reads outside the label map.
fn bound_point(labels: &LabelMap, a: &ControlPoint, b: &ControlPoint) -> Option<Point> {
    let (from, to) = if a.saliency < b.saliency { (b, a) } else { (a, b) };
    let superpixel = from.superpixel?;
    match walk(labels, from.origin_pos, to.origin_pos, superpixel) {
        Walk::Crossing(p) => Some(p),
        Walk::NoCrossing => Some(0.5 * (from.origin_pos + to.origin_pos)),
        Walk::LabelMiss => None,
    }
}

fn walk(labels: &LabelMap, from: Point, to: Point, superpixel: usize) -> Walk {
    let check = |x: i64, y: i64| match labels.get(x, y) {
        None => Some(Walk::LabelMiss),
        Some(label) if label != superpixel => Some(Walk::Crossing(Point::new(x as f64, y as f64))),
        Some(_) => None,
    };

    if (from.x - to.x).abs() < EPS {
        let x = from.x.trunc() as i64;
        let step: i64 = if from.y < to.y { 1 } else { -1 };
        let mut y = from.y.trunc() as i64;
        while (step > 0 && (y as f64) < to.y) || (step < 0 && (y as f64) > to.y) {
            if let Some(result) = check(x, y) {
                return result;
            }
            y += step;
        }
        return Walk::NoCrossing;
    }

    let dx: i64 = if from.x > to.x { -1 } else { 1 };
    let span = (to.x - from.x).abs();
    let k = (to.y - from.y) / span;
    let row_at = |x: i64| {
        let t = (x as f64 - from.x).abs().min(span);
        (from.y + k * t).round() as i64
    };

    // Starts in the pixel containing `from`; rows are rounded
    let mut x = from.x.trunc() as i64;
    while (dx > 0 && (x as f64) < to.x) || (dx < 0 && (x as f64) > to.x) {
        let (mut y, y_end) = (row_at(x), row_at(x + dx));
        if k > 0.0 {
            while y <= y_end {
                if let Some(result) = check(x, y) {
                    return result;
                }
                y += 1;
            }
        } else {
            while y >= y_end {
                if let Some(result) = check(x, y) {
                    return result;
                }
                y -= 1;
            }
        }
        x += dx;
    }
    Walk::NoCrossing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyframe::fixtures::{single_superpixel, two_halves};
    use crate::keyframe::Superpixel;

    #[test]
    fn test_walk_horizontal() {
        let labels = LabelMap::from_fn(8, 4, |x, _| usize::from(x >= 4));
        assert_eq!(
            walk(&labels, Point::new(2.0, 2.0), Point::new(6.0, 2.0), 0),
            Walk::Crossing(Point::new(4.0, 2.0))
        );
        assert_eq!(
            walk(&labels, Point::new(6.0, 2.0), Point::new(2.0, 2.0), 1),
            Walk::Crossing(Point::new(3.0, 2.0))
        );
    }

    #[test]
    fn test_walk_vertical_and_diagonal() {
        let labels = LabelMap::from_fn(8, 8, |_, y| usize::from(y >= 5));
        assert_eq!(
            walk(&labels, Point::new(3.0, 1.0), Point::new(3.0, 7.0), 0),
            Walk::Crossing(Point::new(3.0, 5.0))
        );
        let hit = walk(&labels, Point::new(1.0, 1.0), Point::new(7.0, 7.0), 0);
        assert_eq!(hit, Walk::Crossing(Point::new(4.0, 5.0)));
    }

    #[test]
    fn test_walk_starts_in_containing_pixel() {
        let labels = LabelMap::from_fn(8, 8, |x, _| usize::from(x >= 4));
        assert_eq!(
            walk(&labels, Point::new(3.6, 1.0), Point::new(3.6, 7.0), 0),
            Walk::NoCrossing
        );
        assert_eq!(
            walk(&labels, Point::new(1.5, 2.0), Point::new(6.5, 2.0), 0),
            Walk::Crossing(Point::new(4.0, 2.0))
        );
    }

    #[test]
    fn test_walk_without_crossing() {
        let labels = LabelMap::from_fn(8, 8, |_, _| 0);
        assert_eq!(
            walk(&labels, Point::new(1.0, 1.0), Point::new(6.0, 3.0), 0),
            Walk::NoCrossing
        );
    }

    #[test]
    fn test_two_halves_mesh() {
        let frames = vec![two_halves(8, 4)];
        let mut diag = Diagnostics::default();
        let mesh = MeshBuilder::new(&MeshConfig::default()).build(&frames, &mut diag);

        // 2 centers + 1 bound + 4 corners
        assert_eq!(mesh.points.len(), 7);
        assert_eq!(mesh.free_count(), 3);
        assert_eq!(mesh.free_range(0), 0..3);

        let bound = &mesh.points[2];
        assert_eq!(bound.anchor, AnchorKind::Bound);
        assert_eq!(bound.origin_pos, Point::new(4.0, 2.0));
        assert_eq!(bound.boundary_neighbors, vec![0, 1]);
        assert_eq!(mesh.points[0].superpixel_neighbors, vec![1]);

        // corners (0,0),(0,3) belong to the left center, the others to the right
        assert_eq!(mesh.points[3].boundary_neighbors, vec![0]);
        assert_eq!(mesh.points[4].boundary_neighbors, vec![1]);
        assert_eq!(mesh.points[5].boundary_neighbors, vec![0]);
        assert_eq!(mesh.points[6].boundary_neighbors, vec![1]);
        assert_eq!(diag, Diagnostics::default());
    }

    #[test]
    fn test_every_bound_has_two_neighbors() {
        let mut frame = two_halves(16, 16);
        frame.labels = LabelMap::from_fn(16, 16, |x, y| (x / 8 + 2 * (y / 8)) as usize);
        frame.superpixels = vec![
            Superpixel::new(Point::new(4.0, 4.0), 0.9, BorderClass::Top),
            Superpixel::new(Point::new(12.0, 4.0), 0.2, BorderClass::Right),
            Superpixel::new(Point::new(4.0, 12.0), 0.5, BorderClass::Left),
            Superpixel::new(Point::new(12.0, 12.0), 0.1, BorderClass::Bottom),
        ];
        let mut diag = Diagnostics::default();
        let mesh = MeshBuilder::new(&MeshConfig::default()).build(&[frame], &mut diag);

        for p in &mesh.points {
            match p.anchor {
                AnchorKind::Bound => assert_eq!(p.boundary_neighbors.len(), 2),
                AnchorKind::Center => assert!(!p.boundary_neighbors.is_empty()),
                _ => assert_eq!(p.boundary_neighbors.len(), 1),
            }
        }
        let kinds: Vec<AnchorKind> = mesh.points.iter().map(|p| p.anchor).collect();
        for kind in [
            AnchorKind::StaticTop,
            AnchorKind::StaticRight,
            AnchorKind::StaticLeft,
            AnchorKind::StaticBottom,
        ] {
            assert_eq!(kinds.iter().filter(|&&k| k == kind).count(), 1);
        }
        let left = mesh
            .points
            .iter()
            .find(|p| p.anchor == AnchorKind::StaticLeft)
            .unwrap();
        assert_eq!(left.origin_pos, Point::new(0.0, 12.0));
    }

    #[test]
    fn test_density_heuristic_skips_far_interior_pairs() {
        let mut frame = two_halves(64, 8);
        // two tiny superpixels far apart, both interior
        frame.superpixels[0].center = Point::new(2.0, 4.0);
        frame.superpixels[1].center = Point::new(61.0, 4.0);
        let config = MeshConfig {
            bound_density_factor: 1.0,
        };
        let mut diag = Diagnostics::default();
        let mesh = MeshBuilder::new(&config).build(&[frame], &mut diag);
        assert!(mesh.points.iter().all(|p| p.anchor != AnchorKind::Bound));
    }

    #[test]
    fn test_rescale_scales_corners() {
        let frames = vec![single_superpixel(4, 4, Point::new(1.5, 1.5), Point::default())];
        let mut diag = Diagnostics::default();
        let mut mesh = MeshBuilder::new(&MeshConfig::default()).build(&frames, &mut diag);
        mesh.rescale(2.0, 1.0, 8, 4);

        assert_eq!(mesh.points[0].pos, Point::new(3.0, 1.5));
        let corners: Vec<Point> = mesh.points[1..].iter().map(|p| p.pos).collect();
        assert_eq!(
            corners,
            vec![
                Point::new(0.0, 0.0),
                Point::new(6.0, 0.0),
                Point::new(0.0, 3.0),
                Point::new(6.0, 3.0)
            ]
        );
    }

    #[test]
    fn test_rescale_pins_border_anchors() {
        let mut frame = two_halves(8, 4);
        frame.superpixels[0].border = BorderClass::Left;
        frame.superpixels[1].border = BorderClass::Right;
        let mut diag = Diagnostics::default();
        let mut mesh = MeshBuilder::new(&MeshConfig::default()).build(&[frame], &mut diag);
        mesh.rescale(2.0, 1.0, 16, 4);

        for p in &mesh.points {
            match p.anchor {
                AnchorKind::StaticLeft => assert_eq!(p.pos, Point::new(0.0, 2.0)),
                AnchorKind::StaticRight => assert_eq!(p.pos, Point::new(15.0, 2.0)),
                AnchorKind::Static => assert!(p.pos.x == 0.0 || p.pos.x == 14.0),
                _ => assert_eq!(p.pos, p.origin_pos.scale(2.0, 1.0)),
            }
        }
    }

    #[test]
    fn test_rescale_clamps_corners_when_shrinking() {
        let frames = vec![single_superpixel(10, 4, Point::new(4.5, 1.5), Point::default())];
        let mut diag = Diagnostics::default();
        let mut mesh = MeshBuilder::new(&MeshConfig::default()).build(&frames, &mut diag);
        // 9 * 0.5 = 4.5 lies past the last column of a 5-wide output
        mesh.rescale(0.5, 1.0, 5, 4);
        assert_eq!(mesh.points[2].pos, Point::new(4.0, 0.0));
    }
}
