//! Delaunay triangulation restricted to a frame rectangle
//!
//! Incremental Bowyer-Watson over an enclosing super-triangle. Each inserted
//! vertex carries a payload id (the control-point index) so located
//! vertices map straight back to the mesh. Point location goes through a
//! bucket grid of triangle bounding boxes built once insertion is finished.

use std::collections::{BTreeSet, HashMap};

use crate::geometry::{orient, Point};

/// Distance (in pixels) under which a query is considered on an edge/vertex
const LOCATE_TOL: f64 = 1e-7;

/// Number of super-triangle vertices stored ahead of the real ones
const SUPER_VERTICES: usize = 3;

/// A triangulation vertex as seen by callers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VertexRef {
    pub id: usize,
    pub pos: Point,
}

/// Where a query point falls
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Location {
    Vertex(VertexRef),
    Edge([VertexRef; 2]),
    Triangle([VertexRef; 3]),
    /// Inside the frame but not covered by any real triangle
    OutsideHull,
    /// Outside the frame rectangle
    OutsideFrame,
}

impl Location {
    pub fn is_found(&self) -> bool {
        matches!(
            self,
            Location::Vertex(_) | Location::Edge(_) | Location::Triangle(_)
        )
    }
}

/// Result of inserting one point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    Added,
    /// A vertex already exists at this coordinate; carries its id
    Duplicate(usize),
    OutsideFrame,
}

#[derive(Debug, Clone)]
struct BucketIndex {
    cell_size: f64,
    cols: usize,
    rows: usize,
    cells: Vec<Vec<usize>>,
}

#[derive(Debug, Clone)]
pub struct Triangulation {
    width: u32,
    height: u32,
    vertices: Vec<Point>,
    ids: Vec<usize>,
    /// Counter-clockwise vertex triples (positive `orient`)
    triangles: Vec<[usize; 3]>,
    by_coord: HashMap<(u64, u64), usize>,
    index: Option<BucketIndex>,
}

fn coord_key(p: Point) -> (u64, u64) {
    // +0.0 folds -0.0 onto 0.0
    ((p.x + 0.0).to_bits(), (p.y + 0.0).to_bits())
}

/// Positive when `d` lies strictly inside the circumcircle of CCW `(a, b, c)`
fn in_circle(a: Point, b: Point, c: Point, d: Point) -> f64 {
    let (ad, bd, cd) = (a - d, b - d, c - d);
    ad.norm_sqr() * bd.cross(cd) + bd.norm_sqr() * cd.cross(ad) + cd.norm_sqr() * ad.cross(bd)
}

impl Triangulation {
    /// Empty triangulation over `[0, width-1] x [0, height-1]`
    pub fn new(width: u32, height: u32) -> Self {
        let m = width.max(height) as f64 + 16.0;
        let (cx, cy) = (width as f64 / 2.0, height as f64 / 2.0);
        let span = 8.0 * m;
        let vertices = vec![
            Point::new(cx - span, cy - span),
            Point::new(cx + span, cy - span),
            Point::new(cx, cy + span),
        ];
        let mut tri = [0, 1, 2];
        if orient(vertices[0], vertices[1], vertices[2]) < 0.0 {
            tri.swap(1, 2);
        }
        Self {
            width,
            height,
            vertices,
            ids: vec![usize::MAX; SUPER_VERTICES],
            triangles: vec![tri],
            by_coord: HashMap::new(),
            index: None,
        }
    }

    /// Build from `(position, id)` pairs. Returns the triangulation and the
    /// number of duplicate coordinates that were skipped.
    pub fn from_points<I>(width: u32, height: u32, points: I) -> (Self, usize)
    where
        I: IntoIterator<Item = (Point, usize)>,
    {
        let mut triangulation = Self::new(width, height);
        let mut duplicates = 0;
        for (p, id) in points {
            if let Insertion::Duplicate(_) = triangulation.insert(p, id) {
                duplicates += 1;
            }
        }
        triangulation.finish();
        (triangulation, duplicates)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of real (non-super) vertices
    pub fn vertex_count(&self) -> usize {
        self.vertices.len() - SUPER_VERTICES
    }

    fn is_super(&self, v: usize) -> bool {
        v < SUPER_VERTICES
    }

    fn vertex_ref(&self, v: usize) -> VertexRef {
        VertexRef {
            id: self.ids[v],
            pos: self.vertices[v],
        }
    }

    /// Insert one point with its payload id. Finding the cavity scans every
    /// triangle, so building from `n` points costs `O(n^2)`.
    pub fn insert(&mut self, p: Point, id: usize) -> Insertion {
        if p.is_outside(self.width, self.height) {
            return Insertion::OutsideFrame;
        }
        if let Some(&existing) = self.by_coord.get(&coord_key(p)) {
            return Insertion::Duplicate(self.ids[existing]);
        }

        let v = self.vertices.len();
        self.vertices.push(p);
        self.ids.push(id);
        self.by_coord.insert(coord_key(p), v);
        self.index = None;

        let mut bad: Vec<usize> = self
            .triangles
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                in_circle(self.vertices[t[0]], self.vertices[t[1]], self.vertices[t[2]], p) > 0.0
            })
            .map(|(i, _)| i)
            .collect();

        if bad.is_empty() {
            // Round-off on a cocircular configuration; fall back to the
            // triangle that contains the point.
            if let Some(i) = self.triangles.iter().position(|t| self.contains_closed(t, p)) {
                bad.push(i);
            }
        }

        // Cavity boundary: edges used by exactly one bad triangle
        let mut edge_count: HashMap<(usize, usize), (usize, usize, u32)> = HashMap::new();
        for &i in &bad {
            let t = self.triangles[i];
            for k in 0..3 {
                let (a, b) = (t[k], t[(k + 1) % 3]);
                let key = (a.min(b), a.max(b));
                edge_count
                    .entry(key)
                    .and_modify(|e| e.2 += 1)
                    .or_insert((a, b, 1));
            }
        }

        bad.sort_unstable_by(|a, b| b.cmp(a));
        for i in bad {
            self.triangles.swap_remove(i);
        }

        let mut boundary: Vec<(usize, usize)> = edge_count
            .into_values()
            .filter(|e| e.2 == 1)
            .map(|e| (e.0, e.1))
            .collect();
        boundary.sort_unstable();

        for (a, b) in boundary {
            let mut tri = [a, b, v];
            let o = orient(self.vertices[a], self.vertices[b], p);
            if o.abs() <= f64::EPSILON {
                continue;
            }
            if o < 0.0 {
                tri.swap(0, 1);
            }
            self.triangles.push(tri);
        }

        Insertion::Added
    }

    fn contains_closed(&self, t: &[usize; 3], p: Point) -> bool {
        let (a, b, c) = (self.vertices[t[0]], self.vertices[t[1]], self.vertices[t[2]]);
        orient(a, b, p) >= 0.0 && orient(b, c, p) >= 0.0 && orient(c, a, p) >= 0.0
    }

    /// Build the location index. Called automatically by `from_points`.
    pub fn finish(&mut self) {
        let real: Vec<usize> = (0..self.triangles.len())
            .filter(|&i| self.triangles[i].iter().all(|&v| !self.is_super(v)))
            .collect();

        let area = (self.width.max(1) as f64) * (self.height.max(1) as f64);
        let cell_size = (area / real.len().max(1) as f64).sqrt().max(4.0);
        let cols = (self.width as f64 / cell_size).ceil().max(1.0) as usize;
        let rows = (self.height as f64 / cell_size).ceil().max(1.0) as usize;
        let mut cells = vec![Vec::new(); cols * rows];

        for i in real {
            let t = self.triangles[i];
            let pts = [self.vertices[t[0]], self.vertices[t[1]], self.vertices[t[2]]];
            let min_x = pts.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
            let max_x = pts.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
            let min_y = pts.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
            let max_y = pts.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);

            let c0 = ((min_x / cell_size).floor().max(0.0) as usize).min(cols - 1);
            let c1 = ((max_x / cell_size).floor().max(0.0) as usize).min(cols - 1);
            let r0 = ((min_y / cell_size).floor().max(0.0) as usize).min(rows - 1);
            let r1 = ((max_y / cell_size).floor().max(0.0) as usize).min(rows - 1);
            for r in r0..=r1 {
                for c in c0..=c1 {
                    cells[r * cols + c].push(i);
                }
            }
        }

        self.index = Some(BucketIndex {
            cell_size,
            cols,
            rows,
            cells,
        });
    }

    /// Unique edges between real vertices, as payload id pairs
    pub fn edges(&self) -> Vec<(usize, usize)> {
        let mut set = BTreeSet::new();
        for t in &self.triangles {
            for k in 0..3 {
                let (a, b) = (t[k], t[(k + 1) % 3]);
                if self.is_super(a) || self.is_super(b) {
                    continue;
                }
                set.insert((a.min(b), a.max(b)));
            }
        }
        set.into_iter()
            .map(|(a, b)| (self.ids[a], self.ids[b]))
            .collect()
    }

    /// Real triangles as vertex references
    pub fn triangles(&self) -> Vec<[VertexRef; 3]> {
        self.triangles
            .iter()
            .filter(|t| t.iter().all(|&v| !self.is_super(v)))
            .map(|t| [self.vertex_ref(t[0]), self.vertex_ref(t[1]), self.vertex_ref(t[2])])
            .collect()
    }

    /// Classify `p` against the triangulation
    pub fn locate(&self, p: Point) -> Location {
        if p.is_outside(self.width, self.height) {
            return Location::OutsideFrame;
        }

        let candidates: Box<dyn Iterator<Item = usize> + '_> = match &self.index {
            Some(index) => {
                let c = ((p.x / index.cell_size).floor() as usize).min(index.cols - 1);
                let r = ((p.y / index.cell_size).floor() as usize).min(index.rows - 1);
                Box::new(index.cells[r * index.cols + c].iter().copied())
            }
            None => Box::new(
                (0..self.triangles.len())
                    .filter(|&i| self.triangles[i].iter().all(|&v| !self.is_super(v))),
            ),
        };

        for i in candidates {
            if let Some(location) = self.classify(&self.triangles[i], p) {
                return location;
            }
        }
        Location::OutsideHull
    }

    fn classify(&self, t: &[usize; 3], p: Point) -> Option<Location> {
        let mut on_edge = Vec::with_capacity(2);
        for k in 0..3 {
            let (a, b) = (t[k], t[(k + 1) % 3]);
            let (pa, pb) = (self.vertices[a], self.vertices[b]);
            let tol = LOCATE_TOL * (pb - pa).norm().max(1.0);
            let o = orient(pa, pb, p);
            if o < -tol {
                return None;
            }
            if o <= tol {
                on_edge.push(k);
            }
        }

        for &v in t {
            if (self.vertices[v] - p).norm() <= LOCATE_TOL {
                return Some(Location::Vertex(self.vertex_ref(v)));
            }
        }

        Some(match on_edge.as_slice() {
            [] => Location::Triangle([
                self.vertex_ref(t[0]),
                self.vertex_ref(t[1]),
                self.vertex_ref(t[2]),
            ]),
            [k] => Location::Edge([self.vertex_ref(t[*k]), self.vertex_ref(t[(*k + 1) % 3])]),
            // On two edges at once: the shared vertex
            [k0, k1] => {
                let shared = if (k0 + 1) % 3 == *k1 { t[*k1] } else { t[*k0] };
                Location::Vertex(self.vertex_ref(shared))
            }
            // Degenerate sliver; report its first edge
            _ => Location::Edge([self.vertex_ref(t[0]), self.vertex_ref(t[1])]),
        })
    }
}
