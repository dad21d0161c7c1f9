//! Energy minimisation over all free control points
//!
//! Every energy term is a sum of squared residuals that are linear in the
//! point positions, and no term couples x with y. Each iteration therefore
//! assembles two independent normal-equation systems (one per axis) over
//! the Center/Bound points, solves them, keeps Bound points on the segment
//! between their two centers, and re-pins the border anchors to their hosts.

use nalgebra::{DMatrix, DVector};
use tracing::{debug, info};

use crate::config::{DeformationConfig, TemporalMode};
use crate::control_point::{AnchorKind, ControlPoint};
use crate::diagnostics::Diagnostics;
use crate::energy::{evaluate, EnergyReport};
use crate::geometry::{Point, EPS};
use crate::mesh::Mesh;
use crate::spatial::SpatialGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    X,
    Y,
}

impl Axis {
    #[inline]
    fn of(self, p: Point) -> f64 {
        match self {
            Axis::X => p.x,
            Axis::Y => p.y,
        }
    }

    #[inline]
    fn set(self, p: &mut Point, value: f64) {
        match self {
            Axis::X => p.x = value,
            Axis::Y => p.y = value,
        }
    }
}

/// Solver column of each free point
#[derive(Debug, Clone)]
struct Columns {
    column_of: Vec<Option<usize>>,
    point_of: Vec<usize>,
}

impl Columns {
    fn new(points: &[ControlPoint]) -> Self {
        let mut column_of = vec![None; points.len()];
        let mut point_of = Vec::new();
        for (i, p) in points.iter().enumerate() {
            if p.anchor.is_free() {
                column_of[i] = Some(point_of.len());
                point_of.push(i);
            }
        }
        Self {
            column_of,
            point_of,
        }
    }

    fn len(&self) -> usize {
        self.point_of.len()
    }
}

/// Normal equations `h * x = g` of one axis
struct AxisSystem {
    axis: Axis,
    h: DMatrix<f64>,
    g: DVector<f64>,
}

impl AxisSystem {
    fn new(axis: Axis, n: usize) -> Self {
        Self {
            axis,
            h: DMatrix::zeros(n, n),
            g: DVector::zeros(n),
        }
    }

    /// Add `weight * (sum(coef * pos) + constant)^2`. Fixed points fold
    /// into the constant at their current position.
    fn add_residual(
        &mut self,
        weight: f64,
        terms: &[(usize, f64)],
        constant: f64,
        points: &[ControlPoint],
        columns: &Columns,
    ) {
        if weight == 0.0 {
            return;
        }
        let mut c = constant;
        let mut free: Vec<(usize, f64)> = Vec::with_capacity(terms.len());
        for &(point, coef) in terms {
            match columns.column_of[point] {
                Some(col) => free.push((col, coef)),
                None => c += coef * self.axis.of(points[point].pos),
            }
        }
        for &(ci, ai) in &free {
            for &(cj, aj) in &free {
                self.h[(ci, cj)] += weight * ai * aj;
            }
            self.g[ci] -= weight * ai * c;
        }
    }
}

/// Outcome of one axis solve
enum AxisSolution {
    Exact(DVector<f64>),
    Damped(DVector<f64>),
    Failed,
}

fn is_finite(v: &DVector<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}

fn add_damping(system: AxisSystem, lambda: f64) -> (DMatrix<f64>, DVector<f64>) {
    let AxisSystem { mut h, g, .. } = system;
    for i in 0..h.nrows() {
        h[(i, i)] += lambda;
    }
    (h, g)
}

/// Cholesky first; when the system is not positive definite fall back to
/// `(h + λI) x = g + λ x_current`, which pulls unconstrained points toward
/// where they already are.
///
/// Each factorisation consumes its matrix, so at most one dense `n x n`
/// matrix per axis is alive; the fallbacks assemble the system again.
fn solve_axis<F>(assemble: F, current: &DVector<f64>, damping: f64) -> AxisSolution
where
    F: Fn() -> AxisSystem,
{
    let AxisSystem { h, g, .. } = assemble();
    let lambda = damping * h.diagonal().amax().max(1.0);
    if let Some(cholesky) = h.cholesky() {
        let x = cholesky.solve(&g);
        if is_finite(&x) {
            return AxisSolution::Exact(x);
        }
    }

    let (damped, g) = add_damping(assemble(), lambda);
    let rhs = g + current * lambda;
    if let Some(cholesky) = damped.cholesky() {
        let x = cholesky.solve(&rhs);
        if is_finite(&x) {
            return AxisSolution::Damped(x);
        }
    }

    let (damped, _) = add_damping(assemble(), lambda);
    match damped.lu().solve(&rhs) {
        Some(x) if is_finite(&x) => AxisSolution::Damped(x),
        _ => AxisSolution::Failed,
    }
}

pub struct Solver<'a> {
    config: &'a DeformationConfig,
    out_width: u32,
    out_height: u32,
}

impl<'a> Solver<'a> {
    pub fn new(config: &'a DeformationConfig, out_width: u32, out_height: u32) -> Self {
        Self {
            config,
            out_width,
            out_height,
        }
    }

    /// Run the configured number of iterations. Returns the energy before
    /// the first iteration followed by the energy after each one.
    pub fn minimize(
        &self,
        mesh: &mut Mesh,
        groups: &[SpatialGroup],
        linked: &[usize],
        diagnostics: &mut Diagnostics,
    ) -> Vec<EnergyReport> {
        let columns = Columns::new(&mesh.points);
        info!(
            "Minimizing deformation energy over {} free points ({} iterations)",
            columns.len(),
            self.config.iterations
        );

        let mut reports = Vec::with_capacity(self.config.iterations + 1);
        let report = evaluate(&mesh.points, groups, linked, self.config);
        log_energy(0, &report);
        reports.push(report);

        for iter in 0..self.config.iterations {
            self.step(&mut mesh.points, &columns, groups, linked, diagnostics);
            let report = evaluate(&mesh.points, groups, linked, self.config);
            log_energy(iter + 1, &report);
            reports.push(report);
        }
        reports
    }

    fn step(
        &self,
        points: &mut [ControlPoint],
        columns: &Columns,
        groups: &[SpatialGroup],
        linked: &[usize],
        diagnostics: &mut Diagnostics,
    ) {
        if columns.len() == 0 {
            return;
        }

        let view: &[ControlPoint] = points;
        let (sx, sy) = rayon::join(
            || self.solve(view, columns, groups, linked, Axis::X),
            || self.solve(view, columns, groups, linked, Axis::Y),
        );

        let mut next: Vec<Point> = points.iter().map(|p| p.pos).collect();
        for (axis, solution) in [(Axis::X, sx), (Axis::Y, sy)] {
            let values = match solution {
                AxisSolution::Exact(x) => x,
                AxisSolution::Damped(x) => {
                    diagnostics.damped_solves += 1;
                    x
                }
                AxisSolution::Failed => {
                    diagnostics.failed_solves += 1;
                    continue;
                }
            };
            for (col, &point) in columns.point_of.iter().enumerate() {
                axis.set(&mut next[point], values[col]);
            }
        }

        for &point in &columns.point_of {
            next[point] = next[point].clamp_inside(self.out_width, self.out_height);
        }
        project_bound_points(points, &mut next);
        self.commit(points, &next);
    }

    fn solve(
        &self,
        points: &[ControlPoint],
        columns: &Columns,
        groups: &[SpatialGroup],
        linked: &[usize],
        axis: Axis,
    ) -> AxisSolution {
        let current = DVector::from_iterator(
            columns.len(),
            columns.point_of.iter().map(|&i| axis.of(points[i].pos)),
        );
        solve_axis(
            || self.assemble(points, columns, groups, linked, axis),
            &current,
            self.config.damping,
        )
    }

    fn assemble(
        &self,
        points: &[ControlPoint],
        columns: &Columns,
        groups: &[SpatialGroup],
        linked: &[usize],
        axis: Axis,
    ) -> AxisSystem {
        let mut system = AxisSystem::new(axis, columns.len());

        // Saliency: (c - b) - (c0 - b0) per center/neighbour pair
        for (ci, c) in points.iter().enumerate() {
            if c.anchor != AnchorKind::Center {
                continue;
            }
            let weight = self.config.alpha_saliency * c.saliency;
            for &b in &c.boundary_neighbors {
                let offset = axis.of(c.origin_pos) - axis.of(points[b].origin_pos);
                system.add_residual(weight, &[(ci, 1.0), (b, -1.0)], -offset, points, columns);
            }
        }

        // Spatial: population variance of pos/origin as k residuals r_i - mean(r)
        for group in groups {
            let members: Vec<(usize, f64)> = group
                .members
                .iter()
                .map(|&m| (m, axis.of(points[m].origin_pos)))
                .filter(|(_, origin)| origin.abs() >= EPS)
                .collect();
            if members.len() < 2 {
                continue;
            }
            let k = members.len() as f64;
            let weight = self.config.alpha_spatial / k;
            for &(i, _) in &members {
                let terms: Vec<(usize, f64)> = members
                    .iter()
                    .map(|&(j, origin)| {
                        let delta = if i == j { 1.0 } else { 0.0 };
                        (j, (delta - 1.0 / k) / origin)
                    })
                    .collect();
                system.add_residual(weight, &terms, 0.0, points, columns);
            }
        }

        // Temporal: sum(w_j p_j) - p_i - flow_i
        if self.config.temporal_mode == TemporalMode::Solve {
            for &i in linked {
                let p = &points[i];
                let mut terms: Vec<(usize, f64)> =
                    p.temporal_target.iter().map(|c| (c.index, c.weight)).collect();
                terms.push((i, -1.0));
                system.add_residual(
                    self.config.alpha_temporal,
                    &terms,
                    -axis.of(p.flow_displacement),
                    points,
                    columns,
                );
            }
        }

        system
    }

    /// Write solved positions; border anchors follow their host on the free
    /// axis and stay on the output border on the pinned one
    fn commit(&self, points: &mut [ControlPoint], next: &[Point]) {
        let right = (self.out_width.max(1) - 1) as f64;
        let bottom = (self.out_height.max(1) - 1) as f64;

        for (p, &pos) in points.iter_mut().zip(next) {
            if p.anchor.is_free() {
                p.pos = pos;
            }
        }

        for i in 0..points.len() {
            let Some(host) = points[i].host() else {
                continue;
            };
            let host_pos = points[host].pos;
            let p = &mut points[i];
            match p.anchor {
                AnchorKind::StaticLeft => p.pos = Point::new(0.0, host_pos.y),
                AnchorKind::StaticTop => p.pos = Point::new(host_pos.x, 0.0),
                AnchorKind::StaticRight => p.pos = Point::new(right, host_pos.y),
                AnchorKind::StaticBottom => p.pos = Point::new(host_pos.x, bottom),
                AnchorKind::Static | AnchorKind::Center | AnchorKind::Bound => {}
            }
        }
    }
}

/// Clamp every Bound point onto the segment between its two centers
fn project_bound_points(points: &[ControlPoint], next: &mut [Point]) {
    for (i, p) in points.iter().enumerate() {
        if p.anchor != AnchorKind::Bound {
            continue;
        }
        let [n0, n1] = p.boundary_neighbors[..] else {
            continue;
        };
        next[i] = project_onto_segment(next[i], next[n0], next[n1]);
    }
}

/// Parametric projection with `t` clamped to `[0, 1]`
pub fn project_onto_segment(p: Point, a: Point, b: Point) -> Point {
    let ab = b - a;
    let len_sqr = ab.norm_sqr();
    if len_sqr < EPS {
        return a;
    }
    let t = ((p - a).dot(ab) / len_sqr).clamp(0.0, 1.0);
    a + t * ab
}

fn log_energy(iter: usize, report: &EnergyReport) {
    info!("Iter {}. Energy: {:.3}", iter, report.total);
    debug!(
        "SaliencyE {:.3}, SpatialE {:.3}, TemporalE {:.3}",
        report.saliency, report.spatial, report.temporal
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use crate::config::{EdgeConfig, MeshConfig};
    use crate::energy::spatial_energy;
    use crate::keyframe::fixtures::{single_superpixel, two_halves};
    use crate::keyframe::{BorderClass, KeyFrame, LabelMap, Superpixel};
    use crate::mesh::MeshBuilder;
    use crate::spatial::extract_spatial_groups;
    use image::{GrayImage, Luma};

    fn setup(frames: &[KeyFrame], sx: f64, sy: f64, w: u32, h: u32) -> Mesh {
        let mut diag = Diagnostics::default();
        let mut mesh = MeshBuilder::new(&MeshConfig::default()).build(frames, &mut diag);
        mesh.rescale(sx, sy, w, h);
        mesh
    }

    #[test]
    fn test_projection_clamps_to_segment() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(4.0, 0.0);
        assert_eq!(project_onto_segment(Point::new(2.0, 3.0), a, b), Point::new(2.0, 0.0));
        assert_eq!(project_onto_segment(Point::new(-5.0, 1.0), a, b), a);
        assert_eq!(project_onto_segment(Point::new(9.0, -1.0), a, b), b);
        assert_eq!(project_onto_segment(Point::new(9.0, -1.0), a, a), a);
    }

    #[test]
    fn test_two_halves_energy_decreases() {
        let frames = vec![two_halves(8, 4)];
        let mut mesh = setup(&frames, 2.0, 1.0, 16, 4);
        let config = DeformationConfig {
            scale_x: 2.0,
            scale_y: 1.0,
            iterations: 3,
            ..DeformationConfig::default()
        };
        let mut diag = Diagnostics::default();
        let reports = Solver::new(&config, 16, 4).minimize(&mut mesh, &[], &[], &mut diag);

        assert_eq!(reports.len(), 4);
        assert!((reports[0].total - 18.0).abs() < 1e-9);
        for pair in reports.windows(2) {
            assert!(pair[1].shape_total(&config) <= pair[0].shape_total(&config) + 1e-9);
        }
        assert!((reports[3].total - 49.0 / 3.0).abs() < 1e-6);

        let (a, b, bound) = (mesh.points[0].pos, mesh.points[1].pos, mesh.points[2].pos);
        assert!((a.x - 19.0 / 6.0).abs() < 1e-6);
        assert!((b.x - 71.0 / 6.0).abs() < 1e-6);
        assert!((bound.x - 7.5).abs() < 1e-6);
        assert!((a.y - 2.0).abs() < 1e-9 && (b.y - 2.0).abs() < 1e-9);
        assert_eq!(diag.damped_solves, 0);
    }

    #[test]
    fn test_spatial_group_evens_out_scaling() {
        // edge row through both centers and the bound point
        let mask = GrayImage::from_fn(8, 4, |_, y| Luma([if y == 2 { 255 } else { 0 }]));
        let frames = vec![two_halves(8, 4).with_edge_mask(mask)];
        let mut mesh = setup(&frames, 2.0, 1.0, 16, 4);
        let groups = extract_spatial_groups(&mesh, &frames, &EdgeConfig::default());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members, vec![0, 1, 2]);

        let config = DeformationConfig {
            scale_x: 2.0,
            scale_y: 1.0,
            iterations: 3,
            alpha_spatial: 50.0,
            ..DeformationConfig::default()
        };
        let mut diag = Diagnostics::default();
        let reports = Solver::new(&config, 16, 4).minimize(&mut mesh, &groups, &[], &mut diag);

        // uniform scaling starts with zero ratio variance
        assert!((reports[0].shape_total(&config) - 18.0).abs() < 1e-9);
        assert!(reports[0].spatial.abs() < 1e-12);
        for pair in reports.windows(2) {
            assert!(pair[1].shape_total(&config) <= pair[0].shape_total(&config) + 1e-9);
        }

        // stationary point of the saliency and 50 * ratio variance sum along x
        let (a, b, bound) = (mesh.points[0].pos, mesh.points[1].pos, mesh.points[2].pos);
        assert!((a.x - 210247.0 / 59753.0).abs() < 1e-6);
        assert!((b.x - 704073.0 / 59753.0).abs() < 1e-6);
        assert!((bound.x - 454010.0 / 59753.0).abs() < 1e-6);
        assert!((a.y - 2.0).abs() < 1e-9 && (b.y - 2.0).abs() < 1e-9);

        let spatial = spatial_energy(&mesh.points, &groups);
        assert!((spatial - 26039286.0 / 3570421009.0).abs() < 1e-9);
        assert!((reports[3].spatial - spatial).abs() < 1e-12);
        let last = reports[3].shape_total(&config);
        assert!((last - (59528023772.0 + 50.0 * 26039286.0) / 3570421009.0).abs() < 1e-6);

        // the spatial term alone pulls the ratios closer than saliency does
        let mut free = setup(&frames, 2.0, 1.0, 16, 4);
        Solver::new(&config, 16, 4).minimize(&mut free, &[], &[], &mut diag);
        assert!(spatial < spatial_energy(&free.points, &groups));
        assert_eq!(diag.damped_solves, 0);
    }

    #[test]
    fn test_solve_axis_assembles_again_only_on_fallback() {
        let current = DVector::from_vec(vec![3.0, 5.0]);
        let calls = Cell::new(0);

        let definite = || {
            calls.set(calls.get() + 1);
            AxisSystem {
                axis: Axis::X,
                h: DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 4.0]),
                g: DVector::from_vec(vec![2.0, 8.0]),
            }
        };
        match solve_axis(definite, &current, 1e-6) {
            AxisSolution::Exact(x) => {
                assert!((x[0] - 1.0).abs() < 1e-12 && (x[1] - 2.0).abs() < 1e-12);
            }
            _ => panic!("expected an exact solve"),
        }
        assert_eq!(calls.get(), 1);

        calls.set(0);
        // second column unconstrained
        let singular = || {
            calls.set(calls.get() + 1);
            AxisSystem {
                axis: Axis::X,
                h: DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 0.0]),
                g: DVector::from_vec(vec![2.0, 0.0]),
            }
        };
        match solve_axis(singular, &current, 1e-6) {
            AxisSolution::Damped(x) => {
                assert!((x[0] - 1.0).abs() < 1e-5);
                assert!((x[1] - 5.0).abs() < 1e-9);
            }
            _ => panic!("expected a damped solve"),
        }
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_bound_points_stay_collinear() {
        let mut frame = two_halves(16, 16);
        frame.labels = LabelMap::from_fn(16, 16, |x, y| (x / 8 + 2 * (y / 8)) as usize);
        frame.superpixels = vec![
            Superpixel::new(Point::new(3.0, 4.0), 3.0, BorderClass::Top),
            Superpixel::new(Point::new(12.0, 5.0), 0.2, BorderClass::Right),
            Superpixel::new(Point::new(4.0, 11.0), 1.5, BorderClass::Left),
            Superpixel::new(Point::new(11.0, 12.0), 0.1, BorderClass::None),
        ];
        let frames = vec![frame];
        let mut mesh = setup(&frames, 1.5, 0.75, 24, 12);
        let config = DeformationConfig {
            scale_x: 1.5,
            scale_y: 0.75,
            iterations: 4,
            ..DeformationConfig::default()
        };
        let mut diag = Diagnostics::default();
        Solver::new(&config, 24, 12).minimize(&mut mesh, &[], &[], &mut diag);

        for p in mesh.points.iter().filter(|p| p.anchor == AnchorKind::Bound) {
            let n0 = mesh.points[p.boundary_neighbors[0]].pos;
            let n1 = mesh.points[p.boundary_neighbors[1]].pos;
            let (u, v) = (p.pos - n0, n1 - n0);
            assert!(u.cross(v).abs() < 1e-6);
            if v.norm_sqr() > EPS {
                let t = u.dot(v) / v.norm_sqr();
                assert!((-1e-9..=1.0 + 1e-9).contains(&t));
            }
        }
        for p in &mesh.points {
            assert!(!p.pos.is_outside(24, 12));
            match p.anchor {
                AnchorKind::StaticLeft => assert_eq!(p.pos.x, 0.0),
                AnchorKind::StaticTop => assert_eq!(p.pos.y, 0.0),
                AnchorKind::StaticRight => assert_eq!(p.pos.x, 23.0),
                AnchorKind::StaticBottom => assert_eq!(p.pos.y, 11.0),
                _ => {}
            }
        }
    }

    #[test]
    fn test_zero_saliency_falls_back_to_damping() {
        let mut frame = single_superpixel(4, 4, Point::new(1.5, 1.5), Point::default());
        frame.superpixels[0].saliency = 0.0;
        let frames = vec![frame];
        let mut mesh = setup(&frames, 2.0, 1.0, 8, 4);
        let config = DeformationConfig {
            iterations: 1,
            ..DeformationConfig::default()
        };
        let mut diag = Diagnostics::default();
        Solver::new(&config, 8, 4).minimize(&mut mesh, &[], &[], &mut diag);

        assert_eq!(diag.damped_solves, 2);
        assert!(mesh.points[0].pos.approx_eq(Point::new(3.0, 1.5), 1e-9));
    }

    #[test]
    fn test_temporal_term_pulls_toward_flow() {
        let frames = vec![
            single_superpixel(4, 4, Point::new(2.0, 2.0), Point::default()),
            single_superpixel(4, 4, Point::new(2.0, 2.0), Point::default()),
        ];
        let mut mesh = setup(&frames, 1.0, 1.0, 4, 4);
        let next = mesh.frame_range(1).start;
        mesh.points[0].flow_displacement = Point::new(1.0, 0.0);
        mesh.points[0].set_temporal_target(vec![crate::control_point::BaryCoord::new(1.0, next)]);

        let solve = DeformationConfig {
            iterations: 1,
            ..DeformationConfig::default()
        };
        let measure = DeformationConfig {
            temporal_mode: TemporalMode::MeasureOnly,
            ..solve.clone()
        };

        let mut solved = mesh.clone();
        let mut diag = Diagnostics::default();
        let r_solve = Solver::new(&solve, 4, 4).minimize(&mut solved, &[], &[0], &mut diag);
        let r_measure = Solver::new(&measure, 4, 4).minimize(&mut mesh, &[], &[0], &mut diag);

        assert_eq!(r_measure[0].temporal, 1.0);
        assert_eq!(r_measure[1].temporal, 1.0);
        assert!(r_solve[1].temporal < 1.0);
        assert!(r_solve[1].total <= r_solve[0].total + 1e-9);
    }
}
