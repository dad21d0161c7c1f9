//! The three deformation energy terms
//!
//! All terms are evaluated from the current `pos` of every point; the
//! solver reports them once per iteration.

use serde::Serialize;

use crate::config::DeformationConfig;
use crate::control_point::{weighted_position, AnchorKind, ControlPoint};
use crate::geometry::EPS;
use crate::spatial::SpatialGroup;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct EnergyReport {
    pub saliency: f64,
    pub spatial: f64,
    pub temporal: f64,
    /// Weighted sum of the three terms
    pub total: f64,
}

impl EnergyReport {
    /// Weighted saliency + spatial part (what drives the solve when the
    /// temporal term is measure-only)
    pub fn shape_total(&self, config: &DeformationConfig) -> f64 {
        config.alpha_saliency * self.saliency + config.alpha_spatial * self.spatial
    }
}

/// Change of every center-to-neighbour offset, weighted by the center's saliency
pub fn saliency_energy(points: &[ControlPoint]) -> f64 {
    points
        .iter()
        .filter(|p| p.anchor == AnchorKind::Center)
        .map(|c| {
            let distortion: f64 = c
                .boundary_neighbors
                .iter()
                .map(|&b| {
                    let b = &points[b];
                    ((c.pos - b.pos) - (c.origin_pos - b.origin_pos)).norm_sqr()
                })
                .sum();
            c.saliency * distortion
        })
        .sum()
}

/// Variance of `pos / origin_pos` over the members of one group, one axis
fn ratio_variance<F>(points: &[ControlPoint], members: &[usize], axis: F) -> f64
where
    F: Fn(&ControlPoint) -> (f64, f64),
{
    let mut k = 0usize;
    let (mut sum, mut sum_sqr) = (0.0, 0.0);
    for &m in members {
        let (pos, origin) = axis(&points[m]);
        if origin.abs() < EPS {
            continue;
        }
        let r = pos / origin;
        sum += r;
        sum_sqr += r * r;
        k += 1;
    }
    if k == 0 {
        return 0.0;
    }
    let k = k as f64;
    sum_sqr / k - sum * sum / (k * k)
}

/// Non-uniform scaling along each spatial group
pub fn spatial_energy(points: &[ControlPoint], groups: &[SpatialGroup]) -> f64 {
    groups
        .iter()
        .map(|g| {
            ratio_variance(points, &g.members, |p| (p.pos.x, p.origin_pos.x))
                + ratio_variance(points, &g.members, |p| (p.pos.y, p.origin_pos.y))
        })
        .sum()
}

/// Disagreement between each linked point's motion and its flow
pub fn temporal_energy(points: &[ControlPoint], linked: &[usize]) -> f64 {
    linked
        .iter()
        .map(|&i| {
            let p = &points[i];
            let next = weighted_position(points, &p.temporal_target, |cp| cp.pos);
            ((next - p.pos) - p.flow_displacement).norm_sqr()
        })
        .sum()
}

pub fn evaluate(
    points: &[ControlPoint],
    groups: &[SpatialGroup],
    linked: &[usize],
    config: &DeformationConfig,
) -> EnergyReport {
    let saliency = saliency_energy(points);
    let spatial = spatial_energy(points, groups);
    let temporal = temporal_energy(points, linked);
    EnergyReport {
        saliency,
        spatial,
        temporal,
        total: config.alpha_saliency * saliency
            + config.alpha_spatial * spatial
            + config.alpha_temporal * temporal,
    }
}
