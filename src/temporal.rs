//! Temporal links between consecutive key frames
//!
//! Each free point of frame `f` follows its optical flow into frame `f+1`
//! and is expressed there as a barycentric combination of frame `f+1`
//! control points.

use rayon::prelude::*;
use tracing::{debug, info};

use crate::barycentric::barycentric;
use crate::control_point::BaryCoord;
use crate::diagnostics::Diagnostics;
use crate::geometry::Point;
use crate::keyframe::KeyFrame;
use crate::mesh::Mesh;
use crate::triangulation::Triangulation;

struct Link {
    index: usize,
    flow_displacement: Point,
    target: Option<Vec<BaryCoord>>,
}

/// Compute temporal targets for every frame pair. Returns the indices of
/// all points that received a target, in ascending order.
pub fn link_frames(
    mesh: &mut Mesh,
    frames: &[KeyFrame],
    scale_x: f64,
    scale_y: f64,
    diagnostics: &mut Diagnostics,
) -> Vec<usize> {
    let pairs = frames.len().saturating_sub(1);

    let shared: &Mesh = mesh;
    let results: Vec<(Vec<Link>, Diagnostics)> = (0..pairs)
        .into_par_iter()
        .map(|frame| link_pair(shared, &frames[frame], frame, scale_x, scale_y))
        .collect();

    let mut linked = Vec::new();
    for (links, local) in results {
        diagnostics.merge(&local);
        for link in links {
            let point = &mut mesh.points[link.index];
            point.flow_displacement = link.flow_displacement;
            if let Some(target) = link.target {
                point.set_temporal_target(target);
                linked.push(link.index);
            }
        }
    }

    info!("Linked {} control points across {} frame pairs", linked.len(), pairs);
    linked
}

fn link_pair(
    mesh: &Mesh,
    frame: &KeyFrame,
    frame_index: usize,
    scale_x: f64,
    scale_y: f64,
) -> (Vec<Link>, Diagnostics) {
    let mut diagnostics = Diagnostics::default();
    let next = frame_index + 1;

    let (subdiv, duplicates) = Triangulation::from_points(
        mesh.width(),
        mesh.height(),
        mesh.frame_range(next).map(|i| (mesh.points[i].origin_pos, i)),
    );
    diagnostics.duplicate_vertices += duplicates;

    let mut links = Vec::new();
    for index in mesh.frame_range(frame_index) {
        let point = &mesh.points[index];
        if !point.anchor.is_free() {
            continue;
        }

        let flow = frame.flow.at(point.origin_pos);
        let target_pos = point.origin_pos + flow;
        let mut link = Link {
            index,
            flow_displacement: flow.scale(scale_x, scale_y),
            target: None,
        };

        if target_pos.is_outside(mesh.width(), mesh.height()) {
            diagnostics.dropped_out_of_frame += 1;
        } else {
            link.target = barycentric(&subdiv.locate(target_pos), target_pos);
            if link.target.is_none() {
                diagnostics.dropped_unlocated += 1;
            }
        }
        links.push(link);
    }

    debug!(
        "Frame {} -> {}: {} of {} free points linked",
        frame_index,
        next,
        links.iter().filter(|l| l.target.is_some()).count(),
        links.len()
    );
    (links, diagnostics)
}
