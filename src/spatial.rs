//! Spatial groups: mesh points lying on one connected image edge
//!
//! A group is later asked to scale uniformly, which keeps straight edges
//! straight under non-uniform retargeting.

use std::collections::VecDeque;

use image::GrayImage;
use imageproc::edges::canny;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{Connectivity, EdgeConfig};
use crate::keyframe::KeyFrame;
use crate::mesh::Mesh;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpatialGroup {
    pub frame_index: usize,
    /// Sorted, unique control-point indices
    pub members: Vec<usize>,
}

impl SpatialGroup {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Edge mask of a frame: the supplied one, or Canny on its luminance
pub fn edge_mask(frame: &KeyFrame, config: &EdgeConfig) -> GrayImage {
    match &frame.edge_mask {
        Some(mask) => mask.clone(),
        None => canny(&frame.gray, config.canny_low, config.canny_high),
    }
}

/// Extract the spatial groups of every frame
pub fn extract_spatial_groups(mesh: &Mesh, frames: &[KeyFrame], config: &EdgeConfig) -> Vec<SpatialGroup> {
    let groups: Vec<SpatialGroup> = frames
        .par_iter()
        .enumerate()
        .map(|(frame_index, frame)| {
            let mask = edge_mask(frame, config);
            let groups = frame_groups(mesh, frame_index, &mask, config.connectivity);
            debug!("Frame {}: {} spatial groups", frame_index, groups.len());
            groups
        })
        .flatten()
        .collect();

    info!("Extracted {} spatial groups", groups.len());
    groups
}

fn frame_groups(mesh: &Mesh, frame_index: usize, mask: &GrayImage, connectivity: Connectivity) -> Vec<SpatialGroup> {
    let (w, h) = (mask.width() as i64, mask.height() as i64);
    let grid = mesh.grid(frame_index);
    let is_edge = |x: i64, y: i64| {
        x >= 0 && y >= 0 && x < w && y < h && mask.get_pixel(x as u32, y as u32)[0] != 0
    };

    let mut visited: Vec<Option<usize>> = vec![None; (w * h) as usize];
    let mut groups = Vec::new();
    let mut queue = VecDeque::new();

    for seed in mesh.frame_range(frame_index) {
        let (sx, sy) = mesh.points[seed].origin_pos.to_pixel();
        if !is_edge(sx, sy) || visited[(sy * w + sx) as usize].is_some() {
            continue;
        }

        visited[(sy * w + sx) as usize] = Some(seed);
        queue.push_back((sx, sy));
        let mut members = Vec::new();

        while let Some((x, y)) = queue.pop_front() {
            if let Some(index) = grid.at(x, y) {
                members.push(index);
            }
            for &(dx, dy) in connectivity.offsets() {
                let (nx, ny) = (x + dx, y + dy);
                if !is_edge(nx, ny) {
                    continue;
                }
                let cell = &mut visited[(ny * w + nx) as usize];
                if cell.is_none() {
                    *cell = Some(seed);
                    queue.push_back((nx, ny));
                }
            }
        }

        members.sort_unstable();
        members.dedup();
        if members.len() > 1 {
            groups.push(SpatialGroup {
                frame_index,
                members,
            });
        }
    }

    groups
}
