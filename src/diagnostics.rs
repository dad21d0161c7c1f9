//! Counters for recoverable conditions met while deforming
//!
//! None of these abort a run. A non-zero `lookup_misses` points at an
//! upstream invariant violation and is logged at WARN.

use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Diagnostics {
    /// A coordinate that should map to a control point did not
    pub lookup_misses: usize,
    /// Two control points quantized onto the same pixel of an index grid
    pub grid_collisions: usize,
    /// Triangulation edges skipped because an endpoint could not be resolved
    pub skipped_edges: usize,
    /// Points inserted twice at the same coordinate into a triangulation
    pub duplicate_vertices: usize,
    /// Flow-displaced points that left the frame
    pub dropped_out_of_frame: usize,
    /// Flow-displaced points that could not be located in the next mesh
    pub dropped_unlocated: usize,
    /// Output pixels that could not be located in the deformed mesh
    pub unresolved_pixels: usize,
    /// Axis solves that needed the damped fallback
    pub damped_solves: usize,
    /// Axis solves that failed outright (positions kept)
    pub failed_solves: usize,
}

impl Diagnostics {
    pub fn merge(&mut self, other: &Diagnostics) {
        self.lookup_misses += other.lookup_misses;
        self.grid_collisions += other.grid_collisions;
        self.skipped_edges += other.skipped_edges;
        self.duplicate_vertices += other.duplicate_vertices;
        self.dropped_out_of_frame += other.dropped_out_of_frame;
        self.dropped_unlocated += other.dropped_unlocated;
        self.unresolved_pixels += other.unresolved_pixels;
        self.damped_solves += other.damped_solves;
        self.failed_solves += other.failed_solves;
    }

    /// Log the non-zero counters of a stage
    pub fn report(&self, stage: &str) {
        if self.lookup_misses > 0 {
            warn!("{}: {} control-point lookup misses", stage, self.lookup_misses);
        }
        if self.grid_collisions > 0 {
            warn!("{}: {} control points share a pixel", stage, self.grid_collisions);
        }
        if self.skipped_edges > 0 {
            warn!("{}: {} mesh edges skipped", stage, self.skipped_edges);
        }
        if self.duplicate_vertices > 0 {
            warn!("{}: {} duplicate triangulation vertices", stage, self.duplicate_vertices);
        }
        if self.dropped_out_of_frame + self.dropped_unlocated > 0 {
            warn!(
                "{}: {} temporal links dropped ({} left the frame, {} unlocated)",
                stage,
                self.dropped_out_of_frame + self.dropped_unlocated,
                self.dropped_out_of_frame,
                self.dropped_unlocated
            );
        }
        if self.unresolved_pixels > 0 {
            warn!("{}: {} output pixels unresolved", stage, self.unresolved_pixels);
        }
        if self.damped_solves > 0 || self.failed_solves > 0 {
            warn!(
                "{}: {} damped solves, {} failed solves",
                stage, self.damped_solves, self.failed_solves
            );
        }
    }
}
