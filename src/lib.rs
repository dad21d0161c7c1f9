//! retarget-mesh - content-aware video retargeting
//!
//! Key frames of a shot are covered by a mesh of control points (superpixel
//! centers, points on superpixel boundaries and frame anchors). The mesh is
//! deformed to the target size by minimising saliency, edge-straightness and
//! optical-flow consistency energies, and every output pixel is then mapped
//! back into its source frame through the deformed mesh.

pub mod barycentric;
pub mod config;
pub mod control_point;
pub mod deformation;
pub mod diagnostics;
pub mod energy;
pub mod error;
pub mod geometry;
pub mod io;
pub mod keyframe;
pub mod mesh;
pub mod render;
pub mod resample;
pub mod solver;
pub mod spatial;
pub mod temporal;
pub mod triangulation;

pub use config::Config;
pub use deformation::Deformation;
pub use diagnostics::Diagnostics;
pub use error::{Result, RetargetError};
pub use keyframe::KeyFrame;
pub use resample::DeformationMap;
