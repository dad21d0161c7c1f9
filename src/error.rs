//! Error types for the retargeting core

use thiserror::Error;

/// Result type for retargeting operations
pub type Result<T> = std::result::Result<T, RetargetError>;

/// Errors surfaced to callers.
///
/// Geometric degeneracies, dropped temporal links and lookup misses are not
/// errors; they are counted in [`crate::diagnostics::Diagnostics`].
#[derive(Debug, Error)]
pub enum RetargetError {
    #[error("no key frames supplied")]
    EmptySequence,

    #[error("frame {frame} is {width}x{height}, expected {expected_width}x{expected_height}")]
    FrameSizeMismatch {
        frame: usize,
        width: u32,
        height: u32,
        expected_width: u32,
        expected_height: u32,
    },

    #[error("invalid key frame {frame}: {message}")]
    InvalidKeyFrame { frame: usize, message: String },

    #[error("invalid deformation scale {scale_x}x{scale_y}")]
    InvalidScale { scale_x: f64, scale_y: f64 },

    #[error("invalid flow file: {0}")]
    InvalidFlow(String),

    #[error("deformation has not been initialized")]
    NotInitialized,

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RetargetError {
    pub fn invalid_frame(frame: usize, message: impl Into<String>) -> Self {
        Self::InvalidKeyFrame {
            frame,
            message: message.into(),
        }
    }
}
