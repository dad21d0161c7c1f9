//! Per-key-frame inputs handed to the core by upstream stages
//!
//! Superpixel segmentation, saliency estimation and optical flow are computed
//! elsewhere; this module only defines the contract and validates it.

use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RetargetError};
use crate::geometry::Point;

/// Which frame border a superpixel touches
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BorderClass {
    #[default]
    None,
    Left,
    Top,
    Right,
    Bottom,
}

impl BorderClass {
    pub fn is_interior(self) -> bool {
        self == BorderClass::None
    }
}

/// Per-superpixel summary produced by segmentation and saliency estimation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Superpixel {
    pub center: Point,
    pub saliency: f64,
    #[serde(default)]
    pub border: BorderClass,
}

impl Superpixel {
    pub fn new(center: Point, saliency: f64, border: BorderClass) -> Self {
        Self {
            center,
            saliency,
            border,
        }
    }
}

/// Pixel → superpixel id
#[derive(Debug, Clone)]
pub struct LabelMap {
    width: u32,
    height: u32,
    labels: Vec<usize>,
}

impl LabelMap {
    pub fn new(width: u32, height: u32, labels: Vec<usize>) -> Self {
        Self {
            width,
            height,
            labels,
        }
    }

    /// Build from a closure evaluated at every pixel
    pub fn from_fn<F: Fn(u32, u32) -> usize>(width: u32, height: u32, f: F) -> Self {
        let mut labels = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                labels.push(f(x, y));
            }
        }
        Self::new(width, height, labels)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Label at integer pixel, `None` outside the map
    pub fn get(&self, x: i64, y: i64) -> Option<usize> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        self.labels.get(y as usize * self.width as usize + x as usize).copied()
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }
}

/// Dense forward optical flow, pixel → displacement to the next frame
#[derive(Debug, Clone)]
pub struct FlowField {
    width: u32,
    height: u32,
    vectors: Vec<Point>,
}

impl FlowField {
    pub fn new(width: u32, height: u32, vectors: Vec<Point>) -> Self {
        Self {
            width,
            height,
            vectors,
        }
    }

    pub fn zeros(width: u32, height: u32) -> Self {
        Self::uniform(width, height, Point::default())
    }

    pub fn uniform(width: u32, height: u32, v: Point) -> Self {
        Self::new(width, height, vec![v; width as usize * height as usize])
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn vectors(&self) -> &[Point] {
        &self.vectors
    }

    /// Flow at the pixel containing `p` (zero outside the field)
    pub fn at(&self, p: Point) -> Point {
        let (x, y) = p.to_pixel();
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return Point::default();
        }
        self.vectors[y as usize * self.width as usize + x as usize]
    }
}

/// Everything the core needs about one key frame
#[derive(Debug, Clone)]
pub struct KeyFrame {
    /// Index of this key frame in the source video
    pub frame_id: usize,
    pub image: RgbImage,
    pub gray: GrayImage,
    pub labels: LabelMap,
    pub superpixels: Vec<Superpixel>,
    pub flow: FlowField,
    /// Binary edge mask (non-zero = edge). Computed from `gray` when absent.
    pub edge_mask: Option<GrayImage>,
}

impl KeyFrame {
    pub fn new(
        frame_id: usize,
        image: RgbImage,
        labels: LabelMap,
        superpixels: Vec<Superpixel>,
        flow: FlowField,
    ) -> Self {
        let gray = image::imageops::grayscale(&image);
        Self {
            frame_id,
            image,
            gray,
            labels,
            superpixels,
            flow,
            edge_mask: None,
        }
    }

    pub fn with_edge_mask(mut self, mask: GrayImage) -> Self {
        self.edge_mask = Some(mask);
        self
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Check that all per-pixel inputs agree on the frame size and that
    /// every label refers to a known superpixel
    pub fn validate(&self, index: usize) -> Result<()> {
        let (w, h) = (self.width(), self.height());
        if w == 0 || h == 0 {
            return Err(RetargetError::invalid_frame(index, "empty image"));
        }
        if self.labels.width() != w || self.labels.height() != h {
            return Err(RetargetError::invalid_frame(index, "label map size differs from image"));
        }
        if self.labels.labels().len() != w as usize * h as usize {
            return Err(RetargetError::invalid_frame(index, "label map is truncated"));
        }
        if self.flow.width() != w || self.flow.height() != h {
            return Err(RetargetError::invalid_frame(index, "flow field size differs from image"));
        }
        if self.flow.vectors().len() != w as usize * h as usize {
            return Err(RetargetError::invalid_frame(index, "flow field is truncated"));
        }
        if let Some(mask) = &self.edge_mask {
            if mask.width() != w || mask.height() != h {
                return Err(RetargetError::invalid_frame(index, "edge mask size differs from image"));
            }
        }
        if self.superpixels.is_empty() {
            return Err(RetargetError::invalid_frame(index, "no superpixels"));
        }
        if let Some(&bad) = self.labels.labels().iter().find(|&&l| l >= self.superpixels.len()) {
            return Err(RetargetError::invalid_frame(
                index,
                format!("label {} has no superpixel entry", bad),
            ));
        }
        for (i, sp) in self.superpixels.iter().enumerate() {
            if sp.center.is_outside(w, h) {
                return Err(RetargetError::invalid_frame(
                    index,
                    format!("superpixel {} center lies outside the frame", i),
                ));
            }
            if !(sp.saliency >= 0.0) {
                return Err(RetargetError::invalid_frame(
                    index,
                    format!("superpixel {} has negative saliency", i),
                ));
            }
        }
        Ok(())
    }
}
