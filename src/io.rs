//! Loading key frames from disk and writing results
//!
//! A shot is described by a JSON manifest listing, per key frame, the source
//! image, a 16-bit label PNG, the superpixel table and an optional Middlebury
//! `.flo` forward-flow file. Relative paths resolve against the manifest's
//! directory. An optional `shot` section lists every frame of the shot so
//! that non-key frames can be rendered too.

use std::fs::File;
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};

use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, RetargetError};
use crate::geometry::Point;
use crate::keyframe::{FlowField, KeyFrame, LabelMap, Superpixel};
use crate::resample::DeformationMap;

/// Magic number at the start of every `.flo` file
const FLO_MAGIC: f32 = 202021.25;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameEntry {
    pub frame_id: usize,
    pub image: PathBuf,
    /// 16-bit grayscale PNG, pixel value = superpixel id
    pub labels: PathBuf,
    pub superpixels: Vec<Superpixel>,
    /// Forward flow to the next key frame; zero flow when absent
    #[serde(default)]
    pub flow: Option<PathBuf>,
    /// Precomputed edge mask; Canny is run when absent
    #[serde(default)]
    pub edges: Option<PathBuf>,
}

/// Full frame sequence of a shot; `frames[i]` is video frame `start + i`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShotEntry {
    pub start: usize,
    pub frames: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub frames: Vec<FrameEntry>,
    #[serde(default)]
    pub shot: Option<ShotEntry>,
}

impl Manifest {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Load every key frame listed in a manifest
pub fn load_key_frames(manifest_path: &Path) -> Result<Vec<KeyFrame>> {
    let manifest = Manifest::from_file(manifest_path)?;
    let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));

    let frames = manifest
        .frames
        .iter()
        .map(|entry| load_key_frame(base, entry))
        .collect::<Result<Vec<_>>>()?;

    info!("Loaded {} key frames from {:?}", frames.len(), manifest_path);
    Ok(frames)
}

pub fn load_key_frame(base: &Path, entry: &FrameEntry) -> Result<KeyFrame> {
    let image: RgbImage = image::open(resolve(base, &entry.image))?.into_rgb8();
    let (w, h) = image.dimensions();

    let labels = image::open(resolve(base, &entry.labels))?.into_luma16();
    let labels = LabelMap::new(
        labels.width(),
        labels.height(),
        labels.pixels().map(|p| p[0] as usize).collect(),
    );

    let flow = match &entry.flow {
        Some(path) => read_flo(&resolve(base, path))?,
        None => FlowField::zeros(w, h),
    };

    let mut frame = KeyFrame::new(entry.frame_id, image, labels, entry.superpixels.clone(), flow);
    if let Some(path) = &entry.edges {
        let mask: GrayImage = image::open(resolve(base, path))?.into_luma8();
        frame = frame.with_edge_mask(mask);
    }

    debug!(
        "Key frame {}: {}x{}, {} superpixels",
        entry.frame_id,
        w,
        h,
        frame.superpixels.len()
    );
    Ok(frame)
}

/// Load the shot frames listed in a manifest, with the shot start index
pub fn load_shot_frames(manifest_path: &Path) -> Result<Option<(usize, Vec<RgbImage>)>> {
    let manifest = Manifest::from_file(manifest_path)?;
    let Some(shot) = manifest.shot else {
        return Ok(None);
    };
    let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));

    let frames = shot
        .frames
        .iter()
        .map(|path| -> Result<RgbImage> { Ok(image::open(resolve(base, path))?.into_rgb8()) })
        .collect::<Result<Vec<_>>>()?;

    info!("Loaded {} shot frames starting at {}", frames.len(), shot.start);
    Ok(Some((shot.start, frames)))
}

/// Read a Middlebury `.flo` file
pub fn read_flo(path: &Path) -> Result<FlowField> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    parse_flo(&bytes)
}

/// Parse `.flo` bytes: magic, width, height, then interleaved `(u, v)` f32
/// pairs, all little-endian
pub fn parse_flo(bytes: &[u8]) -> Result<FlowField> {
    let word = |i: usize| -> Result<[u8; 4]> {
        bytes
            .get(i * 4..i * 4 + 4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| RetargetError::InvalidFlow("file is truncated".to_string()))
    };

    let magic = f32::from_le_bytes(word(0)?);
    if magic != FLO_MAGIC {
        return Err(RetargetError::InvalidFlow(format!("bad magic {}", magic)));
    }
    let width = i32::from_le_bytes(word(1)?);
    let height = i32::from_le_bytes(word(2)?);
    if width <= 0 || height <= 0 {
        return Err(RetargetError::InvalidFlow(format!(
            "bad dimensions {}x{}",
            width, height
        )));
    }

    let count = width as usize * height as usize;
    let expected = 12 + count * 8;
    if bytes.len() < expected {
        return Err(RetargetError::InvalidFlow(format!(
            "expected {} bytes, found {}",
            expected,
            bytes.len()
        )));
    }

    let mut vectors = Vec::with_capacity(count);
    for i in 0..count {
        let u = f32::from_le_bytes(word(3 + 2 * i)?);
        let v = f32::from_le_bytes(word(4 + 2 * i)?);
        vectors.push(Point::new(u as f64, v as f64));
    }
    Ok(FlowField::new(width as u32, height as u32, vectors))
}

/// Encode a flow field as `.flo` bytes
pub fn encode_flo(flow: &FlowField) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(12 + flow.width() as usize * flow.height() as usize * 8);
    bytes.extend_from_slice(&FLO_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&(flow.width() as i32).to_le_bytes());
    bytes.extend_from_slice(&(flow.height() as i32).to_le_bytes());
    for y in 0..flow.height() {
        for x in 0..flow.width() {
            let v = flow.at(Point::new(x as f64, y as f64));
            bytes.extend_from_slice(&(v.x as f32).to_le_bytes());
            bytes.extend_from_slice(&(v.y as f32).to_le_bytes());
        }
    }
    bytes
}

/// Write rendered frames as `frame_<id>.png`
pub fn write_frames(dir: &Path, ids: &[usize], frames: &[RgbImage]) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::with_capacity(frames.len());
    for (id, frame) in ids.iter().zip(frames) {
        let path = dir.join(format!("frame_{:05}.png", id));
        frame.save(&path)?;
        written.push(path);
    }
    info!("Wrote {} frames to {:?}", written.len(), dir);
    Ok(written)
}

/// Write a deformation map as JSON
pub fn write_map(path: &Path, map: &DeformationMap) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(writer, map)?;
    Ok(())
}
