//! Rendering through a deformation map
//!
//! Maps store source coordinates, so rendering is a plain nearest-neighbour
//! gather over the source raster.

use image::RgbImage;
use rayon::prelude::*;

use crate::error::{Result, RetargetError};
use crate::resample::DeformationMap;

const CHANNELS: usize = 3;

/// Nearest-neighbour sampling from a packed raster
#[inline]
pub fn nearest_sample(
    src: &[u8],
    stride: usize,
    width: usize,
    height: usize,
    channels: usize,
    x: f64,
    y: f64,
) -> [u8; 4] {
    let x = (x.max(0.0).round() as usize).min(width - 1);
    let y = (y.max(0.0).round() as usize).min(height - 1);

    let offset = y * stride + x * channels;
    let mut result = [0u8; 4];

    for c in 0..channels.min(4) {
        result[c] = src.get(offset + c).copied().unwrap_or(0);
    }

    result
}

/// Render one frame through its map
pub fn render_frame(source: &RgbImage, map: &DeformationMap) -> RgbImage {
    let (src_w, src_h) = (source.width() as usize, source.height() as usize);
    let src = source.as_raw();
    let src_stride = src_w * CHANNELS;
    let dst_stride = map.width as usize * CHANNELS;

    if src_w == 0 || src_h == 0 || dst_stride == 0 {
        return RgbImage::new(map.width, map.height);
    }
    let mut dst = vec![0u8; dst_stride * map.height as usize];

    dst.par_chunks_mut(dst_stride)
        .enumerate()
        .for_each(|(dst_y, row)| {
            for dst_x in 0..map.width as usize {
                let p = map.coords[dst_y * map.width as usize + dst_x];
                let pixel = nearest_sample(src, src_stride, src_w, src_h, CHANNELS, p.x, p.y);
                let offset = dst_x * CHANNELS;
                row[offset..offset + CHANNELS].copy_from_slice(&pixel[..CHANNELS]);
            }
        });

    RgbImage::from_raw(map.width, map.height, dst).unwrap_or_else(|| RgbImage::new(map.width, map.height))
}

/// Render every frame of a shot. `frames[i]` is source frame `shot_start + i`
/// and uses the map of the first key frame whose id is `>= shot_start + i`;
/// frames after the last key frame use the last map. `key_frame_ids` are
/// source-frame indices, ascending and parallel to `maps`.
pub fn render_shot(
    frames: &[RgbImage],
    shot_start: usize,
    key_frame_ids: &[usize],
    maps: &[DeformationMap],
) -> Result<Vec<RgbImage>> {
    if maps.is_empty() || key_frame_ids.len() != maps.len() {
        return Err(RetargetError::NotInitialized);
    }
    if key_frame_ids.windows(2).any(|w| w[0] >= w[1]) {
        return Err(RetargetError::invalid_frame(
            key_frame_ids[0],
            "key frame ids are not strictly ascending",
        ));
    }

    let rendered = frames
        .par_iter()
        .enumerate()
        .map(|(i, frame)| {
            let frame_id = shot_start + i;
            let k = key_frame_ids
                .partition_point(|&id| id < frame_id)
                .min(maps.len() - 1);
            render_frame(frame, &maps[k])
        })
        .collect();
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;
    use image::Rgb;

    fn stretch_map(frame_index: usize, w: u32, h: u32, sx: f64) -> DeformationMap {
        let mut coords = Vec::new();
        for y in 0..h {
            for x in 0..w {
                coords.push(Point::new(x as f64 / sx, y as f64));
            }
        }
        DeformationMap {
            frame_index,
            width: w,
            height: h,
            coords,
        }
    }

    #[test]
    fn test_nearest_sample_clamps() {
        let src = [10u8, 20, 30, 40, 50, 60];
        assert_eq!(nearest_sample(&src, 6, 2, 1, 3, 0.4, 0.0), [10, 20, 30, 0]);
        assert_eq!(nearest_sample(&src, 6, 2, 1, 3, 9.0, 3.0), [40, 50, 60, 0]);
        assert_eq!(nearest_sample(&src, 6, 2, 1, 3, -2.0, 0.0), [10, 20, 30, 0]);
    }

    #[test]
    fn test_render_stretch() {
        let source = RgbImage::from_fn(4, 2, |x, _| Rgb([x as u8 * 10, 0, 0]));
        let map = stretch_map(0, 8, 2, 2.0);
        let out = render_frame(&source, &map);
        assert_eq!(out.dimensions(), (8, 2));
        // x / 2 rounded half away from zero
        let reds: Vec<u8> = (0..8).map(|x| out.get_pixel(x, 0)[0]).collect();
        assert_eq!(reds, vec![0, 10, 10, 20, 20, 30, 30, 30]);
    }

    #[test]
    fn test_render_shot_picks_next_key_frame() {
        let frames: Vec<RgbImage> = (0..5)
            .map(|i| RgbImage::from_pixel(2, 1, Rgb([i as u8, 0, 0])))
            .collect();
        let maps = vec![stretch_map(0, 2, 1, 1.0), stretch_map(1, 4, 1, 2.0)];
        let rendered = render_shot(&frames, 0, &[1, 3], &maps).unwrap();

        let widths: Vec<u32> = rendered.iter().map(|f| f.width()).collect();
        assert_eq!(widths, vec![2, 2, 4, 4, 4]);
        assert_eq!(rendered[4].get_pixel(0, 0)[0], 4);
    }

    #[test]
    fn test_render_shot_offset_start() {
        let frames: Vec<RgbImage> = (0..6)
            .map(|i| RgbImage::from_pixel(2, 1, Rgb([i as u8, 0, 0])))
            .collect();
        let maps = vec![stretch_map(0, 2, 1, 1.0), stretch_map(1, 4, 1, 2.0)];
        let rendered = render_shot(&frames, 100, &[100, 105], &maps).unwrap();

        let widths: Vec<u32> = rendered.iter().map(|f| f.width()).collect();
        assert_eq!(widths, vec![2, 4, 4, 4, 4, 4]);
        assert_eq!(rendered[5].get_pixel(3, 0)[0], 5);
    }

    #[test]
    fn test_render_shot_needs_maps() {
        assert!(render_shot(&[], 0, &[], &[]).is_err());
    }
}
