//! Deformation pipeline over one shot of key frames
//!
//! `init_deformation` builds the mesh, the spatial groups and the temporal
//! links, then rescales every point into the output space.
//! `minimize_energy` runs the solver, `calc_deformed_map` builds the dense
//! per-frame maps and `render_key_frames` samples the key frames through them.

use image::RgbImage;
use rayon::prelude::*;
use tracing::info;

use crate::config::{Config, DeformationConfig, EdgeConfig, MeshConfig};
use crate::diagnostics::Diagnostics;
use crate::energy::{evaluate, EnergyReport};
use crate::error::{Result, RetargetError};
use crate::keyframe::KeyFrame;
use crate::mesh::{Mesh, MeshBuilder};
use crate::render::{render_frame, render_shot};
use crate::resample::{build_map, DeformationMap};
use crate::solver::Solver;
use crate::spatial::{extract_spatial_groups, SpatialGroup};
use crate::temporal::link_frames;

/// Deformed size of a `width x height` frame
pub fn deformed_size(width: u32, height: u32, scale_x: f64, scale_y: f64) -> (u32, u32) {
    let w = (width as f64 * scale_x).ceil().max(1.0) as u32;
    let h = (height as f64 * scale_y).ceil().max(1.0) as u32;
    (w, h)
}

pub struct Deformation {
    frames: Vec<KeyFrame>,
    deformation: DeformationConfig,
    mesh_config: MeshConfig,
    edges: EdgeConfig,
    out_width: u32,
    out_height: u32,
    mesh: Option<Mesh>,
    groups: Vec<SpatialGroup>,
    linked: Vec<usize>,
    energy_log: Vec<EnergyReport>,
    maps: Vec<DeformationMap>,
    diagnostics: Diagnostics,
}

impl Deformation {
    /// Validate the key frames and the requested scale
    pub fn new(frames: Vec<KeyFrame>, config: &Config) -> Result<Self> {
        let first = frames.first().ok_or(RetargetError::EmptySequence)?;
        let (width, height) = (first.width(), first.height());

        let (sx, sy) = (config.deformation.scale_x, config.deformation.scale_y);
        if !(sx.is_finite() && sy.is_finite() && sx > 0.0 && sy > 0.0) {
            return Err(RetargetError::InvalidScale {
                scale_x: sx,
                scale_y: sy,
            });
        }

        for (i, frame) in frames.iter().enumerate() {
            if frame.width() != width || frame.height() != height {
                return Err(RetargetError::FrameSizeMismatch {
                    frame: i,
                    width: frame.width(),
                    height: frame.height(),
                    expected_width: width,
                    expected_height: height,
                });
            }
            frame.validate(i)?;
        }

        let (out_width, out_height) = deformed_size(width, height, sx, sy);
        info!(
            "Retargeting {} key frames from {}x{} to {}x{}",
            frames.len(),
            width,
            height,
            out_width,
            out_height
        );

        Ok(Self {
            frames,
            deformation: config.deformation.clone(),
            mesh_config: config.mesh.clone(),
            edges: config.edges.clone(),
            out_width,
            out_height,
            mesh: None,
            groups: Vec::new(),
            linked: Vec::new(),
            energy_log: Vec::new(),
            maps: Vec::new(),
            diagnostics: Diagnostics::default(),
        })
    }

    pub fn output_size(&self) -> (u32, u32) {
        (self.out_width, self.out_height)
    }

    pub fn frames(&self) -> &[KeyFrame] {
        &self.frames
    }

    pub fn mesh(&self) -> Option<&Mesh> {
        self.mesh.as_ref()
    }

    pub fn spatial_groups(&self) -> &[SpatialGroup] {
        &self.groups
    }

    /// Indices of the points carrying a temporal target
    pub fn temporal_links(&self) -> &[usize] {
        &self.linked
    }

    pub fn energy_log(&self) -> &[EnergyReport] {
        &self.energy_log
    }

    pub fn maps(&self) -> &[DeformationMap] {
        &self.maps
    }

    /// Accumulated counters of every stage run so far
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Build the mesh, spatial groups and temporal links; place every point
    /// at its uniformly scaled position
    pub fn init_deformation(&mut self) {
        let (sx, sy) = (self.deformation.scale_x, self.deformation.scale_y);

        let mut diagnostics = Diagnostics::default();
        let mut mesh = MeshBuilder::new(&self.mesh_config).build(&self.frames, &mut diagnostics);
        diagnostics.report("Mesh");
        self.diagnostics.merge(&diagnostics);

        self.groups = extract_spatial_groups(&mesh, &self.frames, &self.edges);

        let mut diagnostics = Diagnostics::default();
        self.linked = link_frames(&mut mesh, &self.frames, sx, sy, &mut diagnostics);
        diagnostics.report("Temporal links");
        self.diagnostics.merge(&diagnostics);

        mesh.rescale(sx, sy, self.out_width, self.out_height);
        self.mesh = Some(mesh);
        self.energy_log.clear();
        self.maps.clear();
    }

    /// Energy of the current positions
    pub fn calc_energy(&self) -> Result<EnergyReport> {
        let mesh = self.mesh.as_ref().ok_or(RetargetError::NotInitialized)?;
        Ok(evaluate(&mesh.points, &self.groups, &self.linked, &self.deformation))
    }

    /// Run all solver iterations. Returns the energy before and after each one.
    pub fn minimize_energy(&mut self) -> Result<&[EnergyReport]> {
        let mesh = self.mesh.as_mut().ok_or(RetargetError::NotInitialized)?;

        let mut diagnostics = Diagnostics::default();
        let solver = Solver::new(&self.deformation, self.out_width, self.out_height);
        self.energy_log = solver.minimize(mesh, &self.groups, &self.linked, &mut diagnostics);
        diagnostics.report("Solver");
        self.diagnostics.merge(&diagnostics);

        Ok(&self.energy_log)
    }

    /// Build the dense map of every key frame
    pub fn calc_deformed_map(&mut self) -> Result<&[DeformationMap]> {
        let mesh = self.mesh.as_ref().ok_or(RetargetError::NotInitialized)?;
        let (w, h) = (self.out_width, self.out_height);
        let (sx, sy) = (self.deformation.scale_x, self.deformation.scale_y);

        let results: Vec<(DeformationMap, Diagnostics)> = (0..mesh.frame_count())
            .into_par_iter()
            .map(|frame| build_map(mesh, frame, w, h, sx, sy))
            .collect();

        let mut diagnostics = Diagnostics::default();
        self.maps = results
            .into_iter()
            .map(|(map, local)| {
                diagnostics.merge(&local);
                map
            })
            .collect();
        diagnostics.report("Resample");
        self.diagnostics.merge(&diagnostics);

        info!("Built {} deformation maps", self.maps.len());
        Ok(&self.maps)
    }

    /// Sample every key frame through its map
    pub fn render_key_frames(&self) -> Result<Vec<RgbImage>> {
        if self.maps.len() != self.frames.len() {
            return Err(RetargetError::NotInitialized);
        }
        Ok(self
            .frames
            .par_iter()
            .zip(self.maps.par_iter())
            .map(|(frame, map)| render_frame(&frame.image, map))
            .collect())
    }

    /// Render the full frame sequence of the shot, `frames[i]` being video
    /// frame `shot_start + i`
    pub fn render_shot(&self, shot_start: usize, frames: &[RgbImage]) -> Result<Vec<RgbImage>> {
        let ids: Vec<usize> = self.frames.iter().map(|f| f.frame_id).collect();
        render_shot(frames, shot_start, &ids, &self.maps)
    }

    /// Every stage in order; returns the rendered key frames
    pub fn run(&mut self) -> Result<Vec<RgbImage>> {
        self.init_deformation();
        self.minimize_energy()?;
        self.calc_deformed_map()?;
        self.render_key_frames()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_point::AnchorKind;
    use crate::geometry::Point;
    use crate::keyframe::fixtures::{single_superpixel, two_halves};
    use crate::keyframe::FlowField;

    fn config(sx: f64, sy: f64) -> Config {
        let mut config = Config::default();
        config.deformation.scale_x = sx;
        config.deformation.scale_y = sy;
        config
    }

    #[test]
    fn test_deformed_size_rounds_up() {
        assert_eq!(deformed_size(4, 4, 2.0, 1.0), (8, 4));
        assert_eq!(deformed_size(5, 3, 1.5, 0.5), (8, 2));
    }

    #[test]
    fn test_single_superpixel_stretch() {
        // centroid of a 4x4 frame
        let frames = vec![single_superpixel(4, 4, Point::new(1.5, 1.5), Point::default())];
        let mut deformation = Deformation::new(frames, &config(2.0, 1.0)).unwrap();
        assert_eq!(deformation.output_size(), (8, 4));

        let rendered = deformation.run().unwrap();
        let mesh = deformation.mesh().unwrap();

        assert!(mesh.points[0].pos.approx_eq(Point::new(3.0, 1.5), 1e-9));
        let corners: Vec<Point> = mesh
            .points
            .iter()
            .filter(|p| p.anchor == AnchorKind::Static)
            .map(|p| p.pos)
            .collect();
        assert_eq!(
            corners,
            vec![
                Point::new(0.0, 0.0),
                Point::new(6.0, 0.0),
                Point::new(0.0, 3.0),
                Point::new(6.0, 3.0)
            ]
        );

        let map = &deformation.maps()[0];
        for y in 0..4 {
            for x in 0..8 {
                let src = map.get(x, y);
                assert!((src.x - x as f64 / 2.0).abs() <= 0.5 + 1e-9);
                assert!((src.y - y as f64).abs() <= 1e-9);
            }
        }
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].dimensions(), (8, 4));
        // last output column lies past the scaled corners
        assert_eq!(deformation.diagnostics().unresolved_pixels, 4);
    }

    #[test]
    fn test_consistent_flow_has_no_temporal_energy() {
        let first = single_superpixel(4, 4, Point::new(2.0, 2.0), Point::new(1.0, 0.0));
        let frames = vec![first, single_superpixel(4, 4, Point::new(2.0, 2.0), Point::default())];
        let mut deformation = Deformation::new(frames, &config(1.0, 1.0)).unwrap();
        deformation.init_deformation();

        assert_eq!(deformation.temporal_links(), &[0]);
        // (3,2) reconstructed in frame 1 equals (2,2) + flow
        assert!(deformation.calc_energy().unwrap().temporal < 1e-12);
    }

    #[test]
    fn test_two_frame_energy_decreases() {
        let frames = vec![two_halves(8, 4), two_halves(8, 4)];
        let mut deformation = Deformation::new(frames, &config(2.0, 1.0)).unwrap();
        deformation.init_deformation();
        let log = deformation.minimize_energy().unwrap().to_vec();

        assert_eq!(log.len(), 11);
        assert!((log[0].total - 36.0).abs() < 1e-9);
        let last = log[log.len() - 1];
        assert!((last.total - 2.0 * 49.0 / 3.0).abs() < 1e-6);
        assert!(last.temporal < 1e-12);

        deformation.calc_deformed_map().unwrap();
        let rendered = deformation.render_key_frames().unwrap();
        assert_eq!(rendered.len(), 2);
        assert!(rendered.iter().all(|f| f.dimensions() == (16, 4)));
    }

    #[test]
    fn test_render_shot_from_offset_key_frames() {
        let mut first = two_halves(8, 4);
        first.frame_id = 100;
        let mut second = single_superpixel(8, 4, Point::new(3.5, 1.5), Point::default());
        second.frame_id = 103;
        let mut deformation = Deformation::new(vec![first, second], &config(2.0, 1.0)).unwrap();
        deformation.run().unwrap();

        let shot: Vec<RgbImage> = (0..5).map(|i| RgbImage::from_pixel(8, 4, image::Rgb([i, 0, 0]))).collect();
        let rendered = deformation.render_shot(100, &shot).unwrap();
        assert_eq!(rendered.len(), 5);
        assert!(rendered.iter().all(|f| f.dimensions() == (16, 4)));
        assert_eq!(rendered[4].get_pixel(15, 3)[0], 4);

        // frames 101..104 take the second key frame's map
        let maps = deformation.maps();
        assert_ne!(maps[0].coords, maps[1].coords);
        for (i, frame) in rendered.iter().enumerate() {
            let map = if i == 0 { &maps[0] } else { &maps[1] };
            assert_eq!(frame, &render_frame(&shot[i], map));
        }
    }

    #[test]
    fn test_stages_need_init() {
        let frames = vec![two_halves(8, 4)];
        let mut deformation = Deformation::new(frames, &config(2.0, 1.0)).unwrap();
        assert!(matches!(deformation.calc_energy(), Err(RetargetError::NotInitialized)));
        assert!(matches!(deformation.minimize_energy(), Err(RetargetError::NotInitialized)));
        assert!(matches!(deformation.render_key_frames(), Err(RetargetError::NotInitialized)));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            Deformation::new(Vec::new(), &Config::default()),
            Err(RetargetError::EmptySequence)
        ));
        assert!(matches!(
            Deformation::new(vec![two_halves(8, 4)], &config(0.0, 1.0)),
            Err(RetargetError::InvalidScale { .. })
        ));
        assert!(matches!(
            Deformation::new(vec![two_halves(8, 4), two_halves(6, 4)], &Config::default()),
            Err(RetargetError::FrameSizeMismatch { frame: 1, .. })
        ));

        let mut truncated = two_halves(8, 4);
        truncated.flow = FlowField::new(8, 4, vec![Point::default(); 3]);
        assert!(matches!(
            Deformation::new(vec![two_halves(8, 4), truncated], &Config::default()),
            Err(RetargetError::InvalidKeyFrame { frame: 1, .. })
        ));
    }
}
