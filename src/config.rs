//! Configuration management for retarget-mesh

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How the temporal term takes part in the optimisation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TemporalMode {
    /// Temporal links contribute to the linear system
    #[default]
    Solve,
    /// Temporal energy is reported but not minimised
    MeasureOnly,
}

/// Pixel connectivity used when following an edge run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Four,
    #[default]
    Eight,
}

impl Connectivity {
    pub fn offsets(self) -> &'static [(i64, i64)] {
        match self {
            Connectivity::Four => &[(1, 0), (-1, 0), (0, 1), (0, -1)],
            Connectivity::Eight => &[
                (1, 0),
                (-1, 0),
                (0, 1),
                (0, -1),
                (1, 1),
                (1, -1),
                (-1, 1),
                (-1, -1),
            ],
        }
    }
}

/// Energy weights and iteration control
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeformationConfig {
    /// Horizontal output scale (output width = ceil(width * scale_x))
    pub scale_x: f64,
    /// Vertical output scale
    pub scale_y: f64,
    /// Number of solve/project/commit rounds
    pub iterations: usize,
    pub alpha_saliency: f64,
    pub alpha_spatial: f64,
    pub alpha_temporal: f64,
    #[serde(default)]
    pub temporal_mode: TemporalMode,
    /// Damping used when the normal equations are not positive definite
    #[serde(default = "default_damping")]
    pub damping: f64,
}

fn default_damping() -> f64 { 1e-6 }

impl Default for DeformationConfig {
    fn default() -> Self {
        Self {
            scale_x: 1.5,
            scale_y: 1.0,
            iterations: 10,
            alpha_saliency: 1.0,
            alpha_spatial: 50.0,
            alpha_temporal: 1.0,
            temporal_mode: TemporalMode::default(),
            damping: default_damping(),
        }
    }
}

/// Mesh construction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Interior superpixels further apart than
    /// `factor * sqrt(frame_area / superpixel_count)` get no bound point
    pub bound_density_factor: f64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            bound_density_factor: 1.8,
        }
    }
}

/// Edge detection settings for spatial groups
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub canny_low: f32,
    pub canny_high: f32,
    #[serde(default)]
    pub connectivity: Connectivity,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            canny_low: 70.0,
            canny_high: 140.0,
            connectivity: Connectivity::default(),
        }
    }
}

/// Where rendered frames go
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub directory: PathBuf,
    /// Also write each deformation map as JSON
    #[serde(default)]
    pub write_maps: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("output"),
            write_maps: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub deformation: DeformationConfig,

    #[serde(default)]
    pub mesh: MeshConfig,

    #[serde(default)]
    pub edges: EdgeConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }
}
