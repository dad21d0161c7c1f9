//! retarget-mesh - content-aware retargeting of a shot of key frames
//!
//! Reads a key-frame manifest, deforms every frame to the configured scale
//! and writes the rendered frames (and optionally the deformation maps).
//! When the manifest lists the whole shot, every shot frame is rendered.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use retarget_mesh::config::Config;
use retarget_mesh::deformation::Deformation;
use retarget_mesh::io;

/// retarget-mesh - saliency-aware mesh deformation for video retargeting
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Key-frame manifest (JSON)
    #[arg(short, long)]
    manifest: PathBuf,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Output directory (overrides the config file)
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Horizontal scale (overrides the config file)
    #[arg(long)]
    scale_x: Option<f64>,

    /// Vertical scale (overrides the config file)
    #[arg(long)]
    scale_y: Option<f64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("retarget-mesh v{}", env!("CARGO_PKG_VERSION"));

    // Load or create configuration, CLI args as overrides
    let mut config = Config::load_or_create(&args.config)?;
    if let Some(dir) = args.out {
        config.output.directory = dir;
    }
    if let Some(sx) = args.scale_x {
        config.deformation.scale_x = sx;
    }
    if let Some(sy) = args.scale_y {
        config.deformation.scale_y = sy;
    }

    let frames = io::load_key_frames(&args.manifest)
        .with_context(|| format!("Failed to load key frames from {:?}", args.manifest))?;
    let ids: Vec<usize> = frames.iter().map(|f| f.frame_id).collect();

    let shot = io::load_shot_frames(&args.manifest)
        .with_context(|| format!("Failed to load shot frames from {:?}", args.manifest))?;

    let mut deformation = Deformation::new(frames, &config).context("Invalid key frames")?;
    let mut rendered = deformation.run().context("Deformation failed")?;
    let mut frame_ids = ids.clone();

    if let Some((start, shot_frames)) = shot {
        rendered = deformation
            .render_shot(start, &shot_frames)
            .context("Shot rendering failed")?;
        frame_ids = (start..start + rendered.len()).collect();
    }

    let out_dir = &config.output.directory;
    io::write_frames(out_dir, &frame_ids, &rendered)
        .with_context(|| format!("Failed to write frames to {:?}", out_dir))?;

    if config.output.write_maps {
        for (id, map) in ids.iter().zip(deformation.maps()) {
            let path = out_dir.join(format!("map_{:05}.json", id));
            io::write_map(&path, map)
                .with_context(|| format!("Failed to write deformation map {:?}", path))?;
        }
    }

    if let Some(last) = deformation.energy_log().last() {
        info!(
            "Final energy {:.3} (saliency {:.3}, spatial {:.3}, temporal {:.3})",
            last.total, last.saliency, last.spatial, last.temporal
        );
    }
    let (w, h) = deformation.output_size();
    info!("Done: {} frames at {}x{}", rendered.len(), w, h);

    Ok(())
}
