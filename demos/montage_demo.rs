//! Montage a 2x2 grid of overlapping noise tiles.
//!
//! Four tiles render windows of one shared noise world, the top-left
//! tile is pinned, and the run reports how close every solved tile
//! origin lands to its true position.
//!
//! Usage:
//!   cargo run --release --example montage_demo

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sandhi_align::{
    align_tiles, AlignContext, FeatureStore, LayerPatch, MontageConfig, OptimizeConfig, Point2D,
    Raster, RasterSource, Rect, Result,
};

/// Deterministic noise image; tiles sample it by nearest neighbour.
struct NoiseWorld {
    width: usize,
    height: usize,
    pixels: Vec<f32>,
}

impl NoiseWorld {
    fn new(width: usize, height: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let pixels = (0..width * height)
            .map(|_| rng.random_range(0.0..1.0))
            .collect();
        Self {
            width,
            height,
            pixels,
        }
    }
}

impl RasterSource for NoiseWorld {
    fn render(&self, bounds: Rect, scale: f32) -> Result<Raster> {
        let w = (bounds.width() * scale).ceil().max(1.0) as usize;
        let h = (bounds.height() * scale).ceil().max(1.0) as usize;
        let inv = 1.0 / scale;
        let mut raster = Raster::new(w, h);
        for y in 0..h {
            for x in 0..w {
                let wx = ((bounds.min.x + x as f32 * inv).round() as isize)
                    .clamp(0, self.width as isize - 1) as usize;
                let wy = ((bounds.min.y + y as f32 * inv).round() as isize)
                    .clamp(0, self.height as isize - 1) as usize;
                raster.set(x, y, self.pixels[wy * self.width + wx]);
            }
        }
        Ok(raster)
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let world = Arc::new(NoiseWorld::new(400, 400, 17));
    let origins = [(0.0f32, 0.0f32), (160.0, 0.0), (0.0, 160.0), (160.0, 160.0)];
    let patches: Vec<LayerPatch> = origins
        .iter()
        .enumerate()
        .map(|(i, &(x, y))| LayerPatch {
            id: i as u64 + 1,
            bounds: Rect::new(Point2D::new(x, y), Point2D::new(x + 240.0, y + 240.0)),
            source: Arc::clone(&world) as Arc<dyn RasterSource>,
        })
        .collect();

    let config = MontageConfig {
        optimize: OptimizeConfig {
            max_epsilon: 0.5,
            ..OptimizeConfig::default()
        },
        ..MontageConfig::default()
    };

    let context = AlignContext::new(FeatureStore::new(None));
    let summary = align_tiles(&context, &patches, &[1], &config).expect("montage failed");

    println!(
        "Matched {} of {} tile pairs, features {} computed / {} cached",
        summary.pairs_connected,
        summary.pairs_examined,
        summary.features_computed,
        summary.features_cached
    );
    println!(
        "Relaxation: {} iterations, {:.3} px -> {:.3} px ({:?})",
        summary.optimize.iterations,
        summary.optimize.initial_error,
        summary.optimize.error,
        summary.optimize.termination
    );
    for (tile, &(x, y)) in summary.tiles.iter().zip(&origins) {
        let solved = tile.model().apply(Point2D::ZERO);
        println!(
            "Tile {}: solved origin ({:8.3}, {:8.3}), truth ({:5.1}, {:5.1}), off by {:.3} px",
            tile.id(),
            solved.x,
            solved.y,
            x,
            y,
            solved.distance(&Point2D::new(x, y))
        );
    }
    context.shutdown();
}
