//! Shared fixtures for the integration tests.
//!
//! Raster sources here render windows of one deterministic noise image,
//! so layers and tiles built over the same world share exact pixel
//! values wherever their bounds overlap.

#![allow(dead_code)]

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sandhi_align::{
    Feature, LayerPatch, Point, Point2D, PointMatch, Raster, RasterSource, Rect, Result,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic white-noise world sampled by nearest neighbour.
///
/// `offset` displaces the content: a pixel at world position `w` reads
/// the base image at `w - offset`, so two worlds sharing a base with
/// different offsets show the same content shifted against each other.
pub struct NoiseWorld {
    width: usize,
    height: usize,
    base: Arc<Vec<f32>>,
    offset: Point2D,
}

impl NoiseWorld {
    pub fn new(width: usize, height: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let base = (0..width * height)
            .map(|_| rng.random_range(0.0..1.0))
            .collect();
        Self {
            width,
            height,
            base: Arc::new(base),
            offset: Point2D::ZERO,
        }
    }

    /// Same base image, content displaced by `(dx, dy)`.
    pub fn with_offset(&self, dx: f32, dy: f32) -> Self {
        Self {
            width: self.width,
            height: self.height,
            base: Arc::clone(&self.base),
            offset: Point2D::new(dx, dy),
        }
    }

    fn sample(&self, x: f32, y: f32) -> f32 {
        let x = ((x - self.offset.x).round() as isize).clamp(0, self.width as isize - 1) as usize;
        let y = ((y - self.offset.y).round() as isize).clamp(0, self.height as isize - 1) as usize;
        self.base[y * self.width + x]
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
                let v = self.sample(
                    bounds.min.x + x as f32 * inv,
                    bounds.min.y + y as f32 * inv,
                );
                raster.set(x, y, v);
            }
        }
        Ok(raster)
    }
}

/// Renders zeros only; no feature or block can ever come out of it.
pub struct BlankSource;

impl RasterSource for BlankSource {
    fn render(&self, bounds: Rect, scale: f32) -> Result<Raster> {
        let w = (bounds.width() * scale).ceil().max(1.0) as usize;
        let h = (bounds.height() * scale).ceil().max(1.0) as usize;
        Ok(Raster::new(w, h))
    }
}

pub fn patch(id: u64, source: Arc<dyn RasterSource>, bounds: Rect) -> LayerPatch {
    LayerPatch { id, bounds, source }
}

pub fn blank_patch(id: u64, bounds: Rect) -> LayerPatch {
    patch(id, Arc::new(BlankSource), bounds)
}

pub const DESCRIPTOR_LEN: usize = 32;

/// Features at random positions with random, mutually distant
/// descriptors. A translated copy pairs up under the ratio test with
/// descriptor distance zero.
pub fn synthetic_features(n: usize, seed: u64, span: f32) -> Vec<Feature> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| Feature {
            location: Point2D::new(
                rng.random_range(0.0..span),
                rng.random_range(0.0..span),
            ),
            scale: 1.6,
            orientation: 0.0,
            descriptor: (0..DESCRIPTOR_LEN)
                .map(|_| rng.random_range(0.0..1.0))
                .collect(),
        })
        .collect()
}

pub fn translated_features(features: &[Feature], dx: f32, dy: f32) -> Vec<Feature> {
    features
        .iter()
        .map(|f| {
            let mut g = f.clone();
            g.location = g.location + Point2D::new(dx, dy);
            g
        })
        .collect()
}

/// Correspondences with `p1` at the given positions and `p2` shifted by
/// `-shift`, the way two tiles `shift` apart see the same world point
/// in their local frames.
pub fn shifted_matches(points: &[(f32, f32)], shift: (f32, f32)) -> Vec<PointMatch> {
    points
        .iter()
        .map(|&(x, y)| {
            PointMatch::new(
                Point::new(Point2D::new(x, y)),
                Point::new(Point2D::new(x - shift.0, y - shift.1)),
            )
        })
        .collect()
}
