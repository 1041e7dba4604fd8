//! Multi-scale blob features with gradient-histogram descriptors.
//!
//! Purpose
//! - Produce scale- and rotation-invariant landmarks on rendered patches
//!   so overlapping tiles can be matched without an initial guess.
//!
//! Algorithm
//! - Normalize the raster to [0,1], then build a Gaussian scale space with
//!   `steps_per_octave` intervals per octave. Octaves larger than
//!   `max_octave_size` are skipped by pre-decimation, octaves below
//!   `min_octave_size` are never built.
//! - Candidates are 26-neighborhood extrema of the difference-of-Gaussian
//!   stack, filtered by contrast and by the principal-curvature ratio of
//!   the local 2x2 Hessian, then refined to subpixel position.
//! - Each candidate gets one orientation per dominant peak of a smoothed
//!   36-bin gradient histogram, and a `descriptor_size^2 *
//!   descriptor_bins` gradient descriptor sampled in the rotated frame.
//!
//! Coordinates of returned features are in the raster's own pixel frame,
//! regardless of which octave detected them.

use serde::{Deserialize, Serialize};

use crate::core::math::Fnv1a;
use crate::core::{Point2D, Raster};
use crate::error::{Error, Result};
use crate::progress::Progress;

/// Scale-space and descriptor parameters.
///
/// Two configurations describe the same feature universe exactly when all
/// fields compare equal; [`FeatureConfig::fingerprint`] folds that
/// equality into a stable key for the on-disk store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Blur of the first scale-space level, in pixels.
    pub initial_sigma: f32,
    /// Scale intervals per octave.
    pub steps_per_octave: usize,
    /// Smallest octave side that is still processed.
    pub min_octave_size: usize,
    /// Largest octave side; bigger inputs are pre-decimated.
    pub max_octave_size: usize,
    /// Descriptor grid cells per side.
    pub descriptor_size: usize,
    /// Orientation bins per descriptor cell.
    pub descriptor_bins: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            initial_sigma: 1.6,
            steps_per_octave: 3,
            min_octave_size: 64,
            max_octave_size: 600,
            descriptor_size: 8,
            descriptor_bins: 8,
        }
    }
}

impl FeatureConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_sigma <= 0.0 {
            return Err(Error::InvalidConfiguration(
                "initial_sigma must be positive".into(),
            ));
        }
        if self.steps_per_octave == 0 {
            return Err(Error::InvalidConfiguration(
                "steps_per_octave must be at least 1".into(),
            ));
        }
        if self.min_octave_size < 8 || self.max_octave_size < self.min_octave_size {
            return Err(Error::InvalidConfiguration(
                "octave size range is empty or too small".into(),
            ));
        }
        if self.descriptor_size == 0 || self.descriptor_bins == 0 {
            return Err(Error::InvalidConfiguration(
                "descriptor dimensions must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Stable 64-bit key over all fields. Equal configurations always map
    /// to equal fingerprints, across processes and platforms.
    pub fn fingerprint(&self) -> u64 {
        let mut h = Fnv1a::new();
        h.write_u32(self.initial_sigma.to_bits());
        h.write_u64(self.steps_per_octave as u64);
        h.write_u64(self.min_octave_size as u64);
        h.write_u64(self.max_octave_size as u64);
        h.write_u64(self.descriptor_size as u64);
        h.write_u64(self.descriptor_bins as u64);
        h.finish()
    }

    #[inline]
    pub fn descriptor_len(&self) -> usize {
        self.descriptor_size * self.descriptor_size * self.descriptor_bins
    }
}

/// One detected landmark.
#[derive(Clone, Debug, PartialEq)]
pub struct Feature {
    /// Position in the source raster's pixel frame.
    pub location: Point2D,
    /// Detection blur in source pixels.
    pub scale: f32,
    /// Dominant gradient direction, radians.
    pub orientation: f32,
    pub descriptor: Vec<f32>,
}

impl Feature {
    /// Squared Euclidean distance between descriptors.
    pub fn descriptor_distance_sq(&self, other: &Feature) -> f32 {
        debug_assert_eq!(self.descriptor.len(), other.descriptor.len());
        self.descriptor
            .iter()
            .zip(other.descriptor.iter())
            .map(|(a, b)| {
                let d = a - b;
                d * d
            })
            .sum()
    }
}

const CONTRAST_THRESHOLD: f32 = 0.015;
const EDGE_RATIO: f32 = 10.0;
const ORIENTATION_BINS: usize = 36;
const ORIENTATION_PEAK_RATIO: f32 = 0.8;

/// Extract features from a raster.
///
/// A blank raster (uniform or empty) yields an empty list, never an
/// error. Checks for cancellation once per octave.
pub fn extract(raster: &Raster, config: &FeatureConfig, progress: &Progress) -> Result<Vec<Feature>> {
    config.validate()?;
    if raster.is_empty() {
        return Ok(Vec::new());
    }
    let Some(mut image) = Image::normalized(raster) else {
        // Uniform input carries no structure.
        return Ok(Vec::new());
    };

    // Pre-decimate until the first octave fits the budget.
    let mut octave_scale = 1.0f32;
    while image.width.max(image.height) > config.max_octave_size {
        progress.checkpoint()?;
        image = image.blurred(0.5).decimated();
        octave_scale *= 2.0;
    }

    // Lift the assumed input blur (0.5) up to initial_sigma.
    let base = (config.initial_sigma * config.initial_sigma - 0.25).max(0.0).sqrt();
    if base > 0.0 {
        image = image.blurred(base);
    }

    let steps = config.steps_per_octave;
    let k = 2.0f32.powf(1.0 / steps as f32);
    let mut features = Vec::new();

    while image.width.min(image.height) >= config.min_octave_size {
        progress.checkpoint()?;

        // Gaussian stack: steps + 3 levels, sigma_i = initial * k^i.
        let mut gaussians = Vec::with_capacity(steps + 3);
        gaussians.push(image.clone());
        let mut sigma = config.initial_sigma;
        for _ in 1..steps + 3 {
            let next_sigma = sigma * k;
            let incremental = (next_sigma * next_sigma - sigma * sigma).sqrt();
            let blurred = gaussians
                .last()
                .map(|g| g.blurred(incremental))
                .unwrap_or_else(|| image.clone());
            gaussians.push(blurred);
            sigma = next_sigma;
        }
        let dogs: Vec<Image> = gaussians
            .windows(2)
            .map(|pair| pair[1].difference(&pair[0]))
            .collect();

        for si in 1..=steps {
            let sigma_rel = config.initial_sigma * k.powi(si as i32);
            detect_level(
                &dogs[si - 1..=si + 1],
                &gaussians[si],
                sigma_rel,
                octave_scale,
                raster,
                config,
                &mut features,
            );
        }

        // Next octave starts from the level at twice the base blur.
        image = gaussians[steps].decimated();
        octave_scale *= 2.0;
    }

    log::debug!(
        "Extracted {} features from {}x{} raster",
        features.len(),
        raster.width,
        raster.height
    );
    Ok(features)
}

/// Scan one DoG level (`dogs[1]`) for extrema against its two neighbors.
fn detect_level(
    dogs: &[Image],
    gaussian: &Image,
    sigma_rel: f32,
    octave_scale: f32,
    raster: &Raster,
    config: &FeatureConfig,
    features: &mut Vec<Feature>,
) {
    let level = &dogs[1];
    let w = level.width;
    let h = level.height;
    if w < 3 || h < 3 {
        return;
    }
    let border = (2.0 * sigma_rel).ceil() as usize + 1;
    if 2 * border + 1 >= w || 2 * border + 1 >= h {
        return;
    }

    for y in border..h - border {
        for x in border..w - border {
            let v = level.get(x, y);
            if v.abs() < CONTRAST_THRESHOLD {
                continue;
            }
            if !is_extremum(dogs, x, y, v) {
                continue;
            }

            // Principal-curvature ratio rejects edge responses.
            let dxx = level.get(x + 1, y) + level.get(x - 1, y) - 2.0 * v;
            let dyy = level.get(x, y + 1) + level.get(x, y - 1) - 2.0 * v;
            let dxy = 0.25
                * (level.get(x + 1, y + 1) + level.get(x - 1, y - 1)
                    - level.get(x + 1, y - 1)
                    - level.get(x - 1, y + 1));
            let trace = dxx + dyy;
            let det = dxx * dyy - dxy * dxy;
            let limit = (EDGE_RATIO + 1.0) * (EDGE_RATIO + 1.0) / EDGE_RATIO;
            if det <= 0.0 || trace * trace / det >= limit {
                continue;
            }

            // Subpixel refinement by one Newton step in x and y.
            let gx = 0.5 * (level.get(x + 1, y) - level.get(x - 1, y));
            let gy = 0.5 * (level.get(x, y + 1) - level.get(x, y - 1));
            let (mut ox, mut oy) = (0.0f32, 0.0f32);
            if det.abs() > 1e-12 {
                ox = -(dyy * gx - dxy * gy) / det;
                oy = -(-dxy * gx + dxx * gy) / det;
            }
            if ox.abs() > 1.5 || oy.abs() > 1.5 {
                continue;
            }
            let refined = v + 0.5 * (gx * ox + gy * oy);
            if refined.abs() < CONTRAST_THRESHOLD {
                continue;
            }

            let fx = (x as f32 + ox + 0.5) * octave_scale - 0.5;
            let fy = (y as f32 + oy + 0.5) * octave_scale - 0.5;
            if raster.mask_at(fx.round().max(0.0) as usize, fy.round().max(0.0) as usize) <= 0.0 {
                continue;
            }

            for orientation in orientations(gaussian, x, y, sigma_rel) {
                let descriptor =
                    sample_descriptor(gaussian, x as f32 + ox, y as f32 + oy, sigma_rel, orientation, config);
                features.push(Feature {
                    location: Point2D::new(fx, fy),
                    scale: sigma_rel * octave_scale,
                    orientation,
                    descriptor,
                });
            }
        }
    }
}

fn is_extremum(dogs: &[Image], x: usize, y: usize, v: f32) -> bool {
    let sign = v > 0.0;
    for (li, level) in dogs.iter().enumerate() {
        for dy in -1i32..=1 {
            for dx in -1i32..=1 {
                if li == 1 && dx == 0 && dy == 0 {
                    continue;
                }
                let n = level.get((x as i32 + dx) as usize, (y as i32 + dy) as usize);
                if sign && n >= v {
                    return false;
                }
                if !sign && n <= v {
                    return false;
                }
            }
        }
    }
    true
}

/// Dominant gradient directions around a point: every smoothed-histogram
/// peak within 80% of the maximum, with parabolic bin refinement.
fn orientations(gaussian: &Image, x: usize, y: usize, sigma_rel: f32) -> Vec<f32> {
    let radius = (3.0 * sigma_rel).ceil() as i32;
    let weight_sigma = 1.5 * sigma_rel;
    let mut hist = [0.0f32; ORIENTATION_BINS];

    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let px = x as i32 + dx;
            let py = y as i32 + dy;
            if px < 1 || py < 1 || px as usize >= gaussian.width - 1 || py as usize >= gaussian.height - 1
            {
                continue;
            }
            let (mag, angle) = gaussian.gradient(px as usize, py as usize);
            let r2 = (dx * dx + dy * dy) as f32;
            let weight = (-r2 / (2.0 * weight_sigma * weight_sigma)).exp();
            let bin = ((angle + std::f32::consts::PI) / std::f32::consts::TAU
                * ORIENTATION_BINS as f32)
                .rem_euclid(ORIENTATION_BINS as f32) as usize
                % ORIENTATION_BINS;
            hist[bin] += mag * weight;
        }
    }

    // Circular box smoothing, two passes.
    for _ in 0..2 {
        let prev = hist;
        for i in 0..ORIENTATION_BINS {
            let l = prev[(i + ORIENTATION_BINS - 1) % ORIENTATION_BINS];
            let r = prev[(i + 1) % ORIENTATION_BINS];
            hist[i] = (l + prev[i] + r) / 3.0;
        }
    }

    let max = hist.iter().cloned().fold(0.0f32, f32::max);
    if max <= 0.0 {
        return vec![0.0];
    }
    let mut out = Vec::new();
    for i in 0..ORIENTATION_BINS {
        let l = hist[(i + ORIENTATION_BINS - 1) % ORIENTATION_BINS];
        let r = hist[(i + 1) % ORIENTATION_BINS];
        if hist[i] >= ORIENTATION_PEAK_RATIO * max && hist[i] > l && hist[i] > r {
            let denom = l - 2.0 * hist[i] + r;
            let offset = if denom.abs() > 1e-12 {
                0.5 * (l - r) / denom
            } else {
                0.0
            };
            let angle = (i as f32 + offset + 0.5) / ORIENTATION_BINS as f32 * std::f32::consts::TAU
                - std::f32::consts::PI;
            out.push(angle);
        }
    }
    if out.is_empty() {
        out.push(0.0);
    }
    out
}

/// Gradient descriptor in the frame rotated by `-orientation`.
fn sample_descriptor(
    gaussian: &Image,
    cx: f32,
    cy: f32,
    sigma_rel: f32,
    orientation: f32,
    config: &FeatureConfig,
) -> Vec<f32> {
    let d = config.descriptor_size;
    let bins = config.descriptor_bins;
    let cell = 2.0 * sigma_rel;
    let half = cell * d as f32 * 0.5;
    let radius = (half * std::f32::consts::SQRT_2).ceil() as i32;
    let (sin, cos) = (-orientation).sin_cos();
    let mut desc = vec![0.0f32; d * d * bins];

    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let px = cx.round() as i32 + dx;
            let py = cy.round() as i32 + dy;
            if px < 1 || py < 1 || px as usize >= gaussian.width - 1 || py as usize >= gaussian.height - 1
            {
                continue;
            }
            // Offset in the rotated descriptor frame.
            let rx = cos * dx as f32 - sin * dy as f32;
            let ry = sin * dx as f32 + cos * dy as f32;
            let col = rx / cell + d as f32 * 0.5 - 0.5;
            let row = ry / cell + d as f32 * 0.5 - 0.5;
            if col <= -1.0 || col >= d as f32 || row <= -1.0 || row >= d as f32 {
                continue;
            }

            let (mag, angle) = gaussian.gradient(px as usize, py as usize);
            let rel = (angle - orientation + std::f32::consts::PI).rem_euclid(std::f32::consts::TAU);
            let ob = rel / std::f32::consts::TAU * bins as f32;
            let weight = mag * (-(rx * rx + ry * ry) / (2.0 * half * half)).exp();

            // Bilinear in (row, col), linear in orientation.
            let r0 = row.floor();
            let c0 = col.floor();
            let o0 = ob.floor();
            for (ri, rw) in [(r0, 1.0 - (row - r0)), (r0 + 1.0, row - r0)] {
                if ri < 0.0 || ri >= d as f32 {
                    continue;
                }
                for (ci, cw) in [(c0, 1.0 - (col - c0)), (c0 + 1.0, col - c0)] {
                    if ci < 0.0 || ci >= d as f32 {
                        continue;
                    }
                    for (oi, ow) in [(o0, 1.0 - (ob - o0)), (o0 + 1.0, ob - o0)] {
                        let slot = (ri as usize * d + ci as usize) * bins
                            + (oi as usize % bins);
                        desc[slot] += weight * rw * cw * ow;
                    }
                }
            }
        }
    }

    // L2 normalize, clamp, renormalize. Clamping tames gradient spikes
    // from illumination edges.
    normalize(&mut desc);
    for v in desc.iter_mut() {
        *v = v.min(0.2);
    }
    normalize(&mut desc);
    desc
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Row-major working image for the scale space.
#[derive(Clone)]
struct Image {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Image {
    /// Build a [0,1]-normalized copy of the raster's valid pixels.
    /// Returns `None` when the raster has no dynamic range.
    fn normalized(raster: &Raster) -> Option<Image> {
        let mut lo = f32::INFINITY;
        let mut hi = f32::NEG_INFINITY;
        for &p in &raster.pixels {
            lo = lo.min(p);
            hi = hi.max(p);
        }
        if !(hi > lo) {
            return None;
        }
        let span = hi - lo;
        Some(Image {
            width: raster.width,
            height: raster.height,
            data: raster.pixels.iter().map(|&p| (p - lo) / span).collect(),
        })
    }

    #[inline]
    fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    #[inline]
    fn get_clamped(&self, x: i64, y: i64) -> f32 {
        let x = x.clamp(0, self.width as i64 - 1) as usize;
        let y = y.clamp(0, self.height as i64 - 1) as usize;
        self.data[y * self.width + x]
    }

    /// Gradient magnitude and direction from central differences.
    #[inline]
    fn gradient(&self, x: usize, y: usize) -> (f32, f32) {
        let gx = 0.5 * (self.get(x + 1, y) - self.get(x - 1, y));
        let gy = 0.5 * (self.get(x, y + 1) - self.get(x, y - 1));
        ((gx * gx + gy * gy).sqrt(), gy.atan2(gx))
    }

    /// Separable Gaussian blur with replicated borders.
    fn blurred(&self, sigma: f32) -> Image {
        if sigma <= 0.0 {
            return self.clone();
        }
        let radius = (3.0 * sigma).ceil().max(1.0) as i64;
        let mut kernel = Vec::with_capacity(2 * radius as usize + 1);
        let mut sum = 0.0f32;
        for i in -radius..=radius {
            let v = (-(i * i) as f32 / (2.0 * sigma * sigma)).exp();
            kernel.push(v);
            sum += v;
        }
        for v in kernel.iter_mut() {
            *v /= sum;
        }

        let mut tmp = Image {
            width: self.width,
            height: self.height,
            data: vec![0.0; self.data.len()],
        };
        for y in 0..self.height {
            for x in 0..self.width {
                let mut acc = 0.0;
                for (i, k) in kernel.iter().enumerate() {
                    acc += k * self.get_clamped(x as i64 + i as i64 - radius, y as i64);
                }
                tmp.data[y * self.width + x] = acc;
            }
        }
        let mut out = Image {
            width: self.width,
            height: self.height,
            data: vec![0.0; self.data.len()],
        };
        for y in 0..self.height {
            for x in 0..self.width {
                let mut acc = 0.0;
                for (i, k) in kernel.iter().enumerate() {
                    acc += k * tmp.get_clamped(x as i64, y as i64 + i as i64 - radius);
                }
                out.data[y * self.width + x] = acc;
            }
        }
        out
    }

    /// 2x decimation, picking every other pixel.
    fn decimated(&self) -> Image {
        let nw = (self.width + 1) / 2;
        let nh = (self.height + 1) / 2;
        let mut data = Vec::with_capacity(nw * nh);
        for y in 0..nh {
            for x in 0..nw {
                data.push(self.get((x * 2).min(self.width - 1), (y * 2).min(self.height - 1)));
            }
        }
        Image {
            width: nw,
            height: nh,
            data,
        }
    }

    /// `self - other`, elementwise.
    fn difference(&self, other: &Image) -> Image {
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a - b)
            .collect();
        Image {
            width: self.width,
            height: self.height,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_raster(width: usize, height: usize, blobs: &[(f32, f32)]) -> Raster {
        let mut raster = Raster::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let mut v = 0.02 * (x as f32 / width as f32);
                for &(bx, by) in blobs {
                    let dx = x as f32 - bx;
                    let dy = y as f32 - by;
                    v += (-(dx * dx + dy * dy) / (2.0 * 9.0)).exp();
                }
                raster.set(x, y, v);
            }
        }
        raster
    }

    fn default_progress() -> Progress {
        Progress::new()
    }

    #[test]
    fn test_blank_raster_yields_no_features() {
        let config = FeatureConfig::default();
        let progress = default_progress();
        let empty = Raster::new(0, 0);
        assert!(extract(&empty, &config, &progress).unwrap().is_empty());

        let uniform = Raster::new(128, 128);
        assert!(extract(&uniform, &config, &progress).unwrap().is_empty());
    }

    #[test]
    fn test_finds_isolated_blobs() {
        let config = FeatureConfig {
            min_octave_size: 32,
            ..FeatureConfig::default()
        };
        let raster = blob_raster(128, 128, &[(40.0, 40.0), (90.0, 70.0)]);
        let features = extract(&raster, &config, &default_progress()).unwrap();
        assert!(!features.is_empty());
        for &(bx, by) in &[(40.0f32, 40.0f32), (90.0, 70.0)] {
            let hit = features.iter().any(|f| {
                let d = f.location.distance(&Point2D::new(bx, by));
                d < 3.0
            });
            assert!(hit, "no feature near ({}, {})", bx, by);
        }
    }

    #[test]
    fn test_descriptors_match_across_translation() {
        let config = FeatureConfig {
            min_octave_size: 32,
            ..FeatureConfig::default()
        };
        let blobs_a = [(40.0, 40.0), (80.0, 56.0), (56.0, 88.0)];
        let shift = (9.0f32, 5.0f32);
        let blobs_b: Vec<(f32, f32)> = blobs_a
            .iter()
            .map(|&(x, y)| (x + shift.0, y + shift.1))
            .collect();

        let fa = extract(&blob_raster(144, 144, &blobs_a), &config, &default_progress()).unwrap();
        let fb = extract(&blob_raster(144, 144, &blobs_b), &config, &default_progress()).unwrap();
        assert!(!fa.is_empty() && !fb.is_empty());

        let mut good = 0;
        for a in &fa {
            let nearest = fb
                .iter()
                .min_by(|p, q| {
                    a.descriptor_distance_sq(p)
                        .partial_cmp(&a.descriptor_distance_sq(q))
                        .unwrap()
                })
                .unwrap();
            let dx = nearest.location.x - a.location.x;
            let dy = nearest.location.y - a.location.y;
            if (dx - shift.0).abs() < 1.5 && (dy - shift.1).abs() < 1.5 {
                good += 1;
            }
        }
        assert!(good >= 2, "only {} descriptor matches survived the shift", good);
    }

    #[test]
    fn test_cancellation_stops_extraction() {
        let config = FeatureConfig::default();
        let progress = Progress::new();
        progress.cancel();
        let raster = blob_raster(128, 128, &[(64.0, 64.0)]);
        assert!(matches!(
            extract(&raster, &config, &progress),
            Err(crate::error::Error::Cancelled)
        ));
    }

    #[test]
    fn test_fingerprint_tracks_fields() {
        let a = FeatureConfig::default();
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.max_octave_size = 1024;
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = FeatureConfig::default();
        config.steps_per_octave = 0;
        assert!(config.validate().is_err());
        let raster = Raster::new(64, 64);
        assert!(extract(&raster, &config, &default_progress()).is_err());
    }
}
