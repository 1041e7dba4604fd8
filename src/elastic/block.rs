//! Block-correlation matching between rendered layer rasters.
//!
//! For every mesh vertex the matcher compares the intensity block
//! around the vertex in the source layer against candidate blocks in
//! the target layer, searching a window around the position predicted
//! by the pairwise model. The offset with the highest Pearson
//! correlation wins, subject to three quality gates:
//!
//! - the correlation itself must reach `min_r`,
//! - the second-best peak in the search window must stay below
//!   `rod_r` times the best one,
//! - the peak must be sharp in both directions, measured by the
//!   curvature ratio of the correlation surface.
//!
//! Flat blocks and blocks reaching into masked or out-of-bounds pixels
//! produce no candidate at all, so featureless layers simply yield
//! empty results. Accepted offsets are refined to subpixel precision
//! with a quadratic fit around the peak.

use crate::core::math::{gaussian, median};
use crate::core::{Model, ModelKind, Point, Point2D, PointMatch, Raster};
use crate::error::Result;
use crate::progress::Progress;

/// Minimum fraction of unmasked pixels in a block.
const MIN_COVERAGE: f32 = 0.95;

/// Quality gates and geometry of the block search.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockMatchParams {
    /// Half block side in working pixels.
    pub block_radius: usize,
    /// Half search window side in working pixels.
    pub search_radius: usize,
    /// Minimal accepted correlation coefficient.
    pub min_r: f32,
    /// Maximal ratio of the second-best to the best correlation peak.
    pub rod_r: f32,
    /// Maximal curvature ratio of the correlation surface at the peak.
    pub max_curvature_r: f32,
}

struct BlockStats {
    mean: f32,
    variance: f32,
}

/// Mean and variance of the block centered at `(cx, cy)`, or `None`
/// when the block leaves the raster or is mostly masked.
fn block_stats(raster: &Raster, cx: isize, cy: isize, radius: isize) -> Option<BlockStats> {
    if cx < radius
        || cy < radius
        || cx + radius >= raster.width as isize
        || cy + radius >= raster.height as isize
    {
        return None;
    }
    let n = ((2 * radius + 1) * (2 * radius + 1)) as f32;
    let mut coverage = 0.0f32;
    let mut sum = 0.0f32;
    let mut sum_sq = 0.0f32;
    for y in cy - radius..=cy + radius {
        for x in cx - radius..=cx + radius {
            let (x, y) = (x as usize, y as usize);
            coverage += raster.mask_at(x, y);
            let v = raster.at(x, y);
            sum += v;
            sum_sq += v * v;
        }
    }
    if coverage / n < MIN_COVERAGE {
        return None;
    }
    let mean = sum / n;
    Some(BlockStats {
        mean,
        variance: (sum_sq / n - mean * mean).max(0.0),
    })
}

/// Pearson correlation of the source block at `(sx, sy)` with the
/// target block at `(tx, ty)`.
fn pmcc(
    source: &Raster,
    (sx, sy): (isize, isize),
    target: &Raster,
    (tx, ty): (isize, isize),
    radius: isize,
    source_stats: &BlockStats,
) -> Option<f32> {
    let target_stats = block_stats(target, tx, ty, radius)?;
    if target_stats.variance <= f32::EPSILON {
        return None;
    }
    let n = ((2 * radius + 1) * (2 * radius + 1)) as f32;
    let mut sum_st = 0.0f32;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let s = source.at((sx + dx) as usize, (sy + dy) as usize);
            let t = target.at((tx + dx) as usize, (ty + dy) as usize);
            sum_st += s * t;
        }
    }
    let covariance = sum_st / n - source_stats.mean * target_stats.mean;
    let r = covariance / (source_stats.variance * target_stats.variance).sqrt();
    Some(r.clamp(-1.0, 1.0))
}

/// Highest local maximum of the correlation surface outside the
/// immediate neighbourhood of the best peak.
fn second_peak(r_map: &[f32], side: usize, best_idx: usize) -> Option<f32> {
    let bx = (best_idx % side) as isize;
    let by = (best_idx / side) as isize;
    let at = |x: isize, y: isize| -> Option<f32> {
        if x < 0 || y < 0 || x >= side as isize || y >= side as isize {
            return None;
        }
        let v = r_map[y as usize * side + x as usize];
        v.is_finite().then_some(v)
    };
    let mut second: Option<f32> = None;
    for y in 0..side as isize {
        for x in 0..side as isize {
            if (x - bx).abs() <= 1 && (y - by).abs() <= 1 {
                continue;
            }
            let Some(v) = at(x, y) else { continue };
            let mut is_peak = true;
            'neighbours: for ny in y - 1..=y + 1 {
                for nx in x - 1..=x + 1 {
                    if (nx, ny) == (x, y) {
                        continue;
                    }
                    if let Some(nv) = at(nx, ny) {
                        if nv > v {
                            is_peak = false;
                            break 'neighbours;
                        }
                    }
                }
            }
            if is_peak {
                second = Some(second.map_or(v, |s| s.max(v)));
            }
        }
    }
    second
}

/// Match every query vertex of the source layer against the target
/// layer. `transform` maps source working coordinates to the target
/// frame and centers each search window.
///
/// Queries whose blocks are flat, masked or out of bounds are skipped
/// silently; the result holds one match per accepted query with `p1`
/// carrying the query's identity.
pub(crate) fn block_matches(
    source: &Raster,
    target: &Raster,
    transform: &Model,
    queries: &[Point],
    params: &BlockMatchParams,
    progress: &Progress,
) -> Result<Vec<PointMatch>> {
    let br = params.block_radius as isize;
    let sr = params.search_radius as isize;
    let side = 2 * params.search_radius + 1;
    let mut matches = Vec::new();

    for query in queries {
        progress.checkpoint()?;
        let sx = query.local.x.round() as isize;
        let sy = query.local.y.round() as isize;
        let Some(stats) = block_stats(source, sx, sy, br) else {
            continue;
        };
        if stats.variance <= f32::EPSILON {
            continue;
        }

        let estimate = transform.apply(query.local);
        let cx = estimate.x.round() as isize;
        let cy = estimate.y.round() as isize;

        let mut r_map = vec![f32::NEG_INFINITY; side * side];
        let mut best = f32::NEG_INFINITY;
        let mut best_idx = None;
        for dy in -sr..=sr {
            for dx in -sr..=sr {
                if let Some(r) = pmcc(source, (sx, sy), target, (cx + dx, cy + dy), br, &stats) {
                    let idx = (dy + sr) as usize * side + (dx + sr) as usize;
                    r_map[idx] = r;
                    if r > best {
                        best = r;
                        best_idx = Some(idx);
                    }
                }
            }
        }
        let Some(best_idx) = best_idx else { continue };
        if best < params.min_r {
            continue;
        }
        let bx = best_idx % side;
        let by = best_idx / side;
        // peaks on the window border cannot be localized
        if bx == 0 || by == 0 || bx + 1 >= side || by + 1 >= side {
            continue;
        }
        if let Some(second) = second_peak(&r_map, side, best_idx) {
            if second / best > params.rod_r {
                continue;
            }
        }

        let at = |x: usize, y: usize| r_map[y * side + x];
        let neighbourhood = [
            at(bx - 1, by - 1),
            at(bx, by - 1),
            at(bx + 1, by - 1),
            at(bx - 1, by),
            at(bx + 1, by),
            at(bx - 1, by + 1),
            at(bx, by + 1),
            at(bx + 1, by + 1),
        ];
        if neighbourhood.iter().any(|v| !v.is_finite()) {
            continue;
        }
        let dxx = at(bx - 1, by) - 2.0 * best + at(bx + 1, by);
        let dyy = at(bx, by - 1) - 2.0 * best + at(bx, by + 1);
        let dxy = 0.25
            * (at(bx + 1, by + 1) - at(bx - 1, by + 1) - at(bx + 1, by - 1) + at(bx - 1, by - 1));
        let trace = dxx + dyy;
        let det = dxx * dyy - dxy * dxy;
        // the peak must curve down in every direction
        if det <= 0.0 || trace >= 0.0 {
            continue;
        }
        let edge = params.max_curvature_r;
        if trace * trace / det > (edge + 1.0) * (edge + 1.0) / edge {
            continue;
        }

        let gx = 0.5 * (at(bx + 1, by) - at(bx - 1, by));
        let gy = 0.5 * (at(bx, by + 1) - at(bx, by - 1));
        let ox = (-(gx * dyy - gy * dxy) / det).clamp(-1.0, 1.0);
        let oy = (-(gy * dxx - gx * dxy) / det).clamp(-1.0, 1.0);
        let tx = (cx + bx as isize - sr) as f32 + ox;
        let ty = (cy + by as isize - sr) as f32 + oy;
        matches.push(PointMatch::new(
            *query,
            Point::new(Point2D::new(tx, ty)),
        ));
    }
    Ok(matches)
}

/// Drop matches that disagree with a locally fitted model of their
/// neighbourhood.
///
/// Every match gets a model of `kind` fitted to all matches with
/// Gaussian distance weights of width `sigma` around it. A match is
/// dropped when its own residual under that local model exceeds
/// `max_epsilon`, or `max_trust` times the median residual. Dropping
/// changes the neighbourhoods, so the filter repeats until a pass
/// keeps everything.
pub(crate) fn local_smoothness_filter(
    matches: &mut Vec<PointMatch>,
    kind: ModelKind,
    sigma: f32,
    max_epsilon: f32,
    max_trust: f32,
) {
    loop {
        if matches.len() < kind.min_num_matches() {
            return;
        }
        let mut residuals = Vec::with_capacity(matches.len());
        for center in matches.iter() {
            let weighted: Vec<PointMatch> = matches
                .iter()
                .map(|m| {
                    let w = m.weight * gaussian(center.p1.local.distance(&m.p1.local), sigma);
                    PointMatch::with_weight(m.p1, m.p2, w)
                })
                .collect();
            let mut model = Model::identity(kind);
            let residual = match model.fit(&weighted) {
                Ok(()) => model.apply(center.p1.local).distance(&center.p2.world),
                // a neighbourhood too degenerate to judge keeps its match
                Err(_) => 0.0,
            };
            residuals.push(residual);
        }
        let med = median(&residuals);
        let before = matches.len();
        let mut idx = 0;
        matches.retain(|_| {
            let keep = residuals[idx] <= max_epsilon && residuals[idx] <= max_trust * med;
            idx += 1;
            keep
        });
        if matches.len() == before {
            return;
        }
        log::debug!(
            "Local smoothness filter dropped {} of {} block matches",
            before - matches.len(),
            before
        );
    }
}
