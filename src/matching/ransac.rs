//! Randomized consensus model fitting over candidate correspondences.
//!
//! Repeatedly fits a minimal random sample, scores it by inlier count
//! under a residual threshold, refits the winner on its full inlier set
//! and tightens it with a median-based trust filter. A candidate set
//! that supports no acceptable model is a negative result, not an error.

use rand::Rng;

use crate::core::{Model, PointMatch};

/// Acceptance thresholds for the consensus search.
#[derive(Clone, Debug)]
pub struct ConsensusParams {
    /// Inlier residual threshold in pixels.
    pub max_epsilon: f32,
    /// Minimal inliers / candidates ratio.
    pub min_inlier_ratio: f32,
    /// Minimal absolute inlier count.
    pub min_num_inliers: usize,
    /// Trial budget.
    pub max_trials: usize,
    /// Trust-filter width as a multiple of the median residual.
    pub max_trust: f32,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            max_epsilon: 100.0,
            min_inlier_ratio: 0.2,
            min_num_inliers: 7,
            max_trials: 1000,
            max_trust: 3.0,
        }
    }
}

/// A model accepted by the consensus search.
#[derive(Clone, Debug)]
pub struct ConsensusResult {
    pub model: Model,
    pub inliers: Vec<PointMatch>,
    /// Positions of the inliers in the candidate slice.
    pub inlier_indices: Vec<usize>,
    /// Mean inlier residual in pixels.
    pub error: f32,
}

/// Run the consensus search for a model shaped like `template`.
///
/// Returns `None` when the candidates cannot support a model within the
/// thresholds. Degenerate samples (collinear, coincident) are skipped,
/// they consume a trial but never abort the search.
pub fn filter_ransac<R: Rng>(
    rng: &mut R,
    candidates: &[PointMatch],
    template: &Model,
    params: &ConsensusParams,
) -> Option<ConsensusResult> {
    let min_num = template.min_num_matches();
    if candidates.len() < min_num.max(params.min_num_inliers) {
        return None;
    }

    let mut best_indices: Vec<usize> = Vec::new();
    let mut best_error = f32::INFINITY;
    let mut sample = vec![0usize; min_num];
    let mut sample_matches: Vec<PointMatch> = Vec::with_capacity(min_num);

    for _ in 0..params.max_trials {
        // Draw a minimal sample of distinct candidates.
        for slot in 0..min_num {
            loop {
                let idx = rng.random_range(0..candidates.len());
                if !sample[..slot].contains(&idx) {
                    sample[slot] = idx;
                    break;
                }
            }
        }
        sample_matches.clear();
        sample_matches.extend(sample.iter().map(|&i| candidates[i].clone()));

        let mut model = template.clone();
        if model.fit(&sample_matches).is_err() {
            continue;
        }

        let mut indices = Vec::new();
        let mut error_sum = 0.0f64;
        for (i, m) in candidates.iter().enumerate() {
            let r = model.residual(m);
            if r < params.max_epsilon {
                indices.push(i);
                error_sum += f64::from(r);
            }
        }
        let error = if indices.is_empty() {
            f32::INFINITY
        } else {
            (error_sum / indices.len() as f64) as f32
        };
        if indices.len() > best_indices.len()
            || (indices.len() == best_indices.len() && error < best_error)
        {
            best_indices = indices;
            best_error = error;
        }
    }

    accept(candidates, template, params, best_indices)
}

/// Refit on the winning inliers and tighten with the trust filter, then
/// re-check the acceptance thresholds.
fn accept(
    candidates: &[PointMatch],
    template: &Model,
    params: &ConsensusParams,
    mut indices: Vec<usize>,
) -> Option<ConsensusResult> {
    let min_ratio_count =
        (params.min_inlier_ratio as f64 * candidates.len() as f64).ceil() as usize;
    let required = params
        .min_num_inliers
        .max(template.min_num_matches())
        .max(min_ratio_count);
    if indices.len() < required {
        return None;
    }

    let mut model = template.clone();
    loop {
        let inliers: Vec<PointMatch> = indices.iter().map(|&i| candidates[i].clone()).collect();
        if model.fit(&inliers).is_err() {
            return None;
        }
        let residuals: Vec<f32> = inliers.iter().map(|m| model.residual(m)).collect();
        let threshold = params.max_trust * crate::core::math::median(&residuals);
        let kept: Vec<usize> = indices
            .iter()
            .zip(residuals.iter())
            .filter(|(_, &r)| r <= threshold)
            .map(|(&i, _)| i)
            .collect();
        if kept.len() == indices.len() {
            let error = model.mean_residual(&inliers);
            return Some(ConsensusResult {
                model,
                inliers,
                inlier_indices: indices,
                error,
            });
        }
        if kept.len() < required {
            return None;
        }
        indices = kept;
    }
}
