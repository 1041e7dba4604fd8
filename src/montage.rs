//! Montage and linear layer alignment entry points.
//!
//! [`align_tiles`] registers a collection of overlapping tiles within
//! one section: features are warmed per tile, every overlapping pair is
//! matched through the correspondence cache, and the resulting tile
//! graph is relaxed globally. [`align_layers_linearly`] chains whole
//! sections instead, composing one pairwise model per consecutive layer
//! into absolute transforms.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::context::AlignContext;
use crate::core::{LayerPatch, Model, ModelKind, Point, PointMatch};
use crate::error::{Error, Result};
use crate::executor::{collect_phase, PoolSize};
use crate::features::{cached_features, scaled_fingerprint};
use crate::matching::{match_and_connect, match_candidates, match_consensus, MatchConfig};
use crate::optimize::{OptimizeConfig, OptimizeResult, Tile, TileConfiguration};

/// Parameters of one montage run.
#[derive(Clone, Debug)]
pub struct MontageConfig {
    /// Pairwise matching parameters, cache fingerprint included.
    pub matching: MatchConfig,
    /// Global relaxation budgets.
    pub optimize: OptimizeConfig,
    /// Per-tile model category.
    pub desired_model: ModelKind,
    /// Blend every tile model with a simpler regularizer.
    pub regularize: bool,
    /// Regularizing model category.
    pub regularizer: ModelKind,
    /// Regularizer blend weight in `[0, 1]`.
    pub lambda: f32,
    /// Drop high-residual correspondences after the first relaxation
    /// and relax again.
    pub filter_outliers: bool,
    /// Outlier cut at `mean + mean_factor * stddev` of the residuals.
    pub mean_factor: f32,
    /// Match only pairs with intersecting bounds instead of all pairs.
    pub pair_overlapping_only: bool,
}

impl Default for MontageConfig {
    fn default() -> Self {
        Self {
            matching: MatchConfig::default(),
            optimize: OptimizeConfig::default(),
            desired_model: ModelKind::Rigid,
            regularize: false,
            regularizer: ModelKind::Translation,
            lambda: 0.1,
            filter_outliers: false,
            mean_factor: 3.0,
            pair_overlapping_only: true,
        }
    }
}

impl MontageConfig {
    pub fn validate(&self) -> Result<()> {
        self.matching.validate()?;
        if self.mean_factor <= 0.0 {
            return Err(Error::InvalidConfiguration(
                "mean_factor must be positive".into(),
            ));
        }
        if self.regularize {
            // interpolation rejects unsupported pairings and out-of-range lambda
            Model::interpolated(
                Model::identity(self.desired_model),
                Model::identity(self.regularizer),
                self.lambda,
            )?;
        }
        Ok(())
    }
}

/// What a montage run did, plus the tiles carrying the solved models.
#[derive(Debug)]
pub struct MontageSummary {
    /// One tile per input patch, in order, models solved in place.
    pub tiles: Vec<Tile>,
    /// Tile pairs considered for matching.
    pub pairs_examined: usize,
    /// Pairs that produced at least one correspondence.
    pub pairs_connected: usize,
    /// Feature sets extracted in this run.
    pub features_computed: usize,
    /// Feature sets served from the cache.
    pub features_cached: usize,
    /// Correspondences dropped by the outlier filter.
    pub dropped_matches: usize,
    /// Global relaxation summary.
    pub optimize: OptimizeResult,
}

fn montage_tiles(patches: &[LayerPatch], config: &MontageConfig) -> Result<Vec<Tile>> {
    patches
        .iter()
        .map(|p| {
            let model = if config.regularize {
                Model::interpolated(
                    Model::identity(config.desired_model),
                    Model::identity(config.regularizer),
                    config.lambda,
                )?
            } else {
                Model::identity(config.desired_model)
            };
            Ok(Tile::new(p.id, p.clone(), model))
        })
        .collect()
}

/// Register a collection of tiles against each other.
///
/// `fixed` names patch ids that keep their current model; every id must
/// belong to one of `patches`. Matching runs through the correspondence
/// cache, so a rerun with unchanged parameters only pays for the
/// relaxation.
pub fn align_tiles(
    context: &AlignContext,
    patches: &[LayerPatch],
    fixed: &[u64],
    config: &MontageConfig,
) -> Result<MontageSummary> {
    config.validate()?;
    if patches.is_empty() {
        return Err(Error::InvalidConfiguration(
            "montage of zero patches".into(),
        ));
    }
    let tiles = montage_tiles(patches, config)?;
    for id in fixed {
        if !tiles.iter().any(|t| t.id() == *id) {
            return Err(Error::InvalidConfiguration(format!(
                "fixed tile {} is not among the patches",
                id
            )));
        }
    }

    let mut pairs: Vec<(usize, usize)> = Vec::new();
    for i in 0..patches.len() {
        for j in i + 1..patches.len() {
            if !config.pair_overlapping_only
                || patches[i].bounds.intersects(&patches[j].bounds)
            {
                pairs.push((i, j));
            }
        }
    }
    let pairs_examined = pairs.len();
    log::info!(
        "Montage of {} tiles, {} candidate pairs",
        patches.len(),
        pairs_examined
    );

    // Warm the feature cache once per tile before the pair jobs race
    // for it.
    let feature_pool = context
        .executors()
        .pool("montage-features", PoolSize::CoreShare { tenths: 10 });
    context.progress().add_work(patches.len());
    let fingerprint = scaled_fingerprint(&config.matching.features, 1.0);
    let jobs: Vec<_> = patches
        .iter()
        .map(|patch| {
            let ctx = context.clone();
            let patch = patch.clone();
            let feature_config = config.matching.features.clone();
            move || {
                let result = (|| -> Result<bool> {
                    let cached = ctx.feature_store().load(patch.id, fingerprint).is_some();
                    if !cached {
                        cached_features(&ctx, &patch, 1.0, &feature_config)?;
                    }
                    ctx.progress().step();
                    Ok(cached)
                })();
                ctx.cancel_on_error(result)
            }
        })
        .collect();
    let cached_flags = collect_phase(feature_pool.run_all(jobs)?)?;
    let features_cached = cached_flags.iter().filter(|&&cached| cached).count();
    let features_computed = patches.len() - features_cached;

    let match_pool = context
        .executors()
        .pool("montage-match", PoolSize::CoreShare { tenths: 10 });
    context.progress().add_work(pairs.len());
    let jobs: Vec<_> = pairs
        .iter()
        .map(|&(i, j)| {
            let ctx = context.clone();
            let a = tiles[i].clone();
            let b = tiles[j].clone();
            let matching = config.matching.clone();
            move || {
                let result = match_and_connect(&ctx, &a, &b, &matching);
                if result.is_ok() {
                    ctx.progress().step();
                }
                ctx.cancel_on_error(result)
            }
        })
        .collect();
    let counts = collect_phase(match_pool.run_all(jobs)?)?;
    let pairs_connected = counts.iter().filter(|&&n| n > 0).count();
    log::info!(
        "Connected {} of {} tile pairs",
        pairs_connected,
        pairs_examined
    );

    let fixed_tiles: Vec<Tile> = tiles
        .iter()
        .filter(|t| fixed.contains(&t.id()))
        .cloned()
        .collect();
    let configuration = TileConfiguration::new(tiles.clone(), &fixed_tiles)?;
    let (optimize, dropped_matches) = if config.filter_outliers {
        configuration.optimize_and_filter(context, &config.optimize, config.mean_factor)?
    } else {
        (configuration.optimize(context, &config.optimize)?, 0)
    };

    Ok(MontageSummary {
        tiles,
        pairs_examined,
        pairs_connected,
        features_computed,
        features_cached,
        dropped_matches,
        optimize,
    })
}

/// Chain a layer series with one rigid-ish model per layer.
///
/// Each layer is matched against its predecessor at a working scale
/// bounded by the feature pyramid size, and its absolute model is the
/// composition of that pairwise model with the predecessor's absolute
/// model. An unmatched pair keeps the layer in its predecessor's frame
/// and is logged rather than failing the run.
///
/// Returns one model per input layer; the first is the identity.
pub fn align_layers_linearly(
    context: &AlignContext,
    layers: &[LayerPatch],
    config: &MatchConfig,
) -> Result<Vec<Model>> {
    config.validate()?;
    if layers.is_empty() {
        return Ok(Vec::new());
    }

    let mut models = Vec::with_capacity(layers.len());
    let mut accumulated = Model::identity(config.expected_model);
    models.push(accumulated.clone());
    let mut matched = 0usize;
    context.progress().add_work(layers.len().saturating_sub(1));

    for (index, window) in layers.windows(2).enumerate() {
        context.checkpoint()?;
        let previous = &window[0];
        let current = &window[1];
        let bounds = previous.bounds.union(&current.bounds);
        let limit = config.features.max_octave_size as f32;
        let scale = (limit / bounds.width())
            .min(limit / bounds.height())
            .min(1.0);

        let current_features = cached_features(context, current, scale, &config.features)?;
        let previous_features = cached_features(context, previous, scale, &config.features)?;

        // candidates in world coordinates, current layer first so the
        // fitted model maps current onto previous
        let mut candidates = match_candidates(&current_features, &previous_features, config.rod);
        for m in &mut candidates {
            let p1 = m.p1.local + current.bounds.min;
            let p2 = m.p2.local + previous.bounds.min;
            *m = PointMatch::new(Point::new(p1), Point::new(p2));
        }

        let mut rng = StdRng::from_os_rng();
        let step = match match_consensus(&mut rng, &mut candidates, config) {
            Some(result) => {
                matched += 1;
                log::info!(
                    "Layers {} -> {}: {} correspondences, mean residual {:.3} px",
                    index + 1,
                    index,
                    result.inliers.len(),
                    result.error
                );
                result.model
            }
            None => {
                log::warn!(
                    "Layers {} -> {}: no model found, keeping relative position",
                    index + 1,
                    index
                );
                Model::identity(config.expected_model)
            }
        };
        accumulated = Model::composed(&accumulated, &step)?;
        models.push(accumulated.clone());
        context.progress().step();
    }
    log::info!(
        "Linear layer alignment matched {} of {} pairs",
        matched,
        layers.len() - 1
    );
    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Raster, RasterSource, Rect};
    use crate::features::FeatureStore;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Blank;
    impl RasterSource for Blank {
        fn render(&self, _bounds: Rect, _scale: f32) -> Result<Raster> {
            Ok(Raster::new(8, 8))
        }
    }

    fn patch(id: u64, x: f32, y: f32) -> LayerPatch {
        LayerPatch {
            id,
            bounds: Rect::new(
                crate::core::Point2D::new(x, y),
                crate::core::Point2D::new(x + 100.0, y + 100.0),
            ),
            source: Arc::new(Blank),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(MontageConfig::default().validate().is_ok());
    }

    #[test]
    fn test_regularized_homography_is_rejected() {
        let config = MontageConfig {
            regularize: true,
            desired_model: ModelKind::Homography,
            ..MontageConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_regularized_tiles_carry_interpolated_models() {
        let config = MontageConfig {
            regularize: true,
            ..MontageConfig::default()
        };
        let tiles = montage_tiles(&[patch(1, 0.0, 0.0)], &config).unwrap();
        assert!(matches!(tiles[0].model(), Model::Interpolated { .. }));
        assert_eq!(tiles[0].model().kind(), ModelKind::Rigid);
    }

    #[test]
    fn test_unknown_fixed_tile_is_rejected() {
        let context = AlignContext::new(FeatureStore::new(None));
        let patches = [patch(1, 0.0, 0.0), patch(2, 80.0, 0.0)];
        let err = align_tiles(&context, &patches, &[99], &MontageConfig::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn test_empty_layer_series_yields_no_models() {
        let context = AlignContext::new(FeatureStore::new(None));
        let models = align_layers_linearly(&context, &[], &MatchConfig::default()).unwrap();
        assert!(models.is_empty());
    }
}
