//! Montage integration tests over the public API.
//!
//! Tile matching runs on synthetic feature sets, on pre-seeded
//! correspondence caches and on windows of a shared noise world, so
//! every scenario is deterministic.

mod common;

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;

use sandhi_align::matching::match_pair;
use sandhi_align::optimize::Termination;
use sandhi_align::{
    align_layers_linearly, align_tiles, AlignContext, FeatureStore, MatchConfig, Model, ModelKind,
    MontageConfig, OptimizeConfig, Point2D, RasterSource, Rect,
};

fn fresh_context() -> AlignContext {
    common::init_logging();
    AlignContext::new(FeatureStore::new(None))
}

// ============================================================================
// Consensus matching on synthetic features
// ============================================================================

#[test]
fn test_fifty_feature_translation_is_recovered() {
    common::init_logging();
    let features = common::synthetic_features(50, 11, 200.0);
    let shifted = common::translated_features(&features, 12.5, -4.0);
    let config = MatchConfig {
        max_epsilon: 2.0,
        min_inlier_ratio: 0.2,
        min_num_inliers: 7,
        expected_model: ModelKind::Translation,
        ..MatchConfig::default()
    };

    let mut rng = StdRng::seed_from_u64(42);
    let result = match_pair(&mut rng, &features, &shifted, &config)
        .expect("a clean translation must produce a model");

    assert!(result.inliers.len() >= 7);
    assert!(result.error <= 0.5);
    match result.model {
        Model::Translation { dx, dy } => {
            assert!(
                (dx - 12.5).abs() <= 0.5 && (dy + 4.0).abs() <= 0.5,
                "recovered translation ({}, {}) too far from (12.5, -4.0)",
                dx,
                dy
            );
        }
        other => panic!("expected a translation, got {:?}", other),
    }
}

#[test]
fn test_inlier_count_threshold_is_absolute() {
    common::init_logging();
    let features = common::synthetic_features(50, 11, 200.0);
    let shifted = common::translated_features(&features, 12.5, -4.0);
    // 50 candidates can never satisfy 51 required inliers, regardless
    // of how well they agree.
    let config = MatchConfig {
        max_epsilon: 2.0,
        min_inlier_ratio: 0.2,
        min_num_inliers: 51,
        expected_model: ModelKind::Translation,
        ..MatchConfig::default()
    };
    let mut rng = StdRng::seed_from_u64(42);
    assert!(match_pair(&mut rng, &features, &shifted, &config).is_none());
}

// ============================================================================
// Montage runs
// ============================================================================

#[test]
fn test_blank_tiles_stay_negative_without_failing() {
    let context = fresh_context();
    let patches = [
        common::blank_patch(1, Rect::from_size(64.0, 64.0)),
        common::blank_patch(
            2,
            Rect::new(Point2D::new(32.0, 0.0), Point2D::new(96.0, 64.0)),
        ),
    ];

    let summary = align_tiles(&context, &patches, &[], &MontageConfig::default()).unwrap();
    assert_eq!(summary.pairs_examined, 1);
    assert_eq!(summary.pairs_connected, 0);
    assert_eq!(summary.features_computed, 2);
    assert_eq!(summary.features_cached, 0);
    assert_eq!(summary.optimize.iterations, 0);

    // The empty feature sets and the negative pair are both cached.
    let summary = align_tiles(&context, &patches, &[], &MontageConfig::default()).unwrap();
    assert_eq!(summary.features_cached, 2);
    assert_eq!(summary.features_computed, 0);
    assert_eq!(summary.pairs_connected, 0);
}

#[test]
fn test_three_tile_chain_composes_through_the_cache() {
    let context = fresh_context();
    let patches = [
        common::blank_patch(1, Rect::from_size(100.0, 100.0)),
        common::blank_patch(
            2,
            Rect::new(Point2D::new(90.0, 0.0), Point2D::new(190.0, 100.0)),
        ),
        common::blank_patch(
            3,
            Rect::new(Point2D::new(180.0, 0.0), Point2D::new(280.0, 100.0)),
        ),
    ];
    let config = MontageConfig {
        optimize: OptimizeConfig {
            max_epsilon: 0.01,
            ..OptimizeConfig::default()
        },
        ..MontageConfig::default()
    };

    // Seed correspondences as two tiles 90 px apart would see them.
    let fingerprint = config.matching.fingerprint();
    let m12 = common::shifted_matches(
        &[(92.0, 12.0), (97.0, 35.0), (93.0, 64.0), (98.0, 88.0)],
        (90.0, 0.0),
    );
    let m23 = common::shifted_matches(
        &[(92.0, 15.0), (97.0, 40.0), (93.0, 70.0), (98.0, 90.0)],
        (90.0, 0.0),
    );
    context.match_cache().put(1, 2, fingerprint, &m12);
    context.match_cache().put(2, 3, fingerprint, &m23);

    let summary = align_tiles(&context, &patches, &[1], &config).unwrap();
    // Tiles 1 and 3 do not overlap, so only the consecutive pairs run.
    assert_eq!(summary.pairs_examined, 2);
    assert_eq!(summary.pairs_connected, 2);
    assert_eq!(summary.optimize.termination, Termination::Converged);

    let t2 = summary.tiles[1].model().apply(Point2D::ZERO);
    let t3 = summary.tiles[2].model().apply(Point2D::ZERO);
    assert!(
        t2.distance(&Point2D::new(90.0, 0.0)) <= 0.1,
        "middle tile landed at ({}, {})",
        t2.x,
        t2.y
    );
    assert!(
        t3.distance(&Point2D::new(180.0, 0.0)) <= 0.1,
        "far tile landed at ({}, {})",
        t3.x,
        t3.y
    );
}

#[test]
fn test_changed_parameters_miss_the_match_cache() {
    let context = fresh_context();
    let patches = [
        common::blank_patch(1, Rect::from_size(100.0, 100.0)),
        common::blank_patch(
            2,
            Rect::new(Point2D::new(80.0, 0.0), Point2D::new(180.0, 100.0)),
        ),
    ];
    let base = MontageConfig::default();
    let strict = MontageConfig {
        matching: MatchConfig {
            rod: 0.8,
            ..base.matching.clone()
        },
        ..base.clone()
    };
    assert_ne!(
        base.matching.fingerprint(),
        strict.matching.fingerprint(),
        "the ratio threshold must be part of the fingerprint"
    );

    let matches = common::shifted_matches(
        &[(85.0, 10.0), (95.0, 40.0), (88.0, 70.0), (97.0, 90.0)],
        (80.0, 0.0),
    );
    context
        .match_cache()
        .put(1, 2, base.matching.fingerprint(), &matches);

    // Different parameters miss the seeded entry; blank tiles then
    // yield nothing on their own.
    let summary = align_tiles(&context, &patches, &[], &strict).unwrap();
    assert_eq!(summary.pairs_connected, 0);
    // The original parameters still find it.
    let summary = align_tiles(&context, &patches, &[], &base).unwrap();
    assert_eq!(summary.pairs_connected, 1);
}

#[test]
fn test_overlapping_noise_tiles_register_end_to_end() {
    let context = fresh_context();
    let world = Arc::new(common::NoiseWorld::new(256, 144, 5));
    let patches = [
        common::patch(
            1,
            Arc::clone(&world) as Arc<dyn RasterSource>,
            Rect::from_size(160.0, 128.0),
        ),
        common::patch(
            2,
            world as Arc<dyn RasterSource>,
            Rect::new(Point2D::new(80.0, 0.0), Point2D::new(240.0, 128.0)),
        ),
    ];
    let config = MontageConfig {
        optimize: OptimizeConfig {
            max_epsilon: 0.5,
            ..OptimizeConfig::default()
        },
        ..MontageConfig::default()
    };

    let summary = align_tiles(&context, &patches, &[1], &config).unwrap();
    assert_eq!(summary.pairs_examined, 1);
    assert_eq!(summary.pairs_connected, 1, "the overlap did not match");
    assert_eq!(summary.features_computed, 2);
    assert_eq!(summary.optimize.termination, Termination::Converged);

    // Tile 2 sits 80 px to the right of tile 1 in the shared world.
    let origin = summary.tiles[1].model().apply(Point2D::ZERO);
    assert!(
        origin.distance(&Point2D::new(80.0, 0.0)) <= 1.0,
        "tile 2 registered at ({}, {})",
        origin.x,
        origin.y
    );
}

// ============================================================================
// Linear layer chaining
// ============================================================================

#[test]
fn test_layer_chain_composes_absolute_models() {
    let context = fresh_context();
    let base = common::NoiseWorld::new(256, 256, 9);
    let bounds = Rect::new(Point2D::new(16.0, 16.0), Point2D::new(216.0, 216.0));
    let layers = [
        common::patch(1, Arc::new(base.with_offset(0.0, 0.0)), bounds),
        common::patch(2, Arc::new(base.with_offset(6.0, 4.0)), bounds),
        common::patch(3, Arc::new(base.with_offset(11.0, 6.0)), bounds),
    ];

    let models = align_layers_linearly(&context, &layers, &MatchConfig::default()).unwrap();
    assert_eq!(models.len(), 3);

    let probe = Point2D::new(100.0, 100.0);
    assert_eq!(models[0].apply(probe), probe);
    let p1 = models[1].apply(probe);
    assert!(
        p1.distance(&Point2D::new(94.0, 96.0)) <= 1.0,
        "layer 1 mapped the probe to ({}, {})",
        p1.x,
        p1.y
    );
    let p2 = models[2].apply(probe);
    assert!(
        p2.distance(&Point2D::new(89.0, 94.0)) <= 1.0,
        "layer 2 mapped the probe to ({}, {})",
        p2.x,
        p2.y
    );
}
